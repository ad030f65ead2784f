// 🎭 Identity - Roles, capabilities and the acting principal
//
// Authentication happens upstream; the engines receive an already-verified
// Actor and re-derive everything authorization needs from its role set.
// Capabilities are computed once at construction so call sites check a flag
// instead of re-reasoning about role semantics.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Department scope entry meaning "every department in the event".
pub const EVENT_WIDE: &str = "*";

// ============================================================================
// ROLES
// ============================================================================

/// Closed set of roles in the event hierarchy. Tier 0 sits at the top of the
/// allocation chain; finance sits outside it and only receives cash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    EventManager,
    SellerManager,
    Seller,
    Finance,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::EventManager => "event_manager",
            Role::SellerManager => "seller_manager",
            Role::Seller => "seller",
            Role::Finance => "finance",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "event_manager" => Some(Role::EventManager),
            "seller_manager" => Some(Role::SellerManager),
            "seller" => Some(Role::Seller),
            "finance" => Some(Role::Finance),
            _ => None,
        }
    }

    /// Position in the allocation chain. Finance handles cash, not points,
    /// and has no tier.
    pub fn tier(&self) -> Option<u8> {
        match self {
            Role::EventManager => Some(0),
            Role::SellerManager => Some(1),
            Role::Seller => Some(2),
            Role::Finance => None,
        }
    }

    pub fn all() -> [Role; 4] {
        [
            Role::EventManager,
            Role::SellerManager,
            Role::Seller,
            Role::Finance,
        ]
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// What an actor may do, derived from roles. Operations check capabilities,
/// never raw roles, so role→permission mapping lives in exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Move points down the chain (and recall them back up).
    Allocate,
    /// Record point sales to visitors.
    Sell,
    /// Take cash custody from sellers and submit parcels to finance.
    Collect,
    /// Claim a pending cash submission for counting.
    Claim,
    /// Confirm, dispute, reject or requeue a claimed submission.
    Confirm,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Allocate => "allocate",
            Capability::Sell => "sell",
            Capability::Collect => "collect",
            Capability::Claim => "claim",
            Capability::Confirm => "confirm",
        }
    }
}

/// Role → capability expansion. Seller managers both allocate (downward to
/// sellers) and collect (cash back up); finance members never touch points.
pub fn capabilities_for(roles: &[Role]) -> HashSet<Capability> {
    let mut caps = HashSet::new();
    for role in roles {
        match role {
            Role::EventManager => {
                caps.insert(Capability::Allocate);
            }
            Role::SellerManager => {
                caps.insert(Capability::Allocate);
                caps.insert(Capability::Collect);
            }
            Role::Seller => {
                caps.insert(Capability::Sell);
            }
            Role::Finance => {
                caps.insert(Capability::Claim);
                caps.insert(Capability::Confirm);
            }
        }
    }
    caps
}

// ============================================================================
// ACTOR
// ============================================================================

/// The verified principal performing an operation. Department scope limits
/// which accounts the actor may administer; `EVENT_WIDE` grants all.
/// Deliberately not `Deserialize`: capabilities must be derived through
/// [`Actor::new`], never accepted from a payload.
#[derive(Debug, Clone, Serialize)]
pub struct Actor {
    pub user_id: String,
    pub roles: Vec<Role>,
    pub department_scope: Vec<String>,
    #[serde(skip)]
    capabilities: HashSet<Capability>,
}

impl Actor {
    pub fn new(
        user_id: impl Into<String>,
        roles: Vec<Role>,
        department_scope: Vec<String>,
    ) -> Self {
        let capabilities = capabilities_for(&roles);
        Actor {
            user_id: user_id.into(),
            roles,
            department_scope,
            capabilities,
        }
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Department authority check: exact department match or event-wide scope.
    pub fn can_administer(&self, department: &str) -> bool {
        self.department_scope
            .iter()
            .any(|d| d == department || d == EVENT_WIDE)
    }
}

// ============================================================================
// VERIFICATION TOKEN
// ============================================================================

/// Proof that an out-of-band confirmation (OTP or equivalent) happened for a
/// large allocation. The ledger only records the reference; issuing and
/// checking the OTP itself is upstream's problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationToken {
    pub verified: bool,
    pub reference: String,
}

impl VerificationToken {
    pub fn verified(reference: impl Into<String>) -> Self {
        VerificationToken {
            verified: true,
            reference: reference.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
