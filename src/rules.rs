// 📏 Allocation Rules - Limits as Data
// Per-role transfer caps and alert thresholds, loadable from JSON

use serde::{Deserialize, Serialize};
use anyhow::{Result, Context as AnyhowContext};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::identity::Role;

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRule {
    /// Role the rule applies to (the allocating side)
    pub role: Role,

    /// Largest single allocation this role may hand out
    pub max_per_allocation: i64,

    /// pending_collection / total_sold ratio at which the chain below an
    /// allocation target gets flagged for cash pickup
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Allocations at or above this amount require an out-of-band
    /// verification token; None disables the gate for the role
    #[serde(default)]
    pub otp_threshold: Option<i64>,

    /// Description/notes about this rule
    pub description: Option<String>,
}

fn default_warning_threshold() -> f64 {
    0.8
}

// ============================================================================
// RULE TABLE
// ============================================================================

/// One rule per allocating role. Roles without a rule cannot allocate at all,
/// which is how sellers and finance stay out of the points-distribution game.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: HashMap<Role, AllocationRule>,
}

impl RuleTable {
    /// Empty table: nobody can allocate. Useful for tests that want to grant
    /// rules one at a time.
    pub fn new() -> Self {
        RuleTable {
            rules: HashMap::new(),
        }
    }

    /// Load rules from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

        let rules: Vec<AllocationRule> = serde_json::from_str(&content)
            .context("Failed to parse rules JSON")?;

        Ok(RuleTable::from_rules(rules))
    }

    /// Create table from a list of rules; a later rule for the same role
    /// replaces an earlier one.
    pub fn from_rules(rules: Vec<AllocationRule>) -> Self {
        let mut table = RuleTable::new();
        for rule in rules {
            table.set_rule(rule);
        }
        table
    }

    /// Standard event limits: event managers move big tranches (with an OTP
    /// gate on the largest), seller managers hand out small ones.
    pub fn defaults() -> Self {
        RuleTable::from_rules(vec![
            AllocationRule {
                role: Role::EventManager,
                max_per_allocation: 10_000,
                warning_threshold: 0.8,
                otp_threshold: Some(5_000),
                description: Some("Event pool tranches to department managers".to_string()),
            },
            AllocationRule {
                role: Role::SellerManager,
                max_per_allocation: 1_000,
                warning_threshold: 0.8,
                otp_threshold: None,
                description: Some("Working floats for sellers".to_string()),
            },
        ])
    }

    pub fn set_rule(&mut self, rule: AllocationRule) {
        self.rules.insert(rule.role, rule);
    }

    pub fn rule_for(&self, role: Role) -> Option<&AllocationRule> {
        self.rules.get(&role)
    }

    /// Get number of rules loaded
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================
