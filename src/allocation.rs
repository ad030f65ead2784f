// 🎯 Allocation Engine - Points moving down the chain (and back up)
//
// Allocations are two-sided transfers: the source account loses the points
// from its distributable pool, the target gains them, and both entries share
// one correlation id inside one SQLite transaction. Per-role limits and the
// OTP gate live in the rule table; the advisory collection alert is
// recomputed here because an allocation is the moment a manager is about to
// pour more points onto a chain that may be sitting on uncollected cash.

use std::sync::Arc;

use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::accounts::{self, Account, BalanceDelta};
use crate::db::{self, EntryDraft, LedgerStore, TransactionKind};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::{Actor, Capability, Role, VerificationToken};
use crate::rules::RuleTable;

/// Both sides of a completed transfer, as committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub from: Account,
    pub to: Account,
    pub correlation_id: String,
    /// Whether the target now carries a collection alert.
    pub collection_alert_raised: bool,
}

#[derive(Clone)]
pub struct AllocationEngine {
    store: Arc<LedgerStore>,
    rules: RuleTable,
}

impl AllocationEngine {
    pub fn new(store: Arc<LedgerStore>, rules: RuleTable) -> Self {
        AllocationEngine { store, rules }
    }

    /// Move points from the actor's account down to a target account.
    ///
    /// Check order: amount, capability, ownership, target + department
    /// authority, per-role limit, OTP gate, then balance. A failure at any
    /// point leaves both accounts and the ledger untouched.
    pub fn allocate(
        &self,
        actor: &Actor,
        from_account_id: &str,
        to_account_id: &str,
        amount: i64,
        note: Option<String>,
        verification: Option<&VerificationToken>,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<TransferOutcome> {
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "allocation amount must be > 0, got {}",
                amount
            )));
        }
        if !actor.has_capability(Capability::Allocate) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot allocate points",
                actor.user_id
            )));
        }
        if from_account_id == to_account_id {
            return Err(LedgerError::Validation(
                "cannot allocate points to the source account".into(),
            ));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fingerprint = db::request_fingerprint(
            "allocate",
            &format!(
                "{}|{}|{}|{}",
                from_account_id,
                to_account_id,
                amount,
                note.as_deref().unwrap_or("")
            ),
        );
        if let Some(key) = idempotency_key {
            if let Some(stored) = db::replay_outcome(&tx, key, "allocate", &fingerprint)? {
                let outcome: TransferOutcome = serde_json::from_str(&stored)?;
                return Ok(outcome);
            }
        }

        let from = accounts::load_account(&tx, from_account_id)?;
        if from.user_id != actor.user_id || !actor.has_role(from.role) {
            return Err(LedgerError::Unauthorized(format!(
                "account {} is not an account user '{}' allocates from",
                from_account_id, actor.user_id
            )));
        }

        let to = accounts::load_account(&tx, to_account_id)?;
        if !actor.can_administer(&to.department) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' has no authority over department '{}'",
                actor.user_id, to.department
            )));
        }

        let (from_tier, to_tier) = match (from.role.tier(), to.role.tier()) {
            (Some(f), Some(t)) => (f, t),
            _ => {
                return Err(LedgerError::Validation(
                    "finance accounts hold no points".into(),
                ))
            }
        };
        if to_tier <= from_tier {
            return Err(LedgerError::Validation(format!(
                "allocations flow down the chain, not {} → {}",
                from.role, to.role
            )));
        }

        let rule = self.rules.rule_for(from.role).ok_or_else(|| {
            LedgerError::Validation(format!("no allocation rule configured for role {}", from.role))
        })?;
        if amount > rule.max_per_allocation {
            return Err(LedgerError::LimitExceeded {
                role: from.role.as_str().to_string(),
                amount,
                limit: rule.max_per_allocation,
            });
        }

        if let Some(otp_threshold) = rule.otp_threshold {
            let verified = verification.map_or(false, |v| v.verified);
            if amount >= otp_threshold && !verified {
                return Err(LedgerError::Validation(format!(
                    "allocations of {} points and above require out-of-band verification",
                    otp_threshold
                )));
            }
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();

        let debit = BalanceDelta {
            available_points: -amount,
            total_received: -amount,
            ..Default::default()
        };
        let from_after = accounts::apply_delta_on(
            &tx,
            &debit,
            &EntryDraft {
                account_id: from.id.clone(),
                kind: TransactionKind::Allocation,
                amount: -amount,
                actor_id: actor.user_id.clone(),
                counterparty_id: Some(to.id.clone()),
                correlation_id: correlation_id.clone(),
                note: note.clone(),
            },
        )?;

        let credit = BalanceDelta {
            available_points: amount,
            total_received: amount,
            ..Default::default()
        };
        let to_after = accounts::apply_delta_on(
            &tx,
            &credit,
            &EntryDraft {
                account_id: to.id.clone(),
                kind: TransactionKind::Allocation,
                amount,
                actor_id: actor.user_id.clone(),
                counterparty_id: Some(from.id.clone()),
                correlation_id: correlation_id.clone(),
                note,
            },
        )?;

        let alert = recompute_collection_alert(&tx, &to_after, rule.warning_threshold)?;

        let outcome = TransferOutcome {
            from: from_after,
            to: to_after,
            correlation_id: correlation_id.clone(),
            collection_alert_raised: alert,
        };

        if let Some(key) = idempotency_key {
            db::record_outcome(
                &tx,
                key,
                "allocate",
                &fingerprint,
                &serde_json::to_string(&outcome)?,
            )?;
        }

        tx.commit()?;

        tracing::info!(
            from = %outcome.from.id,
            to = %outcome.to.id,
            amount,
            correlation_id = %correlation_id,
            "points allocated"
        );
        if alert {
            tracing::warn!(
                account_id = %outcome.to.id,
                department = %outcome.to.department,
                "collection alert: chain below target is sitting on uncollected cash"
            );
        }

        Ok(outcome)
    }

    /// Pull unspent points from a lower account back up to the actor's own.
    /// The inverse of allocate: no per-transfer cap and no OTP gate, but the
    /// same ownership, authority and balance rules.
    pub fn recall(
        &self,
        actor: &Actor,
        from_account_id: &str,
        to_account_id: &str,
        amount: i64,
        note: Option<String>,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<TransferOutcome> {
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "recall amount must be > 0, got {}",
                amount
            )));
        }
        if !actor.has_capability(Capability::Allocate) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot recall points",
                actor.user_id
            )));
        }
        if from_account_id == to_account_id {
            return Err(LedgerError::Validation(
                "cannot recall points into the source account".into(),
            ));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fingerprint = db::request_fingerprint(
            "recall",
            &format!(
                "{}|{}|{}|{}",
                from_account_id,
                to_account_id,
                amount,
                note.as_deref().unwrap_or("")
            ),
        );
        if let Some(key) = idempotency_key {
            if let Some(stored) = db::replay_outcome(&tx, key, "recall", &fingerprint)? {
                let outcome: TransferOutcome = serde_json::from_str(&stored)?;
                return Ok(outcome);
            }
        }

        let to = accounts::load_account(&tx, to_account_id)?;
        if to.user_id != actor.user_id || !actor.has_role(to.role) {
            return Err(LedgerError::Unauthorized(format!(
                "account {} is not an account user '{}' recalls into",
                to_account_id, actor.user_id
            )));
        }

        let from = accounts::load_account(&tx, from_account_id)?;
        if !actor.can_administer(&from.department) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' has no authority over department '{}'",
                actor.user_id, from.department
            )));
        }

        match (from.role.tier(), to.role.tier()) {
            (Some(f), Some(t)) if f > t => {}
            _ => {
                return Err(LedgerError::Validation(format!(
                    "recalls flow up the chain, not {} → {}",
                    from.role, to.role
                )))
            }
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();

        let debit = BalanceDelta {
            available_points: -amount,
            total_received: -amount,
            ..Default::default()
        };
        let from_after = accounts::apply_delta_on(
            &tx,
            &debit,
            &EntryDraft {
                account_id: from.id.clone(),
                kind: TransactionKind::Recall,
                amount: -amount,
                actor_id: actor.user_id.clone(),
                counterparty_id: Some(to.id.clone()),
                correlation_id: correlation_id.clone(),
                note: note.clone(),
            },
        )?;

        let credit = BalanceDelta {
            available_points: amount,
            total_received: amount,
            ..Default::default()
        };
        let to_after = accounts::apply_delta_on(
            &tx,
            &credit,
            &EntryDraft {
                account_id: to.id.clone(),
                kind: TransactionKind::Recall,
                amount,
                actor_id: actor.user_id.clone(),
                counterparty_id: Some(from.id.clone()),
                correlation_id: correlation_id.clone(),
                note,
            },
        )?;

        let outcome = TransferOutcome {
            from: from_after,
            to: to_after,
            correlation_id: correlation_id.clone(),
            collection_alert_raised: false,
        };

        if let Some(key) = idempotency_key {
            db::record_outcome(
                &tx,
                key,
                "recall",
                &fingerprint,
                &serde_json::to_string(&outcome)?,
            )?;
        }

        tx.commit()?;

        tracing::info!(
            from = %outcome.from.id,
            to = %outcome.to.id,
            amount,
            correlation_id = %correlation_id,
            "points recalled"
        );

        Ok(outcome)
    }
}

/// Recompute the advisory alert for an allocation target: sum pending cash
/// and sales over every account in the target's department at the target's
/// tier or deeper, and compare the ratio against the threshold. With no
/// sales yet the ratio is undefined and the alert stays off.
fn recompute_collection_alert(
    tx: &rusqlite::Transaction<'_>,
    target: &Account,
    warning_threshold: f64,
) -> LedgerResult<bool> {
    let target_tier = match target.role.tier() {
        Some(tier) => tier,
        None => return Ok(false),
    };

    let mut stmt = tx.prepare(
        "SELECT role, pending_collection, total_sold FROM accounts WHERE department = ?1",
    )?;
    let rows = stmt.query_map(params![target.department], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut pending_sum: i64 = 0;
    let mut sold_sum: i64 = 0;
    for row in rows {
        let (role_str, pending, sold) = row?;
        let role = Role::parse(&role_str)
            .ok_or_else(|| LedgerError::Internal(format!("unknown role '{}' in store", role_str)))?;
        if role.tier().map_or(false, |t| t >= target_tier) {
            pending_sum += pending;
            sold_sum += sold;
        }
    }

    let alert = sold_sum > 0 && (pending_sum as f64) / (sold_sum as f64) >= warning_threshold;
    accounts::set_collection_alert(tx, &target.id, alert)?;

    Ok(alert)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;

    struct Fixture {
        accounts: AccountStore,
        engine: AllocationEngine,
        em: Actor,
        sm: Actor,
        em_account: Account,
        sm_account: Account,
        seller_account: Account,
    }

    /// Event manager with a 10,000 point pool, one seller manager and one
    /// seller in the toys department.
    fn fixture() -> Fixture {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let accounts = AccountStore::new(store.clone());
        let engine = AllocationEngine::new(store, RuleTable::defaults());

        let em_account = accounts
            .create_account("em-1", Role::EventManager, "event", 10_000)
            .unwrap();
        let sm_account = accounts
            .create_account("sm-1", Role::SellerManager, "toys", 0)
            .unwrap();
        let seller_account = accounts
            .create_account("seller-1", Role::Seller, "toys", 0)
            .unwrap();

        let em = Actor::new(
            "em-1",
            vec![Role::EventManager],
            vec![crate::identity::EVENT_WIDE.to_string()],
        );
        let sm = Actor::new("sm-1", vec![Role::SellerManager], vec!["toys".to_string()]);

        Fixture {
            accounts,
            engine,
            em,
            sm,
            em_account,
            sm_account,
            seller_account,
        }
    }

    #[test]
    fn test_allocation_chain_em_to_sm_to_seller() {
        let f = fixture();

        let first = f
            .engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 500, None, None, None)
            .unwrap();
        assert_eq!(first.from.available_points, 9_500);
        assert_eq!(first.to.available_points, 500);
        assert_eq!(first.to.total_received, 500);

        let second = f
            .engine
            .allocate(&f.sm, &f.sm_account.id, &f.seller_account.id, 100, None, None, None)
            .unwrap();
        assert_eq!(second.from.available_points, 400);
        assert_eq!(second.to.available_points, 100);
        assert_eq!(second.to.total_received, 100);

        for account in [&second.from, &second.to, &first.from] {
            assert!(account.points_balanced());
        }

        // Two entries per transfer, one seed: five rows total
        assert_eq!(f.accounts.history(&f.em_account.id).unwrap().len(), 2);
        assert_eq!(f.accounts.history(&f.sm_account.id).unwrap().len(), 2);
        assert_eq!(f.accounts.history(&f.seller_account.id).unwrap().len(), 1);

        println!("✅ Allocation chain test passed");
    }

    #[test]
    fn test_both_sides_share_correlation_id() {
        let f = fixture();

        let outcome = f
            .engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 500, None, None, None)
            .unwrap();

        let conn = f.engine.store.lock();
        let entries = db::entries_for_correlation(&conn, &outcome.correlation_id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, -500);
        assert_eq!(entries[1].amount, 500);
        assert_eq!(entries[0].kind, TransactionKind::Allocation);

        println!("✅ Correlation id test passed");
    }

    #[test]
    fn test_limit_exceeded_changes_nothing() {
        let f = fixture();
        f.engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 1_000, None, None, None)
            .unwrap();

        // Seller manager limit is 1,000
        let err = f
            .engine
            .allocate(&f.sm, &f.sm_account.id, &f.seller_account.id, 1_001, None, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::LimitExceeded { limit: 1_000, amount: 1_001, .. }
        ));

        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        let seller = f.accounts.get(&f.seller_account.id).unwrap();
        assert_eq!(sm.available_points, 1_000);
        assert_eq!(seller.available_points, 0);
        assert_eq!(f.accounts.history(&f.seller_account.id).unwrap().len(), 0);

        println!("✅ Limit exceeded test passed");
    }

    #[test]
    fn test_insufficient_balance_rolls_back_whole_transfer() {
        let f = fixture();
        f.engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 400, None, None, None)
            .unwrap();

        let err = f
            .engine
            .allocate(&f.sm, &f.sm_account.id, &f.seller_account.id, 500, None, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        let seller = f.accounts.get(&f.seller_account.id).unwrap();
        assert_eq!(sm.available_points, 400);
        assert_eq!(seller.available_points, 0);
        assert!(sm.points_balanced() && seller.points_balanced());

        println!("✅ Insufficient balance rollback test passed");
    }

    #[test]
    fn test_department_authority_enforced() {
        let f = fixture();
        let foreign_seller = f
            .accounts
            .create_account("seller-9", Role::Seller, "food", 0)
            .unwrap();
        f.engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 500, None, None, None)
            .unwrap();

        // sm-1 is scoped to toys, seller-9 sells food
        let err = f
            .engine
            .allocate(&f.sm, &f.sm_account.id, &foreign_seller.id, 100, None, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        println!("✅ Department authority test passed");
    }

    #[test]
    fn test_capability_and_ownership_checks() {
        let f = fixture();

        let seller_actor = Actor::new("seller-1", vec![Role::Seller], vec!["toys".to_string()]);
        let err = f
            .engine
            .allocate(&seller_actor, &f.seller_account.id, &f.sm_account.id, 10, None, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        // sm-1 trying to spend the event manager's account
        let err = f
            .engine
            .allocate(&f.sm, &f.em_account.id, &f.sm_account.id, 10, None, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        println!("✅ Capability and ownership test passed");
    }

    #[test]
    fn test_allocations_flow_downward_only() {
        let f = fixture();
        f.engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 500, None, None, None)
            .unwrap();

        let err = f
            .engine
            .allocate(&f.sm, &f.sm_account.id, &f.em_account.id, 100, None, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        println!("✅ Downward flow test passed");
    }

    #[test]
    fn test_otp_gate_for_large_allocations() {
        let f = fixture();

        // 5,000 hits the event manager OTP threshold
        let err = f
            .engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 5_000, None, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let token = VerificationToken::verified("otp-ref-42");
        let outcome = f
            .engine
            .allocate(
                &f.em,
                &f.em_account.id,
                &f.sm_account.id,
                5_000,
                None,
                Some(&token),
                None,
            )
            .unwrap();
        assert_eq!(outcome.to.available_points, 5_000);

        // Below the threshold no token is needed
        f.engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 4_999, None, None, None)
            .unwrap();

        println!("✅ OTP gate test passed");
    }

    #[test]
    fn test_collection_alert_raised_then_cleared() {
        let f = fixture();
        f.engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 500, None, None, None)
            .unwrap();
        f.engine
            .allocate(&f.sm, &f.sm_account.id, &f.seller_account.id, 100, None, None, None)
            .unwrap();

        // Seller sells 90 of 100; all of it still uncollected → ratio 1.0
        let seller_actor = Actor::new("seller-1", vec![Role::Seller], vec!["toys".to_string()]);
        f.accounts
            .record_sale(&seller_actor, &f.seller_account.id, 90, None, None)
            .unwrap();

        let outcome = f
            .engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 100, None, None, None)
            .unwrap();
        assert!(outcome.collection_alert_raised);
        assert!(f.accounts.get(&f.sm_account.id).unwrap().collection_alert);

        // Cash gets picked up; the next allocation clears the alert
        let pickup = BalanceDelta {
            total_cash_collected: 90,
            pending_collection: -90,
            ..Default::default()
        };
        f.accounts
            .apply_delta(
                &pickup,
                EntryDraft {
                    account_id: f.seller_account.id.clone(),
                    kind: TransactionKind::Collection,
                    amount: -90,
                    actor_id: "sm-1".to_string(),
                    counterparty_id: None,
                    correlation_id: uuid::Uuid::new_v4().to_string(),
                    note: None,
                },
                None,
            )
            .unwrap();

        let outcome = f
            .engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 100, None, None, None)
            .unwrap();
        assert!(!outcome.collection_alert_raised);
        assert!(!f.accounts.get(&f.sm_account.id).unwrap().collection_alert);

        println!("✅ Collection alert test passed");
    }

    #[test]
    fn test_no_alert_when_nothing_sold_yet() {
        let f = fixture();

        let outcome = f
            .engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 500, None, None, None)
            .unwrap();
        assert!(!outcome.collection_alert_raised);

        println!("✅ No-sales alert edge case test passed");
    }

    #[test]
    fn test_recall_pulls_points_back_up() {
        let f = fixture();
        f.engine
            .allocate(&f.em, &f.em_account.id, &f.sm_account.id, 500, None, None, None)
            .unwrap();
        f.engine
            .allocate(&f.sm, &f.sm_account.id, &f.seller_account.id, 100, None, None, None)
            .unwrap();

        let outcome = f
            .engine
            .recall(
                &f.sm,
                &f.seller_account.id,
                &f.sm_account.id,
                60,
                Some("end of shift".to_string()),
                None,
            )
            .unwrap();

        assert_eq!(outcome.from.available_points, 40);
        assert_eq!(outcome.from.total_received, 40);
        assert_eq!(outcome.to.available_points, 460);
        assert!(outcome.from.points_balanced());
        assert!(outcome.to.points_balanced());

        println!("✅ Recall test passed");
    }

    #[test]
    fn test_allocate_is_idempotent_under_key() {
        let f = fixture();

        let first = f
            .engine
            .allocate(
                &f.em,
                &f.em_account.id,
                &f.sm_account.id,
                500,
                None,
                None,
                Some("alloc-key-1"),
            )
            .unwrap();
        let replay = f
            .engine
            .allocate(
                &f.em,
                &f.em_account.id,
                &f.sm_account.id,
                500,
                None,
                None,
                Some("alloc-key-1"),
            )
            .unwrap();

        assert_eq!(first.correlation_id, replay.correlation_id);
        assert_eq!(f.accounts.get(&f.em_account.id).unwrap().available_points, 9_500);
        assert_eq!(f.accounts.get(&f.sm_account.id).unwrap().available_points, 500);

        // Reusing the key for a different amount is rejected
        let err = f
            .engine
            .allocate(
                &f.em,
                &f.em_account.id,
                &f.sm_account.id,
                900,
                None,
                None,
                Some("alloc-key-1"),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        println!("✅ Idempotent allocation test passed");
    }
}
