// 💵 Collection Tracker - Cash custody moving from sellers to collectors
//
// A collection is the physical moment a seller manager takes banknotes off a
// seller's table. The seller's pending_collection shrinks, the collector's
// cash_on_hand grows, and a CashCollection row records the hand-over so the
// same banknotes can later be traced into a finance submission.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::accounts::{self, Account, BalanceDelta};
use crate::db::{self, EntryDraft, LedgerStore, TransactionKind};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::{Actor, Capability, Role};

// ============================================================================
// CASH COLLECTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashCollection {
    pub id: String,
    pub seller_id: String,
    /// Collector's account id, not their user id: the cash sits on a
    /// specific role account until it is submitted.
    pub collected_by: String,
    pub amount: i64,
    pub collected_at: DateTime<Utc>,
    pub submitted_to_finance: bool,
    pub submission_id: Option<String>,
}

const COLLECTION_COLUMNS: &str =
    "id, seller_id, collected_by, amount, collected_at, submitted_to_finance, submission_id";

pub(crate) fn collection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CashCollection> {
    let collected_at_str: String = row.get(4)?;

    Ok(CashCollection {
        id: row.get(0)?,
        seller_id: row.get(1)?,
        collected_by: row.get(2)?,
        amount: row.get(3)?,
        collected_at: DateTime::parse_from_rfc3339(&collected_at_str)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
        submitted_to_finance: row.get(5)?,
        submission_id: row.get(6)?,
    })
}

pub(crate) fn load_collection(conn: &Connection, collection_id: &str) -> LedgerResult<CashCollection> {
    conn.query_row(
        &format!(
            "SELECT {} FROM cash_collections WHERE id = ?1",
            COLLECTION_COLUMNS
        ),
        params![collection_id],
        collection_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("collection", collection_id))
}

/// Tie a collection to the submission that carries its cash to finance.
pub(crate) fn mark_submitted(
    conn: &Connection,
    collection_id: &str,
    submission_id: &str,
) -> LedgerResult<()> {
    conn.execute(
        "UPDATE cash_collections SET submitted_to_finance = 1, submission_id = ?2 WHERE id = ?1",
        params![collection_id, submission_id],
    )?;

    Ok(())
}

/// Detach every collection from a rejected submission so the cash can be
/// recounted and resubmitted.
pub(crate) fn release_for_submission(conn: &Connection, submission_id: &str) -> LedgerResult<usize> {
    let released = conn.execute(
        "UPDATE cash_collections SET submitted_to_finance = 0, submission_id = NULL
         WHERE submission_id = ?1",
        params![submission_id],
    )?;

    Ok(released)
}

pub(crate) fn collections_for_submission(
    conn: &Connection,
    submission_id: &str,
) -> LedgerResult<Vec<CashCollection>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM cash_collections WHERE submission_id = ?1 ORDER BY collected_at",
        COLLECTION_COLUMNS
    ))?;

    let collections = stmt
        .query_map(params![submission_id], collection_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(collections)
}

// ============================================================================
// COLLECTION TRACKER
// ============================================================================

/// Everything the caller gets back from one hand-over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub collection: CashCollection,
    pub seller: Account,
    pub collector: Account,
}

#[derive(Clone)]
pub struct CollectionTracker {
    store: Arc<LedgerStore>,
}

impl CollectionTracker {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        CollectionTracker { store }
    }

    /// Record a cash hand-over from a seller to the acting collector.
    /// Collecting more than the seller's outstanding pending amount is
    /// rejected outright; partial pickups are the normal case.
    pub fn record_collection(
        &self,
        actor: &Actor,
        collector_account_id: &str,
        seller_account_id: &str,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<CollectionOutcome> {
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "collection amount must be > 0, got {}",
                amount
            )));
        }
        if !actor.has_capability(Capability::Collect) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot collect cash",
                actor.user_id
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fingerprint = db::request_fingerprint(
            "record_collection",
            &format!("{}|{}|{}", collector_account_id, seller_account_id, amount),
        );
        if let Some(key) = idempotency_key {
            if let Some(stored) = db::replay_outcome(&tx, key, "record_collection", &fingerprint)? {
                let outcome: CollectionOutcome = serde_json::from_str(&stored)?;
                return Ok(outcome);
            }
        }

        let collector = accounts::load_account(&tx, collector_account_id)?;
        if collector.user_id != actor.user_id || !actor.has_role(collector.role) {
            return Err(LedgerError::Unauthorized(format!(
                "account {} is not an account user '{}' collects into",
                collector_account_id, actor.user_id
            )));
        }
        if collector.role != Role::SellerManager {
            return Err(LedgerError::Validation(format!(
                "cash is collected into a seller manager account, {} is a {} account",
                collector_account_id, collector.role
            )));
        }

        let seller = accounts::load_account(&tx, seller_account_id)?;
        if seller.role != Role::Seller {
            return Err(LedgerError::Validation(format!(
                "cash is collected from seller accounts, {} is a {} account",
                seller_account_id, seller.role
            )));
        }
        if !actor.can_administer(&seller.department) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' has no authority over department '{}'",
                actor.user_id, seller.department
            )));
        }

        if amount > seller.pending_collection {
            return Err(LedgerError::AmountExceedsPending {
                seller_id: seller.id,
                requested: amount,
                pending: seller.pending_collection,
            });
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();

        let seller_delta = BalanceDelta {
            total_cash_collected: amount,
            pending_collection: -amount,
            ..Default::default()
        };
        let seller_after = accounts::apply_delta_on(
            &tx,
            &seller_delta,
            &EntryDraft {
                account_id: seller.id.clone(),
                kind: TransactionKind::Collection,
                amount: -amount,
                actor_id: actor.user_id.clone(),
                counterparty_id: Some(collector.id.clone()),
                correlation_id: correlation_id.clone(),
                note: None,
            },
        )?;

        let collector_delta = BalanceDelta {
            cash_on_hand: amount,
            pending_cash_submission: amount,
            ..Default::default()
        };
        let collector_after = accounts::apply_delta_on(
            &tx,
            &collector_delta,
            &EntryDraft {
                account_id: collector.id.clone(),
                kind: TransactionKind::Collection,
                amount,
                actor_id: actor.user_id.clone(),
                counterparty_id: Some(seller.id.clone()),
                correlation_id: correlation_id.clone(),
                note: None,
            },
        )?;

        let collection = CashCollection {
            id: uuid::Uuid::new_v4().to_string(),
            seller_id: seller.id.clone(),
            collected_by: collector.id.clone(),
            amount,
            collected_at: Utc::now(),
            submitted_to_finance: false,
            submission_id: None,
        };
        tx.execute(
            "INSERT INTO cash_collections (
                id, seller_id, collected_by, amount, collected_at, submitted_to_finance
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                collection.id,
                collection.seller_id,
                collection.collected_by,
                collection.amount,
                collection.collected_at.to_rfc3339(),
            ],
        )?;

        let outcome = CollectionOutcome {
            collection,
            seller: seller_after,
            collector: collector_after,
        };

        if let Some(key) = idempotency_key {
            db::record_outcome(
                &tx,
                key,
                "record_collection",
                &fingerprint,
                &serde_json::to_string(&outcome)?,
            )?;
        }

        tx.commit()?;

        tracing::info!(
            collection_id = %outcome.collection.id,
            seller = %outcome.seller.id,
            collector = %outcome.collector.id,
            amount,
            "cash collected"
        );

        Ok(outcome)
    }

    pub fn get(&self, collection_id: &str) -> LedgerResult<CashCollection> {
        let conn = self.store.lock();
        load_collection(&conn, collection_id)
    }

    /// Collections still sitting on a collector's account, oldest first.
    /// These are the candidates for the next submission to finance.
    pub fn unsubmitted_for(&self, collector_account_id: &str) -> LedgerResult<Vec<CashCollection>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cash_collections
             WHERE collected_by = ?1 AND submitted_to_finance = 0
             ORDER BY collected_at",
            COLLECTION_COLUMNS
        ))?;

        let collections = stmt
            .query_map(params![collector_account_id], collection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(collections)
    }

    pub fn for_seller(&self, seller_account_id: &str) -> LedgerResult<Vec<CashCollection>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cash_collections WHERE seller_id = ?1 ORDER BY collected_at",
            COLLECTION_COLUMNS
        ))?;

        let collections = stmt
            .query_map(params![seller_account_id], collection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(collections)
    }
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
        tracker: CollectionTracker,
        sm: Actor,
        sm_account: Account,
        seller_account: Account,
    }

    /// Seller with 150 points sold and uncollected, manager ready to collect.
    fn fixture() -> Fixture {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let accounts = AccountStore::new(store.clone());
        let tracker = CollectionTracker::new(store);

        let sm_account = accounts
            .create_account("sm-1", Role::SellerManager, "toys", 0)
            .unwrap();
        let seller_account = accounts
            .create_account("seller-1", Role::Seller, "toys", 200)
            .unwrap();

        let seller_actor = Actor::new("seller-1", vec![Role::Seller], vec!["toys".to_string()]);
        accounts
            .record_sale(&seller_actor, &seller_account.id, 150, None, None)
            .unwrap();

        let sm = Actor::new("sm-1", vec![Role::SellerManager], vec!["toys".to_string()]);

        Fixture {
            accounts,
            tracker,
            sm,
            sm_account,
            seller_account,
        }
    }

    #[test]
    fn test_collection_moves_cash_custody() {
        let f = fixture();

        let outcome = f
            .tracker
            .record_collection(&f.sm, &f.sm_account.id, &f.seller_account.id, 100, None)
            .unwrap();

        assert_eq!(outcome.seller.total_cash_collected, 100);
        assert_eq!(outcome.seller.pending_collection, 50);
        assert!(outcome.seller.cash_balanced());

        assert_eq!(outcome.collector.cash_on_hand, 100);
        assert_eq!(outcome.collector.pending_cash_submission, 100);

        assert!(!outcome.collection.submitted_to_finance);
        assert_eq!(outcome.collection.amount, 100);

        let open = f.tracker.unsubmitted_for(&f.sm_account.id).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, outcome.collection.id);

        println!("✅ Cash custody test passed");
    }

    #[test]
    fn test_first_pickup_from_fresh_seller() {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let accounts = AccountStore::new(store.clone());
        let tracker = CollectionTracker::new(store.clone());

        let sm_account = accounts
            .create_account("sm-2", Role::SellerManager, "food", 0)
            .unwrap();
        let seller_account = accounts
            .create_account("seller-2", Role::Seller, "food", 100)
            .unwrap();

        let seller_actor = Actor::new("seller-2", vec![Role::Seller], vec!["food".to_string()]);
        accounts
            .record_sale(&seller_actor, &seller_account.id, 80, None, None)
            .unwrap();

        let sm = Actor::new("sm-2", vec![Role::SellerManager], vec!["food".to_string()]);
        let outcome = tracker
            .record_collection(&sm, &sm_account.id, &seller_account.id, 50, None)
            .unwrap();

        assert_eq!(outcome.seller.pending_collection, 30);
        assert_eq!(outcome.seller.total_cash_collected, 50);
        assert_eq!(outcome.collector.cash_on_hand, 50);

        // Both sides of the pickup share one correlation id: -50 at the
        // seller, +50 at the collector
        let conn = store.lock();
        let seller_entries = crate::db::entries_for_account(&conn, &seller_account.id).unwrap();
        let pickup_entry = seller_entries
            .iter()
            .find(|e| e.kind == TransactionKind::Collection)
            .unwrap();
        let pair =
            crate::db::entries_for_correlation(&conn, &pickup_entry.correlation_id).unwrap();
        assert_eq!(pair.len(), 2);
        assert_eq!(pair[0].amount + pair[1].amount, 0);

        println!("✅ Fresh seller pickup test passed");
    }

    #[test]
    fn test_collection_cannot_exceed_pending() {
        let f = fixture();

        let err = f
            .tracker
            .record_collection(&f.sm, &f.sm_account.id, &f.seller_account.id, 200, None)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::AmountExceedsPending {
                requested: 200,
                pending: 150,
                ..
            }
        ));

        let seller = f.accounts.get(&f.seller_account.id).unwrap();
        assert_eq!(seller.pending_collection, 150);
        assert_eq!(seller.total_cash_collected, 0);
        assert_eq!(f.tracker.for_seller(&f.seller_account.id).unwrap().len(), 0);

        println!("✅ Exceeds pending test passed");
    }

    #[test]
    fn test_partial_collections_accumulate() {
        let f = fixture();

        f.tracker
            .record_collection(&f.sm, &f.sm_account.id, &f.seller_account.id, 100, None)
            .unwrap();
        let second = f
            .tracker
            .record_collection(&f.sm, &f.sm_account.id, &f.seller_account.id, 50, None)
            .unwrap();

        assert_eq!(second.seller.pending_collection, 0);
        assert_eq!(second.seller.total_cash_collected, 150);
        assert_eq!(second.collector.cash_on_hand, 150);

        // The pot is empty now
        let err = f
            .tracker
            .record_collection(&f.sm, &f.sm_account.id, &f.seller_account.id, 1, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::AmountExceedsPending { pending: 0, .. }));

        assert_eq!(f.tracker.for_seller(&f.seller_account.id).unwrap().len(), 2);

        println!("✅ Partial collections test passed");
    }

    #[test]
    fn test_collection_requires_collect_capability() {
        let f = fixture();

        let seller_actor = Actor::new("seller-1", vec![Role::Seller], vec!["toys".to_string()]);
        let err = f
            .tracker
            .record_collection(&seller_actor, &f.sm_account.id, &f.seller_account.id, 10, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let finance_actor = Actor::new("fin-1", vec![Role::Finance], vec!["event".to_string()]);
        let err = f
            .tracker
            .record_collection(&finance_actor, &f.sm_account.id, &f.seller_account.id, 10, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        println!("✅ Collect capability test passed");
    }

    #[test]
    fn test_collector_must_own_the_account() {
        let f = fixture();

        let other_sm = Actor::new("sm-2", vec![Role::SellerManager], vec!["toys".to_string()]);
        let err = f
            .tracker
            .record_collection(&other_sm, &f.sm_account.id, &f.seller_account.id, 10, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        println!("✅ Collector ownership test passed");
    }

    #[test]
    fn test_collection_respects_department_authority() {
        let f = fixture();
        let food_seller = f
            .accounts
            .create_account("seller-9", Role::Seller, "food", 100)
            .unwrap();
        let food_actor = Actor::new("seller-9", vec![Role::Seller], vec!["food".to_string()]);
        f.accounts
            .record_sale(&food_actor, &food_seller.id, 80, None, None)
            .unwrap();

        // sm-1 is scoped to toys
        let err = f
            .tracker
            .record_collection(&f.sm, &f.sm_account.id, &food_seller.id, 50, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        println!("✅ Collection department authority test passed");
    }

    #[test]
    fn test_collection_is_idempotent_under_key() {
        let f = fixture();

        let first = f
            .tracker
            .record_collection(
                &f.sm,
                &f.sm_account.id,
                &f.seller_account.id,
                100,
                Some("pickup-1"),
            )
            .unwrap();
        let replay = f
            .tracker
            .record_collection(
                &f.sm,
                &f.sm_account.id,
                &f.seller_account.id,
                100,
                Some("pickup-1"),
            )
            .unwrap();

        assert_eq!(first.collection.id, replay.collection.id);

        let seller = f.accounts.get(&f.seller_account.id).unwrap();
        assert_eq!(seller.pending_collection, 50);
        assert_eq!(f.tracker.for_seller(&f.seller_account.id).unwrap().len(), 1);

        println!("✅ Idempotent collection test passed");
    }
}
