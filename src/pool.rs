// 🏦 Submission Pool - Cash parcels queued for finance
//
// A submission is a counted stack of banknotes travelling from a collector to
// the finance desk. Parcels enter the pool pending; any finance member may
// claim one but exactly one wins (claim is a compare-and-swap on the row).
// Confirm settles the hand-over once; dispute, reject and requeue route a
// miscounted parcel through manual review. Nothing in the pool is ever
// deleted, a rejected parcel stays visible with its reason.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::accounts::{self, BalanceDelta};
use crate::collection;
use crate::db::{self, EntryDraft, LedgerStore, TransactionKind};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::{Actor, Capability, Role};

/// Machine-written note tags on submission lifecycle entries. The ledger
/// replay relies on these to tell the three cash movements apart; human
/// commentary lives on the parcel's resolution_note instead.
pub(crate) const NOTE_SUBMITTED: &str = "submitted";
pub(crate) const NOTE_CONFIRMED: &str = "confirmed";
pub(crate) const NOTE_REJECTED: &str = "rejected";

fn lifecycle_note(tag: &str, submission_id: &str) -> String {
    format!("{}:{}", tag, submission_id)
}

// ============================================================================
// SUBMISSION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Claimed,
    Confirmed,
    Disputed,
    Rejected,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Claimed => "claimed",
            SubmissionStatus::Confirmed => "confirmed",
            SubmissionStatus::Disputed => "disputed",
            SubmissionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<SubmissionStatus> {
        match s {
            "pending" => Some(SubmissionStatus::Pending),
            "claimed" => Some(SubmissionStatus::Claimed),
            "confirmed" => Some(SubmissionStatus::Confirmed),
            "disputed" => Some(SubmissionStatus::Disputed),
            "rejected" => Some(SubmissionStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Confirmed | SubmissionStatus::Rejected)
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CASH SUBMISSION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashSubmission {
    pub id: String,
    /// Collector account the parcel came from.
    pub submitter_id: String,
    pub submitter_role: Role,
    pub amount: i64,
    pub status: SubmissionStatus,
    /// Finance user who claimed the parcel; cleared again on requeue.
    pub received_by: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Reason or note from the latest resolution step.
    pub resolution_note: Option<String>,
    /// Collections currently tied to this parcel (empty again after a
    /// rejection releases them).
    pub collection_ids: Vec<String>,
}

const SUBMISSION_COLUMNS: &str = "id, submitter_id, submitter_role, amount, status, \
                                  received_by, submitted_at, claimed_at, confirmed_at, \
                                  resolution_note";

fn parse_opt_ts(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| rusqlite::Error::InvalidQuery),
    }
}

fn submission_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CashSubmission> {
    let role_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let submitted_at_str: String = row.get(6)?;

    Ok(CashSubmission {
        id: row.get(0)?,
        submitter_id: row.get(1)?,
        submitter_role: Role::parse(&role_str).ok_or(rusqlite::Error::InvalidQuery)?,
        amount: row.get(3)?,
        status: SubmissionStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?,
        received_by: row.get(5)?,
        submitted_at: DateTime::parse_from_rfc3339(&submitted_at_str)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
        claimed_at: parse_opt_ts(row.get(7)?)?,
        confirmed_at: parse_opt_ts(row.get(8)?)?,
        resolution_note: row.get(9)?,
        collection_ids: Vec::new(),
    })
}

fn load_submission(conn: &Connection, submission_id: &str) -> LedgerResult<CashSubmission> {
    let mut submission = conn
        .query_row(
            &format!(
                "SELECT {} FROM cash_submissions WHERE id = ?1",
                SUBMISSION_COLUMNS
            ),
            params![submission_id],
            submission_from_row,
        )
        .optional()?
        .ok_or_else(|| LedgerError::not_found("submission", submission_id))?;

    submission.collection_ids = collection::collections_for_submission(conn, submission_id)?
        .into_iter()
        .map(|c| c.id)
        .collect();

    Ok(submission)
}

// ============================================================================
// SUBMISSION POOL
// ============================================================================

#[derive(Clone)]
pub struct SubmissionPool {
    store: Arc<LedgerStore>,
}

impl SubmissionPool {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        SubmissionPool { store }
    }

    /// Hand a counted cash parcel to the finance pool. The parcel must be
    /// backed by named, not-yet-submitted collections whose amounts sum
    /// exactly to the declared total.
    pub fn submit(
        &self,
        actor: &Actor,
        submitter_account_id: &str,
        amount: i64,
        collection_ids: &[String],
        idempotency_key: Option<&str>,
    ) -> LedgerResult<CashSubmission> {
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "submission amount must be > 0, got {}",
                amount
            )));
        }
        if collection_ids.is_empty() {
            return Err(LedgerError::Validation(
                "a submission must include at least one collection".into(),
            ));
        }
        if !actor.has_capability(Capability::Collect) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot submit cash to finance",
                actor.user_id
            )));
        }

        let mut sorted_ids: Vec<&String> = collection_ids.iter().collect();
        sorted_ids.sort();
        for pair in sorted_ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(LedgerError::Validation(format!(
                    "collection {} is listed twice in the submission",
                    pair[0]
                )));
            }
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fingerprint = db::request_fingerprint(
            "submit",
            &format!(
                "{}|{}|{}",
                submitter_account_id,
                amount,
                sorted_ids
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        );
        if let Some(key) = idempotency_key {
            if let Some(stored) = db::replay_outcome(&tx, key, "submit", &fingerprint)? {
                let submission: CashSubmission = serde_json::from_str(&stored)?;
                return Ok(submission);
            }
        }

        let submitter = accounts::load_account(&tx, submitter_account_id)?;
        if submitter.user_id != actor.user_id || !actor.has_role(submitter.role) {
            return Err(LedgerError::Unauthorized(format!(
                "account {} is not an account user '{}' submits from",
                submitter_account_id, actor.user_id
            )));
        }

        let mut included_total: i64 = 0;
        for collection_id in collection_ids {
            let coll = collection::load_collection(&tx, collection_id)?;
            if coll.collected_by != submitter.id {
                return Err(LedgerError::Forbidden(format!(
                    "collection {} was not collected by account {}",
                    collection_id, submitter.id
                )));
            }
            if coll.submitted_to_finance {
                return Err(LedgerError::AlreadySubmitted {
                    collection_id: collection_id.clone(),
                });
            }
            included_total += coll.amount;
        }
        if included_total != amount {
            return Err(LedgerError::Validation(format!(
                "submission amount {} does not match included collections total {}",
                amount, included_total
            )));
        }

        let submission_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        tx.execute(
            "INSERT INTO cash_submissions (
                id, submitter_id, submitter_role, amount, status, submitted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                submission_id,
                submitter.id,
                submitter.role.as_str(),
                amount,
                SubmissionStatus::Pending.as_str(),
                now.to_rfc3339(),
            ],
        )?;

        for collection_id in collection_ids {
            collection::mark_submitted(&tx, collection_id, &submission_id)?;
        }

        // The cash is still physically on the submitter; only its earmark
        // moves from "waiting to be submitted" to "in the pool".
        let delta = BalanceDelta {
            pending_cash_submission: -amount,
            ..Default::default()
        };
        accounts::apply_delta_on(
            &tx,
            &delta,
            &EntryDraft {
                account_id: submitter.id.clone(),
                kind: TransactionKind::Submission,
                amount: -amount,
                actor_id: actor.user_id.clone(),
                counterparty_id: None,
                correlation_id: submission_id.clone(),
                note: Some(lifecycle_note(NOTE_SUBMITTED, &submission_id)),
            },
        )?;

        let submission = load_submission(&tx, &submission_id)?;

        if let Some(key) = idempotency_key {
            db::record_outcome(
                &tx,
                key,
                "submit",
                &fingerprint,
                &serde_json::to_string(&submission)?,
            )?;
        }

        tx.commit()?;

        tracing::info!(
            submission_id = %submission.id,
            submitter = %submission.submitter_id,
            amount,
            collections = submission.collection_ids.len(),
            "cash parcel submitted to pool"
        );

        Ok(submission)
    }

    /// Claim a pending parcel for counting. Exactly one finance member wins;
    /// everyone else gets AlreadyClaimed. A repeat claim by the winner is a
    /// no-op success, which is what makes blind retries safe.
    pub fn claim(&self, actor: &Actor, submission_id: &str) -> LedgerResult<CashSubmission> {
        if !actor.has_capability(Capability::Claim) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot claim submissions",
                actor.user_id
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Compare-and-swap: only an unclaimed pending row can be taken.
        let taken = tx.execute(
            "UPDATE cash_submissions
             SET status = ?2, received_by = ?3, claimed_at = ?4
             WHERE id = ?1 AND status = ?5 AND received_by IS NULL",
            params![
                submission_id,
                SubmissionStatus::Claimed.as_str(),
                actor.user_id,
                Utc::now().to_rfc3339(),
                SubmissionStatus::Pending.as_str(),
            ],
        )?;

        let submission = load_submission(&tx, submission_id)?;

        if taken == 0 {
            // Lost the race, or retrying an earlier win.
            if submission.status == SubmissionStatus::Claimed
                && submission.received_by.as_deref() == Some(actor.user_id.as_str())
            {
                tx.commit()?;
                return Ok(submission);
            }
            return Err(LedgerError::AlreadyClaimed {
                submission_id: submission_id.to_string(),
                claimed_by: submission
                    .received_by
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        tx.commit()?;

        tracing::info!(
            submission_id = %submission.id,
            claimed_by = %actor.user_id,
            "submission claimed"
        );

        Ok(submission)
    }

    /// Count the cash and settle the parcel. Only the claimant may confirm;
    /// confirming an already-confirmed parcel again is a no-op success, so
    /// the balance effect happens exactly once no matter how many retries.
    pub fn confirm(
        &self,
        actor: &Actor,
        submission_id: &str,
        note: Option<String>,
    ) -> LedgerResult<CashSubmission> {
        if !actor.has_capability(Capability::Confirm) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot confirm submissions",
                actor.user_id
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let submission = load_submission(&tx, submission_id)?;

        match submission.status {
            SubmissionStatus::Confirmed => {
                if submission.received_by.as_deref() == Some(actor.user_id.as_str()) {
                    return Ok(submission);
                }
                Err(LedgerError::Forbidden(format!(
                    "submission {} was confirmed by '{}'",
                    submission_id,
                    submission.received_by.as_deref().unwrap_or("unknown")
                )))
            }
            SubmissionStatus::Claimed => {
                if submission.received_by.as_deref() != Some(actor.user_id.as_str()) {
                    return Err(LedgerError::Forbidden(format!(
                        "submission {} is claimed by '{}', only the claimant confirms it",
                        submission_id,
                        submission.received_by.as_deref().unwrap_or("unknown")
                    )));
                }

                // Cash leaves the collector's custody for good.
                let delta = BalanceDelta {
                    cash_on_hand: -submission.amount,
                    cash_submitted: submission.amount,
                    ..Default::default()
                };
                accounts::apply_delta_on(
                    &tx,
                    &delta,
                    &EntryDraft {
                        account_id: submission.submitter_id.clone(),
                        kind: TransactionKind::Submission,
                        amount: -submission.amount,
                        actor_id: actor.user_id.clone(),
                        counterparty_id: None,
                        correlation_id: submission.id.clone(),
                        note: Some(lifecycle_note(NOTE_CONFIRMED, &submission.id)),
                    },
                )?;

                tx.execute(
                    "UPDATE cash_submissions
                     SET status = ?2, confirmed_at = ?3, resolution_note = ?4
                     WHERE id = ?1",
                    params![
                        submission_id,
                        SubmissionStatus::Confirmed.as_str(),
                        Utc::now().to_rfc3339(),
                        note,
                    ],
                )?;

                let confirmed = load_submission(&tx, submission_id)?;
                tx.commit()?;

                tracing::info!(
                    submission_id = %confirmed.id,
                    confirmed_by = %actor.user_id,
                    amount = confirmed.amount,
                    "submission confirmed"
                );

                Ok(confirmed)
            }
            SubmissionStatus::Pending => Err(LedgerError::Forbidden(format!(
                "submission {} must be claimed before it can be confirmed",
                submission_id
            ))),
            SubmissionStatus::Disputed => Err(LedgerError::Validation(format!(
                "submission {} is disputed; requeue it before confirming",
                submission_id
            ))),
            SubmissionStatus::Rejected => Err(LedgerError::Validation(format!(
                "submission {} was rejected and is closed",
                submission_id
            ))),
        }
    }

    /// Flag a count mismatch without settling or undoing anything. The
    /// parcel freezes in Disputed until a supervisor requeues it.
    pub fn dispute(
        &self,
        actor: &Actor,
        submission_id: &str,
        reason: &str,
    ) -> LedgerResult<CashSubmission> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "a dispute needs a reason".into(),
            ));
        }
        if !actor.has_capability(Capability::Confirm) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot dispute submissions",
                actor.user_id
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let submission = load_submission(&tx, submission_id)?;

        match submission.status {
            SubmissionStatus::Disputed => {
                if submission.received_by.as_deref() == Some(actor.user_id.as_str()) {
                    return Ok(submission);
                }
                Err(LedgerError::Forbidden(format!(
                    "submission {} is under dispute by '{}'",
                    submission_id,
                    submission.received_by.as_deref().unwrap_or("unknown")
                )))
            }
            SubmissionStatus::Claimed => {
                if submission.received_by.as_deref() != Some(actor.user_id.as_str()) {
                    return Err(LedgerError::Forbidden(format!(
                        "submission {} is claimed by '{}', only the claimant disputes it",
                        submission_id,
                        submission.received_by.as_deref().unwrap_or("unknown")
                    )));
                }

                tx.execute(
                    "UPDATE cash_submissions SET status = ?2, resolution_note = ?3 WHERE id = ?1",
                    params![
                        submission_id,
                        SubmissionStatus::Disputed.as_str(),
                        reason,
                    ],
                )?;

                let disputed = load_submission(&tx, submission_id)?;
                tx.commit()?;

                tracing::warn!(
                    submission_id = %disputed.id,
                    disputed_by = %actor.user_id,
                    reason,
                    "submission disputed"
                );

                Ok(disputed)
            }
            other => Err(LedgerError::Validation(format!(
                "only a claimed submission can be disputed, {} is {}",
                submission_id, other
            ))),
        }
    }

    /// Close the parcel as not-accepted. The included collections become
    /// submittable again and the earmarked amount returns to the collector,
    /// who still physically holds the cash.
    pub fn reject(
        &self,
        actor: &Actor,
        submission_id: &str,
        reason: &str,
    ) -> LedgerResult<CashSubmission> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "a rejection needs a reason".into(),
            ));
        }
        if !actor.has_capability(Capability::Confirm) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot reject submissions",
                actor.user_id
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let submission = load_submission(&tx, submission_id)?;

        match submission.status {
            SubmissionStatus::Rejected => {
                if submission.received_by.as_deref() == Some(actor.user_id.as_str()) {
                    return Ok(submission);
                }
                Err(LedgerError::Validation(format!(
                    "submission {} was already rejected",
                    submission_id
                )))
            }
            SubmissionStatus::Claimed => {
                if submission.received_by.as_deref() != Some(actor.user_id.as_str()) {
                    return Err(LedgerError::Forbidden(format!(
                        "submission {} is claimed by '{}', only the claimant rejects it",
                        submission_id,
                        submission.received_by.as_deref().unwrap_or("unknown")
                    )));
                }

                collection::release_for_submission(&tx, submission_id)?;

                let delta = BalanceDelta {
                    pending_cash_submission: submission.amount,
                    ..Default::default()
                };
                accounts::apply_delta_on(
                    &tx,
                    &delta,
                    &EntryDraft {
                        account_id: submission.submitter_id.clone(),
                        kind: TransactionKind::Submission,
                        amount: submission.amount,
                        actor_id: actor.user_id.clone(),
                        counterparty_id: None,
                        correlation_id: submission.id.clone(),
                        note: Some(lifecycle_note(NOTE_REJECTED, &submission.id)),
                    },
                )?;

                tx.execute(
                    "UPDATE cash_submissions SET status = ?2, resolution_note = ?3 WHERE id = ?1",
                    params![
                        submission_id,
                        SubmissionStatus::Rejected.as_str(),
                        reason,
                    ],
                )?;

                let rejected = load_submission(&tx, submission_id)?;
                tx.commit()?;

                tracing::warn!(
                    submission_id = %rejected.id,
                    rejected_by = %actor.user_id,
                    reason,
                    "submission rejected, collections released"
                );

                Ok(rejected)
            }
            SubmissionStatus::Disputed => Err(LedgerError::Validation(format!(
                "submission {} is disputed; requeue it before rejecting",
                submission_id
            ))),
            other => Err(LedgerError::Validation(format!(
                "only a claimed submission can be rejected, {} is {}",
                submission_id, other
            ))),
        }
    }

    /// Supervisor action after a dispute: put the parcel back in the pool
    /// for a fresh count by whoever claims it next.
    pub fn requeue(
        &self,
        actor: &Actor,
        submission_id: &str,
        note: &str,
    ) -> LedgerResult<CashSubmission> {
        if !actor.has_capability(Capability::Confirm) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot requeue submissions",
                actor.user_id
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let submission = load_submission(&tx, submission_id)?;
        if submission.status != SubmissionStatus::Disputed {
            return Err(LedgerError::Validation(format!(
                "only a disputed submission can be requeued, {} is {}",
                submission_id, submission.status
            )));
        }

        tx.execute(
            "UPDATE cash_submissions
             SET status = ?2, received_by = NULL, claimed_at = NULL, resolution_note = ?3
             WHERE id = ?1",
            params![submission_id, SubmissionStatus::Pending.as_str(), note],
        )?;

        let requeued = load_submission(&tx, submission_id)?;
        tx.commit()?;

        tracing::info!(
            submission_id = %requeued.id,
            requeued_by = %actor.user_id,
            "submission requeued for a fresh count"
        );

        Ok(requeued)
    }

    pub fn get(&self, submission_id: &str) -> LedgerResult<CashSubmission> {
        let conn = self.store.lock();
        load_submission(&conn, submission_id)
    }

    /// The open pool as finance sees it: pending and claimed parcels, oldest
    /// first.
    pub fn open_pool(&self) -> LedgerResult<Vec<CashSubmission>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cash_submissions
             WHERE status IN (?1, ?2)
             ORDER BY submitted_at",
            SUBMISSION_COLUMNS
        ))?;

        let ids: Vec<String> = stmt
            .query_map(
                params![
                    SubmissionStatus::Pending.as_str(),
                    SubmissionStatus::Claimed.as_str()
                ],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        ids.iter().map(|id| load_submission(&conn, id)).collect()
    }

    pub fn for_submitter(&self, submitter_account_id: &str) -> LedgerResult<Vec<CashSubmission>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cash_submissions WHERE submitter_id = ?1 ORDER BY submitted_at",
            SUBMISSION_COLUMNS
        ))?;

        let ids: Vec<String> = stmt
            .query_map(params![submitter_account_id], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        ids.iter().map(|id| load_submission(&conn, id)).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{Account, AccountStore};
    use crate::collection::CollectionTracker;

    struct Fixture {
        accounts: AccountStore,
        tracker: CollectionTracker,
        pool: SubmissionPool,
        sm: Actor,
        fin_a: Actor,
        fin_b: Actor,
        sm_account: Account,
        collection_ids: Vec<String>,
    }

    /// Seller manager holding 450 in collected cash across two pickups
    /// (300 + 150), ready to submit; two finance members at the desk.
    fn fixture() -> Fixture {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let accounts = AccountStore::new(store.clone());
        let tracker = CollectionTracker::new(store.clone());
        let pool = SubmissionPool::new(store);

        let sm_account = accounts
            .create_account("sm-1", Role::SellerManager, "toys", 0)
            .unwrap();
        let seller_account = accounts
            .create_account("seller-1", Role::Seller, "toys", 500)
            .unwrap();

        let seller_actor = Actor::new("seller-1", vec![Role::Seller], vec!["toys".to_string()]);
        accounts
            .record_sale(&seller_actor, &seller_account.id, 450, None, None)
            .unwrap();

        let sm = Actor::new("sm-1", vec![Role::SellerManager], vec!["toys".to_string()]);
        let first = tracker
            .record_collection(&sm, &sm_account.id, &seller_account.id, 300, None)
            .unwrap();
        let second = tracker
            .record_collection(&sm, &sm_account.id, &seller_account.id, 150, None)
            .unwrap();

        Fixture {
            accounts,
            tracker,
            pool,
            sm,
            fin_a: Actor::new("fin-a", vec![Role::Finance], vec![]),
            fin_b: Actor::new("fin-b", vec![Role::Finance], vec![]),
            sm_account,
            collection_ids: vec![first.collection.id, second.collection.id],
        }
    }

    fn submit_parcel(f: &Fixture) -> CashSubmission {
        f.pool
            .submit(&f.sm, &f.sm_account.id, 450, &f.collection_ids, None)
            .unwrap()
    }

    #[test]
    fn test_submit_creates_pending_parcel() {
        let f = fixture();

        let submission = submit_parcel(&f);
        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(submission.amount, 450);
        assert_eq!(submission.collection_ids.len(), 2);
        assert!(submission.received_by.is_none());

        // Earmark moved into the pool; physical custody unchanged
        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        assert_eq!(sm.pending_cash_submission, 0);
        assert_eq!(sm.cash_on_hand, 450);
        assert_eq!(sm.cash_submitted, 0);

        // Both collections now locked to the parcel
        assert!(f.tracker.unsubmitted_for(&f.sm_account.id).unwrap().is_empty());

        assert_eq!(f.pool.open_pool().unwrap().len(), 1);

        println!("✅ Submit test passed");
    }

    #[test]
    fn test_submit_rejects_bad_amount_and_foreign_or_used_collections() {
        let f = fixture();

        // Sum mismatch
        let err = f
            .pool
            .submit(&f.sm, &f.sm_account.id, 449, &f.collection_ids, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        // Empty backing
        let err = f.pool.submit(&f.sm, &f.sm_account.id, 450, &[], None).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        // Same collection listed twice
        let doubled = vec![f.collection_ids[0].clone(), f.collection_ids[0].clone()];
        let err = f
            .pool
            .submit(&f.sm, &f.sm_account.id, 600, &doubled, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        // A collection already in an earlier parcel
        f.pool
            .submit(&f.sm, &f.sm_account.id, 300, &f.collection_ids[0..1], None)
            .unwrap();
        let err = f
            .pool
            .submit(&f.sm, &f.sm_account.id, 450, &f.collection_ids, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadySubmitted { .. }));

        println!("✅ Submit validation test passed");
    }

    #[test]
    fn test_claim_then_confirm_settles_once() {
        let f = fixture();
        let submission = submit_parcel(&f);

        let claimed = f.pool.claim(&f.fin_a, &submission.id).unwrap();
        assert_eq!(claimed.status, SubmissionStatus::Claimed);
        assert_eq!(claimed.received_by.as_deref(), Some("fin-a"));

        let confirmed = f
            .pool
            .confirm(&f.fin_a, &submission.id, Some("counted, all good".to_string()))
            .unwrap();
        assert_eq!(confirmed.status, SubmissionStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());

        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        assert_eq!(sm.cash_on_hand, 0);
        assert_eq!(sm.cash_submitted, 450);

        // Retried confirm is a no-op success, not a second settlement
        let entries_before = f.accounts.history(&f.sm_account.id).unwrap().len();
        let again = f.pool.confirm(&f.fin_a, &submission.id, None).unwrap();
        assert_eq!(again.status, SubmissionStatus::Confirmed);

        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        assert_eq!(sm.cash_submitted, 450);
        assert_eq!(f.accounts.history(&f.sm_account.id).unwrap().len(), entries_before);

        println!("✅ Claim and confirm test passed");
    }

    #[test]
    fn test_only_the_claimant_confirms() {
        let f = fixture();
        let submission = submit_parcel(&f);

        // Nobody claimed it yet
        let err = f.pool.confirm(&f.fin_a, &submission.id, None).unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));

        f.pool.claim(&f.fin_a, &submission.id).unwrap();

        let err = f.pool.confirm(&f.fin_b, &submission.id, None).unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));

        // The losing desk can't claim it either
        let err = f.pool.claim(&f.fin_b, &submission.id).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::AlreadyClaimed { ref claimed_by, .. } if claimed_by == "fin-a"
        ));

        println!("✅ Claimant exclusivity test passed");
    }

    #[test]
    fn test_claim_is_exclusive_under_contention() {
        let f = fixture();
        let submission = submit_parcel(&f);

        let mut handles = Vec::new();
        for i in 0..4 {
            let pool = f.pool.clone();
            let submission_id = submission.id.clone();
            handles.push(std::thread::spawn(move || {
                let finance = Actor::new(format!("fin-{}", i), vec![Role::Finance], vec![]);
                pool.claim(&finance, &submission_id)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one claimant must win");

        for result in &results {
            if let Err(err) = result {
                assert!(matches!(err, LedgerError::AlreadyClaimed { .. }));
            }
        }

        let current = f.pool.get(&submission.id).unwrap();
        assert_eq!(current.status, SubmissionStatus::Claimed);
        assert!(current.received_by.is_some());

        println!("✅ Concurrent claim test passed");
    }

    #[test]
    fn test_claim_retry_by_winner_is_noop() {
        let f = fixture();
        let submission = submit_parcel(&f);

        let first = f.pool.claim(&f.fin_a, &submission.id).unwrap();
        let retry = f.pool.claim(&f.fin_a, &submission.id).unwrap();

        assert_eq!(first.received_by, retry.received_by);
        assert_eq!(retry.status, SubmissionStatus::Claimed);

        println!("✅ Claim retry test passed");
    }

    #[test]
    fn test_reject_releases_collections_and_restores_earmark() {
        let f = fixture();
        let submission = submit_parcel(&f);

        f.pool.claim(&f.fin_a, &submission.id).unwrap();
        let rejected = f
            .pool
            .reject(&f.fin_a, &submission.id, "count came up 10 short")
            .unwrap();
        assert_eq!(rejected.status, SubmissionStatus::Rejected);
        assert_eq!(
            rejected.resolution_note.as_deref(),
            Some("count came up 10 short")
        );
        assert!(rejected.collection_ids.is_empty());

        // Cash never left the collector; the earmark is back
        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        assert_eq!(sm.cash_on_hand, 450);
        assert_eq!(sm.pending_cash_submission, 450);
        assert_eq!(sm.cash_submitted, 0);

        // Collections can travel in a fresh parcel
        let open = f.tracker.unsubmitted_for(&f.sm_account.id).unwrap();
        assert_eq!(open.len(), 2);

        let resubmitted = f
            .pool
            .submit(&f.sm, &f.sm_account.id, 450, &f.collection_ids, None)
            .unwrap();
        assert_eq!(resubmitted.status, SubmissionStatus::Pending);
        assert_ne!(resubmitted.id, submission.id);

        println!("✅ Reject and resubmit test passed");
    }

    #[test]
    fn test_dispute_freezes_then_requeue_reopens() {
        let f = fixture();
        let submission = submit_parcel(&f);

        f.pool.claim(&f.fin_a, &submission.id).unwrap();
        let disputed = f
            .pool
            .dispute(&f.fin_a, &submission.id, "two notes look counterfeit")
            .unwrap();
        assert_eq!(disputed.status, SubmissionStatus::Disputed);

        // Frozen: no confirm, no reject, no claim
        assert!(f.pool.confirm(&f.fin_a, &submission.id, None).is_err());
        assert!(f.pool.reject(&f.fin_a, &submission.id, "nope").is_err());
        assert!(f.pool.claim(&f.fin_b, &submission.id).is_err());

        let requeued = f
            .pool
            .requeue(&f.fin_b, &submission.id, "re-counted by supervisor")
            .unwrap();
        assert_eq!(requeued.status, SubmissionStatus::Pending);
        assert!(requeued.received_by.is_none());
        assert!(requeued.claimed_at.is_none());

        // Fresh claim by the other desk settles normally
        f.pool.claim(&f.fin_b, &submission.id).unwrap();
        let confirmed = f.pool.confirm(&f.fin_b, &submission.id, None).unwrap();
        assert_eq!(confirmed.status, SubmissionStatus::Confirmed);

        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        assert_eq!(sm.cash_submitted, 450);
        assert_eq!(sm.cash_on_hand, 0);

        println!("✅ Dispute and requeue test passed");
    }

    #[test]
    fn test_requeue_requires_disputed_state() {
        let f = fixture();
        let submission = submit_parcel(&f);

        let err = f
            .pool
            .requeue(&f.fin_a, &submission.id, "why not")
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        println!("✅ Requeue state check test passed");
    }

    #[test]
    fn test_pool_ops_require_finance_capability() {
        let f = fixture();
        let submission = submit_parcel(&f);

        let err = f.pool.claim(&f.sm, &submission.id).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let err = f.pool.confirm(&f.sm, &submission.id, None).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        // And submitting needs the collector side
        let err = f
            .pool
            .submit(&f.fin_a, &f.sm_account.id, 450, &f.collection_ids, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        println!("✅ Pool capability test passed");
    }

    #[test]
    fn test_submit_is_idempotent_under_key() {
        let f = fixture();

        let first = f
            .pool
            .submit(&f.sm, &f.sm_account.id, 450, &f.collection_ids, Some("parcel-1"))
            .unwrap();
        let replay = f
            .pool
            .submit(&f.sm, &f.sm_account.id, 450, &f.collection_ids, Some("parcel-1"))
            .unwrap();

        assert_eq!(first.id, replay.id);
        assert_eq!(f.pool.for_submitter(&f.sm_account.id).unwrap().len(), 1);

        let sm = f.accounts.get(&f.sm_account.id).unwrap();
        assert_eq!(sm.pending_cash_submission, 0);

        println!("✅ Idempotent submit test passed");
    }
}
