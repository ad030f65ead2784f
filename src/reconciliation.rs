// ⚖️ Reconciliation Reporter - Prove the books are closed
//
// Two jobs at event end (or any moment in between):
//
//   1. Rollups: where the points went and where the cash is, per account,
//      per department, or event-wide.
//   2. Audit: replay every ledger entry from seq 1 and compare the rebuilt
//      balances against the stored rows. Any difference means a write
//      bypassed the ledger.
//
// The identities being checked:
//   available + total_sold == total_received          (points never leak)
//   collected + pending_collection == total_sold      (every sold point is cash)

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::accounts::{self, BalanceDelta};
use crate::collection;
use crate::db::{self, LedgerStore, TransactionKind};
use crate::error::{LedgerError, LedgerResult};
use crate::pool::{self, SubmissionStatus};

// ============================================================================
// ROLLUP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum RollupScope {
    /// Every account in the ledger.
    Event,
    Department(String),
    Account(String),
}

impl std::fmt::Display for RollupScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollupScope::Event => write!(f, "event"),
            RollupScope::Department(d) => write!(f, "department:{}", d),
            RollupScope::Account(id) => write!(f, "account:{}", id),
        }
    }
}

/// Aggregated position of one scope. Point figures count the scope's net
/// intake (a department that received 2000 and sub-allocated internally
/// still shows 2000); cash figures track the parcel pipeline end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollup {
    pub scope: RollupScope,
    pub accounts: usize,

    pub points_allocated: i64,
    pub points_available: i64,
    pub points_sold: i64,

    pub cash_collected: i64,
    pub cash_awaiting_collection: i64,
    pub cash_on_hand: i64,
    pub cash_awaiting_submission: i64,
    pub cash_confirmed: i64,

    pub parcels_open: usize,
    pub cash_in_open_parcels: i64,
    pub parcels_disputed: usize,
    pub cash_in_disputed_parcels: i64,

    pub generated_at: DateTime<Utc>,
}

impl Rollup {
    /// True once nothing is in flight: no cash waiting at sellers, none in
    /// collector custody, no open parcels. The end-of-event target state.
    pub fn is_fully_settled(&self) -> bool {
        self.cash_awaiting_collection == 0 && self.cash_on_hand == 0 && self.parcels_open == 0
    }

    /// Everything ever handed into the pool that was not sent back: open,
    /// disputed and confirmed parcels together.
    pub fn total_submitted(&self) -> i64 {
        self.cash_in_open_parcels + self.cash_in_disputed_parcels + self.cash_confirmed
    }

    pub fn summary(&self) -> String {
        format!(
            "Rollup for {}: {} accounts, {} points in / {} sold / {} still available, \
             cash {} collected ({} outstanding), {} confirmed by finance, \
             {} open parcels worth {}",
            self.scope,
            self.accounts,
            self.points_allocated,
            self.points_sold,
            self.points_available,
            self.cash_collected,
            self.cash_awaiting_collection,
            self.cash_confirmed,
            self.parcels_open,
            self.cash_in_open_parcels,
        )
    }
}

// ============================================================================
// AUDIT REPORT
// ============================================================================

/// A stored balance that replaying the ledger does not reproduce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub account_id: String,
    pub field: String,
    pub stored: i64,
    pub rebuilt: i64,
}

/// A broken bookkeeping rule on the stored rows themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// None for violations that span rows (parcel backing, garbled entries).
    pub account_id: Option<String>,
    pub rule: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub balanced: bool,
    pub accounts_checked: usize,
    pub entries_replayed: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub violations: Vec<InvariantViolation>,
    pub generated_at: DateTime<Utc>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.balanced
    }

    pub fn summary(&self) -> String {
        format!(
            "Audit over {} accounts / {} entries: {} ({} discrepancies, {} violations)",
            self.accounts_checked,
            self.entries_replayed,
            if self.balanced { "CLEAN" } else { "OUT OF BALANCE" },
            self.discrepancies.len(),
            self.violations.len(),
        )
    }
}

// ============================================================================
// RECONCILIATION REPORTER
// ============================================================================

#[derive(Clone)]
pub struct ReconciliationReporter {
    store: Arc<LedgerStore>,
}

struct BalanceSums {
    accounts: usize,
    allocated: i64,
    available: i64,
    sold: i64,
    collected: i64,
    awaiting_collection: i64,
    on_hand: i64,
    awaiting_submission: i64,
    confirmed: i64,
}

impl ReconciliationReporter {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        ReconciliationReporter { store }
    }

    pub fn rollup(&self, scope: RollupScope) -> LedgerResult<Rollup> {
        let conn = self.store.lock();

        let sums = self.sum_balances(&conn, &scope)?;
        let pool_rows = self.sum_pool(&conn, &scope)?;

        let mut parcels_open = 0usize;
        let mut cash_in_open_parcels = 0i64;
        let mut parcels_disputed = 0usize;
        let mut cash_in_disputed_parcels = 0i64;

        for (status, amount, count) in pool_rows {
            match status {
                SubmissionStatus::Pending | SubmissionStatus::Claimed => {
                    parcels_open += count;
                    cash_in_open_parcels += amount;
                }
                SubmissionStatus::Disputed => {
                    parcels_disputed += count;
                    cash_in_disputed_parcels += amount;
                }
                SubmissionStatus::Confirmed | SubmissionStatus::Rejected => {}
            }
        }

        Ok(Rollup {
            scope,
            accounts: sums.accounts,
            points_allocated: sums.allocated,
            points_available: sums.available,
            points_sold: sums.sold,
            cash_collected: sums.collected,
            cash_awaiting_collection: sums.awaiting_collection,
            cash_on_hand: sums.on_hand,
            cash_awaiting_submission: sums.awaiting_submission,
            cash_confirmed: sums.confirmed,
            parcels_open,
            cash_in_open_parcels,
            parcels_disputed,
            cash_in_disputed_parcels,
            generated_at: Utc::now(),
        })
    }

    pub fn event_rollup(&self) -> LedgerResult<Rollup> {
        self.rollup(RollupScope::Event)
    }

    /// One rollup per department that has at least one account.
    pub fn department_rollups(&self) -> LedgerResult<Vec<Rollup>> {
        let departments: Vec<String> = {
            let conn = self.store.lock();
            let mut stmt =
                conn.prepare("SELECT DISTINCT department FROM accounts ORDER BY department")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        departments
            .into_iter()
            .map(|dept| self.rollup(RollupScope::Department(dept)))
            .collect()
    }

    fn sum_balances(&self, conn: &Connection, scope: &RollupScope) -> LedgerResult<BalanceSums> {
        let select = "SELECT COUNT(*), \
                      COALESCE(SUM(total_received), 0), \
                      COALESCE(SUM(available_points), 0), \
                      COALESCE(SUM(total_sold), 0), \
                      COALESCE(SUM(total_cash_collected), 0), \
                      COALESCE(SUM(pending_collection), 0), \
                      COALESCE(SUM(cash_on_hand), 0), \
                      COALESCE(SUM(pending_cash_submission), 0), \
                      COALESCE(SUM(cash_submitted), 0) \
                      FROM accounts";

        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(BalanceSums {
                accounts: row.get::<_, i64>(0)? as usize,
                allocated: row.get(1)?,
                available: row.get(2)?,
                sold: row.get(3)?,
                collected: row.get(4)?,
                awaiting_collection: row.get(5)?,
                on_hand: row.get(6)?,
                awaiting_submission: row.get(7)?,
                confirmed: row.get(8)?,
            })
        };

        let sums = match scope {
            RollupScope::Event => conn.query_row(select, [], map_row)?,
            RollupScope::Department(dept) => conn.query_row(
                &format!("{} WHERE department = ?1", select),
                params![dept],
                map_row,
            )?,
            RollupScope::Account(id) => conn.query_row(
                &format!("{} WHERE id = ?1", select),
                params![id],
                map_row,
            )?,
        };

        Ok(sums)
    }

    fn sum_pool(
        &self,
        conn: &Connection,
        scope: &RollupScope,
    ) -> LedgerResult<Vec<(SubmissionStatus, i64, usize)>> {
        let select = "SELECT s.status, COALESCE(SUM(s.amount), 0), COUNT(*) \
                      FROM cash_submissions s \
                      JOIN accounts a ON a.id = s.submitter_id";

        let sql = match scope {
            RollupScope::Event => format!("{} GROUP BY s.status", select),
            RollupScope::Department(_) => {
                format!("{} WHERE a.department = ?1 GROUP BY s.status", select)
            }
            RollupScope::Account(_) => {
                format!("{} WHERE s.submitter_id = ?1 GROUP BY s.status", select)
            }
        };

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)? as usize,
            ))
        };

        let raw: Vec<(String, i64, usize)> = match scope {
            RollupScope::Event => stmt
                .query_map([], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            RollupScope::Department(dept) => stmt
                .query_map(params![dept], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            RollupScope::Account(id) => stmt
                .query_map(params![id], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };

        raw.into_iter()
            .map(|(status, amount, count)| {
                let status = SubmissionStatus::parse(&status).ok_or_else(|| {
                    LedgerError::Internal(format!("unknown submission status '{}'", status))
                })?;
                Ok((status, amount, count))
            })
            .collect()
    }

    /// Replay the whole ledger and cross-check every stored balance, the
    /// per-account identities, and each parcel's collection backing.
    pub fn audit(&self) -> LedgerResult<AuditReport> {
        let conn = self.store.lock();

        let accounts = accounts::all_accounts(&conn)?;
        let entries = db::all_entries(&conn)?;

        let mut violations: Vec<InvariantViolation> = Vec::new();
        let mut rebuilt: HashMap<String, BalanceDelta> = HashMap::new();

        for entry in &entries {
            let acc = rebuilt.entry(entry.account_id.clone()).or_default();
            match entry.kind {
                // Signed point transfer, both sides and opening seeds alike
                TransactionKind::Allocation | TransactionKind::Recall => {
                    acc.available_points += entry.amount;
                    acc.total_received += entry.amount;
                }
                TransactionKind::Sale => {
                    acc.available_points -= entry.amount;
                    acc.total_sold += entry.amount;
                    acc.pending_collection += entry.amount;
                }
                // Negative on the seller giving cash up, positive on the
                // collector taking custody
                TransactionKind::Collection => {
                    if entry.amount < 0 {
                        acc.total_cash_collected += -entry.amount;
                        acc.pending_collection += entry.amount;
                    } else {
                        acc.cash_on_hand += entry.amount;
                        acc.pending_cash_submission += entry.amount;
                    }
                }
                // Lifecycle tag in the note tells the three moves apart
                TransactionKind::Submission => {
                    let tag = entry
                        .note
                        .as_deref()
                        .and_then(|note| note.split_once(':'))
                        .map(|(tag, _)| tag);
                    match tag {
                        Some(pool::NOTE_CONFIRMED) => {
                            acc.cash_on_hand += entry.amount;
                            acc.cash_submitted += -entry.amount;
                        }
                        Some(pool::NOTE_SUBMITTED) | Some(pool::NOTE_REJECTED) => {
                            acc.pending_cash_submission += entry.amount;
                        }
                        _ => violations.push(InvariantViolation {
                            account_id: Some(entry.account_id.clone()),
                            rule: "submission_note".to_string(),
                            detail: format!(
                                "submission entry {} carries no lifecycle tag",
                                entry.id
                            ),
                        }),
                    }
                }
            }
        }

        let mut discrepancies: Vec<Discrepancy> = Vec::new();
        for account in &accounts {
            let replayed = rebuilt.get(&account.id).cloned().unwrap_or_default();

            let fields: [(&str, i64, i64); 8] = [
                (
                    "available_points",
                    account.available_points,
                    replayed.available_points,
                ),
                ("total_received", account.total_received, replayed.total_received),
                ("total_sold", account.total_sold, replayed.total_sold),
                (
                    "total_cash_collected",
                    account.total_cash_collected,
                    replayed.total_cash_collected,
                ),
                (
                    "pending_collection",
                    account.pending_collection,
                    replayed.pending_collection,
                ),
                ("cash_on_hand", account.cash_on_hand, replayed.cash_on_hand),
                (
                    "pending_cash_submission",
                    account.pending_cash_submission,
                    replayed.pending_cash_submission,
                ),
                ("cash_submitted", account.cash_submitted, replayed.cash_submitted),
            ];

            for (field, stored, value) in fields {
                if stored != value {
                    discrepancies.push(Discrepancy {
                        account_id: account.id.clone(),
                        field: field.to_string(),
                        stored,
                        rebuilt: value,
                    });
                }
            }

            if !account.points_balanced() {
                violations.push(InvariantViolation {
                    account_id: Some(account.id.clone()),
                    rule: "points_identity".to_string(),
                    detail: format!(
                        "available {} + sold {} != received {}",
                        account.available_points, account.total_sold, account.total_received
                    ),
                });
            }
            if !account.cash_balanced() {
                violations.push(InvariantViolation {
                    account_id: Some(account.id.clone()),
                    rule: "cash_identity".to_string(),
                    detail: format!(
                        "collected {} + pending {} != sold {}",
                        account.total_cash_collected,
                        account.pending_collection,
                        account.total_sold
                    ),
                });
            }
        }

        // Every parcel must be backed by collections summing to its declared
        // amount; a rejected parcel has released its backing.
        let mut stmt = conn.prepare("SELECT id, amount, status FROM cash_submissions")?;
        let submissions: Vec<(String, i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        for (submission_id, amount, status_str) in submissions {
            let status = match SubmissionStatus::parse(&status_str) {
                Some(status) => status,
                None => {
                    violations.push(InvariantViolation {
                        account_id: None,
                        rule: "submission_status".to_string(),
                        detail: format!(
                            "submission {} has unknown status '{}'",
                            submission_id, status_str
                        ),
                    });
                    continue;
                }
            };

            let backing: i64 = collection::collections_for_submission(&conn, &submission_id)?
                .iter()
                .map(|c| c.amount)
                .sum();
            let expected = if status == SubmissionStatus::Rejected {
                0
            } else {
                amount
            };

            if backing != expected {
                violations.push(InvariantViolation {
                    account_id: None,
                    rule: "submission_backing".to_string(),
                    detail: format!(
                        "submission {} declares {} but its collections sum to {}",
                        submission_id, expected, backing
                    ),
                });
            }
        }

        let balanced = discrepancies.is_empty() && violations.is_empty();
        let report = AuditReport {
            balanced,
            accounts_checked: accounts.len(),
            entries_replayed: entries.len(),
            discrepancies,
            violations,
            generated_at: Utc::now(),
        };

        if report.balanced {
            tracing::info!(
                accounts = report.accounts_checked,
                entries = report.entries_replayed,
                "audit clean"
            );
        } else {
            tracing::warn!(
                discrepancies = report.discrepancies.len(),
                violations = report.violations.len(),
                "audit found problems"
            );
        }

        Ok(report)
    }

    /// Current balance sheet, one row per account.
    pub fn balances_csv<W: Write>(&self, writer: W) -> LedgerResult<()> {
        let conn = self.store.lock();
        let accounts = accounts::all_accounts(&conn)?;

        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record([
            "account_id",
            "user_id",
            "role",
            "department",
            "available_points",
            "total_received",
            "total_sold",
            "total_cash_collected",
            "pending_collection",
            "cash_on_hand",
            "pending_cash_submission",
            "cash_submitted",
            "collection_alert",
        ])?;

        for account in &accounts {
            wtr.write_record([
                account.id.clone(),
                account.user_id.clone(),
                account.role.as_str().to_string(),
                account.department.clone(),
                account.available_points.to_string(),
                account.total_received.to_string(),
                account.total_sold.to_string(),
                account.total_cash_collected.to_string(),
                account.pending_collection.to_string(),
                account.cash_on_hand.to_string(),
                account.pending_cash_submission.to_string(),
                account.cash_submitted.to_string(),
                account.collection_alert.to_string(),
            ])?;
        }

        wtr.flush()?;
        Ok(())
    }

    /// One row per rollup, suitable for the end-of-event spreadsheet.
    pub fn rollups_csv<W: Write>(&self, rollups: &[Rollup], writer: W) -> LedgerResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record([
            "scope",
            "accounts",
            "points_allocated",
            "points_available",
            "points_sold",
            "cash_collected",
            "cash_awaiting_collection",
            "cash_on_hand",
            "cash_awaiting_submission",
            "cash_confirmed",
            "parcels_open",
            "cash_in_open_parcels",
            "parcels_disputed",
            "cash_in_disputed_parcels",
        ])?;

        for rollup in rollups {
            wtr.write_record([
                rollup.scope.to_string(),
                rollup.accounts.to_string(),
                rollup.points_allocated.to_string(),
                rollup.points_available.to_string(),
                rollup.points_sold.to_string(),
                rollup.cash_collected.to_string(),
                rollup.cash_awaiting_collection.to_string(),
                rollup.cash_on_hand.to_string(),
                rollup.cash_awaiting_submission.to_string(),
                rollup.cash_confirmed.to_string(),
                rollup.parcels_open.to_string(),
                rollup.cash_in_open_parcels.to_string(),
                rollup.parcels_disputed.to_string(),
                rollup.cash_in_disputed_parcels.to_string(),
            ])?;
        }

        wtr.flush()?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
