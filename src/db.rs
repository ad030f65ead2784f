// 🗄️ Ledger Store - SQLite persistence for accounts, entries and cash parcels
//
// One event = one database file. Every balance mutation and its ledger entry
// commit inside a single BEGIN IMMEDIATE transaction, so a crash can never
// leave a balance change without its paper trail (or the other way around).
// The append-only `transactions` table is the source of truth; reporting is
// always recomputable from it.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, LedgerResult};

// ============================================================================
// TRANSACTION KINDS
// ============================================================================

/// Closed union of ledger entry kinds. Unknown kinds are rejected on read so
/// a corrupted or hand-edited database fails loudly instead of mis-auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Points moved down the chain (or the opening seed of a root account).
    Allocation,
    /// Points sold to a visitor for cash.
    Sale,
    /// Physical cash handed from a seller to a collector.
    Collection,
    /// Cash parcel lifecycle: submitted, confirmed or rejected by finance.
    Submission,
    /// Points pulled back up the chain by a manager.
    Recall,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Allocation => "allocation",
            TransactionKind::Sale => "sale",
            TransactionKind::Collection => "collection",
            TransactionKind::Submission => "submission",
            TransactionKind::Recall => "recall",
        }
    }

    pub fn parse(s: &str) -> Option<TransactionKind> {
        match s {
            "allocation" => Some(TransactionKind::Allocation),
            "sale" => Some(TransactionKind::Sale),
            "collection" => Some(TransactionKind::Collection),
            "submission" => Some(TransactionKind::Submission),
            "recall" => Some(TransactionKind::Recall),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// LEDGER ENTRIES
// ============================================================================

/// One immutable row of the append-only ledger. `seq` is assigned by SQLite
/// (AUTOINCREMENT) and gives the total order every replay and report uses.
/// Two-sided operations write one entry per affected account, stitched
/// together by a shared `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: i64,
    pub id: String,
    pub account_id: String,
    pub kind: TransactionKind,
    /// Signed amount as seen from `account_id`: positive for value flowing
    /// in, negative for value flowing out.
    pub amount: i64,
    pub actor_id: String,
    pub counterparty_id: Option<String>,
    pub correlation_id: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Entry as written by an operation, before SQLite assigns `seq` and `id`.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub account_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub actor_id: String,
    pub counterparty_id: Option<String>,
    pub correlation_id: String,
    pub note: Option<String>,
}

/// Append one entry. Callers run this inside the same SQLite transaction as
/// the balance update it documents.
pub fn append_entry(conn: &Connection, draft: &EntryDraft) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO transactions (
            id, account_id, kind, amount, actor_id,
            counterparty_id, correlation_id, note, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            uuid::Uuid::new_v4().to_string(),
            draft.account_id,
            draft.kind.as_str(),
            draft.amount,
            draft.actor_id,
            draft.counterparty_id,
            draft.correlation_id,
            draft.note,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(())
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind_str: String = row.get(3)?;
    let created_at_str: String = row.get(9)?;

    Ok(LedgerEntry {
        seq: row.get(0)?,
        id: row.get(1)?,
        account_id: row.get(2)?,
        kind: TransactionKind::parse(&kind_str).ok_or(rusqlite::Error::InvalidQuery)?,
        amount: row.get(4)?,
        actor_id: row.get(5)?,
        counterparty_id: row.get(6)?,
        correlation_id: row.get(7)?,
        note: row.get(8)?,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
    })
}

const ENTRY_COLUMNS: &str = "seq, id, account_id, kind, amount, actor_id, \
                             counterparty_id, correlation_id, note, created_at";

/// Full ledger in seq order, oldest first. This is the replay input.
pub fn all_entries(conn: &Connection) -> LedgerResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transactions ORDER BY seq ASC",
        ENTRY_COLUMNS
    ))?;

    let entries = stmt
        .query_map([], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn entries_for_account(conn: &Connection, account_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transactions WHERE account_id = ?1 ORDER BY seq ASC",
        ENTRY_COLUMNS
    ))?;

    let entries = stmt
        .query_map(params![account_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Both sides of a two-sided operation.
pub fn entries_for_correlation(
    conn: &Connection,
    correlation_id: &str,
) -> LedgerResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transactions WHERE correlation_id = ?1 ORDER BY seq ASC",
        ENTRY_COLUMNS
    ))?;

    let entries = stmt
        .query_map(params![correlation_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn entry_count(conn: &Connection) -> LedgerResult<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// IDEMPOTENCY JOURNAL
// ============================================================================

/// Fingerprint of a request payload, stored next to the idempotency key so a
/// replayed key with a *different* payload is rejected instead of silently
/// returning an unrelated outcome.
pub fn request_fingerprint(operation: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Look up a previously journaled outcome for this key. Returns the stored
/// outcome JSON when key, operation and fingerprint all match; errors when
/// the key was used for a different request.
pub fn replay_outcome(
    conn: &Connection,
    key: &str,
    operation: &str,
    fingerprint: &str,
) -> LedgerResult<Option<String>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT operation, fingerprint, outcome FROM idempotency_keys WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((stored_op, stored_fp, outcome)) => {
            if stored_op != operation || stored_fp != fingerprint {
                return Err(LedgerError::Validation(format!(
                    "idempotency key '{}' was already used by a different request",
                    key
                )));
            }
            Ok(Some(outcome))
        }
    }
}

/// Journal the outcome of a completed operation under its idempotency key.
/// Runs inside the operation's SQLite transaction: the key and the effects
/// become durable together or not at all.
pub fn record_outcome(
    conn: &Connection,
    key: &str,
    operation: &str,
    fingerprint: &str,
    outcome_json: &str,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO idempotency_keys (key, operation, fingerprint, outcome, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            key,
            operation,
            fingerprint,
            outcome_json,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(())
}

// ============================================================================
// LEDGER STORE
// ============================================================================

/// Shared handle to the event's database. The mutex serializes mutating
/// operations; SQLite is single-writer anyway, and holding the lock across a
/// whole read-validate-mutate unit is what makes claim races and double
/// spends impossible.
pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        setup_schema(&conn)?;

        Ok(LedgerStore {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and the demo.
    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_schema(&conn)?;

        Ok(LedgerStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

pub fn setup_schema(conn: &Connection) -> LedgerResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Accounts Table (one row per participant per role)
    // Balance fields are maintained by deltas only, never overwritten.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            department TEXT NOT NULL,
            available_points INTEGER NOT NULL DEFAULT 0,
            total_received INTEGER NOT NULL DEFAULT 0,
            total_sold INTEGER NOT NULL DEFAULT 0,
            total_cash_collected INTEGER NOT NULL DEFAULT 0,
            pending_collection INTEGER NOT NULL DEFAULT 0,
            cash_on_hand INTEGER NOT NULL DEFAULT 0,
            pending_cash_submission INTEGER NOT NULL DEFAULT 0,
            cash_submitted INTEGER NOT NULL DEFAULT 0,
            collection_alert INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(user_id, role)
        )",
        [],
    )?;

    // ==========================================================================
    // Transactions Table (append-only ledger, total order via seq)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount INTEGER NOT NULL,
            actor_id TEXT NOT NULL,
            counterparty_id TEXT,
            correlation_id TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Cash Collections Table (custody transfers seller → collector)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cash_collections (
            id TEXT PRIMARY KEY,
            seller_id TEXT NOT NULL,
            collected_by TEXT NOT NULL,
            amount INTEGER NOT NULL,
            collected_at TEXT NOT NULL,
            submitted_to_finance INTEGER NOT NULL DEFAULT 0,
            submission_id TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Cash Submissions Table (parcels in the finance pool)
    // One claimant at most: the claim CAS keys on status + received_by.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cash_submissions (
            id TEXT PRIMARY KEY,
            submitter_id TEXT NOT NULL,
            submitter_role TEXT NOT NULL,
            amount INTEGER NOT NULL,
            status TEXT NOT NULL,
            received_by TEXT,
            submitted_at TEXT NOT NULL,
            claimed_at TEXT,
            confirmed_at TEXT,
            resolution_note TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Idempotency Keys Table (request journal for safe retries)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT PRIMARY KEY,
            operation TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            outcome TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_account ON transactions(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_correlation ON transactions(correlation_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_user ON accounts(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_department ON accounts(department)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_collections_seller ON cash_collections(seller_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_collections_collector ON cash_collections(collected_by)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_status ON cash_submissions(status)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(account_id: &str, kind: TransactionKind, amount: i64) -> EntryDraft {
        EntryDraft {
            account_id: account_id.to_string(),
            kind,
            amount,
            actor_id: "tester".to_string(),
            counterparty_id: None,
            correlation_id: "corr-1".to_string(),
            note: None,
        }
    }

    #[test]
    fn test_schema_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_schema(&conn).unwrap();
        setup_schema(&conn).unwrap();

        assert_eq!(entry_count(&conn).unwrap(), 0);

        println!("✅ Schema setup test passed");
    }

    #[test]
    fn test_append_and_read_in_seq_order() {
        let conn = Connection::open_in_memory().unwrap();
        setup_schema(&conn).unwrap();

        append_entry(&conn, &draft("acc-a", TransactionKind::Allocation, 500)).unwrap();
        append_entry(&conn, &draft("acc-b", TransactionKind::Allocation, -500)).unwrap();
        append_entry(&conn, &draft("acc-a", TransactionKind::Sale, 120)).unwrap();

        let all = all_entries(&conn).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].seq < all[1].seq && all[1].seq < all[2].seq);
        assert_eq!(all[2].kind, TransactionKind::Sale);

        let for_a = entries_for_account(&conn, "acc-a").unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].amount, 500);
        assert_eq!(for_a[1].amount, 120);

        let correlated = entries_for_correlation(&conn, "corr-1").unwrap();
        assert_eq!(correlated.len(), 3);

        println!("✅ Append and seq order test passed");
    }

    #[test]
    fn test_kind_roundtrip_rejects_unknown() {
        for kind in [
            TransactionKind::Allocation,
            TransactionKind::Sale,
            TransactionKind::Collection,
            TransactionKind::Submission,
            TransactionKind::Recall,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("refund"), None);

        println!("✅ Transaction kind roundtrip test passed");
    }

    #[test]
    fn test_idempotency_journal_replay() {
        let conn = Connection::open_in_memory().unwrap();
        setup_schema(&conn).unwrap();

        let fp = request_fingerprint("allocate", "from=a|to=b|amount=500");

        // Nothing journaled yet
        assert!(replay_outcome(&conn, "key-1", "allocate", &fp)
            .unwrap()
            .is_none());

        record_outcome(&conn, "key-1", "allocate", &fp, "{\"ok\":true}").unwrap();

        // Same key + same payload replays the stored outcome
        let replayed = replay_outcome(&conn, "key-1", "allocate", &fp).unwrap();
        assert_eq!(replayed.as_deref(), Some("{\"ok\":true}"));

        // Same key + different payload is an error, not a silent replay
        let other_fp = request_fingerprint("allocate", "from=a|to=b|amount=900");
        let err = replay_outcome(&conn, "key-1", "allocate", &other_fp).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        println!("✅ Idempotency journal test passed");
    }

    #[test]
    fn test_fingerprint_is_stable_sha256() {
        let fp1 = request_fingerprint("submit", "payload");
        let fp2 = request_fingerprint("submit", "payload");
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);

        assert_ne!(fp1, request_fingerprint("confirm", "payload"));

        println!("✅ Fingerprint test passed");
    }
}
