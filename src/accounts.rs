// 💳 Account Store - Per-role balance records and atomic deltas
//
// An account is one participant wearing one role. All balance fields move by
// signed increments only; the store never overwrites a balance with an
// absolute value. Each delta commits together with its ledger entry, so the
// stored balances are always the fold of the entries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::db::{self, EntryDraft, LedgerEntry, LedgerStore, TransactionKind};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::{Actor, Capability, Role};

/// Actor id recorded on administrative entries (opening seeds).
pub const SYSTEM_ACTOR: &str = "system";

// ============================================================================
// ACCOUNT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub role: Role,
    pub department: String,

    // Point-side balances
    pub available_points: i64,
    pub total_received: i64,
    pub total_sold: i64,

    // Cash-side balances (seller view)
    pub total_cash_collected: i64,
    pub pending_collection: i64,

    // Cash-side balances (collector view)
    pub cash_on_hand: i64,
    pub pending_cash_submission: i64,
    pub cash_submitted: i64,

    /// Advisory flag raised when the chain below sits on too much uncollected
    /// cash. Never blocks an operation.
    pub collection_alert: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Points identity: what came in was either sold or is still available.
    pub fn points_balanced(&self) -> bool {
        self.available_points + self.total_sold == self.total_received
    }

    /// Cash identity: everything sold is either collected or still pending.
    pub fn cash_balanced(&self) -> bool {
        self.total_cash_collected + self.pending_collection == self.total_sold
    }
}

/// Signed increments for every balance field. Fields left at zero are
/// untouched; SQL applies them as `field = field + delta` in one statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub available_points: i64,
    pub total_received: i64,
    pub total_sold: i64,
    pub total_cash_collected: i64,
    pub pending_collection: i64,
    pub cash_on_hand: i64,
    pub pending_cash_submission: i64,
    pub cash_submitted: i64,
}

const ACCOUNT_COLUMNS: &str = "id, user_id, role, department, available_points, \
                               total_received, total_sold, total_cash_collected, \
                               pending_collection, cash_on_hand, pending_cash_submission, \
                               cash_submitted, collection_alert, created_at, updated_at";

pub(crate) fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let role_str: String = row.get(2)?;
    let created_at_str: String = row.get(13)?;
    let updated_at_str: String = row.get(14)?;

    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        role: Role::parse(&role_str).ok_or(rusqlite::Error::InvalidQuery)?,
        department: row.get(3)?,
        available_points: row.get(4)?,
        total_received: row.get(5)?,
        total_sold: row.get(6)?,
        total_cash_collected: row.get(7)?,
        pending_collection: row.get(8)?,
        cash_on_hand: row.get(9)?,
        pending_cash_submission: row.get(10)?,
        cash_submitted: row.get(11)?,
        collection_alert: row.get(12)?,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
    })
}

pub(crate) fn load_account(conn: &Connection, account_id: &str) -> LedgerResult<Account> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
        params![account_id],
        account_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("account", account_id))
}

pub(crate) fn all_accounts(conn: &Connection) -> LedgerResult<Vec<Account>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM accounts ORDER BY department, role, user_id",
        ACCOUNT_COLUMNS
    ))?;

    let accounts = stmt
        .query_map([], account_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(accounts)
}

/// Validate and apply one delta plus its ledger entry. Must run inside the
/// caller's SQLite transaction; the guards read the row the same transaction
/// will update, which is race-free under BEGIN IMMEDIATE.
pub(crate) fn apply_delta_on(
    conn: &Connection,
    delta: &BalanceDelta,
    entry: &EntryDraft,
) -> LedgerResult<Account> {
    let current = load_account(conn, &entry.account_id)?;

    if current.available_points + delta.available_points < 0 {
        return Err(LedgerError::InsufficientBalance {
            account_id: current.id,
            field: "available_points",
            balance: current.available_points,
            delta: delta.available_points,
        });
    }

    if current.pending_collection + delta.pending_collection < 0 {
        return Err(LedgerError::InsufficientBalance {
            account_id: current.id,
            field: "pending_collection",
            balance: current.pending_collection,
            delta: delta.pending_collection,
        });
    }

    conn.execute(
        "UPDATE accounts SET
            available_points = available_points + ?2,
            total_received = total_received + ?3,
            total_sold = total_sold + ?4,
            total_cash_collected = total_cash_collected + ?5,
            pending_collection = pending_collection + ?6,
            cash_on_hand = cash_on_hand + ?7,
            pending_cash_submission = pending_cash_submission + ?8,
            cash_submitted = cash_submitted + ?9,
            updated_at = ?10
         WHERE id = ?1",
        params![
            entry.account_id,
            delta.available_points,
            delta.total_received,
            delta.total_sold,
            delta.total_cash_collected,
            delta.pending_collection,
            delta.cash_on_hand,
            delta.pending_cash_submission,
            delta.cash_submitted,
            Utc::now().to_rfc3339(),
        ],
    )?;

    db::append_entry(conn, entry)?;

    load_account(conn, &entry.account_id)
}

pub(crate) fn set_collection_alert(
    conn: &Connection,
    account_id: &str,
    alert: bool,
) -> LedgerResult<()> {
    conn.execute(
        "UPDATE accounts SET collection_alert = ?2, updated_at = ?3 WHERE id = ?1",
        params![account_id, alert, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

// ============================================================================
// ACCOUNT STORE
// ============================================================================

#[derive(Clone)]
pub struct AccountStore {
    store: Arc<LedgerStore>,
}

impl AccountStore {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        AccountStore { store }
    }

    /// Create one account for a participant in a role. `opening_points` seeds
    /// root accounts (the event pool an event manager distributes from) and
    /// is zero for everyone else; the seed is written as a regular allocation
    /// entry so replay reproduces it.
    pub fn create_account(
        &self,
        user_id: &str,
        role: Role,
        department: &str,
        opening_points: i64,
    ) -> LedgerResult<Account> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::Validation("user_id must not be empty".into()));
        }
        if department.trim().is_empty() {
            return Err(LedgerError::Validation(
                "department must not be empty".into(),
            ));
        }
        if opening_points < 0 {
            return Err(LedgerError::Validation(format!(
                "opening_points must be >= 0, got {}",
                opening_points
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let account_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let result = tx.execute(
            "INSERT INTO accounts (id, user_id, role, department, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![account_id, user_id, role.as_str(), department, now],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(LedgerError::Validation(format!(
                    "account already exists for user '{}' with role {}",
                    user_id, role
                )));
            }
            Err(e) => return Err(e.into()),
        }

        if opening_points > 0 {
            let delta = BalanceDelta {
                available_points: opening_points,
                total_received: opening_points,
                ..Default::default()
            };
            let entry = EntryDraft {
                account_id: account_id.clone(),
                kind: TransactionKind::Allocation,
                amount: opening_points,
                actor_id: SYSTEM_ACTOR.to_string(),
                counterparty_id: None,
                correlation_id: uuid::Uuid::new_v4().to_string(),
                note: Some("opening balance".to_string()),
            };
            apply_delta_on(&tx, &delta, &entry)?;
        }

        let account = load_account(&tx, &account_id)?;
        tx.commit()?;

        tracing::info!(
            account_id = %account.id,
            user_id = %account.user_id,
            role = %account.role,
            department = %account.department,
            opening_points,
            "account created"
        );

        Ok(account)
    }

    /// Bookkeeping primitive: apply one validated delta and its entry as a
    /// unit. The engines compose this; it is also the right tool for manual
    /// corrections, which is why it takes an idempotency key of its own.
    pub fn apply_delta(
        &self,
        delta: &BalanceDelta,
        entry: EntryDraft,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<Account> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fingerprint = db::request_fingerprint(
            "apply_delta",
            &format!(
                "{}|{}|{}|{}",
                entry.account_id,
                entry.kind,
                entry.amount,
                serde_json::to_string(delta)?
            ),
        );
        if let Some(key) = idempotency_key {
            if let Some(stored) = db::replay_outcome(&tx, key, "apply_delta", &fingerprint)? {
                let account: Account = serde_json::from_str(&stored)?;
                return Ok(account);
            }
        }

        let account = apply_delta_on(&tx, delta, &entry)?;

        if let Some(key) = idempotency_key {
            db::record_outcome(
                &tx,
                key,
                "apply_delta",
                &fingerprint,
                &serde_json::to_string(&account)?,
            )?;
        }

        tx.commit()?;
        Ok(account)
    }

    /// A seller sells points to a visitor for cash. Points leave the
    /// available balance; the cash stays with the seller as pending
    /// collection until a manager picks it up.
    pub fn record_sale(
        &self,
        actor: &Actor,
        seller_account_id: &str,
        amount: i64,
        note: Option<String>,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<Account> {
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "sale amount must be > 0, got {}",
                amount
            )));
        }
        if !actor.has_capability(Capability::Sell) {
            return Err(LedgerError::Unauthorized(format!(
                "user '{}' cannot record sales",
                actor.user_id
            )));
        }

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fingerprint = db::request_fingerprint(
            "record_sale",
            &format!(
                "{}|{}|{}",
                seller_account_id,
                amount,
                note.as_deref().unwrap_or("")
            ),
        );
        if let Some(key) = idempotency_key {
            if let Some(stored) = db::replay_outcome(&tx, key, "record_sale", &fingerprint)? {
                let account: Account = serde_json::from_str(&stored)?;
                return Ok(account);
            }
        }

        let seller = load_account(&tx, seller_account_id)?;
        if seller.user_id != actor.user_id {
            return Err(LedgerError::Forbidden(format!(
                "account {} does not belong to user '{}'",
                seller_account_id, actor.user_id
            )));
        }
        if seller.role != Role::Seller {
            return Err(LedgerError::Validation(format!(
                "sales are recorded on seller accounts, {} is a {} account",
                seller_account_id, seller.role
            )));
        }

        let delta = BalanceDelta {
            available_points: -amount,
            total_sold: amount,
            pending_collection: amount,
            ..Default::default()
        };
        let entry = EntryDraft {
            account_id: seller_account_id.to_string(),
            kind: TransactionKind::Sale,
            amount,
            actor_id: actor.user_id.clone(),
            counterparty_id: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            note,
        };

        let account = apply_delta_on(&tx, &delta, &entry)?;

        if let Some(key) = idempotency_key {
            db::record_outcome(
                &tx,
                key,
                "record_sale",
                &fingerprint,
                &serde_json::to_string(&account)?,
            )?;
        }

        tx.commit()?;

        tracing::info!(
            account_id = %account.id,
            amount,
            pending_collection = account.pending_collection,
            "sale recorded"
        );

        Ok(account)
    }

    pub fn get(&self, account_id: &str) -> LedgerResult<Account> {
        let conn = self.store.lock();
        load_account(&conn, account_id)
    }

    pub fn find_by_user(&self, user_id: &str, role: Role) -> LedgerResult<Option<Account>> {
        let conn = self.store.lock();
        let account = conn
            .query_row(
                &format!(
                    "SELECT {} FROM accounts WHERE user_id = ?1 AND role = ?2",
                    ACCOUNT_COLUMNS
                ),
                params![user_id, role.as_str()],
                account_from_row,
            )
            .optional()?;

        Ok(account)
    }

    pub fn list(&self) -> LedgerResult<Vec<Account>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts ORDER BY department, role, user_id",
            ACCOUNT_COLUMNS
        ))?;

        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(accounts)
    }

    pub fn list_department(&self, department: &str) -> LedgerResult<Vec<Account>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts WHERE department = ?1 ORDER BY role, user_id",
            ACCOUNT_COLUMNS
        ))?;

        let accounts = stmt
            .query_map(params![department], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(accounts)
    }

    /// Full entry history for one account, oldest first.
    pub fn history(&self, account_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.store.lock();
        db::entries_for_account(&conn, account_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
