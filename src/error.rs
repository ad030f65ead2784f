// ⚠️ Ledger Errors - Typed failure taxonomy for every ledger operation
//
// Every mutating operation returns one of these variants instead of panicking
// or silently no-oping. Callers (CLI, HTTP surface, tests) match on the
// variant to decide between "fix the request", "retry", and "give up".

use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed or contradictory request: non-positive amount, unknown role,
    /// idempotency key reused with a different payload, state-machine misuse.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Actor lacks the capability or department authority for the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Requested allocation exceeds the per-role single-transfer limit.
    #[error("allocation limit exceeded for {role}: {amount} points requested, limit is {limit}")]
    LimitExceeded {
        role: String,
        amount: i64,
        limit: i64,
    },

    /// Debit would push a protected balance field below zero.
    #[error("insufficient balance on account {account_id}: {field} is {balance}, delta {delta}")]
    InsufficientBalance {
        account_id: String,
        field: &'static str,
        balance: i64,
        delta: i64,
    },

    /// Cash collection larger than the seller's outstanding pending amount.
    #[error("collection of {requested} exceeds pending amount {pending} for seller {seller_id}")]
    AmountExceedsPending {
        seller_id: String,
        requested: i64,
        pending: i64,
    },

    /// Submission already claimed by another finance member.
    #[error("submission {submission_id} already claimed by {claimed_by}")]
    AlreadyClaimed {
        submission_id: String,
        claimed_by: String,
    },

    /// Cash collection already included in an earlier submission.
    #[error("collection {collection_id} already submitted to finance")]
    AlreadySubmitted { collection_id: String },

    /// Actor is authenticated and capable but not the right party for this
    /// record (wrong claimant, foreign collection, foreign account).
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Write lost to a concurrent writer; safe to retry with the same key.
    #[error("storage conflict: {0}")]
    StorageConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Bug or corrupted journal; surfaced loudly, never swallowed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a retry with the same idempotency key can succeed.
    /// Validation and authorization failures are permanent; only
    /// transient storage contention is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StorageConflict(_))
    }

    /// Short machine-readable tag, used by the HTTP surface and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::Unauthorized(_) => "unauthorized",
            LedgerError::LimitExceeded { .. } => "limit_exceeded",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::AmountExceedsPending { .. } => "amount_exceeds_pending",
            LedgerError::AlreadyClaimed { .. } => "already_claimed",
            LedgerError::AlreadySubmitted { .. } => "already_submitted",
            LedgerError::Forbidden(_) => "forbidden",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::StorageConflict(_) => "storage_conflict",
            LedgerError::Storage(_) => "storage",
            LedgerError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    LedgerError::StorageConflict(err.to_string())
                }
                _ => LedgerError::Storage(err.to_string()),
            },
            _ => LedgerError::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Internal(format!("outcome serialization failed: {}", err))
    }
}

impl From<csv::Error> for LedgerError {
    fn from(err: csv::Error) -> Self {
        LedgerError::Internal(format!("csv export failed: {}", err))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Internal(format!("io error: {}", err))
    }
}

// ============================================================================
// TESTS
// ============================================================================
