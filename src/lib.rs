// Bazaar Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod accounts;
pub mod allocation;
pub mod collection;
pub mod db;
pub mod error;
pub mod identity;
pub mod pool;
pub mod reconciliation;
pub mod rules;

// Re-export commonly used types
pub use accounts::{Account, AccountStore, BalanceDelta, SYSTEM_ACTOR};
pub use allocation::{AllocationEngine, TransferOutcome};
pub use collection::{CashCollection, CollectionOutcome, CollectionTracker};
pub use db::{
    LedgerEntry, LedgerStore, TransactionKind,
    all_entries, entries_for_account, entries_for_correlation, entry_count,
};
pub use error::{LedgerError, LedgerResult};
pub use identity::{
    Actor, Capability, Role, VerificationToken, capabilities_for, EVENT_WIDE,
};
pub use pool::{CashSubmission, SubmissionPool, SubmissionStatus};
pub use reconciliation::{
    AuditReport, Discrepancy, InvariantViolation, ReconciliationReporter, Rollup, RollupScope,
};
pub use rules::{AllocationRule, RuleTable};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
