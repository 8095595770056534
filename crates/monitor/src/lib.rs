//! The remediation loop: change detection over the rule corpus and the
//! project tree, per-file resolve/lock/fix, and the todo ledger that catches
//! whatever a pass could not finish.

pub mod backlog;
pub mod context;
pub mod detector;
pub mod fingerprint;
pub mod ledger;
pub mod remediate;
pub mod scheduler;

pub use backlog::{BacklogProcessor, BacklogReport};
pub use context::AgentContext;
pub use detector::{ChangeDetector, ChangeSet, ScanOptions};
pub use fingerprint::{Digest128, FileRecord, FingerprintStore, Observation, hash_file};
pub use ledger::{
    EnqueueReport, FsLedger, LedgerBackend, LedgerEdit, MemoryLedger, Priority, TodoEntry,
    TodoLedger,
};
pub use remediate::{FileOutcome, Remediator};
pub use scheduler::{CycleReport, RemediationScheduler};
