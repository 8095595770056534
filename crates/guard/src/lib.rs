//! Cross-process coordination between the remediation agent and a human
//! editor: sentinel-file locks, the activity heuristic, the mode policy and
//! the conflict resolver that combines them.

pub mod activity;
pub mod audit;
pub mod lock;
pub mod policy;
pub mod resolver;

use std::io;
use std::path::PathBuf;

pub use activity::{ActivitySignalBackend, ActivityTracker, FsActivitySignal, ManualActivitySignal};
pub use audit::{AuditSink, ConflictRecord, FileAuditLog, MemoryAuditLog};
pub use lock::{
    FsLockBackend, LockBackend, LockId, LockInfo, LockManager, LockStatus, MemoryLockBackend,
};
pub use policy::{ConflictReason, ModeDecision, OperatingMode, decide};
pub use resolver::{ConflictResolver, Resolution, ResolutionOutcome};

/// Failures of the shared coordination surface itself.  Designed outcomes
/// (contention, timeouts, stale locks) are values, never errors.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("lock backend failed at {path}: {source}")]
    Backend {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("audit log unwritable at {path}: {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
