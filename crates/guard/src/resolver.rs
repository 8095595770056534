use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::GuardError;
use crate::activity::ActivityTracker;
use crate::audit::{AuditSink, ConflictRecord};
use crate::lock::LockManager;
use crate::policy::{ConflictReason, ModeDecision, OperatingMode, decide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionOutcome {
    /// No conflict; the caller takes its own working lock before mutating.
    Proceed,
    /// Conflict, but the resolver won the lock.  The caller now holds it and
    /// must release it when done.
    ForcedWithLock,
    /// Conflict and the lock could not be won; leave the file alone.
    Skipped,
}

impl ResolutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proceed => "PROCEED",
            Self::ForcedWithLock => "FORCED_WITH_LOCK",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub reason: String,
    pub mode: OperatingMode,
}

impl Resolution {
    pub fn holds_lock(&self) -> bool {
        self.outcome == ResolutionOutcome::ForcedWithLock
    }

    pub fn is_skipped(&self) -> bool {
        self.outcome == ResolutionOutcome::Skipped
    }
}

/// Decides per file whether the agent may act now.
///
/// A live lock held by another owner is a conflict in every mode.  Otherwise
/// the mode policy decides.  Every conflict is escalated by racing for the
/// lock: winning it means acting despite the conflict, losing it means
/// skipping.  Each decision is written to the audit sink.
pub struct ConflictResolver {
    locks: Arc<LockManager>,
    activity: Arc<ActivityTracker>,
    audit: Arc<dyn AuditSink>,
    lock_timeout: Duration,
}

impl ConflictResolver {
    pub fn new(
        locks: Arc<LockManager>,
        activity: Arc<ActivityTracker>,
        audit: Arc<dyn AuditSink>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            locks,
            activity,
            audit,
            lock_timeout,
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub async fn check_and_resolve(
        &self,
        path: &Path,
        mode: OperatingMode,
    ) -> Result<Resolution, GuardError> {
        let user_active = self.activity.is_user_active();
        let decision = match self.locks.is_locked(path)? {
            (true, Some(owner)) if !owner.ours => {
                ModeDecision::Conflict(ConflictReason::LockHeld(owner.describe()))
            }
            _ => decide(mode, user_active),
        };

        let resolution = match decision {
            ModeDecision::Proceed => Resolution {
                outcome: ResolutionOutcome::Proceed,
                reason: if user_active {
                    "human active; dev priority outranks manual edits".to_string()
                } else {
                    "no conflict".to_string()
                },
                mode,
            },
            ModeDecision::Conflict(reason) => {
                let won = self.locks.acquire(path, self.lock_timeout).await?;
                let outcome = if won {
                    ResolutionOutcome::ForcedWithLock
                } else {
                    ResolutionOutcome::Skipped
                };
                info!(path = %path.display(), mode = %mode, %reason, outcome = %outcome, "conflict resolved");
                Resolution {
                    outcome,
                    reason: reason.to_string(),
                    mode,
                }
            }
        };

        self.record(path, &resolution);
        Ok(resolution)
    }

    fn record(&self, path: &Path, resolution: &Resolution) {
        let record = ConflictRecord {
            subject_path: path.to_path_buf(),
            mode: resolution.mode,
            reason: resolution.reason.clone(),
            resolution: resolution.outcome.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.audit.append(&record) {
            warn!(error = %err, "could not append conflict audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::activity::ManualActivitySignal;
    use crate::audit::MemoryAuditLog;
    use crate::lock::{LockBackend, LockId, MemoryLockBackend};

    struct Fixture {
        backend: Arc<MemoryLockBackend>,
        signal: Arc<ManualActivitySignal>,
        audit: Arc<MemoryAuditLog>,
        resolver: ConflictResolver,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryLockBackend::new());
        let signal = Arc::new(ManualActivitySignal::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let locks = Arc::new(
            LockManager::new(backend.clone(), Duration::from_secs(300))
                .with_poll_interval(Duration::from_millis(5)),
        );
        let activity = Arc::new(ActivityTracker::new(signal.clone(), Duration::from_secs(300)));
        let resolver =
            ConflictResolver::new(locks, activity, audit.clone(), Duration::from_millis(40));
        Fixture {
            backend,
            signal,
            audit,
            resolver,
        }
    }

    fn other_manager(fx: &Fixture) -> LockManager {
        let backend: Arc<dyn LockBackend> = fx.backend.clone();
        LockManager::new(backend, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn dev_priority_proceeds_despite_activity() {
        let fx = fixture();
        fx.signal.touched_ago(Duration::from_secs(10));
        let path = Path::new("/p/a.py");

        let res = fx.resolver.check_and_resolve(path, OperatingMode::DevPriority).await.unwrap();
        assert_eq!(res.outcome, ResolutionOutcome::Proceed);
        assert!(!fx.resolver.locks().is_locked(path).unwrap().0, "proceed takes no lock");

        let records = fx.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mode, OperatingMode::DevPriority);
        assert_eq!(records[0].resolution, "PROCEED");
    }

    #[tokio::test]
    async fn prod_priority_with_idle_human_proceeds() {
        let fx = fixture();
        let res = fx
            .resolver
            .check_and_resolve(Path::new("/p/a.py"), OperatingMode::ProdPriority)
            .await
            .unwrap();
        assert_eq!(res.outcome, ResolutionOutcome::Proceed);
        assert_eq!(res.reason, "no conflict");
    }

    #[tokio::test]
    async fn prod_priority_with_active_human_forces_with_lock() {
        let fx = fixture();
        fx.signal.touched_ago(Duration::from_secs(10));
        let path = Path::new("/p/b.py");

        let res = fx.resolver.check_and_resolve(path, OperatingMode::ProdPriority).await.unwrap();
        assert_eq!(res.outcome, ResolutionOutcome::ForcedWithLock);
        assert!(res.holds_lock());
        let (locked, info) = fx.resolver.locks().is_locked(path).unwrap();
        assert!(locked);
        assert!(info.unwrap().ours);
        assert_eq!(fx.audit.records()[0].resolution, "FORCED_WITH_LOCK");
    }

    #[tokio::test]
    async fn prod_priority_with_active_human_and_foreign_lock_skips() {
        let fx = fixture();
        fx.signal.touched_ago(Duration::from_secs(10));
        let path = Path::new("/p/b.py");
        let other = other_manager(&fx);
        assert!(other.try_acquire(path).unwrap());

        let res = fx.resolver.check_and_resolve(path, OperatingMode::ProdPriority).await.unwrap();
        assert_eq!(res.outcome, ResolutionOutcome::Skipped);
        assert!(res.reason.starts_with("file locked"));
        let record = &fx.audit.records()[0];
        assert_eq!(record.resolution, "SKIPPED");
        assert_eq!(record.mode, OperatingMode::ProdPriority);
    }

    #[tokio::test]
    async fn live_foreign_lock_conflicts_even_in_dev_priority() {
        let fx = fixture();
        let path = Path::new("/p/locked.py");
        let other = other_manager(&fx);
        assert!(other.try_acquire(path).unwrap());

        let res = fx.resolver.check_and_resolve(path, OperatingMode::DevPriority).await.unwrap();
        assert_eq!(res.outcome, ResolutionOutcome::Skipped);
    }

    #[tokio::test]
    async fn stale_foreign_lock_is_not_a_conflict() {
        let fx = fixture();
        let path = Path::new("/p/abandoned.py");
        let other = other_manager(&fx);
        assert!(other.try_acquire(path).unwrap());
        fx.backend.backdate(&LockId::for_path(path), Duration::from_secs(400));

        let res = fx.resolver.check_and_resolve(path, OperatingMode::DevPriority).await.unwrap();
        assert_eq!(res.outcome, ResolutionOutcome::Proceed);
    }

    #[tokio::test]
    async fn unknown_mode_escalates_like_prod() {
        let fx = fixture();
        fx.signal.touched_ago(Duration::from_secs(1));
        let res = fx
            .resolver
            .check_and_resolve(Path::new("/p/u.py"), OperatingMode::Unknown)
            .await
            .unwrap();
        assert_eq!(res.outcome, ResolutionOutcome::ForcedWithLock);
        assert_eq!(fx.audit.records()[0].mode, OperatingMode::Unknown);
        assert!(res.reason.contains("unknown mode"));
    }

    #[tokio::test]
    async fn every_decision_is_audited() {
        let fx = fixture();
        for name in ["/p/1.py", "/p/2.py", "/p/3.py"] {
            fx.resolver
                .check_and_resolve(Path::new(name), OperatingMode::DevPriority)
                .await
                .unwrap();
        }
        assert_eq!(fx.audit.records().len(), 3);
    }
}
