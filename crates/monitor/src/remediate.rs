use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};
use warden_guard::{ConflictResolver, GuardError, OperatingMode};
use warden_rules::{RuleEngine, RuleSource};

/// What happened to one file in a remediation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Compliant,
    Fixed,
    /// Checked under lock but still non-compliant, or the engine failed.
    NotFixed(String),
    /// Lost the conflict; the file was neither read nor written.
    Skipped(String),
    /// Gone before it could be processed.
    Vanished,
    /// Not attempted this pass (gate closed, stop requested, aborted cycle).
    Deferred(String),
}

impl FileOutcome {
    /// Whether the file belongs in the backlog after this pass.
    pub fn needs_backlog(&self) -> bool {
        matches!(self, Self::NotFixed(_) | Self::Skipped(_) | Self::Deferred(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::Fixed => "fixed",
            Self::NotFixed(_) => "not_fixed",
            Self::Skipped(_) => "skipped",
            Self::Vanished => "vanished",
            Self::Deferred(_) => "deferred",
        }
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFixed(why) | Self::Skipped(why) | Self::Deferred(why) => {
                write!(f, "{} ({why})", self.label())
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Resolve, lock, check, fix, release: the per-file step shared by the
/// scheduler and the backlog consumer.
pub struct Remediator {
    source: Arc<dyn RuleSource>,
    engine: Arc<dyn RuleEngine>,
    resolver: Arc<ConflictResolver>,
}

impl Remediator {
    pub fn new(
        source: Arc<dyn RuleSource>,
        engine: Arc<dyn RuleEngine>,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        Self {
            source,
            engine,
            resolver,
        }
    }

    pub fn source(&self) -> &Arc<dyn RuleSource> {
        &self.source
    }

    pub fn engine(&self) -> &Arc<dyn RuleEngine> {
        &self.engine
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Only lock-backend failures are errors; everything that can go wrong
    /// with the file itself is an outcome.  The file's lock is released
    /// before returning.
    pub async fn remediate(&self, path: &Path, mode: OperatingMode) -> Result<FileOutcome, GuardError> {
        if !path.exists() {
            return Ok(FileOutcome::Vanished);
        }

        let resolution = self.resolver.check_and_resolve(path, mode).await?;
        if resolution.is_skipped() {
            return Ok(FileOutcome::Skipped(resolution.reason));
        }
        if !resolution.holds_lock() {
            let locks = self.resolver.locks();
            if !locks.acquire(path, self.resolver.lock_timeout()).await? {
                return Ok(FileOutcome::Skipped("working lock contended".to_string()));
            }
        }

        let outcome = self.check_and_fix(path).await;
        if let Err(err) = self.resolver.locks().release(path) {
            warn!(path = %path.display(), error = %err, "failed to release lock");
        }
        debug!(path = %path.display(), outcome = %outcome, "file processed");
        Ok(outcome)
    }

    async fn check_and_fix(&self, path: &Path) -> FileOutcome {
        let rules = self.source.applicable_rules(path);
        let report = match self.engine.check(path, &rules).await {
            Ok(report) => report,
            Err(_) if !path.exists() => return FileOutcome::Vanished,
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "compliance check failed");
                return FileOutcome::NotFixed(format!("check failed: {err}"));
            }
        };
        if report.compliant {
            return FileOutcome::Compliant;
        }

        match self.engine.apply_fix(path, &report.plan).await {
            Ok(true) => FileOutcome::Fixed,
            Ok(false) => {
                let issues: Vec<String> = report.issues.iter().map(ToString::to_string).collect();
                FileOutcome::NotFixed(format!("still non-compliant: {}", issues.join("; ")))
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "fix failed");
                FileOutcome::NotFixed(format!("fix failed: {err}"))
            }
        }
    }
}
