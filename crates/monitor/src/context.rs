use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;
use warden_config::AppConfig;
use warden_guard::{
    ActivityTracker, ConflictResolver, FileAuditLog, FsActivitySignal, FsLockBackend, LockManager,
};
use warden_rules::{BuiltinEngine, ProjectVarsSource, RuleSet};

use crate::backlog::BacklogProcessor;
use crate::detector::{ChangeDetector, ScanOptions};
use crate::ledger::{FsLedger, TodoLedger};
use crate::remediate::Remediator;
use crate::scheduler::RemediationScheduler;

/// Everything one agent instance owns, built from one configuration.
///
/// Nothing here is process-global: two contexts over two project roots can
/// live side by side, and they only interact through the files they share.
pub struct AgentContext {
    config: AppConfig,
    locks: Arc<LockManager>,
    activity: Arc<ActivityTracker>,
    resolver: Arc<ConflictResolver>,
    source: Arc<ProjectVarsSource>,
    engine: Arc<BuiltinEngine>,
    ledger: Arc<TodoLedger>,
    remediator: Arc<Remediator>,
}

impl AgentContext {
    /// Validate `config`, pin the project root to an absolute path and open
    /// the shared lock directory.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let root = fs::canonicalize(config.project_root()).with_context(|| {
            format!("project root not found: {}", config.project_root().display())
        })?;
        let mut config = config.clone();
        config.workspace.project_root = root.to_string_lossy().into_owned();

        let lock_dir = config.lock_dir();
        let lock_backend = FsLockBackend::open(&lock_dir)
            .with_context(|| format!("failed to create lock directory {}", lock_dir.display()))?;
        let locks = Arc::new(
            LockManager::new(Arc::new(lock_backend), Duration::from_secs(config.locks.ttl_secs))
                .with_poll_interval(Duration::from_millis(config.locks.poll_interval_ms)),
        );
        let activity = Arc::new(ActivityTracker::new(
            Arc::new(FsActivitySignal::new(config.activity_file())),
            Duration::from_secs(config.activity.window_secs),
        ));
        let resolver = Arc::new(ConflictResolver::new(
            locks.clone(),
            activity.clone(),
            Arc::new(FileAuditLog::new(config.audit_path())),
            Duration::from_millis(config.locks.acquire_timeout_ms),
        ));

        let rules = RuleSet::from_names(&config.rules.enabled).context("invalid rules.enabled")?;
        let source = Arc::new(ProjectVarsSource::new(&root, config.vars_file(), rules));
        let engine = Arc::new(BuiltinEngine::new());
        let ledger = Arc::new(TodoLedger::new(Box::new(FsLedger::new(config.ledger_path()))));
        let remediator = Arc::new(Remediator::new(source.clone(), engine.clone(), resolver.clone()));

        debug!(root = %root.display(), holder = locks.holder(), "agent context ready");
        Ok(Self {
            config,
            locks,
            activity,
            resolver,
            source,
            engine,
            ledger,
            remediator,
        })
    }

    /// The configuration with `workspace.project_root` made absolute.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn source(&self) -> &Arc<ProjectVarsSource> {
        &self.source
    }

    pub fn engine(&self) -> &Arc<BuiltinEngine> {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<TodoLedger> {
        &self.ledger
    }

    /// The project population, minus the files the agent writes itself.
    pub fn scan_options(&self) -> Result<ScanOptions> {
        let scan = &self.config.scan;
        let mut options = ScanOptions::new(self.config.project_root())
            .with_extensions(&scan.extensions)
            .with_excluded_dirs(&scan.excluded_dirs)
            .with_exclude_globs(&scan.exclude_globs)?
            .ignore(self.config.ledger_path())
            .ignore(self.config.audit_path());
        if let Some(log_file) = self.config.log_file() {
            options = options.ignore(log_file);
        }
        Ok(options)
    }

    pub fn scheduler(&self) -> Result<RemediationScheduler> {
        let options = self.scan_options()?;
        let interval = Duration::from_secs(self.config.scheduler.interval_secs);
        let scheduler = if self.config.scheduler.persist_fingerprints {
            let dir = self.config.fingerprint_dir();
            RemediationScheduler::new(
                self.remediator.clone(),
                ChangeDetector::load_stores(options, &dir),
                self.ledger.clone(),
                interval,
            )
            .with_persistence(dir)
        } else {
            RemediationScheduler::new(
                self.remediator.clone(),
                ChangeDetector::new(options),
                self.ledger.clone(),
                interval,
            )
        };
        Ok(scheduler)
    }

    pub fn backlog(&self) -> BacklogProcessor {
        BacklogProcessor::new(self.remediator.clone(), self.ledger.clone())
    }
}
