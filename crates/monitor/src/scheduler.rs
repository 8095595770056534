use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use warden_guard::{ModeDecision, OperatingMode, decide};

use crate::detector::ChangeDetector;
use crate::ledger::{EnqueueReport, TodoLedger};
use crate::remediate::{FileOutcome, Remediator};

#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Mode read at the start of the cycle.
    pub mode: OperatingMode,
    pub rule_changes: usize,
    pub escalated: bool,
    /// `false` when the cycle-level policy check deferred every candidate.
    pub gate_open: bool,
    pub outcomes: Vec<(PathBuf, FileOutcome)>,
    pub enqueued: EnqueueReport,
    /// A stop request arrived before every candidate was processed.
    pub stopped: bool,
}

impl CycleReport {
    fn new(mode: OperatingMode) -> Self {
        Self {
            mode,
            rule_changes: 0,
            escalated: false,
            gate_open: true,
            outcomes: Vec::new(),
            enqueued: EnqueueReport::default(),
            stopped: false,
        }
    }

    /// Nothing changed, so nothing was looked at.
    pub fn is_idle(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcome(&self, path: &Path) -> Option<&FileOutcome> {
        self.outcomes.iter().find(|(p, _)| p == path).map(|(_, o)| o)
    }

    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    /// Files the engine actually looked at.
    pub fn checked(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Compliant | FileOutcome::Fixed | FileOutcome::NotFixed(_)))
    }

    pub fn fixed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Fixed))
    }

    /// Skipped files count as not fixed.
    pub fn not_fixed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::NotFixed(_) | FileOutcome::Skipped(_)))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Deferred(_)))
    }
}

/// Top-level detect / resolve-and-fix / ledger loop.
///
/// One cycle: detect changes (rule files first), evaluate the mode policy
/// once for the whole cycle, remediate each candidate sequentially, then
/// append whatever is still outstanding to the ledger.  `run` repeats the
/// same cycle on a fixed interval; single-shot callers use `run_once`.
pub struct RemediationScheduler {
    remediator: Arc<Remediator>,
    detector: ChangeDetector,
    ledger: Arc<TodoLedger>,
    interval: Duration,
    fingerprint_dir: Option<PathBuf>,
    stop: Option<watch::Receiver<bool>>,
}

impl RemediationScheduler {
    pub fn new(
        remediator: Arc<Remediator>,
        detector: ChangeDetector,
        ledger: Arc<TodoLedger>,
        interval: Duration,
    ) -> Self {
        Self {
            remediator,
            detector,
            ledger,
            interval,
            fingerprint_dir: None,
            stop: None,
        }
    }

    /// Save both fingerprint stores under `dir` at the end of every cycle.
    pub fn with_persistence(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fingerprint_dir = Some(dir.into());
        self
    }

    /// Stop signal checked before each file.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One cycle, for single-shot invocations.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        let report = self.run_cycle().await?;
        log_report(&report);
        Ok(report)
    }

    /// Cycle forever until `shutdown` flips to `true`.  A failed cycle is
    /// logged and retried after the normal interval.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.stop = Some(shutdown.clone());
        info!(interval_secs = self.interval.as_secs(), "remediation loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle().await {
                Ok(report) => log_report(&report),
                Err(err) => error!(error = %format!("{err:#}"), "remediation cycle failed; retrying next interval"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("remediation loop stopped");
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let source = self.remediator.source().clone();
        let mode = source.operating_mode();
        let mut report = CycleReport::new(mode);

        let changes = self.detector.detect(source.as_ref())?;
        report.rule_changes = changes.rule_changes.len();
        report.escalated = changes.escalated;
        if changes.is_empty() {
            debug!(mode = %mode, "no changes");
            self.persist()?;
            return Ok(report);
        }

        let user_active = self.remediator.resolver().activity().is_user_active();
        let mut failure = None;
        match decide(mode, user_active) {
            ModeDecision::Conflict(reason) => {
                info!(mode = %mode, %reason, files = changes.candidates.len(), "cycle gate closed; deferring candidates");
                report.gate_open = false;
                let why = format!("cycle gate closed: {reason}");
                for path in changes.candidates {
                    report.outcomes.push((path, FileOutcome::Deferred(why.clone())));
                }
            }
            ModeDecision::Proceed => {
                for path in changes.candidates {
                    if failure.is_some() {
                        let why = "cycle aborted".to_string();
                        report.outcomes.push((path, FileOutcome::Deferred(why)));
                        continue;
                    }
                    if self.stop_requested() {
                        report.stopped = true;
                        let why = "stop requested".to_string();
                        report.outcomes.push((path, FileOutcome::Deferred(why)));
                        continue;
                    }
                    match self.remediator.remediate(&path, mode).await {
                        Ok(outcome) => {
                            if outcome == FileOutcome::Fixed {
                                self.detector.rebaseline(&path);
                            }
                            report.outcomes.push((path, outcome));
                        }
                        Err(err) => {
                            error!(path = %path.display(), error = %err, "lock infrastructure failed; aborting cycle");
                            report.outcomes.push((path, FileOutcome::Deferred("cycle aborted".to_string())));
                            failure = Some(err);
                        }
                    }
                }
            }
        }

        let backlog: Vec<PathBuf> = report
            .outcomes
            .iter()
            .filter(|(_, o)| o.needs_backlog())
            .map(|(p, _)| p.clone())
            .collect();
        if !backlog.is_empty() {
            report.enqueued = self.ledger.enqueue_resolved(&backlog, mode)?;
        }
        self.persist()?;

        match failure {
            Some(err) => Err(err).context("remediation cycle aborted"),
            None => Ok(report),
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn persist(&self) -> Result<()> {
        if let Some(dir) = &self.fingerprint_dir {
            self.detector
                .save_stores(dir)
                .with_context(|| format!("failed to save fingerprints under {}", dir.display()))?;
        }
        Ok(())
    }
}

fn log_report(report: &CycleReport) {
    if report.is_idle() {
        return;
    }
    info!(
        mode = %report.mode,
        escalated = report.escalated,
        gate_open = report.gate_open,
        checked = report.checked(),
        fixed = report.fixed(),
        not_fixed = report.not_fixed(),
        deferred = report.deferred(),
        enqueued = report.enqueued.appended.len(),
        "remediation cycle complete"
    );
    if report.stopped {
        warn!("cycle interrupted by stop request; remaining files deferred to the ledger");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;
    use warden_guard::OperatingMode;

    use super::*;
    use crate::detector::ScanOptions;
    use crate::ledger::{MemoryLedger, Priority};
    use crate::remediate::testing::{BrokenEngine, Fixture};

    struct Harness {
        fx: Fixture,
        ledger: Arc<TodoLedger>,
        scheduler: RemediationScheduler,
    }

    fn harness(fx: Fixture) -> Harness {
        let ledger = Arc::new(TodoLedger::new(Box::new(MemoryLedger::new())));
        let options = ScanOptions::new(fx.root()).with_extensions(&["py", "txt", "md"]);
        let scheduler = RemediationScheduler::new(
            fx.remediator.clone(),
            ChangeDetector::new(options),
            ledger.clone(),
            Duration::from_secs(3600),
        );
        Harness {
            fx,
            ledger,
            scheduler,
        }
    }

    fn ledger_paths(ledger: &TodoLedger) -> Vec<PathBuf> {
        ledger.entries().unwrap().into_iter().map(|e| e.path).collect()
    }

    #[tokio::test]
    async fn first_cycle_only_baselines() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        let a = fx.write("a.py", "import os\n");
        let mut h = harness(fx);

        let report = h.scheduler.run_cycle().await.unwrap();
        assert!(report.is_idle());
        assert_eq!(fs::read_to_string(&a).unwrap(), "import os\n");
        assert!(ledger_paths(&h.ledger).is_empty());
    }

    #[tokio::test]
    async fn changed_file_is_fixed_and_not_enqueued() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        let a = fx.write("a.py", "import os\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        fs::write(&a, "import sys\n").unwrap();
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.outcome(&a), Some(&FileOutcome::Fixed));
        assert_eq!(report.fixed(), 1);
        assert!(ledger_paths(&h.ledger).is_empty());
        let body = fs::read_to_string(&a).unwrap();
        assert!(body.starts_with("# -*- coding: utf-8 -*-\n"));
        assert!(body.ends_with("import sys\n"));

        let audit = h.fx.audit.records();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].resolution, "PROCEED");

        // The agent's own write is not a change.
        assert!(h.scheduler.run_cycle().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn active_human_in_prod_defers_everything_untouched() {
        let fx = Fixture::new(OperatingMode::ProdPriority);
        let b = fx.write("b.py", "import os\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        let other = h.fx.other_process();
        assert!(other.try_acquire(&b).unwrap());
        h.fx.signal.touched_ago(Duration::from_secs(10));
        fs::write(&b, "import sys\n").unwrap();

        let report = h.scheduler.run_cycle().await.unwrap();
        assert!(!report.gate_open);
        assert!(matches!(report.outcome(&b), Some(FileOutcome::Deferred(_))));
        assert_eq!(fs::read_to_string(&b).unwrap(), "import sys\n");

        let entries = h.ledger.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, b);
        assert_eq!(entries[0].priority, Priority::Low);
    }

    #[tokio::test]
    async fn prod_with_idle_human_remediates() {
        let fx = Fixture::new(OperatingMode::ProdPriority);
        let a = fx.write("a.py", "import os\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        h.fx.signal.touched_ago(Duration::from_secs(600));
        fs::write(&a, "import sys\n").unwrap();
        let report = h.scheduler.run_cycle().await.unwrap();
        assert!(report.gate_open);
        assert_eq!(report.outcome(&a), Some(&FileOutcome::Fixed));
    }

    #[tokio::test]
    async fn live_lock_skips_file_and_enqueues_high_in_dev() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        let a = fx.write("a.py", "import os\n");
        let c = fx.write("c.py", "import os\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        let other = h.fx.other_process();
        assert!(other.try_acquire(&a).unwrap());
        fs::write(&a, "import sys\n").unwrap();
        fs::write(&c, "import sys\n").unwrap();

        let report = h.scheduler.run_cycle().await.unwrap();
        assert!(matches!(report.outcome(&a), Some(FileOutcome::Skipped(_))));
        assert_eq!(report.outcome(&c), Some(&FileOutcome::Fixed));
        assert_eq!(fs::read_to_string(&a).unwrap(), "import sys\n");

        let entries = h.ledger.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, a);
        assert_eq!(entries[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn lock_won_during_conflict_is_used_then_released() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        let a = fx.write("a.py", "import os\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        let other = Arc::new(h.fx.other_process());
        assert!(other.try_acquire(&a).unwrap());
        fs::write(&a, "import sys\n").unwrap();
        let releaser = {
            let other = other.clone();
            let a = a.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                other.release(&a).unwrap();
            })
        };

        let report = h.scheduler.run_cycle().await.unwrap();
        releaser.await.unwrap();
        assert_eq!(report.outcome(&a), Some(&FileOutcome::Fixed));
        assert_eq!(h.fx.audit.records()[0].resolution, "FORCED_WITH_LOCK");
        assert!(!h.fx.remediator.resolver().locks().is_locked(&a).unwrap().0);
    }

    #[tokio::test]
    async fn rule_change_rechecks_every_project_file() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        let rules = fx.write("rules/dev.mdc", "v1");
        fx.source.set_rule_files(vec![rules.clone()]);
        let a = fx.write("a.py", "import os\n");
        let ok = fx.write("ok.py", "# -*- coding: utf-8 -*-\n\"\"\"Ok.\"\"\"\n");
        let notes = fx.write("notes.md", "hello\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        fs::write(&rules, "v2").unwrap();
        let report = h.scheduler.run_cycle().await.unwrap();
        assert!(report.escalated);
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.outcome(&a), Some(&FileOutcome::Fixed));
        assert_eq!(report.outcome(&ok), Some(&FileOutcome::Compliant));
        assert_eq!(report.outcome(&notes), Some(&FileOutcome::Compliant));
        assert_eq!(report.checked(), 3);
    }

    #[tokio::test]
    async fn engine_failures_do_not_stop_the_batch() {
        let fx = Fixture::with_engine(OperatingMode::DevPriority, Arc::new(BrokenEngine));
        let a = fx.write("a.py", "1\n");
        let b = fx.write("b.py", "1\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        fs::write(&a, "2\n").unwrap();
        fs::write(&b, "2\n").unwrap();
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.not_fixed(), 2);
        assert_eq!(ledger_paths(&h.ledger), vec![a, b]);
    }

    #[tokio::test]
    async fn repeated_failures_enqueue_once() {
        let fx = Fixture::with_engine(OperatingMode::ProdPriority, Arc::new(BrokenEngine));
        let a = fx.write("a.py", "1\n");
        let mut h = harness(fx);
        h.scheduler.run_cycle().await.unwrap();

        for body in ["2\n", "3\n"] {
            fs::write(&a, body).unwrap();
            let report = h.scheduler.run_cycle().await.unwrap();
            assert_eq!(report.not_fixed(), 1);
        }
        assert_eq!(ledger_paths(&h.ledger), vec![a]);
    }

    #[tokio::test]
    async fn stop_request_defers_remaining_files() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        let a = fx.write("a.py", "import os\n");
        let b = fx.write("b.py", "import os\n");
        let h = harness(fx);
        let (tx, rx) = watch::channel(false);
        let mut scheduler = h.scheduler.with_stop_signal(rx);
        scheduler.run_cycle().await.unwrap();

        fs::write(&a, "import sys\n").unwrap();
        fs::write(&b, "import sys\n").unwrap();
        tx.send(true).unwrap();
        let report = scheduler.run_cycle().await.unwrap();
        assert!(report.stopped);
        assert_eq!(report.deferred(), 2);
        assert_eq!(fs::read_to_string(&a).unwrap(), "import sys\n");
        assert_eq!(ledger_paths(&h.ledger), vec![a, b]);
    }

    #[tokio::test]
    async fn run_loop_exits_on_shutdown() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        fx.write("a.py", "import os\n");
        let h = harness(fx);
        let mut scheduler = h.scheduler;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(joined.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn persisted_fingerprints_detect_changes_across_runs() {
        let fx = Fixture::new(OperatingMode::DevPriority);
        let a = fx.write("a.py", "import os\n");
        let cache = fx.root().join(".state/fingerprints");
        let options = || ScanOptions::new(fx.root()).with_extensions(&["py"]);
        let ledger = Arc::new(TodoLedger::new(Box::new(MemoryLedger::new())));

        let mut first = RemediationScheduler::new(
            fx.remediator.clone(),
            ChangeDetector::new(options()),
            ledger.clone(),
            Duration::from_secs(60),
        )
        .with_persistence(&cache);
        assert!(first.run_once().await.unwrap().is_idle());

        fs::write(&a, "import sys\n").unwrap();
        let mut second = RemediationScheduler::new(
            fx.remediator.clone(),
            ChangeDetector::load_stores(options(), &cache),
            ledger,
            Duration::from_secs(60),
        )
        .with_persistence(&cache);
        let report = second.run_once().await.unwrap();
        assert_eq!(report.outcome(&a), Some(&FileOutcome::Fixed));
    }
}
