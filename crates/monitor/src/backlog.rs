use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::ledger::TodoLedger;
use crate::remediate::{FileOutcome, Remediator};

#[derive(Debug, Clone, Default)]
pub struct BacklogReport {
    /// Entries removed from the ledger: compliant, fixed, or vanished.
    pub completed: Vec<PathBuf>,
    pub fixed: Vec<PathBuf>,
    /// Entries left in place, with why.
    pub kept: Vec<(PathBuf, String)>,
    pub removed: usize,
}

/// Works through the ledger.
///
/// Each entry goes through the same resolve/lock/check/fix step as a live
/// cycle.  Entries that end up compliant or whose file is gone are removed
/// in one rewrite at the end; the rest stay for a later pass.
pub struct BacklogProcessor {
    remediator: Arc<Remediator>,
    ledger: Arc<TodoLedger>,
}

impl BacklogProcessor {
    pub fn new(remediator: Arc<Remediator>, ledger: Arc<TodoLedger>) -> Self {
        Self { remediator, ledger }
    }

    pub async fn process(&self) -> Result<BacklogReport> {
        let entries = self.ledger.entries()?;
        let mode = self.remediator.source().operating_mode();
        let mut report = BacklogReport::default();
        let mut seen = HashSet::new();

        for entry in entries {
            if !seen.insert(entry.path.clone()) {
                continue;
            }
            match self.remediator.remediate(&entry.path, mode).await? {
                FileOutcome::Compliant | FileOutcome::Vanished => report.completed.push(entry.path),
                FileOutcome::Fixed => {
                    report.fixed.push(entry.path.clone());
                    report.completed.push(entry.path);
                }
                FileOutcome::NotFixed(why) | FileOutcome::Skipped(why) | FileOutcome::Deferred(why) => {
                    report.kept.push((entry.path, why));
                }
            }
        }

        let done: HashSet<PathBuf> = report.completed.iter().cloned().collect();
        report.removed = self.ledger.remove(&done)?;
        info!(
            completed = report.completed.len(),
            fixed = report.fixed.len(),
            kept = report.kept.len(),
            "backlog pass complete"
        );
        Ok(report)
    }
}
