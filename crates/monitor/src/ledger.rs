//! Durable backlog of files awaiting remediation.
//!
//! Text format, one entry per line:
//!
//! ```text
//! # path|priority|enqueued_at
//! /srv/project/a.py|HIGH|2024-01-01T00:00:00
//! ```
//!
//! Enqueueing only ever appends.  Removing entries is a whole-file rewrite
//! that keeps `#` lines verbatim.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use fs2::FileExt;
use tracing::{debug, info, warn};
use warden_guard::{ConflictResolver, OperatingMode};

pub const HEADER: &str = "# path|priority|enqueued_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    /// HIGH under DEV_PRIORITY, LOW otherwise.
    pub fn for_mode(mode: OperatingMode) -> Self {
        if mode.is_dev_priority() { Self::High } else { Self::Low }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Low => "LOW",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Some(Self::High),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoEntry {
    pub path: PathBuf,
    pub priority: Priority,
    /// Kept as written; entries from other tools may use any ISO-8601 form.
    pub enqueued_at: String,
}

impl TodoEntry {
    fn new(path: PathBuf, priority: Priority) -> Self {
        Self {
            path,
            priority,
            enqueued_at: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{}|{}|{}", self.path.display(), self.priority, self.enqueued_at)
    }

    /// Parse a data line.  Only the path column is required.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut parts = line.splitn(3, '|');
        let path = parts.next()?.trim();
        if path.is_empty() {
            return None;
        }
        Some(Self {
            path: PathBuf::from(path),
            priority: parts.next().and_then(Priority::parse).unwrap_or(Priority::Low),
            enqueued_at: parts.next().unwrap_or_default().trim().to_string(),
        })
    }
}

// ── Backends ──────────────────────────────────────────────────────────────────

/// What an exclusive edit does with the ledger text it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEdit {
    Unchanged,
    Append(String),
    Replace(String),
}

/// Storage for the ledger text.  `edit` runs read-modify-write under
/// exclusive access shared with every other writer of the same backend.
pub trait LedgerBackend: Send + Sync {
    /// Current text; empty when the ledger does not exist yet.
    fn read(&self) -> Result<String>;
    fn edit(&self, edit: &mut dyn FnMut(&str) -> LedgerEdit) -> Result<()>;
    fn location(&self) -> PathBuf;
}

/// Ledger file guarded by an `fs2` lock on a `.lock` sidecar, so appends from
/// the agent and rewrites from a consumer in another process serialize.
#[derive(Debug, Clone)]
pub struct FsLedger {
    path: PathBuf,
}

impl FsLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    fn read_text(&self) -> io::Result<String> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    fn replace(&self, text: &str) -> io::Result<()> {
        let tmp = sibling(&self.path, "tmp");
        let written = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()
        })();
        if let Err(err) = written.and_then(|_| fs::rename(&tmp, &self.path)) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                debug!(path = %tmp.display(), error = %cleanup, "could not remove temp file");
            }
            return Err(err);
        }
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "ledger".to_string());
    path.with_file_name(format!("{name}.{suffix}"))
}

impl LedgerBackend for FsLedger {
    fn read(&self) -> Result<String> {
        self.read_text()
            .with_context(|| format!("failed to read ledger {}", self.path.display()))
    }

    fn edit(&self, edit: &mut dyn FnMut(&str) -> LedgerEdit) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let lock_path = self.lock_path();
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        lock.lock_exclusive()
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;

        let result = (|| -> Result<()> {
            let current = self.read()?;
            match edit(&current) {
                LedgerEdit::Unchanged => Ok(()),
                LedgerEdit::Append(text) => {
                    let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
                    file.write_all(text.as_bytes())?;
                    file.sync_all()?;
                    Ok(())
                }
                LedgerEdit::Replace(text) => Ok(self.replace(&text)?),
            }
        })();

        if let Err(err) = FileExt::unlock(&lock) {
            warn!(path = %lock_path.display(), error = %err, "failed to unlock ledger");
        }
        result.with_context(|| format!("failed to update ledger {}", self.path.display()))
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    text: Mutex<String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
        }
    }
}

impl LedgerBackend for MemoryLedger {
    fn read(&self) -> Result<String> {
        Ok(self.text.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn edit(&self, edit: &mut dyn FnMut(&str) -> LedgerEdit) -> Result<()> {
        let mut text = self.text.lock().unwrap_or_else(|e| e.into_inner());
        match edit(&text) {
            LedgerEdit::Unchanged => {}
            LedgerEdit::Append(more) => text.push_str(&more),
            LedgerEdit::Replace(all) => *text = all,
        }
        Ok(())
    }

    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}

// ── Ledger ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub appended: Vec<PathBuf>,
    /// Already present in the ledger or repeated in the input.
    pub duplicates: Vec<PathBuf>,
    /// Dropped with a reason: unrepresentable path or lost conflict.
    pub rejected: Vec<(PathBuf, String)>,
}

impl EnqueueReport {
    fn merge(&mut self, other: EnqueueReport) {
        self.appended.extend(other.appended);
        self.duplicates.extend(other.duplicates);
        self.rejected.extend(other.rejected);
    }
}

pub struct TodoLedger {
    backend: Box<dyn LedgerBackend>,
}

impl TodoLedger {
    pub fn new(backend: Box<dyn LedgerBackend>) -> Self {
        Self { backend }
    }

    pub fn location(&self) -> PathBuf {
        self.backend.location()
    }

    pub fn entries(&self) -> Result<Vec<TodoEntry>> {
        Ok(self.backend.read()?.lines().filter_map(TodoEntry::parse).collect())
    }

    pub fn contains(&self, path: &Path) -> Result<bool> {
        Ok(self.entries()?.iter().any(|e| e.path == path))
    }

    /// Enqueue after a fresh conflict-resolution pass per surviving path.
    /// A path the resolver skips is dropped with its reason; a lock won on
    /// the way is released at once, since enqueueing never edits the file.
    pub async fn enqueue(
        &self,
        paths: &[PathBuf],
        resolver: &ConflictResolver,
        mode: OperatingMode,
    ) -> Result<EnqueueReport> {
        let (survivors, mut report) = self.dedup(paths)?;

        let mut accepted = Vec::with_capacity(survivors.len());
        for path in survivors {
            let resolution = resolver.check_and_resolve(&path, mode).await?;
            if resolution.holds_lock() {
                resolver.locks().release(&path)?;
            }
            if resolution.is_skipped() {
                info!(path = %path.display(), reason = %resolution.reason, "not enqueued");
                report.rejected.push((path, resolution.reason));
            } else {
                accepted.push(path);
            }
        }

        report.merge(self.append(&accepted, Priority::for_mode(mode))?);
        Ok(report)
    }

    /// Enqueue paths whose conflict resolution already happened this cycle.
    pub fn enqueue_resolved(&self, paths: &[PathBuf], mode: OperatingMode) -> Result<EnqueueReport> {
        let (survivors, mut report) = self.dedup(paths)?;
        report.merge(self.append(&survivors, Priority::for_mode(mode))?);
        Ok(report)
    }

    /// Drop data lines whose path is in `done`.  Comment lines and entries
    /// appended since the caller read the ledger are kept.  Returns how many
    /// lines were removed.
    pub fn remove(&self, done: &HashSet<PathBuf>) -> Result<usize> {
        if done.is_empty() {
            return Ok(0);
        }
        let mut removed = 0;
        self.backend.edit(&mut |current: &str| {
            let mut kept = String::with_capacity(current.len());
            removed = 0;
            for line in current.lines() {
                match TodoEntry::parse(line) {
                    Some(entry) if done.contains(&entry.path) => removed += 1,
                    _ => {
                        kept.push_str(line);
                        kept.push('\n');
                    }
                }
            }
            if removed == 0 { LedgerEdit::Unchanged } else { LedgerEdit::Replace(kept) }
        })?;
        debug!(removed, ledger = %self.location().display(), "ledger entries removed");
        Ok(removed)
    }

    fn dedup(&self, paths: &[PathBuf]) -> Result<(Vec<PathBuf>, EnqueueReport)> {
        let mut seen: HashSet<PathBuf> = self.entries()?.into_iter().map(|e| e.path).collect();
        let mut report = EnqueueReport::default();
        let mut survivors = Vec::new();
        for path in paths {
            if let Some(reason) = unrepresentable(path) {
                warn!(path = %path.display(), reason, "path cannot be stored in the ledger");
                report.rejected.push((path.clone(), reason.to_string()));
            } else if seen.insert(path.clone()) {
                survivors.push(path.clone());
            } else {
                report.duplicates.push(path.clone());
            }
        }
        Ok((survivors, report))
    }

    /// Append under the backend lock, re-checking for entries written since
    /// `dedup` read the ledger.
    fn append(&self, paths: &[PathBuf], priority: Priority) -> Result<EnqueueReport> {
        let mut report = EnqueueReport::default();
        if paths.is_empty() {
            return Ok(report);
        }
        self.backend.edit(&mut |current: &str| {
            report = EnqueueReport::default();
            let present: HashSet<PathBuf> =
                current.lines().filter_map(TodoEntry::parse).map(|e| e.path).collect();
            let mut text = String::new();
            if current.trim().is_empty() {
                text.push_str(HEADER);
                text.push('\n');
            } else if !current.ends_with('\n') {
                text.push('\n');
            }
            for path in paths {
                if present.contains(path) {
                    report.duplicates.push(path.clone());
                    continue;
                }
                text.push_str(&TodoEntry::new(path.clone(), priority).to_line());
                text.push('\n');
                report.appended.push(path.clone());
            }
            if report.appended.is_empty() {
                LedgerEdit::Unchanged
            } else if current.trim().is_empty() {
                LedgerEdit::Replace(text)
            } else {
                LedgerEdit::Append(text)
            }
        })?;
        if !report.appended.is_empty() {
            info!(count = report.appended.len(), priority = %priority, "enqueued for remediation");
        }
        Ok(report)
    }
}

fn unrepresentable(path: &Path) -> Option<&'static str> {
    let text = path.to_string_lossy();
    if text.contains('|') {
        Some("path contains the column separator '|'")
    } else if text.contains('\n') || text.contains('\r') {
        Some("path contains a line break")
    } else if text.trim_start().starts_with('#') {
        Some("path would read back as a comment")
    } else {
        None
    }
}
