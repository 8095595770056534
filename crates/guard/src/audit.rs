//! Append-only conflict audit trail.
//!
//! One line per decision: `[timestamp] path | mode | reason | resolution`.
//! The mode is recorded as it was at decision time, since it may change
//! between cycles.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::GuardError;
use crate::policy::OperatingMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub subject_path: PathBuf,
    pub mode: OperatingMode,
    pub reason: String,
    pub resolution: String,
    pub timestamp: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn to_line(&self) -> String {
        format!(
            "[{}] {} | {} | {} | {}",
            self.timestamp.to_rfc3339(),
            self.subject_path.display(),
            self.mode,
            self.reason,
            self.resolution
        )
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, record: &ConflictRecord) -> Result<(), GuardError>;
}

#[derive(Debug, Clone)]
pub struct FileAuditLog {
    path: PathBuf,
}

impl FileAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        // A single write keeps concurrent appenders from interleaving lines.
        file.write_all(format!("{line}\n").as_bytes())
    }
}

impl AuditSink for FileAuditLog {
    fn append(&self, record: &ConflictRecord) -> Result<(), GuardError> {
        self.write_line(&record.to_line()).map_err(|source| GuardError::Audit {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<ConflictRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ConflictRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &ConflictRecord) -> Result<(), GuardError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}
