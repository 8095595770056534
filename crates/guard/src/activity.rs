//! Human-activity heuristic.
//!
//! This is a proxy, not an activity monitor: the human side (an editor hook,
//! a shell alias, `warden touch`) refreshes a signal and the agent only asks
//! whether that happened within the window.  Reads are advisory and never
//! block; any failure to read the signal means "not active", which lets
//! automation proceed.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

pub trait ActivitySignalBackend: Send + Sync {
    /// When the signal was last refreshed.
    fn last_touched(&self) -> io::Result<SystemTime>;
    fn touch(&self) -> io::Result<()>;
}

/// Signal file whose mtime is the only datum; its content is ignored.
#[derive(Debug, Clone)]
pub struct FsActivitySignal {
    path: PathBuf,
}

impl FsActivitySignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ActivitySignalBackend for FsActivitySignal {
    fn last_touched(&self) -> io::Result<SystemTime> {
        fs::metadata(&self.path)?.modified()
    }

    fn touch(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("Last activity: {}\n", Utc::now().to_rfc3339()))
    }
}

/// In-memory signal with a settable timestamp.
#[derive(Debug, Default)]
pub struct ManualActivitySignal {
    last: Mutex<Option<SystemTime>>,
}

impl ManualActivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, at: Option<SystemTime>) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    /// Mark the signal as touched `ago` before now.
    pub fn touched_ago(&self, ago: Duration) {
        self.set(SystemTime::now().checked_sub(ago));
    }
}

impl ActivitySignalBackend for ManualActivitySignal {
    fn last_touched(&self) -> io::Result<SystemTime> {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "signal never touched"))
    }

    fn touch(&self) -> io::Result<()> {
        self.set(Some(SystemTime::now()));
        Ok(())
    }
}

pub struct ActivityTracker {
    backend: Arc<dyn ActivitySignalBackend>,
    window: Duration,
}

impl ActivityTracker {
    pub fn new(backend: Arc<dyn ActivitySignalBackend>, window: Duration) -> Self {
        Self { backend, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Active iff the signal is younger than the window.  A timestamp in the
    /// future (clock skew) counts as just touched.
    pub fn is_user_active(&self) -> bool {
        match self.backend.last_touched() {
            Ok(at) => {
                let age = SystemTime::now().duration_since(at).unwrap_or(Duration::ZERO);
                age < self.window
            }
            Err(err) => {
                debug!(error = %err, "activity signal unreadable; treating human as inactive");
                false
            }
        }
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.backend.last_touched().ok().map(DateTime::<Utc>::from)
    }

    pub fn touch(&self) -> Result<()> {
        self.backend.touch()?;
        Ok(())
    }
}
