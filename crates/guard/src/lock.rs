//! Advisory, file-scoped locks backed by sentinel files.
//!
//! The sentinel's *existence* is the lock, its mtime is the staleness clock,
//! and its content is informational only (holder, pid, acquisition time).
//! Mutual exclusion comes entirely from the backend's atomic create-if-absent;
//! nothing here coordinates through process memory, so two managers in the
//! same process contend exactly like two processes would.
//!
//! Every acquisition writes a unique payload, which doubles as a compare
//! token: stale reclaim and release only remove the sentinel they inspected.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::GuardError;

const SENTINEL_EXT: &str = "lock";

// ── Lock identity ─────────────────────────────────────────────────────────────

/// Stable identifier of the lock protecting one subject path.
///
/// SHA-256 of the path with `\` normalised to `/`, so the identity survives
/// restarts and does not depend on the platform's separator convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(String);

impl LockId {
    pub fn for_path(path: &Path) -> Self {
        let normalized = path.to_string_lossy().replace('\\', "/");
        let mut h = Sha256::new();
        h.update(normalized.as_bytes());
        Self(format!("{:x}", h.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Backends ──────────────────────────────────────────────────────────────────

/// Storage for lock sentinels.  `try_create` is the single serialization
/// point and must be atomic across every process sharing the backend.
pub trait LockBackend: Send + Sync {
    /// Create the sentinel if absent.  `Ok(false)` means it already exists.
    fn try_create(&self, id: &LockId, contents: &str) -> io::Result<bool>;
    /// Sentinel contents and age, or `None` when absent.
    fn inspect(&self, id: &LockId) -> io::Result<Option<(String, Duration)>>;
    /// Remove the sentinel.  Removing an absent sentinel is not an error.
    fn remove(&self, id: &LockId) -> io::Result<()>;
    /// Remove the sentinel only if its contents still equal `expected`.
    /// `Ok(false)` means it was absent or has been replaced since.
    fn remove_if(&self, id: &LockId, expected: &str) -> io::Result<bool>;
    fn list(&self) -> io::Result<Vec<LockId>>;
    /// Where the sentinels live, for error reporting.
    fn location(&self) -> PathBuf;
}

/// One `<lock id>.lock` file per held lock inside a dedicated directory.
#[derive(Debug, Clone)]
pub struct FsLockBackend {
    dir: PathBuf,
}

impl FsLockBackend {
    /// Open the sentinel directory, creating it when missing.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn sentinel_path(&self, id: &LockId) -> PathBuf {
        self.dir.join(format!("{}.{SENTINEL_EXT}", id.as_str()))
    }

    fn tombstone_path(&self, id: &LockId) -> PathBuf {
        self.dir
            .join(format!("{}.stale.{}", id.as_str(), Uuid::new_v4().simple()))
    }

    /// Put a sentinel that was moved aside by mistake back in place, unless a
    /// new one has been created meanwhile.
    fn restore(&self, tombstone: &Path, sentinel: &Path) {
        match fs::hard_link(tombstone, sentinel) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                warn!(path = %sentinel.display(), "sentinel replaced while set aside; keeping the newer one");
            }
            Err(err) => {
                debug!(path = %sentinel.display(), error = %err, "hard link failed; renaming back");
                if let Err(err) = fs::rename(tombstone, sentinel) {
                    warn!(path = %sentinel.display(), error = %err, "could not restore lock sentinel");
                }
                return;
            }
        }
        if let Err(err) = fs::remove_file(tombstone) {
            debug!(path = %tombstone.display(), error = %err, "could not remove tombstone");
        }
    }

    fn create_new(&self, path: &Path, contents: &str) -> io::Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                // The lock is already held once the file exists; a failed
                // write only loses the informational payload.
                if let Err(err) = file.write_all(contents.as_bytes()) {
                    warn!(path = %path.display(), error = %err, "could not write lock sentinel payload");
                }
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl LockBackend for FsLockBackend {
    fn try_create(&self, id: &LockId, contents: &str) -> io::Result<bool> {
        let path = self.sentinel_path(id);
        match self.create_new(&path, contents) {
            // The directory may have been wiped underneath us; recreate once.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir)?;
                self.create_new(&path, contents)
            }
            other => other,
        }
    }

    fn inspect(&self, id: &LockId) -> io::Result<Option<(String, Duration)>> {
        let path = self.sentinel_path(id);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);
        let contents = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(Some((contents, age)))
    }

    fn remove(&self, id: &LockId) -> io::Result<()> {
        match fs::remove_file(self.sentinel_path(id)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// The sentinel is renamed to a unique tombstone first, so of several
    /// peers racing on the same sentinel exactly one gets to judge it.  A
    /// tombstone holding anything other than `expected` is put back.
    fn remove_if(&self, id: &LockId, expected: &str) -> io::Result<bool> {
        let sentinel = self.sentinel_path(id);
        let tombstone = self.tombstone_path(id);
        match fs::rename(&sentinel, &tombstone) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        }
        let found = match fs::read(&tombstone) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                self.restore(&tombstone, &sentinel);
                return Err(err);
            }
        };
        if found != expected {
            self.restore(&tombstone, &sentinel);
            return Ok(false);
        }
        if let Err(err) = fs::remove_file(&tombstone) {
            debug!(path = %tombstone.display(), error = %err, "could not remove tombstone");
        }
        Ok(true)
    }

    fn list(&self) -> io::Result<Vec<LockId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SENTINEL_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(LockId(stem.to_string()));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn location(&self) -> PathBuf {
        self.dir.clone()
    }
}

/// In-process backend for tests and embedders that do not need other
/// processes to observe the locks.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    sentinels: Mutex<HashMap<LockId, (String, SystemTime)>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Age an existing sentinel by `by`, as if it had been created earlier.
    pub fn backdate(&self, id: &LockId, by: Duration) {
        let mut map = self.sentinels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, created)) = map.get_mut(id) {
            *created = created.checked_sub(by).unwrap_or(SystemTime::UNIX_EPOCH);
        }
    }
}

impl LockBackend for MemoryLockBackend {
    fn try_create(&self, id: &LockId, contents: &str) -> io::Result<bool> {
        let mut map = self.sentinels.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(id) {
            return Ok(false);
        }
        map.insert(id.clone(), (contents.to_string(), SystemTime::now()));
        Ok(true)
    }

    fn inspect(&self, id: &LockId) -> io::Result<Option<(String, Duration)>> {
        let map = self.sentinels.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(id).map(|(contents, created)| {
            let age = SystemTime::now().duration_since(*created).unwrap_or(Duration::ZERO);
            (contents.clone(), age)
        }))
    }

    fn remove(&self, id: &LockId) -> io::Result<()> {
        self.sentinels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    fn remove_if(&self, id: &LockId, expected: &str) -> io::Result<bool> {
        let mut map = self.sentinels.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(id).is_some_and(|(contents, _)| contents == expected) {
            map.remove(id);
            return Ok(true);
        }
        Ok(false)
    }

    fn list(&self) -> io::Result<Vec<LockId>> {
        let map = self.sentinels.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<LockId> = map.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}

// ── Sentinel payload ──────────────────────────────────────────────────────────

/// Parsed view of a sentinel.  Fields other than `id` and `age` are best
/// effort: a sentinel written by another tool may carry none of them.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub id: LockId,
    pub subject: Option<PathBuf>,
    pub holder: Option<String>,
    pub owner_pid: Option<u32>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub age: Duration,
    /// True when the sentinel was written by the inspecting manager.
    pub ours: bool,
}

impl LockInfo {
    fn parse(id: LockId, contents: &str, age: Duration, own_holder: &str) -> Self {
        let mut info = Self {
            id,
            subject: None,
            holder: None,
            owner_pid: None,
            acquired_at: None,
            age,
            ours: false,
        };
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "holder" => info.holder = Some(value.to_string()),
                "pid" => info.owner_pid = value.parse().ok(),
                "acquired_at" => {
                    info.acquired_at = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
                "subject" => info.subject = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        info.ours = info.holder.as_deref() == Some(own_holder);
        info
    }

    /// One-line human description used in audit reasons and CLI output.
    pub fn describe(&self) -> String {
        let holder = self.holder.as_deref().unwrap_or("unknown holder");
        match self.acquired_at {
            Some(at) => format!("held by {holder} since {}", at.to_rfc3339()),
            None => format!("held by {holder} for {}s", self.age.as_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LockStatus {
    Free,
    Held(LockInfo),
    /// Present but older than the TTL: the next acquirer will reclaim it.
    Stale(LockInfo),
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
    poll_interval: Duration,
    holder: String,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, ttl: Duration) -> Self {
        let instance = Uuid::new_v4().simple().to_string();
        Self {
            backend,
            ttl,
            poll_interval: Duration::from_millis(100),
            holder: format!("{}/{}", std::process::id(), &instance[..8]),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// `<pid>/<instance>` written into every sentinel this manager creates.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire the lock for `path`, polling until `timeout` elapses.
    ///
    /// Never blocks past the timeout; `Ok(false)` is the normal contention
    /// outcome.  Locks are not reentrant: a second acquire by the same
    /// manager contends with the first.
    pub async fn acquire(&self, path: &Path, timeout: Duration) -> Result<bool, GuardError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.try_acquire(path)? {
                return Ok(true);
            }
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => {
                    info!(path = %path.display(), timeout_ms = saturating_millis(timeout), "lock contended; giving up");
                    return Ok(false);
                }
                Some(deadline) => deadline - now,
                None => self.poll_interval,
            };
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// One acquisition attempt, reclaiming the sentinel first when stale.
    pub fn try_acquire(&self, path: &Path) -> Result<bool, GuardError> {
        let id = LockId::for_path(path);
        let contents = self.sentinel_contents(path);

        if self.backend.try_create(&id, &contents).map_err(|e| self.backend_err(e))? {
            debug!(path = %path.display(), lock = %id, "lock acquired");
            return Ok(true);
        }

        match self.backend.inspect(&id).map_err(|e| self.backend_err(e))? {
            // Released between our create and inspect; one more try.
            None => self.backend.try_create(&id, &contents).map_err(|e| self.backend_err(e)),
            Some((existing, age)) if age > self.ttl => {
                let info = LockInfo::parse(id.clone(), &existing, age, &self.holder);
                warn!(
                    path = %path.display(),
                    lock = %id,
                    age_secs = age.as_secs(),
                    holder = info.holder.as_deref().unwrap_or("unknown"),
                    "removing stale lock sentinel"
                );
                if !self.backend.remove_if(&id, &existing).map_err(|e| self.backend_err(e))? {
                    debug!(path = %path.display(), lock = %id, "stale sentinel already reclaimed by a peer");
                    return Ok(false);
                }
                self.backend.try_create(&id, &contents).map_err(|e| self.backend_err(e))
            }
            Some(_) => Ok(false),
        }
    }

    /// Release a lock this manager holds.  Absent sentinels and sentinels
    /// owned by someone else are left alone.
    pub fn release(&self, path: &Path) -> Result<(), GuardError> {
        let id = LockId::for_path(path);
        let Some((contents, age)) = self.backend.inspect(&id).map_err(|e| self.backend_err(e))? else {
            return Ok(());
        };
        match LockInfo::parse(id.clone(), &contents, age, &self.holder) {
            info if info.ours => {
                if self.backend.remove_if(&id, &contents).map_err(|e| self.backend_err(e))? {
                    debug!(path = %path.display(), lock = %id, "lock released");
                } else {
                    warn!(path = %path.display(), lock = %id, "lock changed hands before release; left in place");
                }
                Ok(())
            }
            info => {
                warn!(path = %path.display(), lock = %id, owner = %info.describe(), "not releasing a lock held by another owner");
                Ok(())
            }
        }
    }

    /// Remove the sentinel for `path` whoever holds it.  Returns whether one
    /// was present.
    pub fn force_release(&self, path: &Path) -> Result<bool, GuardError> {
        let id = LockId::for_path(path);
        let present = self.inspect(&id)?.is_some();
        self.backend.remove(&id).map_err(|e| self.backend_err(e))?;
        if present {
            warn!(path = %path.display(), lock = %id, "lock force-released");
        }
        Ok(present)
    }

    pub fn status(&self, path: &Path) -> Result<LockStatus, GuardError> {
        let id = LockId::for_path(path);
        Ok(match self.inspect(&id)? {
            None => LockStatus::Free,
            Some(info) if info.age > self.ttl => LockStatus::Stale(info),
            Some(info) => LockStatus::Held(info),
        })
    }

    /// `(locked, owner)` for a live lock.  Stale sentinels count as unlocked.
    pub fn is_locked(&self, path: &Path) -> Result<(bool, Option<LockInfo>), GuardError> {
        Ok(match self.status(path)? {
            LockStatus::Held(info) => (true, Some(info)),
            LockStatus::Free | LockStatus::Stale(_) => (false, None),
        })
    }

    pub fn list(&self) -> Result<Vec<LockStatus>, GuardError> {
        let ids = self.backend.list().map_err(|e| self.backend_err(e))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.inspect(&id)? {
                Some(info) if info.age > self.ttl => out.push(LockStatus::Stale(info)),
                Some(info) => out.push(LockStatus::Held(info)),
                None => {}
            }
        }
        Ok(out)
    }

    fn inspect(&self, id: &LockId) -> Result<Option<LockInfo>, GuardError> {
        let found = self.backend.inspect(id).map_err(|e| self.backend_err(e))?;
        Ok(found.map(|(contents, age)| LockInfo::parse(id.clone(), &contents, age, &self.holder)))
    }

    fn sentinel_contents(&self, path: &Path) -> String {
        format!(
            "holder={}\npid={}\nacquired_at={}\nsubject={}\n",
            self.holder,
            std::process::id(),
            Utc::now().to_rfc3339(),
            path.display()
        )
    }

    fn backend_err(&self, source: io::Error) -> GuardError {
        GuardError::Backend {
            path: self.backend.location(),
            source,
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
