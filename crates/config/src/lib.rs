use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

// ── Workspace layout ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root of the project being kept compliant.  Every other relative path in
    /// this file resolves against it.  Overridden by `WARDEN_PROJECT_ROOT`.
    pub project_root: String,
    /// Private state directory (fingerprint caches live under it).
    pub state_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            project_root: ".".to_string(),
            state_dir: ".warden".to_string(),
        }
    }
}

// ── Project file scanning ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Extension allow-list, without the leading dot.
    pub extensions: Vec<String>,
    /// Directory names that are never descended into, at any depth.
    pub excluded_dirs: Vec<String>,
    /// Extra glob patterns (relative to the project root) excluded from the
    /// project population, e.g. `"vendor/**"`.
    pub exclude_globs: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: ["py", "txt", "md", "json", "yaml", "yml", "ps1", "sh"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_dirs: [".git", "__pycache__", ".idea", "node_modules", ".warden", "target"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude_globs: vec![],
        }
    }
}

// ── Locks ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Directory holding one sentinel file per locked path.
    pub dir: String,
    /// Sentinels older than this are presumed abandoned and reclaimed.
    pub ttl_secs: u64,
    /// Upper bound on how long a single `acquire` keeps polling.
    pub acquire_timeout_ms: u64,
    /// Sleep between acquisition attempts.
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: ".warden/locks".to_string(),
            ttl_secs: 300,
            acquire_timeout_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

// ── Human activity signal ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// File whose mtime is the "human last touched the workspace" signal.
    pub signal_file: String,
    /// The human counts as active while the signal is younger than this.
    pub window_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            signal_file: ".warden/user_activity".to_string(),
            window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Save fingerprint caches between runs so `--once` invocations see the
    /// changes made since the previous invocation.
    pub persist_fingerprints: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            persist_fingerprints: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: "rules/todo_remediation.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: "logs/path_conflicts.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// `name|type|value` variables file describing the active rule corpus.
    pub vars_file: String,
    /// Built-in rule checks to run.  An unknown identifier fails startup.
    pub enabled: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            vars_file: "rules/project_vars.txt".to_string(),
            enabled: vec![
                "encoding_declaration".to_string(),
                "header_comment".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Optional log file written alongside stderr.  Empty disables it.
    pub log_file: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: "logs/warden.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub workspace: WorkspaceConfig,
    pub scan: ScanConfig,
    pub locks: LockConfig,
    pub activity: ActivityConfig,
    pub scheduler: SchedulerConfig,
    pub ledger: LedgerConfig,
    pub audit: AuditConfig,
    pub rules: RulesConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply `WARDEN_*` overrides from `lookup`.  Empty and unparseable values
    /// are ignored so a stray export never disables the agent.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("WARDEN_PROJECT_ROOT").filter(|v| !v.is_empty()) {
            self.workspace.project_root = root;
        }
        if let Some(secs) = lookup("WARDEN_INTERVAL_SECS").and_then(|v| v.trim().parse::<u64>().ok()) {
            if secs > 0 {
                self.scheduler.interval_secs = secs;
            }
        }
        if let Some(level) = lookup("WARDEN_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.telemetry.log_level = level;
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.locks.ttl_secs == 0 {
            bail!("locks.ttl_secs must be greater than zero");
        }
        if self.activity.window_secs == 0 {
            bail!("activity.window_secs must be greater than zero");
        }
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be greater than zero");
        }
        if self.scan.extensions.is_empty() {
            bail!("scan.extensions must list at least one extension");
        }
        Ok(())
    }

    pub fn project_root(&self) -> PathBuf {
        PathBuf::from(&self.workspace.project_root)
    }

    /// Resolve a configured path against the project root.  Absolute paths
    /// are returned unchanged.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.project_root().join(candidate)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.workspace.state_dir)
    }

    pub fn fingerprint_dir(&self) -> PathBuf {
        self.state_dir().join("fingerprints")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.resolve(&self.locks.dir)
    }

    pub fn activity_file(&self) -> PathBuf {
        self.resolve(&self.activity.signal_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.resolve(&self.ledger.path)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.resolve(&self.audit.path)
    }

    pub fn vars_file(&self) -> PathBuf {
        self.resolve(&self.rules.vars_file)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        let trimmed = self.telemetry.log_file.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(self.resolve(trimmed))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
