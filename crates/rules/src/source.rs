use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};
use warden_guard::OperatingMode;

use crate::engine::RuleSet;

/// Where the operating mode and the monitored rule files come from.
///
/// Implementations are re-read on every call; the scheduler asks once per
/// cycle and never caches across cycles.
pub trait RuleSource: Send + Sync {
    /// Current mode.  Never fails: anything unreadable is `Unknown`.
    fn operating_mode(&self) -> OperatingMode;

    /// Rule files whose changes invalidate every compliance verdict.
    fn rule_file_paths(&self) -> Result<Vec<PathBuf>>;

    fn applicable_rules(&self, path: &Path) -> RuleSet;
}

// ── project_vars.txt ──────────────────────────────────────────────────────────

const MODE_VAR: &str = "PG_ProjectMod";
const SUB_RULES_VAR: &str = "PG_sub_rulesfiles";
const DEV_RULE_VAR: &str = "PG_RuleFileName";
const PROD_RULE_VAR: &str = "PG_ProdProjectRuleFileName";

/// Parsed `name|type|value` variable file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectVars {
    values: HashMap<String, String>,
}

impl ProjectVars {
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, '|');
            let (Some(name), Some(_kind), Some(value)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            values.insert(name.trim().to_string(), unquote(value.trim()).to_string());
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `(mode token, rule variable name)` from `PG_ProjectMod`.
    pub fn project_mod(&self) -> Option<(&str, Option<&str>)> {
        let raw = self.get(MODE_VAR)?;
        let mut parts = raw.splitn(2, ',');
        let mode = parts.next()?.trim();
        let rule_var = parts.next().map(str::trim).filter(|v| !v.is_empty());
        Some((mode, rule_var))
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Strip `./`, `.\`, `/` and `\` prefixes so the value joins onto the root.
fn strip_relative_prefix(mut value: &str) -> &str {
    loop {
        let next = value
            .strip_prefix("./")
            .or_else(|| value.strip_prefix(".\\"))
            .or_else(|| value.strip_prefix('/'))
            .or_else(|| value.strip_prefix('\\'));
        match next {
            Some(rest) => value = rest,
            None => return value,
        }
    }
}

/// The default rule source: `rules/project_vars.txt` plus the rule files it
/// names, resolved against the project root.
#[derive(Debug)]
pub struct ProjectVarsSource {
    project_root: PathBuf,
    vars_file: PathBuf,
    rules: RuleSet,
}

impl ProjectVarsSource {
    pub fn new(project_root: impl Into<PathBuf>, vars_file: impl Into<PathBuf>, rules: RuleSet) -> Self {
        Self {
            project_root: project_root.into(),
            vars_file: vars_file.into(),
            rules,
        }
    }

    pub fn vars_file(&self) -> &Path {
        &self.vars_file
    }

    /// `Ok(None)` when the file does not exist; any other read failure is an
    /// error.
    pub fn load_vars(&self) -> Result<Option<ProjectVars>> {
        match fs::read_to_string(&self.vars_file) {
            Ok(text) => Ok(Some(ProjectVars::parse(&text))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read {}", self.vars_file.display())),
        }
    }

    fn resolve(&self, value: &str) -> PathBuf {
        self.project_root.join(strip_relative_prefix(value.trim()))
    }

    /// Rewrite `PG_ProjectMod` to select `mode` and its rule file variable,
    /// appending the line when absent.  Other lines are kept verbatim.
    pub fn switch_mode(&self, mode: OperatingMode) -> Result<()> {
        let (token, rule_var) = match mode {
            OperatingMode::DevPriority => ("devP", DEV_RULE_VAR),
            OperatingMode::ProdPriority => ("proD", PROD_RULE_VAR),
            OperatingMode::Unknown => bail!("cannot switch to an unknown mode"),
        };
        let new_line = format!("{MODE_VAR}|project_var|\"{token},{rule_var}\"");

        let existing = match fs::read_to_string(&self.vars_file) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.vars_file.display()));
            }
        };

        let mut replaced = false;
        let mut lines: Vec<String> = existing
            .lines()
            .map(|line| {
                let is_mode_line = !replaced
                    && line
                        .trim_start()
                        .split('|')
                        .next()
                        .is_some_and(|name| name.trim() == MODE_VAR);
                if is_mode_line {
                    replaced = true;
                    new_line.clone()
                } else {
                    line.to_string()
                }
            })
            .collect();
        if !replaced {
            lines.push(new_line);
        }

        if let Some(parent) = self.vars_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.vars_file.with_extension("txt.tmp");
        fs::write(&tmp, format!("{}\n", lines.join("\n")))
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.vars_file)
            .with_context(|| format!("failed to replace {}", self.vars_file.display()))?;
        debug!(mode = %mode, file = %self.vars_file.display(), "project mode switched");
        Ok(())
    }

    fn secondary_rule_files(&self, vars: &ProjectVars, out: &mut Vec<PathBuf>) {
        let Some(list_value) = vars.get(SUB_RULES_VAR) else {
            return;
        };
        let list_path = self.resolve(list_value);
        let text = match fs::read_to_string(&list_path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %list_path.display(), error = %err, "secondary rule list unreadable");
                return;
            }
        };
        out.push(list_path);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cleaned = strip_relative_prefix(line);
            if cleaned.is_empty() || cleaned.contains("```") || cleaned.contains(['{', '}']) {
                continue;
            }
            let path = self.project_root.join(cleaned);
            if path.exists() {
                out.push(path);
            }
        }
    }
}

impl RuleSource for ProjectVarsSource {
    fn operating_mode(&self) -> OperatingMode {
        match self.load_vars() {
            Ok(Some(vars)) => vars
                .project_mod()
                .map(|(mode, _)| OperatingMode::parse(mode))
                .unwrap_or(OperatingMode::Unknown),
            Ok(None) => OperatingMode::Unknown,
            Err(err) => {
                warn!(error = %err, "could not read operating mode; assuming unknown");
                OperatingMode::Unknown
            }
        }
    }

    fn rule_file_paths(&self) -> Result<Vec<PathBuf>> {
        let Some(vars) = self.load_vars()? else {
            debug!(path = %self.vars_file.display(), "no project vars file; no rule files to monitor");
            return Ok(Vec::new());
        };

        let mut paths = Vec::new();
        if let Some((_, Some(rule_var))) = vars.project_mod() {
            match vars.get(rule_var) {
                Some(value) => {
                    let active = self.resolve(value);
                    if active.exists() {
                        paths.push(active);
                    } else {
                        debug!(path = %active.display(), "active rule file missing");
                    }
                }
                None => warn!(variable = rule_var, "rule file variable not defined"),
            }
        }
        self.secondary_rule_files(&vars, &mut paths);

        let mut seen = std::collections::HashSet::new();
        paths.retain(|p| seen.insert(p.clone()));
        Ok(paths)
    }

    fn applicable_rules(&self, _path: &Path) -> RuleSet {
        self.rules.clone()
    }
}

// ── In-memory source ──────────────────────────────────────────────────────────

/// Rule source with a settable mode and rule file list.
#[derive(Debug)]
pub struct StaticRuleSource {
    mode: Mutex<OperatingMode>,
    rule_files: Mutex<Vec<PathBuf>>,
    rules: RuleSet,
}

impl StaticRuleSource {
    pub fn new(mode: OperatingMode, rules: RuleSet) -> Self {
        Self {
            mode: Mutex::new(mode),
            rule_files: Mutex::new(Vec::new()),
            rules,
        }
    }

    pub fn set_mode(&self, mode: OperatingMode) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    pub fn set_rule_files(&self, files: Vec<PathBuf>) {
        *self.rule_files.lock().unwrap_or_else(|e| e.into_inner()) = files;
    }
}

impl RuleSource for StaticRuleSource {
    fn operating_mode(&self) -> OperatingMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rule_file_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self.rule_files.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn applicable_rules(&self, _path: &Path) -> RuleSet {
        self.rules.clone()
    }
}
