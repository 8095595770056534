use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::checks::{EncodingDeclaration, HeaderComment};

// ── Rule identity ─────────────────────────────────────────────────────────────

/// Stable identifier of a built-in compliance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleId {
    EncodingDeclaration,
    HeaderComment,
}

impl RuleId {
    pub const ALL: [RuleId; 2] = [RuleId::EncodingDeclaration, RuleId::HeaderComment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EncodingDeclaration => "encoding_declaration",
            Self::HeaderComment => "header_comment",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleId {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "encoding_declaration" => Ok(Self::EncodingDeclaration),
            "header_comment" => Ok(Self::HeaderComment),
            other => bail!("unknown rule id: {other}"),
        }
    }
}

/// Ordered, duplicate-free set of rules to apply to one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<RuleId>,
}

impl RuleSet {
    pub fn new(rules: impl IntoIterator<Item = RuleId>) -> Self {
        let mut set = Self::default();
        for rule in rules {
            if !set.rules.contains(&rule) {
                set.rules.push(rule);
            }
        }
        set
    }

    pub fn all() -> Self {
        Self::new(RuleId::ALL)
    }

    /// Parse configured rule names; an unknown name is a configuration error.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let ids = names
            .iter()
            .map(|n| n.as_ref().parse::<RuleId>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(ids))
    }

    pub fn iter(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.rules.iter().copied()
    }

    pub fn contains(&self, rule: RuleId) -> bool {
        self.rules.contains(&rule)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

// ── Check results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub rule: RuleId,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

/// What `apply_fix` should do.  Opaque to the remediation core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixPlan {
    steps: Vec<RuleId>,
}

impl FixPlan {
    pub fn steps(&self) -> &[RuleId] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ComplianceReport {
    pub path: PathBuf,
    pub compliant: bool,
    pub issues: Vec<Issue>,
    pub plan: FixPlan,
}

// ── Seams ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn check(&self, path: &Path, rules: &RuleSet) -> Result<ComplianceReport>;

    /// Apply `plan` to the file.  `Ok(true)` iff the file is compliant
    /// afterwards.  Callers hold the file's lock.
    async fn apply_fix(&self, path: &Path, plan: &FixPlan) -> Result<bool>;
}

/// One rule's semantics.  Implementations are pure over the file content.
pub trait RuleCheck: Send + Sync {
    fn id(&self) -> RuleId;

    fn applies_to(&self, path: &Path) -> bool;

    /// `Some(message)` when `content` violates the rule.
    fn inspect(&self, path: &Path, content: &str) -> Option<String>;

    /// Content with the violation repaired.
    fn fix(&self, path: &Path, content: &str) -> String;
}

// ── Built-in engine ───────────────────────────────────────────────────────────

pub struct BuiltinEngine {
    checks: BTreeMap<RuleId, Box<dyn RuleCheck>>,
}

impl Default for BuiltinEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinEngine {
    /// Engine with every built-in check registered.
    pub fn new() -> Self {
        let mut engine = Self::empty();
        engine.register(Box::new(EncodingDeclaration));
        engine.register(Box::new(HeaderComment::default()));
        engine
    }

    pub fn empty() -> Self {
        Self {
            checks: BTreeMap::new(),
        }
    }

    /// Add or replace the check for its rule id.
    pub fn register(&mut self, check: Box<dyn RuleCheck>) {
        self.checks.insert(check.id(), check);
    }

    fn issues(&self, path: &Path, content: &str, rules: impl Iterator<Item = RuleId>) -> Vec<Issue> {
        rules
            .filter_map(|rule| self.checks.get(&rule))
            .filter(|check| check.applies_to(path))
            .filter_map(|check| {
                check.inspect(path, content).map(|message| Issue {
                    rule: check.id(),
                    message,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RuleEngine for BuiltinEngine {
    async fn check(&self, path: &Path, rules: &RuleSet) -> Result<ComplianceReport> {
        let content = read_lossy(path).await?;
        let issues = self.issues(path, &content, rules.iter());
        let plan = FixPlan {
            steps: issues.iter().map(|i| i.rule).collect(),
        };
        Ok(ComplianceReport {
            path: path.to_path_buf(),
            compliant: issues.is_empty(),
            issues,
            plan,
        })
    }

    async fn apply_fix(&self, path: &Path, plan: &FixPlan) -> Result<bool> {
        let bytes = read_bytes(path).await?;
        let Ok(original) = String::from_utf8(bytes) else {
            warn!(path = %path.display(), "not valid UTF-8; leaving file untouched");
            return Ok(false);
        };
        let mut content = original.clone();
        for rule in plan.steps() {
            let Some(check) = self.checks.get(rule) else {
                continue;
            };
            if check.applies_to(path) && check.inspect(path, &content).is_some() {
                content = check.fix(path, &content);
            }
        }

        if content != original {
            write_atomic(path, &content).await?;
            debug!(path = %path.display(), steps = plan.steps().len(), "fix written");
        }

        Ok(self.issues(path, &content, plan.steps().iter().copied()).is_empty())
    }
}

async fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

/// Good enough for reporting; never used as the basis for a rewrite.
async fn read_lossy(path: &Path) -> Result<String> {
    Ok(String::from_utf8_lossy(&read_bytes(path).await?).into_owned())
}

/// Replace `path` with `content` through a `.tmp` sibling and a rename, so a
/// reader never sees a half-written file.  Permissions are carried over.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .with_context(|| format!("not a file path: {}", path.display()))?;
    let tmp_path = path.with_file_name(format!(".{filename}.tmp"));
    let permissions = tokio::fs::metadata(path).await.ok().map(|m| m.permissions());

    let write_result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        if let Some(permissions) = permissions {
            tokio::fs::set_permissions(&tmp_path, permissions).await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(err) = write_result {
        discard_tmp(&tmp_path).await;
        return Err(err.context(format!("failed to write {}", tmp_path.display())));
    }
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        discard_tmp(&tmp_path).await;
        return Err(anyhow::Error::new(err).context(format!("failed to replace {}", path.display())));
    }
    Ok(())
}

async fn discard_tmp(tmp_path: &Path) {
    if let Err(err) = tokio::fs::remove_file(tmp_path).await {
        debug!(path = %tmp_path.display(), error = %err, "could not remove temp file");
    }
}
