use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use warden_rules::RuleSource;

use crate::fingerprint::{FingerprintStore, Observation, hash_file};

const RULES_CACHE: &str = "rules.json";
const PROJECT_CACHE: &str = "project.json";

/// What counts as a project file.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    /// Lower-case, without the dot.
    pub extensions: Vec<String>,
    /// Directory names pruned at any depth.
    pub excluded_dirs: Vec<String>,
    /// Relative to `root`.
    pub exclude: GlobSet,
    /// Exact paths never scanned, e.g. the ledger the agent itself writes.
    pub ignored: Vec<PathBuf>,
}

impl ScanOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: Vec::new(),
            excluded_dirs: Vec::new(),
            exclude: GlobSet::empty(),
            ignored: Vec::new(),
        }
    }

    pub fn with_extensions<S: AsRef<str>>(mut self, extensions: &[S]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_excluded_dirs<S: AsRef<str>>(mut self, dirs: &[S]) -> Self {
        self.excluded_dirs = dirs.iter().map(|d| d.as_ref().to_string()).collect();
        self
    }

    pub fn with_exclude_globs<S: AsRef<str>>(mut self, globs: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for g in globs {
            let g = g.as_ref();
            builder.add(Glob::new(g).with_context(|| format!("invalid glob: {g:?}"))?);
        }
        self.exclude = builder.build()?;
        Ok(self)
    }

    pub fn ignore(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignored.push(path.into());
        self
    }

    fn wants(&self, path: &Path) -> bool {
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
        if !ext_ok || self.ignored.iter().any(|p| p == path) {
            return false;
        }
        match path.strip_prefix(&self.root) {
            Ok(relative) => !self.exclude.is_match(relative),
            Err(_) => true,
        }
    }
}

/// Result of one detection pass.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub rule_changes: BTreeSet<PathBuf>,
    pub project_changes: BTreeSet<PathBuf>,
    /// A rule file changed, so `candidates` is the whole project population.
    pub escalated: bool,
    pub candidates: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Diffs both file populations against their fingerprint stores.
///
/// Every observed file is committed, changed or not, and first sightings
/// are baselined rather than reported.  Unreadable files count as
/// unchanged and keep their previous fingerprint.
pub struct ChangeDetector {
    options: ScanOptions,
    rules: FingerprintStore,
    project: FingerprintStore,
}

impl ChangeDetector {
    pub fn new(options: ScanOptions) -> Self {
        Self::with_stores(options, FingerprintStore::new(), FingerprintStore::new())
    }

    pub fn with_stores(options: ScanOptions, rules: FingerprintStore, project: FingerprintStore) -> Self {
        Self {
            options,
            rules,
            project,
        }
    }

    /// Restore both stores saved by [`Self::save_stores`].
    pub fn load_stores(options: ScanOptions, dir: &Path) -> Self {
        Self::with_stores(
            options,
            FingerprintStore::load(&dir.join(RULES_CACHE)),
            FingerprintStore::load(&dir.join(PROJECT_CACHE)),
        )
    }

    pub fn save_stores(&self, dir: &Path) -> Result<()> {
        self.rules.save(&dir.join(RULES_CACHE))?;
        self.project.save(&dir.join(PROJECT_CACHE))
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn project_store(&self) -> &FingerprintStore {
        &self.project
    }

    pub fn rule_store(&self) -> &FingerprintStore {
        &self.rules
    }

    /// Changed rule files.  Failing to enumerate them is an infrastructure
    /// error.
    pub fn scan_rule_sources(&mut self, source: &dyn RuleSource) -> Result<BTreeSet<PathBuf>> {
        let paths = source.rule_file_paths().context("failed to enumerate rule files")?;
        Ok(observe(&mut self.rules, &paths))
    }

    pub fn scan_project_files(&mut self) -> Result<BTreeSet<PathBuf>> {
        let paths = self.enumerate_project_files()?;
        Ok(observe(&mut self.project, &paths))
    }

    /// Every project file under the root, sorted.
    pub fn enumerate_project_files(&self) -> Result<Vec<PathBuf>> {
        let root = &self.options.root;
        if !root.is_dir() {
            bail!("project root is not a directory: {}", root.display());
        }
        let excluded = &self.options.excluded_dirs;
        let mut files = Vec::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !excluded.iter().any(|d| *d == name)
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry during project scan");
                    continue;
                }
            };
            if entry.file_type().is_file() && self.options.wants(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Rule files first, then project files; a rule change escalates the
    /// candidate set to the full project population.
    pub fn detect(&mut self, source: &dyn RuleSource) -> Result<ChangeSet> {
        let rule_changes = self.scan_rule_sources(source)?;
        let population = self.enumerate_project_files()?;
        let project_changes = observe(&mut self.project, &population);

        let escalated = !rule_changes.is_empty();
        let candidates = if escalated {
            info!(rule_files = rule_changes.len(), files = population.len(), "rule change; rechecking every project file");
            population
        } else {
            project_changes.iter().cloned().collect()
        };
        Ok(ChangeSet {
            rule_changes,
            project_changes,
            escalated,
            candidates,
        })
    }

    /// Re-record `path` after the agent rewrote it, so its own write is not
    /// reported as a change next cycle.
    pub fn rebaseline(&mut self, path: &Path) {
        match hash_file(path) {
            Ok(digest) => self.project.record(path, digest),
            Err(err) => debug!(path = %path.display(), error = %err, "could not re-baseline"),
        }
    }
}

fn observe(store: &mut FingerprintStore, paths: &[PathBuf]) -> BTreeSet<PathBuf> {
    let mut changed = BTreeSet::new();
    for path in paths {
        let digest = match hash_file(path) {
            Ok(digest) => digest,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not hash file; treating as unchanged");
                continue;
            }
        };
        if store.has_changed(path, digest) == Observation::Changed {
            changed.insert(path.clone());
        }
        store.record(path, digest);
    }
    changed
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use warden_guard::OperatingMode;
    use warden_rules::{RuleSet, StaticRuleSource};

    use super::*;

    fn options(root: &Path) -> ScanOptions {
        ScanOptions::new(root)
            .with_extensions(&["py", "txt", "md"])
            .with_excluded_dirs(&[".git", "node_modules", "__pycache__"])
    }

    fn write(root: &Path, rel: &str, body: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    fn source() -> StaticRuleSource {
        StaticRuleSource::new(OperatingMode::DevPriority, RuleSet::all())
    }

    #[test]
    fn enumeration_applies_allow_and_deny_lists() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "a.py", "");
        write(root, "docs/readme.md", "");
        write(root, "bin/tool.exe", "");
        write(root, ".git/config.txt", "");
        write(root, "web/node_modules/x/index.md", "");
        write(root, "vendor/lib.py", "");
        let ledger = write(root, "rules/todo.txt", "");

        let detector = ChangeDetector::new(
            options(root)
                .with_exclude_globs(&["vendor/**"])
                .unwrap()
                .ignore(&ledger),
        );
        let files = detector.enumerate_project_files().unwrap();
        assert_eq!(files, vec![root.join("a.py"), root.join("docs/readme.md")]);
    }

    #[test]
    fn first_scan_baselines_without_reporting() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.py", "x = 1\n");
        let mut detector = ChangeDetector::new(options(dir.path()));

        assert!(detector.scan_project_files().unwrap().is_empty());
        assert_eq!(detector.project_store().len(), 1);
        assert!(detector.scan_project_files().unwrap().is_empty());
    }

    #[test]
    fn modified_project_file_is_the_only_candidate() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "a.py", "x = 1\n");
        write(dir.path(), "b.py", "y = 1\n");
        let mut detector = ChangeDetector::new(options(dir.path()));
        let src = source();
        assert!(detector.detect(&src).unwrap().is_empty());

        fs::write(&a, "x = 2\n").unwrap();
        let changes = detector.detect(&src).unwrap();
        assert!(!changes.escalated);
        assert_eq!(changes.candidates, vec![a]);
    }

    #[test]
    fn rule_change_escalates_to_every_project_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let rules = write(root, "rules/dev.mdc", "rule v1");
        write(root, "a.py", "");
        write(root, "pkg/b.py", "");
        write(root, "notes.md", "");
        let src = source();
        src.set_rule_files(vec![rules.clone()]);
        let mut detector = ChangeDetector::new(options(root));
        assert!(detector.detect(&src).unwrap().is_empty());

        fs::write(&rules, "rule v2").unwrap();
        let changes = detector.detect(&src).unwrap();
        assert!(changes.escalated);
        assert!(changes.project_changes.is_empty());
        assert_eq!(changes.rule_changes.len(), 1);
        assert_eq!(
            changes.candidates,
            vec![root.join("a.py"), root.join("notes.md"), root.join("pkg/b.py")]
        );
    }

    #[test]
    fn vanished_file_is_not_a_change() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "a.py", "x\n");
        let src = source();
        src.set_rule_files(vec![dir.path().join("rules/gone.md")]);
        let mut detector = ChangeDetector::new(options(dir.path()));
        detector.detect(&src).unwrap();

        fs::remove_file(&a).unwrap();
        let changes = detector.detect(&src).unwrap();
        assert!(changes.is_empty());
        assert!(detector.project_store().get(&a).is_some());
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let detector = ChangeDetector::new(options(&dir.path().join("nope")));
        assert!(detector.enumerate_project_files().is_err());
    }

    #[test]
    fn stores_persist_between_detectors() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("project");
        let a = write(&root, "a.py", "v1\n");
        let cache = dir.path().join("state/fingerprints");
        let src = source();

        let mut first = ChangeDetector::new(options(&root));
        first.detect(&src).unwrap();
        first.save_stores(&cache).unwrap();

        fs::write(&a, "v2\n").unwrap();
        let mut second = ChangeDetector::load_stores(options(&root), &cache);
        assert_eq!(second.detect(&src).unwrap().candidates, vec![a]);
    }

    #[test]
    fn rebaseline_hides_own_write() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "a.py", "v1\n");
        let src = source();
        let mut detector = ChangeDetector::new(options(dir.path()));
        detector.detect(&src).unwrap();

        fs::write(&a, "fixed\n").unwrap();
        detector.rebaseline(&a);
        assert!(detector.detect(&src).unwrap().is_empty());
    }
}
