use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Result, bail};

use warden_config::AppConfig;
use warden_guard::{LockInfo, LockStatus, OperatingMode};
use warden_monitor::AgentContext;
use warden_rules::{ComplianceReport, RuleEngine, RuleSource};

pub(crate) fn touch(config: &AppConfig) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    ctx.activity().touch()?;
    println!(
        "activity signal refreshed; automation yields for {}s in production mode",
        ctx.activity().window().as_secs()
    );
    Ok(())
}

pub(crate) fn status(config: &AppConfig) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let cfg = ctx.config();
    let mode = ctx.source().operating_mode();
    let active = ctx.activity().is_user_active();
    let locks = ctx.locks().list()?;
    let stale = locks.iter().filter(|s| matches!(s, LockStatus::Stale(_))).count();
    let entries = ctx.ledger().entries()?;

    println!("warden status");
    println!("- project root: {}", cfg.project_root().display());
    println!("- mode: {mode}");
    match ctx.activity().last_activity() {
        Some(at) => println!(
            "- human: {} (last activity {})",
            if active { "active" } else { "idle" },
            at.to_rfc3339()
        ),
        None => println!("- human: idle (no activity recorded)"),
    }
    println!("- locks: {} live, {stale} stale", locks.len() - stale);
    println!("- ledger: {} pending ({})", entries.len(), ctx.ledger().location().display());
    println!("- rule files:");
    match ctx.source().rule_file_paths() {
        Ok(paths) if paths.is_empty() => println!("    (none; check {})", cfg.vars_file().display()),
        Ok(paths) => {
            for path in paths {
                println!("    {}", path.display());
            }
        }
        Err(err) => println!("    unavailable: {err:#}"),
    }
    Ok(())
}

pub(crate) fn mode_show(config: &AppConfig) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let mode = ctx.source().operating_mode();
    let raw = ctx
        .source()
        .load_vars()?
        .and_then(|vars| vars.get("PG_ProjectMod").map(str::to_string));
    match raw {
        Some(raw) => println!("{mode} ({raw})"),
        None => println!("{mode} (PG_ProjectMod not set in {})", ctx.source().vars_file().display()),
    }
    Ok(())
}

pub(crate) fn mode_set(config: &AppConfig, mode: OperatingMode) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let before = ctx.source().operating_mode();
    ctx.source().switch_mode(mode)?;
    println!("mode: {before} -> {}", ctx.source().operating_mode());
    Ok(())
}

pub(crate) fn locks_list(config: &AppConfig) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let locks = ctx.locks().list()?;
    if locks.is_empty() {
        println!("no locks held");
        return Ok(());
    }
    println!("── locks ({}) ───────────────────────────────────────", locks.len());
    for status in &locks {
        match status {
            LockStatus::Held(info) => println!("  live   {}", describe(info)),
            LockStatus::Stale(info) => println!("  stale  {}", describe(info)),
            LockStatus::Free => {}
        }
    }
    Ok(())
}

fn describe(info: &LockInfo) -> String {
    let subject = info
        .subject
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| info.id.to_string());
    let pid = info.owner_pid.map(|p| format!(" pid {p}")).unwrap_or_default();
    format!("{subject}  {}{pid}, age {}s", info.describe(), info.age.as_secs())
}

pub(crate) fn locks_release(config: &AppConfig, path: &Path, force: bool) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let subject = resolve_subject(&ctx, path);
    match ctx.locks().status(&subject)? {
        LockStatus::Free => println!("not locked: {}", subject.display()),
        LockStatus::Held(info) if !force => {
            bail!("{} is {}; pass --force to release it anyway", subject.display(), info.describe())
        }
        LockStatus::Held(_) | LockStatus::Stale(_) => {
            ctx.locks().force_release(&subject)?;
            println!("released: {}", subject.display());
        }
    }
    Ok(())
}

pub(crate) fn todo_list(config: &AppConfig) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let entries = ctx.ledger().entries()?;
    if entries.is_empty() {
        println!("ledger empty ({})", ctx.ledger().location().display());
        return Ok(());
    }
    for entry in &entries {
        println!("{:<4}  {:<19}  {}", entry.priority, entry.enqueued_at, entry.path.display());
    }
    println!("({} pending)", entries.len());
    Ok(())
}

pub(crate) async fn todo_add(config: &AppConfig, paths: &[PathBuf]) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let mode = ctx.source().operating_mode();
    let subjects: Vec<PathBuf> = paths.iter().map(|p| resolve_subject(&ctx, p)).collect();
    let report = ctx.ledger().enqueue(&subjects, ctx.resolver(), mode).await?;

    for path in &report.appended {
        println!("enqueued   {}", path.display());
    }
    for path in &report.duplicates {
        println!("duplicate  {}", path.display());
    }
    for (path, why) in &report.rejected {
        println!("rejected   {} ({why})", path.display());
    }
    Ok(())
}

pub(crate) async fn todo_process(config: &AppConfig) -> Result<()> {
    let ctx = AgentContext::from_config(config)?;
    let report = ctx.backlog().process().await?;
    for path in &report.fixed {
        println!("fixed      {}", path.display());
    }
    for (path, why) in &report.kept {
        println!("kept       {} ({why})", path.display());
    }
    println!(
        "{} completed, {} removed from the ledger, {} still pending",
        report.completed.len(),
        report.removed,
        report.kept.len()
    );
    Ok(())
}

/// Dry run: no lock, no write.  Exits non-zero when the file has issues so
/// the command composes with shell pipelines.
pub(crate) async fn check(config: &AppConfig, path: &Path) -> Result<ExitCode> {
    let report = inspect(config, path).await?;
    if report.compliant {
        println!("compliant: {}", report.path.display());
        return Ok(ExitCode::SUCCESS);
    }
    println!("non-compliant: {}", report.path.display());
    for issue in &report.issues {
        println!("  - {issue}");
    }
    Ok(ExitCode::FAILURE)
}

async fn inspect(config: &AppConfig, path: &Path) -> Result<ComplianceReport> {
    let ctx = AgentContext::from_config(config)?;
    let subject = resolve_subject(&ctx, path);
    if !subject.is_file() {
        bail!("not a file: {}", subject.display());
    }
    let rules = ctx.source().applicable_rules(&subject);
    ctx.engine().check(&subject, &rules).await
}

/// Paths typed on the command line are relative to the working directory;
/// locks and ledger entries are keyed by the canonical absolute path.
/// A path that does not exist falls back to the project root.
fn resolve_subject(ctx: &AgentContext, path: &Path) -> PathBuf {
    if let Ok(found) = fs::canonicalize(path) {
        return found;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        ctx.config().project_root().join(path)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn config_for(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.workspace.project_root = dir.display().to_string();
        config.telemetry.log_file = String::new();
        config.locks.acquire_timeout_ms = 50;
        config.locks.poll_interval_ms = 5;
        config
    }

    #[tokio::test]
    async fn mode_set_round_trips_through_vars_file() {
        let dir = TempDir::new().unwrap();
        let config = config_for(dir.path());
        mode_set(&config, OperatingMode::ProdPriority).unwrap();

        let ctx = AgentContext::from_config(&config).unwrap();
        assert_eq!(ctx.source().operating_mode(), OperatingMode::ProdPriority);
        let text = fs::read_to_string(ctx.source().vars_file()).unwrap();
        assert!(text.contains("PG_ProjectMod|project_var|\"proD,PG_ProdProjectRuleFileName\""));
    }

    #[tokio::test]
    async fn todo_add_then_process_clears_fixable_entry() {
        let dir = TempDir::new().unwrap();
        let config = config_for(dir.path());
        mode_set(&config, OperatingMode::DevPriority).unwrap();
        let file = dir.path().join("tool.py");
        fs::write(&file, "print('hi')\n").unwrap();

        todo_add(&config, std::slice::from_ref(&file)).await.unwrap();
        let ctx = AgentContext::from_config(&config).unwrap();
        let canonical = fs::canonicalize(&file).unwrap();
        assert!(ctx.ledger().contains(&canonical).unwrap());
        assert!(ctx.locks().list().unwrap().is_empty());

        todo_process(&config).await.unwrap();
        assert!(ctx.ledger().entries().unwrap().is_empty());
        assert!(fs::read_to_string(&file).unwrap().contains("coding: utf-8"));
    }

    #[tokio::test]
    async fn release_refuses_foreign_live_lock_without_force() {
        let dir = TempDir::new().unwrap();
        let config = config_for(dir.path());
        let file = dir.path().join("held.py");
        fs::write(&file, "x = 1\n").unwrap();
        let owner = AgentContext::from_config(&config).unwrap();
        let canonical = fs::canonicalize(&file).unwrap();
        assert!(owner.locks().try_acquire(&canonical).unwrap());

        assert!(locks_release(&config, &file, false).is_err());
        assert!(owner.locks().is_locked(&canonical).unwrap().0);
        locks_release(&config, &file, true).unwrap();
        assert!(!owner.locks().is_locked(&canonical).unwrap().0);
    }

    #[tokio::test]
    async fn check_reports_without_writing() {
        let dir = TempDir::new().unwrap();
        let config = config_for(dir.path());
        let file = dir.path().join("bare.py");
        fs::write(&file, "x = 1\n").unwrap();

        let report = inspect(&config, &file).await.unwrap();
        assert!(!report.compliant);
        assert_eq!(report.issues.len(), 2);
        assert_eq!(fs::read_to_string(&file).unwrap(), "x = 1\n");
        assert!(inspect(&config, &dir.path().join("missing.py")).await.is_err());
    }
}
