mod commands;
mod daemon;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use warden_config::AppConfig;
use warden_guard::OperatingMode;

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    version,
    about = "Keeps a project compliant with its own rules without fighting its developers"
)]
struct Cli {
    /// Configuration file.  Missing means defaults.
    #[arg(long, global = true, default_value = "warden.toml")]
    config: PathBuf,
    /// Force debug logging regardless of RUST_LOG and the config.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the remediation loop until Ctrl-C, or a single cycle with --once.
    Run {
        #[arg(long)]
        once: bool,
        /// Seconds between cycles (overrides scheduler.interval_secs).
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// Mark the human as active right now.
    Touch,
    /// Mode, activity, locks and backlog at a glance.
    Status,
    Mode {
        #[command(subcommand)]
        command: ModeCommands,
    },
    Locks {
        #[command(subcommand)]
        command: LockCommands,
    },
    Todo {
        #[command(subcommand)]
        command: TodoCommands,
    },
    /// Report compliance for one file without changing it.
    Check {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum ModeCommands {
    /// Print the operating mode the rules corpus currently declares.
    Show,
    /// Rewrite PG_ProjectMod in the project variables file.
    Set {
        #[arg(value_enum)]
        mode: CliMode,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Dev,
    Prod,
}

impl From<CliMode> for OperatingMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Dev => OperatingMode::DevPriority,
            CliMode::Prod => OperatingMode::ProdPriority,
        }
    }
}

#[derive(Debug, Subcommand)]
enum LockCommands {
    /// List live and stale sentinels.
    List,
    /// Release a lock held by this workspace, or any lock with --force.
    Release {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum TodoCommands {
    /// Print the remediation ledger.
    List,
    /// Enqueue files, subject to conflict resolution.
    Add {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Work through the ledger now.
    Process,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load {}: {err:#}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if let Commands::Run {
        interval: Some(secs),
        ..
    } = &cli.command
    {
        config.scheduler.interval_secs = *secs;
    }

    let _log_guard = match init_tracing(&config, cli.debug) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialise logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match dispatch(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Commands, config: AppConfig) -> Result<ExitCode> {
    match command {
        Commands::Run { once, .. } => return daemon::run(config, once).await,
        Commands::Check { path } => return commands::check(&config, &path).await,
        Commands::Touch => commands::touch(&config)?,
        Commands::Status => commands::status(&config)?,
        Commands::Mode { command } => match command {
            ModeCommands::Show => commands::mode_show(&config)?,
            ModeCommands::Set { mode } => commands::mode_set(&config, mode.into())?,
        },
        Commands::Locks { command } => match command {
            LockCommands::List => commands::locks_list(&config)?,
            LockCommands::Release { path, force } => commands::locks_release(&config, &path, force)?,
        },
        Commands::Todo { command } => match command {
            TodoCommands::List => commands::todo_list(&config)?,
            TodoCommands::Add { paths } => commands::todo_add(&config, &paths).await?,
            TodoCommands::Process => commands::todo_process(&config).await?,
        },
    }
    Ok(ExitCode::SUCCESS)
}

/// stderr always; the configured log file as a second, non-blocking sink.
/// The returned guard flushes the file writer and must outlive every event.
fn init_tracing(config: &AppConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.telemetry.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let (file_layer, guard) = match config.log_file() {
        Some(path) => {
            let (dir, name) = split_log_path(&path);
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

fn split_log_path(path: &Path) -> (PathBuf, std::ffi::OsString) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "warden.log".into());
    (dir, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["warden", "run", "--once", "--debug", "--config", "x.toml"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(
            cli.command,
            Commands::Run {
                once: true,
                interval: None
            }
        ));
    }

    #[test]
    fn mode_set_accepts_only_dev_or_prod() {
        let cli = Cli::try_parse_from(["warden", "mode", "set", "prod"]).unwrap();
        match cli.command {
            Commands::Mode {
                command: ModeCommands::Set { mode },
            } => assert_eq!(OperatingMode::from(mode), OperatingMode::ProdPriority),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["warden", "mode", "set", "staging"]).is_err());
    }

    #[test]
    fn todo_add_requires_a_path() {
        assert!(Cli::try_parse_from(["warden", "todo", "add"]).is_err());
        let cli = Cli::try_parse_from(["warden", "todo", "add", "a.py", "b.py"]).unwrap();
        assert!(matches!(cli.command, Commands::Todo { command: TodoCommands::Add { ref paths } } if paths.len() == 2));
    }

    #[test]
    fn log_path_without_directory_lands_in_cwd() {
        let (dir, name) = split_log_path(Path::new("warden.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "warden.log");
    }
}
