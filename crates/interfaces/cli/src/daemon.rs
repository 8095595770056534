use std::process::ExitCode;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use warden_config::AppConfig;
use warden_monitor::{AgentContext, CycleReport};

/// `warden run`: the remediation loop in the foreground, or one cycle.
pub(crate) async fn run(config: AppConfig, once: bool) -> Result<ExitCode> {
    let ctx = AgentContext::from_config(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(shutdown_tx));

    info!(
        root = %ctx.config().project_root().display(),
        holder = ctx.locks().holder(),
        once,
        "warden starting"
    );

    let mut scheduler = ctx.scheduler()?;
    if once {
        let mut scheduler = scheduler.with_stop_signal(shutdown_rx);
        return Ok(match scheduler.run_once().await {
            Ok(report) => {
                print_cycle(&report);
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "remediation cycle failed");
                eprintln!("cycle failed: {err:#}");
                ExitCode::FAILURE
            }
        });
    }

    scheduler.run(shutdown_rx).await?;
    info!("warden stopped");
    Ok(ExitCode::SUCCESS)
}

/// Ctrl-C (and SIGTERM on unix) flips the shutdown channel; the scheduler
/// notices between files and between cycles.
async fn forward_shutdown(tx: watch::Sender<bool>) {
    #[cfg(unix)]
    let signalled = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            result = tokio::signal::ctrl_c() => result?,
        }
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let signalled = tokio::signal::ctrl_c();

    match signalled.await {
        Ok(()) => {
            info!("shutdown requested");
            let _ = tx.send(true);
        }
        Err(err) => warn!(error = %err, "could not install signal handler; stop with kill"),
    }
}

fn print_cycle(report: &CycleReport) {
    if report.is_idle() {
        println!("no changes ({})", report.mode);
        return;
    }
    println!(
        "mode {}: checked {}, fixed {}, not fixed {}, deferred {}, enqueued {}",
        report.mode,
        report.checked(),
        report.fixed(),
        report.not_fixed(),
        report.deferred(),
        report.enqueued.appended.len()
    );
    if report.escalated {
        println!("- rule files changed ({}); full project recheck", report.rule_changes);
    }
    if !report.gate_open {
        println!("- human active; every candidate deferred to the ledger");
    }
    for (path, outcome) in &report.outcomes {
        println!("  {} {}", outcome, path.display());
    }
}
