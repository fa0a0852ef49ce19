//! Supabazarr: per-device backup of a self-hosted media stack.

mod cli;

use clap::Parser;
use cli::Cli;
use std::process::ExitCode;
use supabazarr_config::Config;
use supabazarr_engine::{Engine, RunStatus};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const EXIT_FAILED: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = ?e, "Invalid configuration");
            return ExitCode::from(EXIT_FATAL);
        },
    };
    let engine = match Engine::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = ?e, "Cannot set up the backup engine");
            return ExitCode::from(EXIT_FATAL);
        },
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, finishing the current step");
                cancel.cancel();
            }
        }
    });

    if cli.once {
        return once(&engine, &cancel).await;
    }
    every(&engine, &config, &cancel).await;
    ExitCode::SUCCESS
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn once(engine: &Engine, cancel: &CancellationToken) -> ExitCode {
    match engine.run_once(cancel).await {
        Ok(report) if report.status == RunStatus::Failed => ExitCode::from(EXIT_FAILED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "Backup run aborted");
            ExitCode::from(EXIT_FATAL)
        },
    }
}

/// Run now, then every `run.interval_hours`, until cancelled.
async fn every(engine: &Engine, config: &Config, cancel: &CancellationToken) {
    let mut ticker = tokio::time::interval(config.run.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }
        match engine.run_once(cancel).await {
            Ok(report) => tracing::info!(status = %report.status, next_in_hours = config.run.interval_hours, "Waiting for next run"),
            Err(e) => tracing::error!(error = ?e, "Backup run aborted, retrying at the next interval"),
        }
    }
    tracing::info!("Stopped");
}
