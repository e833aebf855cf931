//! Exit Engine Binary
//!
//! Starts the Tranche exit engine: restores persisted positions, runs
//! the reconciliation loop, and executes structured trade signals read
//! as JSON lines from stdin.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin exit-engine
//! echo '{"symbol":"BTC-USDT","side":"buy","equity_pct":"5","entry":"95000","leverage":20,"tps":["96000","97000","98000"],"sl":"94000"}' | exit-engine
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BLOFIN_API_KEY`: Broker API key
//! - `BLOFIN_API_SECRET`: Broker API secret
//! - `BLOFIN_PASSPHRASE`: Broker API passphrase
//!
//! ## Optional
//! - `EXIT_ENGINE_CONFIG`: Config file path (default: config.yaml)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;

use exit_engine::config::{Config, load_config};
use exit_engine::execution::{EntryExecutor, Reconciler, StateStore, intake_channel};
use exit_engine::gateway::{BlofinCredentials, BlofinGateway};
use exit_engine::models::TradeSignal;
use exit_engine::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry();

    tracing::info!("Starting Tranche Exit Engine");

    let config = resolve_config()?;
    tracing::info!(
        environment = %config.engine.environment,
        poll_interval_secs = config.reconciliation.poll_interval_secs,
        state_path = %config.persistence.state_path.display(),
        "Configuration loaded"
    );

    let credentials = credentials_from_env()?;
    let gateway = Arc::new(
        BlofinGateway::new(&config.gateway, credentials)
            .context("failed to build broker gateway")?,
    );

    let store = StateStore::new(config.persistence.state_path.clone());
    let (intake_tx, intake_rx) = intake_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut reconciler = Reconciler::new(
        config.reconciliation.clone(),
        Arc::clone(&gateway),
        store,
        intake_rx,
        shutdown_rx,
    );

    let restored = reconciler
        .restore()
        .context("failed to restore persisted positions")?;
    if restored > 0 {
        tracing::info!(count = restored, "Resumed positions from previous session");
    }

    let reconciler_task = tokio::spawn(reconciler.run());

    let executor = EntryExecutor::new(Arc::clone(&gateway), intake_tx);
    let signal_task = tokio::spawn(run_signal_feed(executor));

    tracing::info!("Engine running; reading signals from stdin (Ctrl+C to stop)");
    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    tracing::info!("Shutdown requested, letting the in-flight cycle finish");
    let _ = shutdown_tx.send(true);
    signal_task.abort();
    reconciler_task
        .await
        .context("reconciliation task panicked")?;

    tracing::info!("Exit engine stopped");
    Ok(())
}

/// Load the config file, falling back to defaults when none exists.
fn resolve_config() -> anyhow::Result<Config> {
    let path = std::env::var("EXIT_ENGINE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

    match load_config(Some(&path)) {
        Ok(config) => Ok(config),
        Err(exit_engine::config::ConfigError::ReadError { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            tracing::warn!(path = %path, "No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e).context("failed to load configuration"),
    }
}

/// Read broker credentials from the environment.
fn credentials_from_env() -> anyhow::Result<BlofinCredentials> {
    let read = |name: &str| {
        std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
    };

    Ok(BlofinCredentials {
        api_key: read("BLOFIN_API_KEY")?,
        api_secret: read("BLOFIN_API_SECRET")?,
        passphrase: read("BLOFIN_PASSPHRASE")?,
    })
}

/// Execute structured trade signals read as JSON lines from stdin.
async fn run_signal_feed(executor: EntryExecutor<BlofinGateway>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let signal: TradeSignal = match serde_json::from_str(line) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, "Unparseable signal line, skipping");
                        continue;
                    }
                };

                match executor.execute(&signal).await {
                    Ok(receipt) => {
                        tracing::info!(symbol = %signal.symbol, receipt = ?receipt, "Signal executed");
                    }
                    Err(e) => {
                        tracing::warn!(symbol = %signal.symbol, error = %e, "Signal rejected");
                    }
                }
            }
            Ok(None) => {
                tracing::info!("Signal feed closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Signal feed read error");
                break;
            }
        }
    }
}
