//! nodewatch monitor - overlay node fleet monitor
//!
//! Mirrors the authoritative node list into the local management service, probes every
//! node's agent over its control RPC and reports status upstream, every few minutes:
//! - registry reconciliation (create / update / delete, report token harvest)
//! - control-RPC health probes through supervised per-node agents
//! - per-node status reports with retry and backoff

mod api;
mod backoff;
mod config;
mod cycle;
mod models;
mod probe;
mod reconcile;
mod report;
mod state;
mod supervisor;

use anyhow::{Context, Result};
use clap::Parser;
use config::{ConfigStore, DEFAULT_CONFIG_FILE, MIN_SETTLE_DELAY_SECS};
use cycle::{shutdown_channel, CycleOrchestrator, ShutdownTrigger};
use std::future::Future;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nodewatch-monitor", version, about = "Overlay node fleet monitor")]
struct Cli {
    /// Management API base URL, e.g. https://your-domain.workers.dev
    #[arg(env = "NODEWATCH_API_URL")]
    api_url: String,

    /// Operator JWT for the management API
    #[arg(env = "NODEWATCH_JWT_TOKEN", hide_env_values = true)]
    jwt_token: String,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Connection timeout in seconds (overrides the config file)
    #[arg(long)]
    timeout: Option<u64>,

    /// Delay between node reports in seconds (overrides the config file)
    #[arg(long)]
    delay: Option<f64>,

    /// Log level (overrides the config file; RUST_LOG wins over both)
    #[arg(long, value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    log_level: Option<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

/// Adds `https://` when the operator passed a bare host.
fn normalize_api_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{directive},hyper=warn,reqwest=warn")));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Fires the trigger on Ctrl-C or SIGTERM.
fn spawn_signal_listener(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination signal received, finishing current stage");
        trigger.trigger();
    });
}

/// Awaits a signal listener. A listener that cannot be installed never resolves, so a
/// missing handler does not read as a shutdown request.
async fn signal_or_pending<F>(listener: F, signal: &str)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = listener.await {
        warn!(signal, error = %e, "cannot listen for signal");
        std::future::pending::<()>().await;
    }
}

async fn ctrl_c() {
    signal_or_pending(tokio::signal::ctrl_c(), "Ctrl-C").await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, Ctrl-C only");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let store = ConfigStore::open(&cli.config).await;
    let mut config = store.current();
    if let Some(timeout) = cli.timeout {
        config.connection_timeout = timeout;
    }
    if let Some(delay) = cli.delay {
        config.node_delay = delay;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    init_tracing(config.tracing_directive());
    info!(config = %store.path().display(), version = env!("CARGO_PKG_VERSION"), "nodewatch monitor starting");

    if config.clamp_settle_delay() {
        warn!(min_secs = MIN_SETTLE_DELAY_SECS, "settle_delay below minimum, raised");
    }
    info!(
        timeout_secs = config.connection_timeout,
        node_delay_secs = config.node_delay,
        max_retries = config.max_retries,
        tokens = config.report_tokens.len(),
        "configuration loaded"
    );

    let api_url = normalize_api_url(&cli.api_url);
    let orchestrator = CycleOrchestrator::new(&api_url, &cli.jwt_token, config, store)
        .context("failed to initialise the monitor")?;

    let (trigger, shutdown) = shutdown_channel();
    spawn_signal_listener(trigger);

    orchestrator.run(shutdown, cli.once).await.context("monitor stopped on a fatal error")?;
    info!("nodewatch monitor stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_api_url_normalization() {
        assert_eq!(normalize_api_url("example.workers.dev/"), "https://example.workers.dev");
        assert_eq!(normalize_api_url("http://127.0.0.1:8787"), "http://127.0.0.1:8787");
    }

    #[tokio::test]
    async fn test_failed_signal_listener_never_fires() {
        let failed = signal_or_pending(std::future::ready(Err(std::io::Error::other("no handler"))), "test");
        assert!(tokio::time::timeout(Duration::from_millis(50), failed).await.is_err());

        let delivered = signal_or_pending(std::future::ready(Ok(())), "test");
        assert!(tokio::time::timeout(Duration::from_millis(50), delivered).await.is_ok());
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "nodewatch-monitor",
            "https://api.example.com",
            "jwt",
            "--timeout",
            "10",
            "--log-level",
            "DEBUG",
            "--once",
        ])
        .unwrap();
        assert_eq!(cli.timeout, Some(10));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(cli.once);

        assert!(Cli::try_parse_from(["nodewatch-monitor", "u", "t", "--log-level", "LOUD"]).is_err());
    }
}
