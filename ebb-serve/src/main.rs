//! ebb-serve - Scheduled pruning service
//!
//! Runs a prune pass for every configured platform on a fixed interval and
//! serves the live status over HTTP.

mod status;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use libebbtide::logging::LoggingConfig;
use libebbtide::report::{write_summaries, OutputFormat};
use libebbtide::{Config, Criteria, EbbtideError, Orchestrator, Service, Summary, Target};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::status::{AppState, ServiceInfo};

const METRICS_UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "ebb-serve")]
#[command(version)]
#[command(about = "Scheduled pruning service with a status endpoint")]
#[command(long_about = "\
ebb-serve - Scheduled pruning service

DESCRIPTION:
    ebb-serve runs a prune pass for every enabled platform immediately,
    then again every interval. Platforms run independently: a failed pass
    is logged and retried on the next tick without affecting the others.

    The [prune] section decides what is pruned. A threshold (max_age or
    before_date) is required unless --dry-run is given.

USAGE:
    # Run in foreground (logs to stderr)
    ebb-serve

    # Preview every hour without changing anything
    ebb-serve --dry-run --interval 1h

    # Expose status on all interfaces
    ebb-serve --status-addr 0.0.0.0:8787

STATUS ENDPOINTS:
    GET /health   - liveness probe
    GET /status   - JSON snapshot of every platform's runs
    GET /metrics  - Prometheus text format

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (stops after the current item)

CONFIGURATION:
    Configuration file: ~/.config/ebbtide/config.toml
    Override with --config or EBBTIDE_CONFIG.

    [service]
    interval = \"6h\"                 # time between passes
    status_addr = \"127.0.0.1:8787\"  # status server address

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime or configuration error
    2 - Authentication error
    3 - Invalid input
")]
struct Cli {
    /// Platforms to serve
    #[arg(short, long, value_name = "PLATFORM")]
    #[arg(help = "Platform to prune (bluesky, mastodon); repeat or comma-separate for several. Defaults to every enabled platform")]
    platform: Vec<String>,

    /// Time between passes (overrides config)
    #[arg(long, value_name = "DURATION")]
    #[arg(help = "Time between passes, e.g. 30m or 6h (default: from config)")]
    interval: Option<String>,

    /// Status server address (overrides config)
    #[arg(long, value_name = "ADDR")]
    #[arg(help = "Address for the status server (default: from config)")]
    status_addr: Option<String>,

    /// Report without acting
    #[arg(short = 'n', long)]
    #[arg(help = "Run every pass as a dry run")]
    dry_run: bool,

    /// Configuration file
    #[arg(short, long, env = "EBBTIDE_CONFIG", value_name = "PATH")]
    #[arg(help = "Path to the configuration file")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Run one pass per platform, print the summaries, and exit")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e.downcast_ref::<EbbtideError>().map_or(1, EbbtideError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_from(cli.config.as_deref())?;
    let criteria = build_criteria(&cli, &config)?;
    let platforms = config.select_platforms(&cli.platform)?;
    let targets: Vec<Target> = platforms.iter().copied().map(Target::own).collect();

    let cancel = CancellationToken::new();
    let signals = install_signal_handler(cancel.clone())?;

    let orchestrator = Orchestrator::from_config(&config, &platforms)
        .await?
        .with_cancellation(cancel.clone());

    let result = if cli.once {
        run_once(&orchestrator, &targets, &criteria).await
    } else {
        serve(&cli, &config, Arc::new(orchestrator), cancel, targets, criteria).await
    };

    signals.close();
    result
}

async fn run_once(orchestrator: &Orchestrator, targets: &[Target], criteria: &Criteria) -> Result<()> {
    let summaries = orchestrator.run_all(targets, criteria, |_| {}).await;
    write_summaries(&summaries, OutputFormat::Jsonl, &mut std::io::stdout().lock())?;

    if summaries.iter().any(Summary::is_failure) {
        anyhow::bail!("one or more platform runs failed");
    }
    Ok(())
}

async fn serve(
    cli: &Cli,
    config: &Config,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    targets: Vec<Target>,
    criteria: Criteria,
) -> Result<()> {
    let interval = match &cli.interval {
        Some(interval) => humantime::parse_duration(interval)
            .map_err(|e| EbbtideError::InvalidInput(format!("interval '{}': {}", interval, e)))?,
        None => config.service.interval()?,
    };
    if interval.is_zero() {
        return Err(EbbtideError::InvalidInput("interval must be greater than zero".to_string()).into());
    }

    let addr = cli
        .status_addr
        .clone()
        .unwrap_or_else(|| config.service.status_addr.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind status server to {}", addr))?;

    let metrics = install_metrics_recorder(cancel.clone());
    let info = ServiceInfo {
        started_at: Utc::now(),
        interval_secs: interval.as_secs(),
        dry_run: criteria.dry_run,
        timeline: criteria.timeline,
    };

    let service = Service::start(orchestrator, cancel.clone(), targets, criteria, interval);
    let app = status::router(AppState {
        board: service.board(),
        info,
        metrics,
    });

    info!(address = %listener.local_addr()?, "status server listening");

    let shutdown = cancel.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("status server error");

    cancel.cancel();
    service.shutdown().await;
    served
}

/// Criteria from the `[prune]` section; a threshold is required unless dry-running
fn build_criteria(cli: &Cli, config: &Config) -> libebbtide::Result<Criteria> {
    let criteria = config
        .prune
        .to_criteria_builder()?
        .dry_run(cli.dry_run)
        .build()?;

    if !criteria.has_threshold() && !criteria.dry_run {
        return Err(EbbtideError::InvalidInput(
            "[prune] needs max_age or before_date unless running with --dry-run".to_string(),
        ));
    }

    Ok(criteria)
}

/// Install the global Prometheus recorder
///
/// Failure only disables `/metrics`; the service keeps running.
fn install_metrics_recorder(cancel: CancellationToken) -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let upkeep = handle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(METRICS_UPKEEP_INTERVAL) => upkeep.run_upkeep(),
                    }
                }
            });
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder, /metrics disabled");
            None
        }
    }
}

#[cfg(unix)]
struct SignalGuard(signal_hook_tokio::Handle);

#[cfg(unix)]
impl SignalGuard {
    fn close(self) {
        self.0.close();
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM
#[cfg(unix)]
fn install_signal_handler(cancel: CancellationToken) -> Result<SignalGuard> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| EbbtideError::InvalidInput(format!("Signal setup failed: {}", e)))?;
    let handle = signals.handle();

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "received shutdown signal, stopping gracefully");
            cancel.cancel();
        }
    });

    Ok(SignalGuard(handle))
}

#[cfg(not(unix))]
struct SignalGuard;

#[cfg(not(unix))]
impl SignalGuard {
    fn close(self) {}
}

#[cfg(not(unix))]
fn install_signal_handler(cancel: CancellationToken) -> Result<SignalGuard> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, stopping gracefully");
            cancel.cancel();
        }
    });
    Ok(SignalGuard)
}
