//! Lodestar scheduler binary.
//!
//! Serves the scheduler HTTP API and runs the queue cache refresh and lease
//! expiry loops.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lodestar_scheduler::{
    api, BackgroundTasks, NoopMetrics, PrometheusMetrics, Scheduler, SchedulerConfig,
    SchedulerMetrics,
};
use lodestar_state::Repositories;

/// Lodestar scheduler.
#[derive(Parser, Debug)]
#[command(name = "lodestar-scheduler")]
#[command(about = "Fair-share job leasing for executor clusters")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    let filter = if cli.verbose {
        "debug,hyper=info,tower=info"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("Lodestar scheduler starting");

    let config =
        SchedulerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    validate(&config)?;

    info!(
        listen_addr = %config.api.listen_addr,
        store = Repositories::backend_name(&config.store),
        batch_size = config.lease.batch_size,
        half_life_secs = config.priority.half_life.as_secs(),
        "Configuration loaded"
    );

    let repositories = Repositories::from_config(&config.store)
        .await
        .context("failed to connect to store")?;

    let prometheus = if config.api.metrics_enabled {
        PrometheusMetrics::install()
            .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder, metrics disabled"))
            .ok()
    } else {
        None
    };
    let metrics: Arc<dyn SchedulerMetrics> = if prometheus.is_some() {
        Arc::new(PrometheusMetrics)
    } else {
        Arc::new(NoopMetrics)
    };

    let listen_addr = config.api.listen_addr;
    let grace_period = config.shutdown.grace_period;
    let scheduler = Arc::new(Scheduler::new(config, repositories, metrics));

    // Start background tasks
    let cancel = CancellationToken::new();
    let mut tasks = BackgroundTasks::new(cancel.clone());
    scheduler.spawn_background(&mut tasks);

    let app = api::router(Arc::new(api::AppState {
        scheduler,
        prometheus,
    }));

    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "Scheduler API listening");

    let server_cancel = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        server_cancel.cancel();
    });

    if let Err(e) = server.await {
        error!(error = %e, "Server error");
    }

    if !tasks.shutdown(grace_period).await {
        warn!("Some background tasks did not stop in time");
    }

    info!("Lodestar scheduler shutdown complete");
    Ok(())
}

fn validate(config: &SchedulerConfig) -> anyhow::Result<()> {
    if config.lease.batch_size == 0 {
        bail!("lease.batch_size must be greater than zero");
    }
    if config.lease.min_priority <= 0.0 {
        bail!("lease.min_priority must be positive");
    }
    if config.priority.half_life.is_zero() {
        bail!("priority.half_life must be greater than zero");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
