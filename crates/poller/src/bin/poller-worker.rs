//! poller-worker: staggered liveness polling for the target catalog.
//!
//! Polls every (sharded) target once per cycle, writes definite results to
//! `live_status`/`live_history` and assigns targets that go live to the
//! least-loaded capture worker.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use tapedeck_balancer::LoadBalancer;
use tapedeck_core::config::{load_dotenv, Config};
use tapedeck_core::signal::shutdown_signal;
use tapedeck_core::{WorkerInstance, WorkerStatus, WorkerType};
use tapedeck_poller::{HttpStatusSource, PollerSettings, StatusPoller, Writer};
use tapedeck_store::{Database, FileTargetRepo, InstanceRepo, PgRepository, TargetRepo};

// ── CLI ─────────────────────────────────────────────────────────────

/// Liveness poller: status endpoint → live_status table → load balancer.
#[derive(Parser, Debug)]
#[command(name = "poller-worker", version, about)]
struct Cli {
    /// Stable instance id; a trailing letter selects the shard (`poller-a` = 0).
    #[arg(long, env = "INSTANCE_ID", default_value = "poller-a")]
    instance_id: String,

    /// Register this instance in the fleet registry on startup.
    #[arg(long, env = "POLLER_REGISTER", default_value_t = true, action = clap::ArgAction::Set)]
    register: bool,

    /// Seconds to wait for the writer to drain on shutdown.
    #[arg(long, env = "POLLER_SHUTDOWN_TIMEOUT", default_value_t = 15)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let db = Arc::new(Database::new(&config.postgres));
    db.warm_up().await;
    let repo = Arc::new(PgRepository::new(db));

    if cli.register {
        let me = WorkerInstance {
            instance_id: cli.instance_id.clone(),
            worker_type: WorkerType::Poller,
            display_name: None,
            max_capacity: 0,
            status: WorkerStatus::Active,
            last_heartbeat: Some(chrono::Utc::now()),
        };
        if let Err(e) = repo.register(&me).await {
            warn!(error = %e, "failed to register poller instance");
        }
    }

    let catalog: Arc<dyn TargetRepo> = match &config.paths.targets_file {
        Some(path) => {
            info!(path = %path.display(), "using target catalog file");
            Arc::new(FileTargetRepo::new(path))
        }
        None => repo.clone(),
    };

    let source = Arc::new(HttpStatusSource::new(
        &config.poller.api_base,
        &config.poller.egress_addrs,
        Duration::from_secs(config.poller.request_timeout_secs),
    )?);
    let settings = PollerSettings::from(&config.poller);

    let (tx, rx) = mpsc::channel(settings.queue_capacity);
    let balancer = Arc::new(LoadBalancer::new(repo.clone()));
    let writer = Writer::new(
        repo.clone(),
        balancer,
        settings.queue_capacity,
        Duration::from_millis(config.poller.flush_interval_ms),
    );
    let writer_handle = tokio::spawn(writer.run(rx));

    let poller = StatusPoller::new(
        cli.instance_id.clone(),
        settings,
        source,
        catalog,
        Some(repo.clone() as Arc<dyn InstanceRepo>),
        tx,
    );
    poller.validate_shard().await?;

    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.notify_one();
    });

    info!(instance = %cli.instance_id, "poller-worker started");
    poller.run(shutdown).await;

    match tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), writer_handle).await {
        Ok(Ok(())) => info!("writer drained"),
        Ok(Err(e)) => warn!(error = %e, "writer task failed"),
        Err(_) => warn!("writer drain timed out"),
    }

    if cli.register {
        if let Err(e) = repo.set_status(&cli.instance_id, WorkerStatus::Inactive).await {
            warn!(error = %e, "failed to mark poller inactive");
        }
    }
    info!("poller-worker shutdown complete");
    Ok(())
}
