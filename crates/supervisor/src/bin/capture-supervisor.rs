//! capture-supervisor: keeps one capture process per live target assigned
//! to this worker.
//!
//! Every tick reads the worker's live assignments from the store and hands
//! them to [`ProcessSupervisor::tick`]. Captures keep running when the
//! supervisor exits; a restarted supervisor adopts them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, info, warn};

use tapedeck_core::config::{load_dotenv, Config};
use tapedeck_core::signal::shutdown_signal;
use tapedeck_core::{WorkerInstance, WorkerStatus, WorkerType};
use tapedeck_store::{Database, FileTargetRepo, InstanceRepo, LiveStatusRepo, PgRepository, TargetRepo};
use tapedeck_supervisor::{
    InstanceLock, OsProcesses, ProcessSupervisor, SegmentActivity, SpawnCommand, SupervisorError,
    SupervisorSettings,
};

const SLOW_TICK: Duration = Duration::from_secs(5);

/// Capture supervisor for one capture worker host.
#[derive(Parser, Debug)]
#[command(name = "capture-supervisor", version, about)]
struct Cli {
    /// Capture worker id; assignments are read for this id.
    #[arg(long, env = "INSTANCE_ID")]
    instance_id: String,

    /// Capacity advertised to the load balancer.
    #[arg(long, env = "CAPTURE_MAX_CAPACITY", default_value_t = 10)]
    max_capacity: i32,

    /// Reload the target catalog every N ticks.
    #[arg(long, env = "SUPERVISOR_RELOAD_EVERY", default_value_t = 100)]
    reload_every: u64,
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
    let sup_cfg = &config.supervisor;

    let lock = InstanceLock::acquire(&sup_cfg.lock_path)?;
    info!(path = %lock.path().display(), "holding supervisor lock");

    if !config.paths.capture_root.is_dir() {
        let missing = config.paths.capture_root.display().to_string();
        drop(lock);
        return Err(SupervisorError::MissingDirectory(missing).into());
    }
    std::fs::create_dir_all(&config.paths.log_dir)?;

    let db = Arc::new(Database::new(&config.postgres));
    db.warm_up().await;
    let repo = Arc::new(PgRepository::new(db));

    let me = WorkerInstance {
        instance_id: cli.instance_id.clone(),
        worker_type: WorkerType::Capture,
        display_name: None,
        max_capacity: cli.max_capacity,
        status: WorkerStatus::Active,
        last_heartbeat: Some(chrono::Utc::now()),
    };
    if let Err(e) = repo.register(&me).await {
        warn!(error = %e, "failed to register capture instance");
    }

    let catalog: Arc<dyn TargetRepo> = match &config.paths.targets_file {
        Some(path) => Arc::new(FileTargetRepo::new(path)),
        None => repo.clone(),
    };

    let control = OsProcesses::new(SpawnCommand {
        program: sup_cfg.capture_program.clone(),
        args: sup_cfg.capture_args.clone(),
        signature: sup_cfg.process_signature.clone(),
        workdir: sup_cfg.capture_workdir.clone(),
        log_dir: config.paths.log_dir.clone(),
    });
    let probe = SegmentActivity::new(
        &config.paths.capture_root,
        Duration::from_secs(sup_cfg.inactivity_threshold_secs),
        Duration::from_secs(sup_cfg.owned_grace_secs),
    );
    let mut supervisor = ProcessSupervisor::new(control, probe, SupervisorSettings::from(sup_cfg));
    supervisor.set_excluded(sup_cfg.excluded_targets.iter().cloned());

    let mut interval = tokio::time::interval(Duration::from_secs(sup_cfg.tick_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(instance = %cli.instance_id, "capture-supervisor started");
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, leaving captures running");
                break;
            }
            _ = interval.tick() => {}
        }

        if ticks % cli.reload_every.max(1) == 0 {
            match catalog.enabled_targets().await {
                Ok(targets) => {
                    debug!(count = targets.len(), "target catalog loaded");
                    supervisor.set_targets(targets);
                }
                Err(e) => warn!(error = %e, "target catalog reload failed, keeping previous"),
            }
        }

        let live = match repo.live_targets_for_worker(&cli.instance_id).await {
            Ok(live) => Some(live),
            Err(e) => {
                warn!(error = %e, "live view unavailable, only adopting this tick");
                None
            }
        };

        let started = Instant::now();
        let now = chrono::Utc::now();
        let report = tokio::task::block_in_place(|| supervisor.tick(now, live.as_ref()));
        let took = started.elapsed();
        if took > SLOW_TICK {
            warn!(elapsed_ms = took.as_millis() as u64, "slow supervisor tick");
        }
        if !report.is_quiet() {
            info!(?report, tracked = supervisor.tracked(), "supervisor tick");
        }

        ticks += 1;
        if ticks % sup_cfg.heartbeat_every_ticks == 0 {
            if let Err(e) = repo.heartbeat(&cli.instance_id, chrono::Utc::now()).await {
                warn!(error = %e, "heartbeat failed");
            }
        }
    }

    drop(lock);
    info!("capture-supervisor stopped");
    Ok(())
}
