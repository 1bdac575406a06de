//! archive-worker: turns finished capture sessions into single artifacts.
//!
//! Runs a detection cycle every `ARCHIVE_CHECK_INTERVAL_SECS` and a merge
//! worker task beside it. On shutdown the queued merges are drained before
//! the process exits.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};

use tapedeck_archive::{
    merge_channel, ArchiveError, Archiver, CompanionLocator, CompletionDetector, CompletionSettings,
    FfmpegConcat, FfprobeProber, GroupingRules, Merger, NoCompanion, SubtitleLocator,
};
use tapedeck_core::config::{load_dotenv, Config};
use tapedeck_core::signal::shutdown_signal;
use tapedeck_core::{WorkerInstance, WorkerStatus, WorkerType};
use tapedeck_store::{Database, FileTargetRepo, InstanceRepo, PgRepository, TargetRepo};

/// Archive worker: validates and merges finished capture sessions.
#[derive(Parser, Debug)]
#[command(name = "archive-worker", version, about)]
struct Cli {
    #[arg(long, env = "INSTANCE_ID", default_value = "archive-a")]
    instance_id: String,

    /// Reload the target catalog every N cycles.
    #[arg(long, env = "ARCHIVE_RELOAD_EVERY", default_value_t = 20)]
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
    let cfg = &config.archive;

    if !config.paths.capture_root.is_dir() {
        return Err(ArchiveError::MissingDirectory(config.paths.capture_root.display().to_string()).into());
    }
    std::fs::create_dir_all(&config.paths.output_dir)?;

    let db = Arc::new(Database::new(&config.postgres));
    db.warm_up().await;
    let repo = Arc::new(PgRepository::new(db));

    let me = WorkerInstance {
        instance_id: cli.instance_id.clone(),
        worker_type: WorkerType::Archive,
        display_name: None,
        max_capacity: 1,
        status: WorkerStatus::Active,
        last_heartbeat: Some(chrono::Utc::now()),
    };
    if let Err(e) = repo.register(&me).await {
        warn!(error = %e, "failed to register archive instance");
    }

    let catalog: Arc<dyn TargetRepo> = match &config.paths.targets_file {
        Some(path) => Arc::new(FileTargetRepo::new(path)),
        None => repo.clone(),
    };

    let companion: Arc<dyn CompanionLocator> = match &config.paths.subtitle_root {
        Some(root) => {
            info!(root = %root.display(), "waiting for subtitles before finalizing");
            Arc::new(SubtitleLocator::new(root, config.paths.subtitle_subpath.clone()))
        }
        None => Arc::new(NoCompanion),
    };
    let prober = Arc::new(FfprobeProber::new(
        cfg.probe_program.clone(),
        Duration::from_secs(cfg.probe_timeout_secs),
    ));
    let detector = CompletionDetector::new(
        CompletionSettings::from(cfg),
        prober,
        companion,
        &config.paths.output_dir,
    );

    let concat = Arc::new(FfmpegConcat::new(
        cfg.concat_program.clone(),
        Duration::from_secs(cfg.concat_timeout_secs),
    ));
    let merger = Merger::new(&config.paths.output_dir, concat)
        .with_post_merge_command(cfg.post_merge_command.clone());
    let (queue, worker) = merge_channel(merger, Duration::from_secs(cfg.merge_retry_secs));
    let merge_task = tokio::spawn(worker.run());

    let mut archiver = Archiver::new(
        &config.paths.capture_root,
        GroupingRules::from(cfg),
        detector,
        repo.clone(),
        queue,
    );

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.check_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(instance = %cli.instance_id, root = %config.paths.capture_root.display(), "archive-worker started");
    let mut cycles: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => {}
        }

        if cycles % cli.reload_every.max(1) == 0 {
            match catalog.enabled_targets().await {
                Ok(targets) => {
                    debug!(count = targets.len(), "target catalog loaded");
                    archiver.set_targets(targets);
                }
                Err(e) => warn!(error = %e, "target catalog reload failed, keeping previous"),
            }
        }

        let summary = archiver.run_cycle(chrono::Utc::now()).await;
        if summary.is_quiet() {
            debug!(?summary, "archive cycle");
        } else {
            info!(?summary, pending_merges = archiver.pending_merges(), "archive cycle");
        }

        cycles += 1;
        if let Err(e) = repo.heartbeat(&cli.instance_id, chrono::Utc::now()).await {
            warn!(error = %e, "heartbeat failed");
        }
    }

    archiver.close_merges();
    info!(pending = archiver.pending_merges(), "draining merge queue");
    if let Err(e) = merge_task.await {
        warn!(error = %e, "merge worker ended abnormally");
    }
    info!("archive-worker stopped");
    Ok(())
}
