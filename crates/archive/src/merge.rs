//! Serialized merging of finished sessions.
//!
//! The detection loop owns a [`MergeQueue`]; a single [`MergeWorker`] task
//! drains it one job at a time and reports back over a second channel, so
//! the loop alone tracks what is pending and what recently failed.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};
use crate::grouper::{Session, SessionKey};
use crate::layout;

const TEMP_DIR: &str = ".temp";
const LOCK_DIR: &str = ".locks";

/// Joins a concat list into one output file.
#[async_trait]
pub trait Concatenator: Send + Sync {
    async fn concat(&self, list: &Path, output: &Path) -> Result<()>;
}

/// Stream-copy concatenation with `ffmpeg -f concat`.
pub struct FfmpegConcat {
    program: String,
    timeout: Duration,
}

impl FfmpegConcat {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self { program: program.into(), timeout }
    }
}

#[async_trait]
impl Concatenator for FfmpegConcat {
    async fn concat(&self, list: &Path, output: &Path) -> Result<()> {
        let child = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(list)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ArchiveError::Timeout {
                    program: self.program.clone(),
                    secs: self.timeout.as_secs(),
                })
            }
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        Err(ArchiveError::ToolFailed {
            program: self.program.clone(),
            detail: format!("{} ({})", output.status, tail.into_iter().rev().collect::<Vec<_>>().join(" | ")),
        })
    }
}

// ── Jobs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub key: SessionKey,
    /// Session order; the first directory names the artifact.
    pub dirs: Vec<PathBuf>,
}

impl MergeJob {
    pub fn from_session(session: &Session) -> Option<Self> {
        if session.dirs.is_empty() {
            return None;
        }
        Some(Self {
            key: session.key.clone(),
            dirs: session.dirs.iter().map(|d| d.path.clone()).collect(),
        })
    }

    pub fn artifact_name(&self) -> String {
        self.dirs.first().map(|d| layout::dir_name(d)).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(PathBuf),
    AlreadyExists,
    /// No manifest listed a valid segment; directories marked without merging.
    NothingToMerge,
    /// Another process holds the artifact lock.
    Locked,
}

#[derive(Debug)]
pub struct MergeReport {
    pub artifact: String,
    pub key: SessionKey,
    pub result: std::result::Result<MergeOutcome, String>,
    pub finished_at: DateTime<Utc>,
}

// ── Queue (detection loop side) ───────────────────────────────

pub struct MergeQueue {
    tx: Option<mpsc::UnboundedSender<MergeJob>>,
    reports: mpsc::UnboundedReceiver<MergeReport>,
    pending: HashSet<String>,
    failed: HashMap<String, DateTime<Utc>>,
    retry_after: Duration,
}

/// A queue and the worker draining it.
pub fn merge_channel(merger: Merger, retry_after: Duration) -> (MergeQueue, MergeWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (report_tx, reports) = mpsc::unbounded_channel();
    let queue = MergeQueue {
        tx: Some(tx),
        reports,
        pending: HashSet::new(),
        failed: HashMap::new(),
        retry_after,
    };
    let worker = MergeWorker { rx, reports: report_tx, merger };
    (queue, worker)
}

impl MergeQueue {
    /// Fold in finished jobs reported by the worker and forget failures
    /// whose back-off has passed.
    pub fn settle(&mut self, now: DateTime<Utc>) -> Vec<MergeReport> {
        let mut settled = Vec::new();
        while let Ok(report) = self.reports.try_recv() {
            self.pending.remove(&report.artifact);
            if report.result.is_err() {
                self.failed.insert(report.artifact.clone(), report.finished_at);
            }
            settled.push(report);
        }
        let retry_after = self.retry_after;
        self.failed
            .retain(|_, failed_at| (now - *failed_at).to_std().map(|waited| waited < retry_after).unwrap_or(true));
        settled
    }

    /// Queue `job` unless it is already pending or failed recently.
    pub fn enqueue(&mut self, job: MergeJob, now: DateTime<Utc>) -> bool {
        self.settle(now);
        let name = job.artifact_name();
        if self.pending.contains(&name) {
            return false;
        }
        if let Some(failed_at) = self.failed.get(&name) {
            let waited = (now - *failed_at).to_std().unwrap_or_default();
            if waited < self.retry_after {
                return false;
            }
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        let key = job.key.clone();
        if tx.send(job).is_err() {
            warn!(session = %key, "merge worker is gone");
            return false;
        }
        self.failed.remove(&name);
        self.pending.insert(name);
        info!(session = %key, pending = self.pending.len(), "session queued for merge");
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Sessions whose last merge failed and are still backing off.
    pub fn backing_off(&self) -> usize {
        self.failed.len()
    }

    /// Stop accepting jobs; the worker finishes what is queued and exits.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

// ── Worker ────────────────────────────────────────────────────

pub struct MergeWorker {
    rx: mpsc::UnboundedReceiver<MergeJob>,
    reports: mpsc::UnboundedSender<MergeReport>,
    merger: Merger,
}

impl MergeWorker {
    pub async fn run(mut self) {
        info!("merge worker started");
        while let Some(job) = self.rx.recv().await {
            let artifact = job.artifact_name();
            info!(session = %job.key, %artifact, "merging");
            let result = match self.merger.merge(&job).await {
                Ok(outcome) => {
                    info!(session = %job.key, ?outcome, "merge finished");
                    Ok(outcome)
                }
                Err(e) => {
                    warn!(session = %job.key, error = %e, "merge failed, will retry later");
                    Err(e.to_string())
                }
            };
            let _ = self.reports.send(MergeReport {
                artifact,
                key: job.key,
                result,
                finished_at: Utc::now(),
            });
        }
        info!("merge worker drained");
    }
}

// ── Merger ────────────────────────────────────────────────────

/// Cross-process lock on one artifact. Released and removed on drop.
struct ArtifactLock {
    file: File,
    path: PathBuf,
}

impl ArtifactLock {
    fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path: path.to_path_buf() })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = self.file.unlock();
    }
}

pub struct Merger {
    output_dir: PathBuf,
    concat: Arc<dyn Concatenator>,
    post_merge_command: Option<String>,
}

impl Merger {
    pub fn new(output_dir: impl Into<PathBuf>, concat: Arc<dyn Concatenator>) -> Self {
        Self {
            output_dir: output_dir.into(),
            concat,
            post_merge_command: None,
        }
    }

    /// Command run with the artifact path appended after each merge.
    pub fn with_post_merge_command(mut self, command: Option<String>) -> Self {
        self.post_merge_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    pub async fn merge(&self, job: &MergeJob) -> Result<MergeOutcome> {
        let name = job.artifact_name();
        let artifact = layout::artifact_path(&self.output_dir, &name);
        if artifact.exists() {
            mark_merged(&job.dirs, &name)?;
            return Ok(MergeOutcome::AlreadyExists);
        }

        let lock_dir = self.output_dir.join(LOCK_DIR);
        fs::create_dir_all(&lock_dir)?;
        let Some(_lock) = ArtifactLock::try_acquire(&lock_dir.join(format!("{name}.merge.lock")))? else {
            return Ok(MergeOutcome::Locked);
        };
        if artifact.exists() {
            mark_merged(&job.dirs, &name)?;
            return Ok(MergeOutcome::AlreadyExists);
        }

        let mut entries = Vec::new();
        for dir in &job.dirs {
            entries.extend(layout::manifest_entries(dir)?);
        }
        if entries.is_empty() {
            info!(session = %job.key, "no valid segments in session, marking without merge");
            mark_merged(&job.dirs, &name)?;
            return Ok(MergeOutcome::NothingToMerge);
        }

        let temp_dir = self.output_dir.join(TEMP_DIR);
        fs::create_dir_all(&temp_dir)?;
        let list = temp_dir.join(format!("{name}_combined.txt"));
        let partial = temp_dir.join(format!("{name}.{}", layout::ARTIFACT_EXT));
        let mut body = entries.join("\n");
        body.push('\n');
        fs::write(&list, body)?;
        if partial.exists() {
            fs::remove_file(&partial)?;
        }

        debug!(session = %job.key, segments = entries.len(), "running concatenation");
        let result = self.concat.concat(&list, &partial).await;
        let _ = fs::remove_file(&list);
        if let Err(e) = result {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        fs::rename(&partial, &artifact)?;
        mark_merged(&job.dirs, &name)?;
        self.after_merge(&artifact);
        Ok(MergeOutcome::Merged(artifact))
    }

    fn after_merge(&self, artifact: &Path) {
        let Some(command) = &self.post_merge_command else {
            return;
        };
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return;
        };
        let spawned = Command::new(program)
            .args(parts)
            .arg(artifact)
            .stdin(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                let artifact = artifact.display().to_string();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => debug!(%artifact, "post-merge command finished"),
                        Ok(status) => warn!(%artifact, %status, "post-merge command failed"),
                        Err(e) => warn!(%artifact, error = %e, "post-merge command lost"),
                    }
                });
            }
            Err(e) => warn!(program, error = %e, "failed to start post-merge command"),
        }
    }
}

fn mark_merged(dirs: &[PathBuf], artifact: &str) -> io::Result<()> {
    let body = format!("merged into: {artifact}\nat: {}\n", Utc::now().to_rfc3339());
    for dir in dirs {
        fs::write(dir.join(layout::MERGED_MARKER), &body)?;
    }
    Ok(())
}
