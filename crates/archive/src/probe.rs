//! Segment validation through an external media probe.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Valid,
    /// Reason the segment was rejected.
    Invalid(String),
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Never fails: tool errors and timeouts are invalid segments.
    async fn probe(&self, path: &Path) -> ProbeVerdict;
}

/// `ffprobe`, asked separately for a video and an audio stream.
pub struct FfprobeProber {
    program: String,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self { program: program.into(), timeout }
    }

    /// Whether the probe reports at least one stream of `kind` (`v` or `a`).
    async fn has_stream(&self, path: &Path, kind: &str) -> Result<bool, String> {
        let child = Command::new(&self.program)
            .args(["-hide_banner", "-v", "error", "-select_streams", kind])
            .args(["-show_entries", "stream=index", "-of", "csv=p=0"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.program))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty()),
            Ok(Err(e)) => Err(format!("{} failed: {e}", self.program)),
            Err(_) => Err(format!("{} timed out after {}s", self.program, self.timeout.as_secs())),
        }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, path: &Path) -> ProbeVerdict {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let video = self.has_stream(path, "v").await;
        let audio = self.has_stream(path, "a").await;
        match (video, audio) {
            (Ok(true), Ok(true)) => ProbeVerdict::Valid,
            (Err(e), _) | (_, Err(e)) => ProbeVerdict::Invalid(format!("[error] {name}: {e}")),
            _ => ProbeVerdict::Invalid(format!("[missing stream] {name}")),
        }
    }
}

/// Probe `paths` with at most `workers` probes in flight.
pub async fn probe_all(
    prober: Arc<dyn Prober>,
    paths: Vec<PathBuf>,
    workers: usize,
) -> Vec<(PathBuf, ProbeVerdict)> {
    if paths.is_empty() {
        return Vec::new();
    }
    debug!(count = paths.len(), workers, "probing segments");
    stream::iter(paths)
        .map(|path| {
            let prober = prober.clone();
            async move {
                let verdict = prober.probe(&path).await;
                (path, verdict)
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await
}
