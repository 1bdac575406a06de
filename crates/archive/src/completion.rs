//! Deciding when a session is finished and writing its manifests.
//!
//! While a session may still be live, stable segments are probed a batch at
//! a time and the verdicts cached per path. Once the target is definitely
//! not live and no segment moved for the final-inactivity window, the
//! remaining segments are probed and each directory gets its manifest. The
//! manifest is created with a hard link from a temporary file, so an
//! existing manifest is never replaced.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tapedeck_core::config::ArchiveConfig;
use tapedeck_core::Target;

use crate::companion::CompanionLocator;
use crate::error::Result;
use crate::grouper::{DirSnapshot, Session};
use crate::layout;
use crate::probe::{probe_all, ProbeVerdict, Prober};

#[derive(Debug, Clone)]
pub struct CompletionSettings {
    /// A directory is probed incrementally only once it has this many segments.
    pub min_segments: usize,
    /// Segments untouched this long are safe to probe while live.
    pub stable: Duration,
    /// Minimum spacing of incremental passes per directory.
    pub live_check_interval: Duration,
    pub final_inactive: Duration,
    pub companion_attempts: u32,
    pub retention: Duration,
    pub probe_workers: usize,
}

impl From<&ArchiveConfig> for CompletionSettings {
    fn from(cfg: &ArchiveConfig) -> Self {
        Self {
            min_segments: cfg.min_segments_for_check,
            stable: Duration::from_secs(cfg.segment_stable_secs),
            live_check_interval: Duration::from_secs(cfg.live_check_interval_secs),
            final_inactive: Duration::from_secs(cfg.final_inactive_secs),
            companion_attempts: cfg.companion_attempts.max(1),
            retention: Duration::from_secs(cfg.retention_secs),
            probe_workers: cfg.probe_workers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Written { valid: usize, errors: usize },
    AlreadyManifested,
}

#[derive(Debug)]
struct DirState {
    checked: HashSet<PathBuf>,
    valid: Vec<PathBuf>,
    errors: Vec<String>,
    last_check: Option<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

impl DirState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            checked: HashSet::new(),
            valid: Vec::new(),
            errors: Vec::new(),
            last_check: None,
            last_seen: now,
        }
    }

    fn record(&mut self, results: Vec<(PathBuf, ProbeVerdict)>) {
        for (path, verdict) in results {
            match verdict {
                ProbeVerdict::Valid => self.valid.push(path.clone()),
                ProbeVerdict::Invalid(reason) => self.errors.push(reason),
            }
            self.checked.insert(path);
        }
    }
}

fn older_than(now: DateTime<Utc>, then: DateTime<Utc>, limit: Duration) -> bool {
    (now - then).to_std().map(|age| age >= limit).unwrap_or(false)
}

pub struct CompletionDetector {
    settings: CompletionSettings,
    prober: Arc<dyn Prober>,
    companion: Arc<dyn CompanionLocator>,
    output_dir: PathBuf,
    dirs: HashMap<PathBuf, DirState>,
    /// Companion lookups per session, keyed by the session's earliest directory.
    companion_checks: HashMap<PathBuf, u32>,
}

impl CompletionDetector {
    pub fn new(
        settings: CompletionSettings,
        prober: Arc<dyn Prober>,
        companion: Arc<dyn CompanionLocator>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            prober,
            companion,
            output_dir: output_dir.into(),
            dirs: HashMap::new(),
            companion_checks: HashMap::new(),
        }
    }

    pub fn tracked_dirs(&self) -> usize {
        self.dirs.len()
    }

    pub fn companion_checks(&self, session: &Session) -> u32 {
        session
            .earliest()
            .and_then(|d| self.companion_checks.get(&d.path))
            .copied()
            .unwrap_or(0)
    }

    /// Probe the stable, unprobed segments of a directory that may still be
    /// recording. Returns how many segments were probed.
    pub async fn check_incremental(&mut self, dir: &DirSnapshot, now: DateTime<Utc>) -> usize {
        if dir.manifested || dir.segment_count < self.settings.min_segments {
            return 0;
        }
        let interval = self.settings.live_check_interval;
        let stable_after = self.settings.stable;
        let state = self.dirs.entry(dir.path.clone()).or_insert_with(|| DirState::new(now));
        state.last_seen = now;
        if let Some(last) = state.last_check {
            if !older_than(now, last, interval) {
                return 0;
            }
        }

        let segments = match layout::list_segments(&dir.path) {
            Ok(segments) => segments,
            Err(e) => {
                warn!(dir = %dir.name, error = %e, "failed to list segments");
                return 0;
            }
        };
        let stable: Vec<PathBuf> = segments
            .into_iter()
            .filter(|s| !state.checked.contains(&s.path))
            .filter(|s| older_than(now, s.modified, stable_after))
            .map(|s| s.path)
            .collect();
        state.last_check = Some(now);

        let count = stable.len();
        if count > 0 {
            let results = probe_all(self.prober.clone(), stable, self.settings.probe_workers).await;
            for (path, verdict) in &results {
                if let ProbeVerdict::Invalid(reason) = verdict {
                    debug!(dir = %dir.name, segment = %path.display(), %reason, "segment rejected");
                }
            }
            if let Some(state) = self.dirs.get_mut(&dir.path) {
                state.record(results);
            }
            debug!(dir = %dir.name, probed = count, "incremental check");
        }
        count
    }

    /// Ended means definitely not live and quiet on disk. An unknown live
    /// signal never ends a session.
    pub fn is_ended(&self, session: &Session, live: Option<bool>, now: DateTime<Utc>) -> bool {
        if live != Some(false) {
            return false;
        }
        session.dirs.iter().all(|dir| match dir.latest_segment {
            Some(latest) => {
                (now - latest).to_std().map(|idle| idle > self.settings.final_inactive).unwrap_or(false)
            }
            None => true,
        })
    }

    /// One companion lookup for an ended session. After the configured
    /// number of attempts the session passes without it.
    pub fn companion_ready(&mut self, session: &Session, target: &Target) -> bool {
        let Some(earliest) = session.earliest() else {
            return false;
        };
        let attempts = self.companion_checks.entry(earliest.path.clone()).or_insert(0);
        *attempts += 1;
        if self.companion.locate(&earliest.name, target) {
            return true;
        }
        if *attempts >= self.settings.companion_attempts {
            info!(session = %session.key, attempts = *attempts, "no companion found, forcing pass");
            return true;
        }
        info!(session = %session.key, attempt = *attempts, "waiting for companion");
        false
    }

    /// Probe everything left in `dir` and write its manifest unless one exists.
    pub async fn finalize(&mut self, dir: &DirSnapshot, now: DateTime<Utc>) -> Result<FinalizeOutcome> {
        if layout::has_manifest(&dir.path) {
            self.dirs.remove(&dir.path);
            return Ok(FinalizeOutcome::AlreadyManifested);
        }

        let mut state = self.dirs.remove(&dir.path).unwrap_or_else(|| DirState::new(now));
        let segments = layout::list_segments(&dir.path)?;
        let total = segments.len();
        let remaining: Vec<PathBuf> = segments
            .into_iter()
            .map(|s| s.path)
            .filter(|p| !state.checked.contains(p))
            .collect();
        if !remaining.is_empty() {
            info!(dir = %dir.name, remaining = remaining.len(), "final probe");
            let results = probe_all(self.prober.clone(), remaining, self.settings.probe_workers).await;
            state.record(results);
        }
        state.valid.sort();
        state.valid.dedup();

        let body = layout::render_manifest(&state.valid, now);
        if !write_once(&dir.path.join(layout::MANIFEST_NAME), &body)? {
            return Ok(FinalizeOutcome::AlreadyManifested);
        }

        if !state.errors.is_empty() || state.valid.is_empty() {
            self.write_report(dir, total, &state, now)?;
        }
        info!(dir = %dir.name, valid = state.valid.len(), errors = state.errors.len(), "manifest written");
        Ok(FinalizeOutcome::Written { valid: state.valid.len(), errors: state.errors.len() })
    }

    fn write_report(&self, dir: &DirSnapshot, total: usize, state: &DirState, now: DateTime<Utc>) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;
        let path = layout::error_report_path(&self.output_dir, &dir.name);
        let mut report = format!(
            "checked at: {}\nsegments: {}\nvalid: {}\nerrors: {}\n\n",
            now.to_rfc3339(),
            total,
            state.valid.len(),
            state.errors.len()
        );
        if state.valid.is_empty() {
            report.push_str("no valid segments found, directory marked as checked\n\n");
        }
        report.push_str(&state.errors.join("\n"));
        fs::write(&path, report)?;
        warn!(dir = %dir.name, report = %path.display(), "directory had problems, report written");
        Ok(())
    }

    /// Drop state for directories gone past retention or already manifested,
    /// and companion counters of sessions whose first directory is gone.
    pub fn cleanup(&mut self, seen_dirs: &HashSet<PathBuf>, now: DateTime<Utc>) {
        let retention = self.settings.retention;
        self.dirs.retain(|path, state| {
            if layout::has_manifest(path) {
                return false;
            }
            seen_dirs.contains(path) || !older_than(now, state.last_seen, retention)
        });
        self.companion_checks.retain(|path, _| seen_dirs.contains(path));
    }
}

/// Create `path` with `body` unless it already exists. Returns whether this
/// call created it.
fn write_once(path: &Path, body: &str) -> io::Result<bool> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::companion::NoCompanion;
    use crate::grouper::{DirSnapshot, SessionKey};

    struct ByName;

    #[async_trait]
    impl Prober for ByName {
        async fn probe(&self, path: &Path) -> ProbeVerdict {
            if path.to_string_lossy().contains("broken") {
                ProbeVerdict::Invalid(format!("[missing stream] {}", path.display()))
            } else {
                ProbeVerdict::Valid
            }
        }
    }

    struct Never;

    impl CompanionLocator for Never {
        fn locate(&self, _dir_name: &str, _target: &Target) -> bool {
            false
        }
    }

    fn settings() -> CompletionSettings {
        CompletionSettings {
            min_segments: 2,
            stable: Duration::from_secs(5),
            live_check_interval: Duration::from_secs(90),
            final_inactive: Duration::from_secs(60),
            companion_attempts: 5,
            retention: Duration::from_secs(120),
            probe_workers: 4,
        }
    }

    fn snapshot(path: &Path) -> DirSnapshot {
        let segments = layout::list_segments(path).unwrap();
        DirSnapshot {
            path: path.to_path_buf(),
            name: layout::dir_name(path),
            target_id: "haruna".into(),
            date_bucket: "260301".into(),
            created_at: Utc::now(),
            earliest_segment: segments.iter().map(|s| s.modified).min(),
            latest_segment: segments.iter().map(|s| s.modified).max(),
            segment_count: segments.len(),
            manifested: layout::has_manifest(path),
        }
    }

    fn bare(name: &str) -> DirSnapshot {
        DirSnapshot {
            path: PathBuf::from("/nonexistent").join(name),
            name: name.to_string(),
            target_id: "haruna".into(),
            date_bucket: "260301".into(),
            created_at: Utc::now(),
            earliest_segment: None,
            latest_segment: None,
            segment_count: 0,
            manifested: false,
        }
    }

    fn capture_dir(root: &Path, files: &[&str]) -> PathBuf {
        let dir = root.join("260301 Showroom - Hashimoto Haruna 120000");
        fs::create_dir_all(&dir).unwrap();
        for f in files {
            fs::write(dir.join(f), b"x").unwrap();
        }
        dir
    }

    fn detector(output: &Path, companion: Arc<dyn CompanionLocator>) -> CompletionDetector {
        CompletionDetector::new(settings(), Arc::new(ByName), companion, output)
    }

    #[tokio::test]
    async fn incremental_probes_stable_segments_once_per_interval() {
        let root = tempfile::tempdir().unwrap();
        let dir = capture_dir(root.path(), &["000001.ts", "000002.ts", "000003.ts"]);
        let mut det = detector(&root.path().join("out"), Arc::new(NoCompanion));

        let now = Utc::now();
        // Fresh files are not stable yet.
        assert_eq!(det.check_incremental(&snapshot(&dir), now).await, 0);

        let later = now + chrono::Duration::seconds(120);
        assert_eq!(det.check_incremental(&snapshot(&dir), later).await, 3);

        fs::write(dir.join("000004.ts"), b"x").unwrap();
        let soon = later + chrono::Duration::seconds(30);
        assert_eq!(det.check_incremental(&snapshot(&dir), soon).await, 0);
        let next = later + chrono::Duration::seconds(100);
        assert_eq!(det.check_incremental(&snapshot(&dir), next).await, 1);
    }

    #[tokio::test]
    async fn finalize_writes_sorted_manifest_and_report() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        let dir = capture_dir(root.path(), &["000002.ts", "000001.ts", "broken.ts"]);
        let mut det = detector(&out, Arc::new(NoCompanion));

        let outcome = det.finalize(&snapshot(&dir), Utc::now()).await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Written { valid: 2, errors: 1 });

        let entries = layout::manifest_entries(&dir).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("000001.ts"));
        assert!(entries[1].contains("000002.ts"));

        let report = fs::read_to_string(layout::error_report_path(&out, &layout::dir_name(&dir))).unwrap();
        assert!(report.contains("broken.ts"));
    }

    #[tokio::test]
    async fn manifest_is_never_rewritten() {
        let root = tempfile::tempdir().unwrap();
        let dir = capture_dir(root.path(), &["000001.ts"]);
        fs::write(dir.join(layout::MANIFEST_NAME), "file '/elsewhere.ts'\n").unwrap();
        let mut det = detector(&root.path().join("out"), Arc::new(NoCompanion));

        let outcome = det.finalize(&snapshot(&dir), Utc::now()).await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::AlreadyManifested);
        assert_eq!(
            fs::read_to_string(dir.join(layout::MANIFEST_NAME)).unwrap(),
            "file '/elsewhere.ts'\n"
        );
        assert!(!write_once(&dir.join(layout::MANIFEST_NAME), "other").unwrap());
    }

    #[tokio::test]
    async fn empty_directory_gets_no_valid_marker() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        let dir = capture_dir(root.path(), &["broken.ts"]);
        let mut det = detector(&out, Arc::new(NoCompanion));

        let outcome = det.finalize(&snapshot(&dir), Utc::now()).await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Written { valid: 0, errors: 1 });
        assert!(layout::manifest_entries(&dir).unwrap().is_empty());
        assert!(layout::error_report_path(&out, &layout::dir_name(&dir)).exists());
    }

    #[test]
    fn ended_requires_definite_false_and_quiet_files() {
        let det = detector(Path::new("/tmp/out"), Arc::new(NoCompanion));
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut dir = bare("260301 Showroom - Hashimoto Haruna 120000");
        dir.latest_segment = Some(base);
        let session = Session {
            key: SessionKey { date_bucket: "260301".into(), target_id: "haruna".into(), sequence: 0 },
            dirs: vec![dir],
        };

        let quiet = base + chrono::Duration::seconds(61);
        assert!(det.is_ended(&session, Some(false), quiet));
        assert!(!det.is_ended(&session, None, quiet));
        assert!(!det.is_ended(&session, Some(true), quiet));
        assert!(!det.is_ended(&session, Some(false), base + chrono::Duration::seconds(30)));
    }

    #[test]
    fn companion_wait_forces_pass_after_attempts() {
        let mut det = detector(Path::new("/tmp/out"), Arc::new(Never));
        let dir = bare("260301 Showroom - Hashimoto Haruna 120000");
        let session = Session {
            key: SessionKey { date_bucket: "260301".into(), target_id: "haruna".into(), sequence: 0 },
            dirs: vec![dir],
        };
        let target = Target::new("haruna", "Hashimoto Haruna");

        for _ in 0..4 {
            assert!(!det.companion_ready(&session, &target));
        }
        assert!(det.companion_ready(&session, &target));
        assert_eq!(det.companion_checks(&session), 5);

        let seen: HashSet<PathBuf> = [session.dirs[0].path.clone()].into_iter().collect();
        det.cleanup(&seen, Utc::now());
        assert_eq!(det.companion_checks(&session), 5);
        det.cleanup(&HashSet::new(), Utc::now());
        assert_eq!(det.companion_checks(&session), 0);
    }
}
