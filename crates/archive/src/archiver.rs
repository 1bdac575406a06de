//! One detection cycle over the capture root.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tapedeck_core::naming::TargetMatcher;
use tapedeck_core::Target;
use tapedeck_store::LiveStatusRepo;

use crate::completion::{CompletionDetector, FinalizeOutcome};
use crate::grouper::{group_sessions, GroupingRules, Session};
use crate::layout;
use crate::merge::{MergeJob, MergeQueue};
use crate::scan::scan_capture_root;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub dirs: usize,
    pub sessions: usize,
    /// Segments probed incrementally this cycle.
    pub probed: usize,
    pub finalized: usize,
    /// Ended sessions still waiting for their companion.
    pub waiting: usize,
    pub enqueued: usize,
}

impl CycleSummary {
    pub fn is_quiet(&self) -> bool {
        self.probed == 0 && self.finalized == 0 && self.waiting == 0 && self.enqueued == 0
    }
}

pub struct Archiver {
    root: PathBuf,
    rules: GroupingRules,
    matcher: TargetMatcher,
    targets: HashMap<String, Target>,
    detector: CompletionDetector,
    live: Arc<dyn LiveStatusRepo>,
    merges: MergeQueue,
}

impl Archiver {
    pub fn new(
        root: impl Into<PathBuf>,
        rules: GroupingRules,
        detector: CompletionDetector,
        live: Arc<dyn LiveStatusRepo>,
        merges: MergeQueue,
    ) -> Self {
        Self {
            root: root.into(),
            rules,
            matcher: TargetMatcher::default(),
            targets: HashMap::new(),
            detector,
            live,
            merges,
        }
    }

    pub fn set_targets(&mut self, targets: Vec<Target>) {
        self.matcher = TargetMatcher::new(&targets);
        self.targets = targets.into_iter().map(|t| (t.id.clone(), t)).collect();
    }

    pub fn pending_merges(&self) -> usize {
        self.merges.pending()
    }

    /// Stop queueing merges; the worker exits once its queue is empty.
    pub fn close_merges(&mut self) {
        self.merges.close();
    }

    /// `Some(false)` for a target without a live row; `None` when the store
    /// cannot answer.
    async fn live_state(&self, target_id: &str) -> Option<bool> {
        match self.live.is_live(target_id).await {
            Ok(state) => Some(state.unwrap_or(false)),
            Err(e) => {
                warn!(target = %target_id, error = %e, "live state unavailable, treating session as running");
                None
            }
        }
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleSummary {
        // Settle first so a merge that finished since the last cycle is no
        // longer pending when its session shows up in the scan.
        for report in self.merges.settle(now) {
            debug!(session = %report.key, ok = report.result.is_ok(), "merge report");
        }

        let root = self.root.clone();
        let matcher = self.matcher.clone();
        let dirs = match tokio::task::spawn_blocking(move || scan_capture_root(&root, &matcher)).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(error = %e, "capture root scan panicked");
                return CycleSummary::default();
            }
        };
        let seen_dirs: HashSet<PathBuf> = dirs.iter().map(|d| d.path.clone()).collect();
        let sessions = group_sessions(dirs, &self.rules);

        let mut summary = CycleSummary {
            dirs: seen_dirs.len(),
            sessions: sessions.len(),
            ..Default::default()
        };

        let mut live_cache: HashMap<String, Option<bool>> = HashMap::new();
        for session in &sessions {
            if session.all_manifested() {
                summary.enqueued += usize::from(self.enqueue(session, now));
                continue;
            }

            let target_id = session.key.target_id.clone();
            let live = match live_cache.get(&target_id) {
                Some(state) => *state,
                None => {
                    let state = self.live_state(&target_id).await;
                    live_cache.insert(target_id.clone(), state);
                    state
                }
            };

            if !self.detector.is_ended(session, live, now) {
                for dir in &session.dirs {
                    summary.probed += self.detector.check_incremental(dir, now).await;
                }
                continue;
            }

            let target = self
                .targets
                .get(&target_id)
                .cloned()
                .unwrap_or_else(|| Target::new(target_id.clone(), target_id.clone()));
            if !self.detector.companion_ready(session, &target) {
                summary.waiting += 1;
                continue;
            }

            summary.finalized += self.finalize_session(session, now).await;
            if session.dirs.iter().all(|d| layout::has_manifest(&d.path)) {
                summary.enqueued += usize::from(self.enqueue(session, now));
            }
        }

        self.detector.cleanup(&seen_dirs, now);
        summary
    }

    async fn finalize_session(&mut self, session: &Session, now: DateTime<Utc>) -> usize {
        info!(session = %session.key, dirs = session.dirs.len(), "session ended, finalizing");
        let mut written = 0;
        for dir in session.dirs.iter().filter(|d| !d.manifested) {
            match self.detector.finalize(dir, now).await {
                Ok(FinalizeOutcome::Written { .. }) => written += 1,
                Ok(FinalizeOutcome::AlreadyManifested) => {}
                Err(e) => warn!(dir = %dir.name, error = %e, "failed to finalize directory"),
            }
        }
        written
    }

    fn enqueue(&mut self, session: &Session, now: DateTime<Utc>) -> bool {
        match MergeJob::from_session(session) {
            Some(job) => self.merges.enqueue(job, now),
            None => false,
        }
    }
}
