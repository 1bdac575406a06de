//! Clustering capture directories into sessions.
//!
//! A capture restarts into a fresh directory whenever it reconnects, so one
//! broadcast often spans several directories. Directories of one target are
//! walked in creation order; a directory joins the running session when its
//! first segment follows the session's last segment within the continuity
//! threshold. When either side has no segments yet, the directories'
//! creation times are compared against a much longer threshold instead.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use tapedeck_core::config::ArchiveConfig;

/// `(date bucket of the first directory, target, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub date_bucket: String,
    pub target_id: String,
    pub sequence: usize,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.date_bucket, self.target_id, self.sequence)
    }
}

/// Point-in-time view of one capture directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSnapshot {
    pub path: PathBuf,
    pub name: String,
    pub target_id: String,
    pub date_bucket: String,
    pub created_at: DateTime<Utc>,
    pub earliest_segment: Option<DateTime<Utc>>,
    pub latest_segment: Option<DateTime<Utc>>,
    pub segment_count: usize,
    pub manifested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub key: SessionKey,
    /// Creation order; the first directory names the merged artifact.
    pub dirs: Vec<DirSnapshot>,
}

impl Session {
    pub fn earliest(&self) -> Option<&DirSnapshot> {
        self.dirs.first()
    }

    pub fn all_manifested(&self) -> bool {
        !self.dirs.is_empty() && self.dirs.iter().all(|d| d.manifested)
    }

    pub fn latest_segment(&self) -> Option<DateTime<Utc>> {
        self.dirs.iter().filter_map(|d| d.latest_segment).max()
    }
}

#[derive(Debug, Clone)]
pub struct GroupingRules {
    pub continuity: Duration,
    pub dir_fallback: Duration,
    pub max_dirs: usize,
}

impl From<&ArchiveConfig> for GroupingRules {
    fn from(cfg: &ArchiveConfig) -> Self {
        Self {
            continuity: Duration::from_secs(cfg.continuity_secs),
            dir_fallback: Duration::from_secs(cfg.dir_fallback_secs),
            max_dirs: cfg.max_dirs_per_session.max(1),
        }
    }
}

/// `later - earlier` below `limit`; overlap counts as continuous.
fn within(earlier: DateTime<Utc>, later: DateTime<Utc>, limit: Duration) -> bool {
    (later - earlier).to_std().map(|gap| gap < limit).unwrap_or(true)
}

fn continues(session: &[DirSnapshot], candidate: &DirSnapshot, rules: &GroupingRules) -> bool {
    let Some(last) = session.last() else {
        return true;
    };
    let session_latest = session.iter().filter_map(|d| d.latest_segment).max();
    match (session_latest, candidate.earliest_segment) {
        (Some(prev), Some(next)) => within(prev, next, rules.continuity),
        _ => within(last.created_at, candidate.created_at, rules.dir_fallback),
    }
}

/// Partition directories into sessions, ordered by key.
pub fn group_sessions(dirs: Vec<DirSnapshot>, rules: &GroupingRules) -> Vec<Session> {
    let mut by_target: BTreeMap<String, Vec<DirSnapshot>> = BTreeMap::new();
    for dir in dirs {
        by_target.entry(dir.target_id.clone()).or_default().push(dir);
    }

    let mut sessions = Vec::new();
    for (target_id, mut dirs) in by_target {
        dirs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));

        let mut current: Vec<DirSnapshot> = Vec::new();
        let mut sequence = 0;
        for dir in dirs {
            if current.is_empty() || continues(&current, &dir, rules) {
                current.push(dir);
                continue;
            }
            sessions.push(close(&target_id, sequence, std::mem::take(&mut current), rules));
            sequence += 1;
            current.push(dir);
        }
        if !current.is_empty() {
            sessions.push(close(&target_id, sequence, current, rules));
        }
    }
    sessions.sort_by(|a, b| a.key.cmp(&b.key));
    sessions
}

fn close(target_id: &str, sequence: usize, mut dirs: Vec<DirSnapshot>, rules: &GroupingRules) -> Session {
    if dirs.len() > rules.max_dirs {
        tracing::debug!(
            target = %target_id,
            dirs = dirs.len(),
            max = rules.max_dirs,
            "session capped, later directories wait for a later cycle"
        );
        dirs.truncate(rules.max_dirs);
    }
    let date_bucket = dirs.first().map(|d| d.date_bucket.clone()).unwrap_or_default();
    Session {
        key: SessionKey {
            date_bucket,
            target_id: target_id.to_string(),
            sequence,
        },
        dirs,
    }
}
