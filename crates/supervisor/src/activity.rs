//! Is a capture still producing segments?

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Days, Local, Utc};
use tracing::debug;

use tapedeck_core::naming::{date_token, TargetMatcher};
use tapedeck_core::Target;

/// Completion manifest name; never treated as a stop marker.
pub const MANIFEST_NAME: &str = "filelist.txt";
const SEGMENT_EXT: &str = "ts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NoDirectory,
    NoSegments,
    StopMarker(PathBuf),
    Inactive { idle: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Fresh,
    /// Nothing on disk yet but the capture is inside its start grace.
    Starting,
    Stale(StaleReason),
}

impl Activity {
    pub fn is_stale(&self) -> bool {
        matches!(self, Activity::Stale(_))
    }
}

pub trait ActivityProbe: Send {
    /// Judge the capture for `target`, which has been running since `since`.
    fn check(&self, target: &Target, now: DateTime<Utc>, since: DateTime<Utc>) -> Activity;

    /// Called after the target catalog changes.
    fn retarget(&mut self, _targets: &[Target]) {}
}

/// [`ActivityProbe`] that inspects the capture directories on disk.
pub struct SegmentActivity {
    root: PathBuf,
    matcher: TargetMatcher,
    inactivity: Duration,
    start_grace: Duration,
}

impl SegmentActivity {
    pub fn new(root: impl Into<PathBuf>, inactivity: Duration, start_grace: Duration) -> Self {
        Self {
            root: root.into(),
            matcher: TargetMatcher::default(),
            inactivity,
            start_grace,
        }
    }

    /// Newest directory of `target` dated today or yesterday (local time).
    fn newest_dir(&self, target: &Target, now: DateTime<Utc>) -> Option<PathBuf> {
        let today = now.with_timezone(&Local).date_naive();
        let buckets: Vec<String> = [Some(today), today.checked_sub_days(Days::new(1))]
            .into_iter()
            .flatten()
            .map(date_token)
            .collect();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(root = %self.root.display(), error = %e, "capture root unreadable");
                return None;
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let (parsed, matched) = self.matcher.resolve_dir(&name)?;
                if matched.target_id() != target.id || !buckets.contains(&parsed.date) {
                    return None;
                }
                Some(((parsed.date, parsed.time), entry.path()))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, path)| path)
    }

    fn within_grace(&self, now: DateTime<Utc>, since: DateTime<Utc>) -> bool {
        (now - since).to_std().map(|d| d < self.start_grace).unwrap_or(true)
    }
}

/// Stop marker file and newest segment modification time in `dir`.
fn scan_dir(dir: &Path) -> (Option<PathBuf>, Option<DateTime<Utc>>) {
    let mut marker = None;
    let mut newest: Option<DateTime<Utc>> = None;
    let Ok(entries) = fs::read_dir(dir) else {
        return (None, None);
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str());
        match ext {
            Some("txt") if entry.file_name() != MANIFEST_NAME => marker = Some(path),
            Some(SEGMENT_EXT) => {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from);
                if let Ok(modified) = modified {
                    newest = Some(newest.map_or(modified, |n| n.max(modified)));
                }
            }
            _ => {}
        }
    }
    (marker, newest)
}

impl ActivityProbe for SegmentActivity {
    fn check(&self, target: &Target, now: DateTime<Utc>, since: DateTime<Utc>) -> Activity {
        let Some(dir) = self.newest_dir(target, now) else {
            return if self.within_grace(now, since) {
                Activity::Starting
            } else {
                Activity::Stale(StaleReason::NoDirectory)
            };
        };

        let (marker, newest) = scan_dir(&dir);
        if let Some(marker) = marker {
            return Activity::Stale(StaleReason::StopMarker(marker));
        }
        let Some(newest) = newest else {
            return if self.within_grace(now, since) {
                Activity::Starting
            } else {
                Activity::Stale(StaleReason::NoSegments)
            };
        };

        let idle = (now - newest).to_std().unwrap_or_default();
        if idle > self.inactivity {
            Activity::Stale(StaleReason::Inactive { idle })
        } else {
            Activity::Fresh
        }
    }

    fn retarget(&mut self, targets: &[Target]) {
        self.matcher = TargetMatcher::new(targets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_name(now: DateTime<Utc>, name: &str, time: &str) -> String {
        let date = date_token(now.with_timezone(&Local).date_naive());
        format!("{date} Showroom - AKB48 Team 8 {name} {time}")
    }

    fn probe(root: &Path) -> SegmentActivity {
        let mut p = SegmentActivity::new(root, Duration::from_secs(120), Duration::from_secs(35));
        p.retarget(&[Target::new("hashimoto_haruna", "Hashimoto Haruna")]);
        p
    }

    fn target() -> Target {
        Target::new("hashimoto_haruna", "Hashimoto Haruna")
    }

    #[test]
    fn missing_directory_is_starting_then_stale() {
        let root = tempfile::tempdir().unwrap();
        let p = probe(root.path());
        let now = Utc::now();
        assert_eq!(p.check(&target(), now, now), Activity::Starting);
        assert_eq!(
            p.check(&target(), now, now - chrono::Duration::seconds(60)),
            Activity::Stale(StaleReason::NoDirectory)
        );
    }

    #[test]
    fn recent_segment_is_fresh_and_old_one_is_stale() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let dir = root.path().join(dir_name(now, "Hashimoto Haruna", "120000"));
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("000001.ts"), b"x").unwrap();
        fs::write(dir.join(MANIFEST_NAME), b"").unwrap();

        let p = probe(root.path());
        let since = now - chrono::Duration::seconds(600);
        assert_eq!(p.check(&target(), Utc::now(), since), Activity::Fresh);

        let later = Utc::now() + chrono::Duration::seconds(300);
        assert!(matches!(
            p.check(&target(), later, since),
            Activity::Stale(StaleReason::Inactive { .. })
        ));
    }

    #[test]
    fn stop_marker_wins_over_fresh_segments() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let dir = root.path().join(dir_name(now, "Hashimoto Haruna", "120000"));
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("000001.ts"), b"x").unwrap();
        fs::write(dir.join("stopped.txt"), b"").unwrap();

        let activity = probe(root.path()).check(&target(), now, now);
        assert!(matches!(activity, Activity::Stale(StaleReason::StopMarker(_))));
    }

    #[test]
    fn newest_directory_by_name_time_is_inspected() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let old = root.path().join(dir_name(now, "Hashimoto Haruna", "080000"));
        let new = root.path().join(dir_name(now, "Hashimoto Haruna", "090000"));
        fs::create_dir(&old).unwrap();
        fs::create_dir(&new).unwrap();
        fs::write(old.join("000001.ts"), b"x").unwrap();

        let since = now - chrono::Duration::seconds(600);
        assert_eq!(
            probe(root.path()).check(&target(), now, since),
            Activity::Stale(StaleReason::NoSegments)
        );
    }

    #[test]
    fn other_targets_directories_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let dir = root.path().join(dir_name(now, "Someone Else", "120000"));
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("000001.ts"), b"x").unwrap();

        let since = now - chrono::Duration::seconds(600);
        assert_eq!(
            probe(root.path()).check(&target(), now, since),
            Activity::Stale(StaleReason::NoDirectory)
        );
    }
}
