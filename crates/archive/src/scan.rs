//! Snapshots of the capture root.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use tapedeck_core::naming::TargetMatcher;

use crate::grouper::DirSnapshot;
use crate::layout;

/// Every capture directory under `root` that still needs work: not a temp
/// directory, not merged and resolvable to a known target.
pub fn scan_capture_root(root: &Path, matcher: &TargetMatcher) -> Vec<DirSnapshot> {
    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if layout::is_ignored_dir(&name) || layout::is_merged(entry.path()) {
            continue;
        }
        let Some((parsed, matched)) = matcher.resolve_dir(&name) else {
            debug!(dir = %name, "capture directory matches no target, skipping");
            continue;
        };
        if matched.is_fallback() {
            debug!(dir = %name, target = %matched.target_id(), "directory matched by fallback name");
        }
        match snapshot_dir(entry.path(), &name, matched.target_id(), &parsed.date) {
            Ok(snapshot) => dirs.push(snapshot),
            Err(e) => warn!(dir = %name, error = %e, "failed to read capture directory"),
        }
    }
    dirs
}

pub fn snapshot_dir(
    path: &Path,
    name: &str,
    target_id: &str,
    date_bucket: &str,
) -> std::io::Result<DirSnapshot> {
    let meta = std::fs::metadata(path)?;
    let created = meta.created().or_else(|_| meta.modified())?;
    let segments = layout::list_segments(path)?;
    Ok(DirSnapshot {
        path: path.to_path_buf(),
        name: name.to_string(),
        target_id: target_id.to_string(),
        date_bucket: date_bucket.to_string(),
        created_at: DateTime::<Utc>::from(created),
        earliest_segment: segments.iter().map(|s| s.modified).min(),
        latest_segment: segments.iter().map(|s| s.modified).max(),
        segment_count: segments.len(),
        manifested: layout::has_manifest(path),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tapedeck_core::Target;

    use super::*;

    #[test]
    fn skips_temp_merged_and_unknown_directories() {
        let root = tempfile::tempdir().unwrap();
        let keep = root.path().join("260301 Showroom - AKB48 Team 8 Hashimoto Haruna 120000");
        let merged = root.path().join("260228 Showroom - AKB48 Team 8 Hashimoto Haruna 090000");
        let temp = root.path().join("temp_260301 Showroom - AKB48 Team 8 Hashimoto Haruna 130000");
        let unknown = root.path().join("260301 Showroom - AKB48 Team 4 Nobody Known 120000");
        for dir in [&keep, &merged, &temp, &unknown] {
            fs::create_dir(dir).unwrap();
        }
        fs::write(keep.join("000001.ts"), b"x").unwrap();
        fs::write(keep.join("000002.ts"), b"x").unwrap();
        fs::write(merged.join(layout::MERGED_MARKER), b"").unwrap();
        fs::write(root.path().join("stray.ts"), b"x").unwrap();

        let matcher = TargetMatcher::new(&[Target::new("hashimoto_haruna", "Hashimoto Haruna")]);
        let dirs = scan_capture_root(root.path(), &matcher);

        assert_eq!(dirs.len(), 1);
        let snap = &dirs[0];
        assert_eq!(snap.target_id, "hashimoto_haruna");
        assert_eq!(snap.date_bucket, "260301");
        assert_eq!(snap.segment_count, 2);
        assert!(snap.earliest_segment.is_some());
        assert!(!snap.manifested);
    }
}
