//! Filesystem conventions for capture directories and the output tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Completion manifest written once per capture directory.
pub const MANIFEST_NAME: &str = "filelist.txt";
/// Per-directory marker written after the session's artifact is produced.
pub const MERGED_MARKER: &str = ".merged";
pub const SEGMENT_EXT: &str = "ts";
pub const ARTIFACT_EXT: &str = "mp4";
/// Directories still being set up by a capture are prefixed with this.
pub const TEMP_PREFIX: &str = "temp_";

const ENTRY_PREFIX: &str = "file '";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Segment files directly inside `dir`, sorted by name.
pub fn list_segments(dir: &Path) -> io::Result<Vec<SegmentFile>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        segments.push(SegmentFile {
            path,
            modified: DateTime::<Utc>::from(meta.modified()?),
        });
    }
    segments.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(segments)
}

pub fn has_manifest(dir: &Path) -> bool {
    dir.join(MANIFEST_NAME).exists()
}

pub fn is_merged(dir: &Path) -> bool {
    dir.join(MERGED_MARKER).exists()
}

pub fn is_ignored_dir(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) || name.starts_with('.')
}

/// One concat-list line for `path`. Single quotes are escaped the way the
/// concat demuxer expects.
pub fn manifest_line(path: &Path) -> String {
    let escaped = path.display().to_string().replace('\'', r"'\''");
    format!("{ENTRY_PREFIX}{escaped}'")
}

/// Manifest body: one line per validated segment, or a comment marking the
/// directory as checked with nothing usable.
pub fn render_manifest(valid: &[PathBuf], checked_at: DateTime<Utc>) -> String {
    if valid.is_empty() {
        return format!("# No valid segments found. Marked as checked at {}\n", checked_at.to_rfc3339());
    }
    let mut body = String::new();
    for path in valid {
        body.push_str(&manifest_line(path));
        body.push('\n');
    }
    body
}

/// Concat-list lines of a directory's manifest; comments and blanks dropped.
pub fn manifest_entries(dir: &Path) -> io::Result<Vec<String>> {
    let raw = fs::read_to_string(dir.join(MANIFEST_NAME))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(ENTRY_PREFIX))
        .map(str::to_string)
        .collect())
}

pub fn artifact_path(output_dir: &Path, dir_name: &str) -> PathBuf {
    output_dir.join(format!("{dir_name}.{ARTIFACT_EXT}"))
}

pub fn error_report_path(output_dir: &Path, dir_name: &str) -> PathBuf {
    output_dir.join(format!("{dir_name}_log.txt"))
}

pub fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_only_entries() {
        let dir = tempfile::tempdir().unwrap();
        let body = render_manifest(
            &[PathBuf::from("/rec/a/000001.ts"), PathBuf::from("/rec/it's/000002.ts")],
            Utc::now(),
        );
        fs::write(dir.path().join(MANIFEST_NAME), format!("# header\n\n{body}")).unwrap();

        let entries = manifest_entries(dir.path()).unwrap();
        assert_eq!(
            entries,
            vec!["file '/rec/a/000001.ts'".to_string(), r"file '/rec/it'\''s/000002.ts'".to_string()]
        );
    }

    #[test]
    fn empty_manifest_is_a_comment() {
        let body = render_manifest(&[], Utc::now());
        assert!(body.starts_with("# No valid segments"));
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), body).unwrap();
        assert!(manifest_entries(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn only_segment_files_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("000002.ts"), b"x").unwrap();
        fs::write(dir.path().join("000001.ts"), b"x").unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), b"").unwrap();
        fs::create_dir(dir.path().join("nested.ts")).unwrap();

        let names: Vec<String> = list_segments(dir.path())
            .unwrap()
            .iter()
            .map(|s| dir_name(&s.path))
            .collect();
        assert_eq!(names, vec!["000001.ts", "000002.ts"]);
    }

    #[test]
    fn ignored_directory_names() {
        assert!(is_ignored_dir("temp_260301 Showroom - X 120000"));
        assert!(is_ignored_dir(".temp"));
        assert!(!is_ignored_dir("260301 Showroom - X 120000"));
    }
}
