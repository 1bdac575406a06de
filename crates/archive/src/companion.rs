//! Companion subtitle lookup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use tapedeck_core::naming::CaptureDirName;
use tapedeck_core::Target;

pub trait CompanionLocator: Send + Sync {
    /// Whether the companion artifact for the session whose earliest
    /// directory is `dir_name` is available.
    fn locate(&self, dir_name: &str, target: &Target) -> bool;
}

/// No companion artifacts are produced; sessions never wait.
pub struct NoCompanion;

impl CompanionLocator for NoCompanion {
    fn locate(&self, _dir_name: &str, _target: &Target) -> bool {
        true
    }
}

/// Subtitles under `{root}/{YYYY-MM-DD}/{subpath}/{dir name}.ass`.
///
/// When the exact file is missing, a same-day subtitle whose name starts
/// with the date token and contains the target's name (or surname) is
/// symlinked under the exact name.
pub struct SubtitleLocator {
    root: PathBuf,
    subpath: String,
}

impl SubtitleLocator {
    pub fn new(root: impl Into<PathBuf>, subpath: impl Into<String>) -> Self {
        Self { root: root.into(), subpath: subpath.into() }
    }

    fn day_dir(&self, parsed: &CaptureDirName) -> Option<PathBuf> {
        let date = parsed.naive_date()?;
        Some(
            self.root
                .join(date.format("%Y-%m-%d").to_string())
                .join(&self.subpath),
        )
    }

    fn fuzzy_match(&self, day_dir: &Path, date: &str, target: &Target) -> Option<PathBuf> {
        let entries: Vec<String> = fs::read_dir(day_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(date) && name.ends_with(".ass"))
            .collect();

        let name = target.capture_name().to_lowercase();
        let surname = name.split_whitespace().next().unwrap_or_default().to_string();
        [name, surname]
            .iter()
            .filter(|needle| !needle.is_empty())
            .find_map(|needle| {
                let mut hits: Vec<&String> =
                    entries.iter().filter(|f| f.to_lowercase().contains(needle.as_str())).collect();
                hits.sort();
                hits.first().map(|f| day_dir.join(f))
            })
    }
}

fn link(source: &Path, exact: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, exact)
    }
    #[cfg(not(unix))]
    {
        fs::copy(source, exact).map(|_| ())
    }
}

impl CompanionLocator for SubtitleLocator {
    fn locate(&self, dir_name: &str, target: &Target) -> bool {
        let Some(parsed) = CaptureDirName::parse(dir_name) else {
            return false;
        };
        let Some(day_dir) = self.day_dir(&parsed) else {
            return false;
        };
        let exact = day_dir.join(format!("{dir_name}.ass"));
        if exact.exists() {
            return true;
        }

        let Some(source) = self.fuzzy_match(&day_dir, &parsed.date, target) else {
            return false;
        };
        match link(&source, &exact) {
            Ok(()) => {
                info!(dir = %dir_name, subtitle = %source.display(), "linked mismatched subtitle");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => true,
            Err(e) => {
                warn!(dir = %dir_name, error = %e, "failed to link subtitle");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: &str = "260301 Showroom - AKB48 Team 8 Hashimoto Haruna 120000";

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let day = root.path().join("2026-03-01").join("AKB48/comments");
        fs::create_dir_all(&day).unwrap();
        (root, day)
    }

    #[test]
    fn exact_subtitle_is_found() {
        let (root, day) = setup();
        fs::write(day.join(format!("{DIR}.ass")), b"").unwrap();
        let locator = SubtitleLocator::new(root.path(), "AKB48/comments");
        assert!(locator.locate(DIR, &Target::new("hashimoto_haruna", "Hashimoto Haruna")));
    }

    #[test]
    fn near_miss_is_linked_under_exact_name() {
        let (root, day) = setup();
        fs::write(day.join("260301 Showroom - AKB48 Hashimoto Haruna 115959.ass"), b"sub").unwrap();
        let locator = SubtitleLocator::new(root.path(), "AKB48/comments");

        assert!(locator.locate(DIR, &Target::new("hashimoto_haruna", "Hashimoto Haruna")));
        let exact = day.join(format!("{DIR}.ass"));
        assert_eq!(fs::read(&exact).unwrap(), b"sub");
    }

    #[test]
    fn missing_subtitle_is_not_found() {
        let (root, day) = setup();
        fs::write(day.join("260228 Showroom - Hashimoto Haruna 115959.ass"), b"").unwrap();
        let locator = SubtitleLocator::new(root.path(), "AKB48/comments");
        assert!(!locator.locate(DIR, &Target::new("hashimoto_haruna", "Hashimoto Haruna")));
        assert!(!locator.locate("not a capture dir", &Target::new("x", "X")));
    }
}
