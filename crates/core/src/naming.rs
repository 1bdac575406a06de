//! Capture directory naming.
//!
//! Capture processes create one directory per broadcast attempt named
//! `YYMMDD <Platform> - <team info> <Name> HHMMSS`. [`CaptureDirName`] parses
//! that template and [`TargetMatcher`] resolves the subject part to a known
//! target. Resolution is structured: a target matches when its name words
//! appear as a contiguous run in the subject. A single fallback (the last two
//! subject words as `last_first`) is accepted only when it names a known
//! target, and is reported as such so callers can log it.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::target::{slugify, Target};

fn dir_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{6}) (\S+) - (.+) (\d{6})$").expect("static capture dir regex is valid")
    })
}

/// Date bucket token used in directory names (`%y%m%d`).
pub fn date_token(date: NaiveDate) -> String {
    date.format("%y%m%d").to_string()
}

/// Parsed form of a capture directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDirName {
    /// `YYMMDD` date bucket.
    pub date: String,
    pub platform: String,
    /// Everything between ` - ` and the trailing time token.
    pub subject: String,
    /// `HHMMSS` start time.
    pub time: String,
}

impl CaptureDirName {
    pub fn parse(name: &str) -> Option<Self> {
        let caps = dir_name_regex().captures(name)?;
        Some(Self {
            date: caps[1].to_string(),
            platform: caps[2].to_string(),
            subject: caps[3].trim().to_string(),
            time: caps[4].to_string(),
        })
    }

    pub fn naive_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date, "%y%m%d").ok()
    }
}

/// How a directory or argument was tied to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    Structured(String),
    /// Matched only through the `last_first` heuristic.
    Fallback(String),
}

impl NameMatch {
    pub fn target_id(&self) -> &str {
        match self {
            NameMatch::Structured(id) | NameMatch::Fallback(id) => id,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, NameMatch::Fallback(_))
    }
}

#[derive(Debug, Clone)]
struct NameEntry {
    target_id: String,
    words: Vec<String>,
}

/// Resolves names found on disk or in process arguments to target ids.
#[derive(Debug, Clone, Default)]
pub struct TargetMatcher {
    entries: Vec<NameEntry>,
    ids: HashSet<String>,
}

impl TargetMatcher {
    pub fn new(targets: &[Target]) -> Self {
        let entries = targets
            .iter()
            .map(|t| NameEntry {
                target_id: t.id.clone(),
                words: lower_words(t.capture_name()),
            })
            .filter(|e| !e.words.is_empty())
            .collect();
        let ids = targets.iter().map(|t| t.id.clone()).collect();
        Self { entries, ids }
    }

    pub fn is_known(&self, target_id: &str) -> bool {
        self.ids.contains(target_id)
    }

    /// Resolve the subject part of a directory name.
    ///
    /// The longest matching name wins; two different targets matching with
    /// the same length is ambiguous and yields `None`.
    pub fn resolve_subject(&self, subject: &str) -> Option<NameMatch> {
        let words: Vec<String> = lower_words(subject)
            .into_iter()
            .filter(|w| !is_time_token(w))
            .collect();

        let mut best: Option<(&NameEntry, bool)> = None;
        for entry in &self.entries {
            if !contains_run(&words, &entry.words) {
                continue;
            }
            best = match best {
                None => Some((entry, false)),
                Some((current, _)) if entry.words.len() > current.words.len() => Some((entry, false)),
                Some((current, _)) if entry.words.len() == current.words.len()
                    && entry.target_id != current.target_id =>
                {
                    Some((current, true))
                }
                other => other,
            };
        }

        match best {
            Some((entry, false)) => return Some(NameMatch::Structured(entry.target_id.clone())),
            Some((_, true)) => return None,
            None => {}
        }

        if words.len() >= 2 {
            let slug = format!("{}_{}", words[words.len() - 2], words[words.len() - 1]);
            if self.ids.contains(&slug) {
                return Some(NameMatch::Fallback(slug));
            }
        }
        None
    }

    /// Resolve a full directory name; `None` when the template or the
    /// subject does not match.
    pub fn resolve_dir(&self, dir_name: &str) -> Option<(CaptureDirName, NameMatch)> {
        let parsed = CaptureDirName::parse(dir_name)?;
        let matched = self.resolve_subject(&parsed.subject)?;
        Some((parsed, matched))
    }

    /// Resolve the capture-name argument of a running capture process.
    pub fn resolve_capture_arg(&self, arg: &str) -> Option<NameMatch> {
        let words = lower_words(arg);
        if let Some(entry) = self.entries.iter().find(|e| e.words == words) {
            return Some(NameMatch::Structured(entry.target_id.clone()));
        }
        let slug = slugify(arg);
        if self.ids.contains(&slug) {
            return Some(NameMatch::Fallback(slug));
        }
        None
    }
}

fn lower_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_lowercase).collect()
}

fn is_time_token(w: &str) -> bool {
    w.len() == 6 && w.bytes().all(|b| b.is_ascii_digit())
}

fn contains_run(haystack: &[String], needle: &[String]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<Target> {
        let mut override_target = Target::new("yui_oguri", "Oguri Yui");
        override_target.naming_override = Some("Yuiyui".into());
        vec![
            Target::new("hashimoto_haruna", "Hashimoto Haruna"),
            Target::new("kyoka", "Kyoka"),
            Target::new("kyoka_shinohara", "Shinohara Kyoka"),
            override_target,
        ]
    }

    #[test]
    fn parses_template() {
        let parsed = CaptureDirName::parse("240312 Showroom - AKB48 Team 8 Hashimoto Haruna 193000").unwrap();
        assert_eq!(parsed.date, "240312");
        assert_eq!(parsed.platform, "Showroom");
        assert_eq!(parsed.subject, "AKB48 Team 8 Hashimoto Haruna");
        assert_eq!(parsed.time, "193000");
        assert_eq!(parsed.naive_date(), NaiveDate::from_ymd_opt(2024, 3, 12));
    }

    #[test]
    fn rejects_other_names() {
        assert!(CaptureDirName::parse("temp_240312 Showroom - X 193000").is_none());
        assert!(CaptureDirName::parse("240312 Showroom X 193000").is_none());
        assert!(CaptureDirName::parse("merged").is_none());
    }

    #[test]
    fn structured_match_prefers_longest_name() {
        let m = TargetMatcher::new(&targets());
        let hit = m.resolve_subject("AKB48 Team 8 Shinohara Kyoka").unwrap();
        assert_eq!(hit, NameMatch::Structured("kyoka_shinohara".into()));
        let hit = m.resolve_subject("Team A Kyoka").unwrap();
        assert_eq!(hit, NameMatch::Structured("kyoka".into()));
    }

    #[test]
    fn naming_override_is_used() {
        let m = TargetMatcher::new(&targets());
        let (_, hit) = m.resolve_dir("240312 Showroom - AKB48 Yuiyui 101010").unwrap();
        assert_eq!(hit.target_id(), "yui_oguri");
    }

    #[test]
    fn fallback_only_for_known_ids() {
        let m = TargetMatcher::new(&[Target::new("hashimoto_haruna", "Haruna H")]);
        let hit = m.resolve_subject("AKB48 Team 8 Hashimoto Haruna").unwrap();
        assert!(hit.is_fallback());
        assert_eq!(hit.target_id(), "hashimoto_haruna");
        assert!(m.resolve_subject("AKB48 Team 8 Someone Else").is_none());
    }

    #[test]
    fn capture_arg_resolution() {
        let m = TargetMatcher::new(&targets());
        assert_eq!(
            m.resolve_capture_arg("Hashimoto Haruna"),
            Some(NameMatch::Structured("hashimoto_haruna".into()))
        );
        assert_eq!(m.resolve_capture_arg("Nobody Here"), None);
    }

    #[test]
    fn date_token_format() {
        let d = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        assert_eq!(date_token(d), "250109");
    }
}
