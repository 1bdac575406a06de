//! Broadcast targets: the people whose streams get captured.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One capture target. Immutable between catalog reloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier, e.g. `shinohara_kyoka`.
    pub id: String,
    /// Romanized name as it appears in directory names and capture arguments.
    pub display_name: String,
    #[serde(default)]
    pub local_name: Option<String>,
    #[serde(default)]
    pub room_id: Option<i64>,
    /// Free-form team string, e.g. `AKB48 Team 8`.
    #[serde(default)]
    pub team: Option<String>,
    /// Explicit stream key; derived from the display name when absent.
    #[serde(default)]
    pub stream_key: Option<String>,
    /// Name token used in capture arguments and directory names instead of
    /// the display name.
    #[serde(default)]
    pub naming_override: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Target {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            local_name: None,
            room_id: None,
            team: None,
            stream_key: None,
            naming_override: None,
            enabled: true,
        }
    }

    /// Key sent to the status endpoint.
    ///
    /// A two-word display name `First Last` becomes `48_Last_First`; anything
    /// else has its spaces replaced by underscores.
    pub fn stream_key(&self) -> String {
        if let Some(key) = &self.stream_key {
            return key.clone();
        }
        let parts: Vec<&str> = self.display_name.split_whitespace().collect();
        if parts.len() == 2 {
            format!("48_{}_{}", parts[1], parts[0])
        } else {
            parts.join("_")
        }
    }

    /// Name handed to the capture command and expected in directory names.
    pub fn capture_name(&self) -> &str {
        self.naming_override.as_deref().unwrap_or(&self.display_name)
    }

    /// `(group_name, team_name)`: the team string split at its first space.
    pub fn team_parts(&self) -> (Option<&str>, Option<&str>) {
        match self.team.as_deref().map(str::trim) {
            None | Some("") => (None, None),
            Some(team) => match team.split_once(' ') {
                Some((group, rest)) => (Some(group), Some(rest.trim())),
                None => (Some(team), None),
            },
        }
    }
}

/// Identifier form of a name: lowercase, whitespace runs become `_`.
pub fn slugify(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Load a YAML target catalog (a sequence of [`Target`] records).
pub fn load_targets_file(path: &Path) -> Result<Vec<Target>> {
    let raw = std::fs::read_to_string(path)?;
    let targets: Vec<Target> = serde_yaml::from_str(&raw)?;
    Ok(targets)
}
