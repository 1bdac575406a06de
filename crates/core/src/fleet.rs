//! Worker instances and the assignments that bind targets to them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TapedeckError;

/// `assigned_by` value written by the automatic live-transition policy.
pub const AUTO_ON_LIVE: &str = "auto-on-live";

/// `assigned_by` value for operator overrides.
pub const MANUAL: &str = "manual";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Poller,
    Capture,
    Archive,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Poller => "poller",
            WorkerType::Capture => "capture",
            WorkerType::Archive => "archive",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poller" => Ok(WorkerType::Poller),
            "capture" | "recorder" => Ok(WorkerType::Capture),
            "archive" => Ok(WorkerType::Archive),
            other => Err(TapedeckError::InvalidValue {
                field: "worker type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Maintenance,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Inactive => "inactive",
            WorkerStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "inactive" => Ok(WorkerStatus::Inactive),
            "maintenance" => Ok(WorkerStatus::Maintenance),
            other => Err(TapedeckError::InvalidValue {
                field: "worker status",
                value: other.to_string(),
            }),
        }
    }
}

/// A registered process in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub instance_id: String,
    pub worker_type: WorkerType,
    pub display_name: Option<String>,
    pub max_capacity: i32,
    pub status: WorkerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// An active worker together with its derived load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub instance_id: String,
    pub max_capacity: i32,
    /// Number of enabled assignments pointing at the worker.
    pub current_load: i64,
}

impl WorkerLoad {
    pub fn available(&self) -> i64 {
        i64::from(self.max_capacity) - self.current_load
    }

    pub fn load_percent(&self) -> f64 {
        if self.max_capacity <= 0 {
            return 0.0;
        }
        self.current_load as f64 * 100.0 / f64::from(self.max_capacity)
    }

    pub fn is_saturated(&self) -> bool {
        self.available() <= 0
    }
}

/// Binding of a target to a worker of a given type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub target_id: String,
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub enabled: bool,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
}

impl Assignment {
    pub fn is_automatic(&self) -> bool {
        self.assigned_by == AUTO_ON_LIVE
    }
}

/// Shard index encoded in an instance id's trailing letter: `poller-a` → 0.
pub fn instance_index(instance_id: &str) -> Option<usize> {
    let last = instance_id.chars().last()?;
    if last.is_ascii_alphabetic() {
        Some((last.to_ascii_lowercase() as u8 - b'a') as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_index_from_trailing_letter() {
        assert_eq!(instance_index("poller-a"), Some(0));
        assert_eq!(instance_index("poller-C"), Some(2));
        assert_eq!(instance_index("poller-1"), None);
        assert_eq!(instance_index(""), None);
    }

    #[test]
    fn worker_type_round_trips_through_str() {
        for t in [WorkerType::Poller, WorkerType::Capture, WorkerType::Archive] {
            assert_eq!(t.as_str().parse::<WorkerType>().unwrap(), t);
        }
        assert_eq!("recorder".parse::<WorkerType>().unwrap(), WorkerType::Capture);
        assert!("bogus".parse::<WorkerType>().is_err());
    }

    #[test]
    fn load_math() {
        let load = WorkerLoad { instance_id: "rec-a".into(), max_capacity: 4, current_load: 3 };
        assert_eq!(load.available(), 1);
        assert!((load.load_percent() - 75.0).abs() < f64::EPSILON);
        assert!(!load.is_saturated());
        let full = WorkerLoad { current_load: 4, ..load };
        assert!(full.is_saturated());
    }
}
