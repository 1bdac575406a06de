use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last written liveness of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveState {
    pub target_id: String,
    pub is_live: bool,
    /// Set on the not-live → live edge, cleared on live → not-live.
    pub started_at: Option<DateTime<Utc>>,
    pub last_check: DateTime<Utc>,
}

/// Result of one status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Live { started_at: Option<DateTime<Utc>> },
    NotLive,
    /// Network error, bad status or malformed body. Never persisted.
    Unknown,
}

impl PollOutcome {
    /// `Some(is_live)` for a definite answer.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PollOutcome::Live { .. } => Some(true),
            PollOutcome::NotLive => Some(false),
            PollOutcome::Unknown => None,
        }
    }
}

/// Edge between two consecutive definite observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Ended,
}

impl Transition {
    /// Compare the previous definite state with a new outcome.
    ///
    /// Unknown outcomes never produce a transition; a target with no previous
    /// observation that is found live counts as started.
    pub fn between(previous: Option<bool>, outcome: &PollOutcome) -> Option<Transition> {
        match (previous, outcome.as_bool()) {
            (Some(true), Some(true)) => None,
            (_, Some(true)) => Some(Transition::Started),
            (Some(true), Some(false)) => Some(Transition::Ended),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        let live = PollOutcome::Live { started_at: None };
        assert_eq!(Transition::between(None, &live), Some(Transition::Started));
        assert_eq!(Transition::between(Some(false), &live), Some(Transition::Started));
        assert_eq!(Transition::between(Some(true), &live), None);
        assert_eq!(Transition::between(Some(true), &PollOutcome::NotLive), Some(Transition::Ended));
        assert_eq!(Transition::between(None, &PollOutcome::NotLive), None);
        assert_eq!(Transition::between(Some(true), &PollOutcome::Unknown), None);
    }
}
