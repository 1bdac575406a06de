//! Where liveness answers come from.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use tapedeck_core::{PollOutcome, Target};

use crate::error::PollError;

/// A liveness oracle with one or more independent egress lanes.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Number of lanes requests can be spread over.
    fn lanes(&self) -> usize;

    /// Query one target through `lane`. Never fails: anything that is not a
    /// definite answer is [`PollOutcome::Unknown`].
    async fn poll(&self, lane: usize, target: &Target) -> PollOutcome;
}

#[derive(Debug, Deserialize)]
struct RoomStatus {
    is_live: Option<bool>,
    started_at: Option<i64>,
}

/// Status endpoint client with one `reqwest::Client` per egress address.
pub struct HttpStatusSource {
    api_base: String,
    clients: Vec<reqwest::Client>,
}

impl HttpStatusSource {
    pub fn new(api_base: &str, egress: &[IpAddr], timeout: Duration) -> Result<Self, PollError> {
        let build = |addr: Option<IpAddr>| {
            reqwest::Client::builder()
                .timeout(timeout)
                .local_address(addr)
                .build()
        };
        let clients = if egress.is_empty() {
            vec![build(None)?]
        } else {
            egress
                .iter()
                .map(|addr| build(Some(*addr)))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            clients,
        })
    }

    fn status_url(&self) -> String {
        format!("{}/api/room/status", self.api_base)
    }
}

/// Interpret a response body; anything unusable is unknown.
fn parse_status(body: &str, checked_at: DateTime<Utc>) -> PollOutcome {
    let status: RoomStatus = match serde_json::from_str(body) {
        Ok(s) => s,
        Err(_) => return PollOutcome::Unknown,
    };
    match status.is_live {
        Some(true) => {
            let started_at = status
                .started_at
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .or(Some(checked_at));
            PollOutcome::Live { started_at }
        }
        Some(false) => PollOutcome::NotLive,
        None => PollOutcome::Unknown,
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    fn lanes(&self) -> usize {
        self.clients.len()
    }

    async fn poll(&self, lane: usize, target: &Target) -> PollOutcome {
        let client = &self.clients[lane % self.clients.len()];
        let key = target.stream_key();
        let response = match client
            .get(self.status_url())
            .query(&[("room_url_key", key.as_str())])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(target = %target.id, lane, error = %e, "status request failed");
                return PollOutcome::Unknown;
            }
        };

        if !response.status().is_success() {
            debug!(target = %target.id, status = %response.status(), "status request rejected");
            return PollOutcome::Unknown;
        }

        match response.text().await {
            Ok(body) => parse_status(&body, Utc::now()),
            Err(e) => {
                debug!(target = %target.id, error = %e, "status body unreadable");
                PollOutcome::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_live_with_start_time() {
        let now = Utc::now();
        let outcome = parse_status(r#"{"is_live": true, "started_at": 1700000000}"#, now);
        assert_eq!(
            outcome,
            PollOutcome::Live { started_at: Utc.timestamp_opt(1_700_000_000, 0).single() }
        );
    }

    #[test]
    fn live_without_start_uses_check_time() {
        let now = Utc::now();
        assert_eq!(
            parse_status(r#"{"is_live": true}"#, now),
            PollOutcome::Live { started_at: Some(now) }
        );
    }

    #[test]
    fn not_live_and_garbage() {
        let now = Utc::now();
        assert_eq!(parse_status(r#"{"is_live": false}"#, now), PollOutcome::NotLive);
        assert_eq!(parse_status("<html>busy</html>", now), PollOutcome::Unknown);
        assert_eq!(parse_status(r#"{"other": 1}"#, now), PollOutcome::Unknown);
    }

    #[test]
    fn one_client_without_egress_addresses() {
        let src = HttpStatusSource::new("http://localhost/", &[], Duration::from_secs(1)).unwrap();
        assert_eq!(src.lanes(), 1);
        assert_eq!(src.status_url(), "http://localhost/api/room/status");
    }
}
