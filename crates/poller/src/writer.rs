//! Batched, deduplicating live-status writer.
//!
//! Poll results arrive over a bounded channel. [`WriteBuffer`] keeps the
//! latest value per target and flushes when either the size threshold or
//! the time window is reached, whichever comes first. History events and
//! transitions are accumulated in arrival order so nothing is lost when a
//! target is written twice before a flush. Balancer calls happen only after
//! the batch is committed; a failed batch goes back into the buffer and is
//! retried with newer values merged on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tapedeck_balancer::Assigner;
use tapedeck_core::{PollOutcome, Target, Transition};
use tapedeck_store::{HistoryEvent, LiveStatusRepo, LiveWrite};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);
const FINAL_FLUSH_ATTEMPTS: usize = 3;

/// One definite poll result.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpdate {
    pub target_id: String,
    pub room_id: Option<i64>,
    pub group_name: Option<String>,
    pub team_name: Option<String>,
    pub is_live: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
    pub transition: Option<Transition>,
}

impl LiveUpdate {
    /// `None` for an unknown outcome, which is never written.
    pub fn from_poll(
        target: &Target,
        outcome: PollOutcome,
        checked_at: DateTime<Utc>,
        transition: Option<Transition>,
    ) -> Option<Self> {
        let (is_live, started_at) = match outcome {
            PollOutcome::Live { started_at } => (true, started_at),
            PollOutcome::NotLive => (false, None),
            PollOutcome::Unknown => return None,
        };
        let (group, team) = target.team_parts();
        Some(Self {
            target_id: target.id.clone(),
            room_id: target.room_id,
            group_name: group.map(str::to_string),
            team_name: team.map(str::to_string),
            is_live,
            // Only the start edge records a start time; later live polls keep it.
            started_at: if transition == Some(Transition::Started) { started_at } else { None },
            checked_at,
            transition,
        })
    }
}

/// A buffered row plus the transitions it still owes the balancer.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub write: LiveWrite,
    pub transitions: Vec<Transition>,
}

impl PendingWrite {
    fn from_update(u: LiveUpdate) -> Self {
        let history = match u.transition {
            Some(Transition::Started) => vec![HistoryEvent::Opened {
                at: u.started_at.unwrap_or(u.checked_at),
            }],
            Some(Transition::Ended) => vec![HistoryEvent::Closed { at: u.checked_at }],
            None => Vec::new(),
        };
        Self {
            write: LiveWrite {
                target_id: u.target_id,
                room_id: u.room_id,
                group_name: u.group_name,
                team_name: u.team_name,
                is_live: u.is_live,
                started_at: u.started_at,
                checked_at: u.checked_at,
                history,
            },
            transitions: u.transition.into_iter().collect(),
        }
    }

    /// Newer values win; history and transitions are concatenated.
    fn merge(older: PendingWrite, newer: PendingWrite) -> PendingWrite {
        let started_at = match (newer.write.is_live, newer.write.started_at) {
            (true, Some(at)) => Some(at),
            (true, None) if older.write.is_live => older.write.started_at,
            _ => None,
        };
        let mut history = older.write.history;
        history.extend(newer.write.history);
        let mut transitions = older.transitions;
        transitions.extend(newer.transitions);
        PendingWrite {
            write: LiveWrite { started_at, history, ..newer.write },
            transitions,
        }
    }
}

/// Deduplicating micro-batch accumulator.
pub struct WriteBuffer {
    pending: HashMap<String, PendingWrite>,
    max_size: usize,
    max_wait: Duration,
    batch_started: Option<Instant>,
}

impl WriteBuffer {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_size: max_size.max(1),
            max_wait,
            batch_started: None,
        }
    }

    pub fn push(&mut self, update: LiveUpdate) {
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }
        let incoming = PendingWrite::from_update(update);
        let merged = match self.pending.remove(&incoming.write.target_id) {
            Some(existing) => PendingWrite::merge(existing, incoming),
            None => incoming,
        };
        self.pending.insert(merged.write.target_id.clone(), merged);
    }

    pub fn should_flush(&self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        if self.pending.len() >= self.max_size {
            return true;
        }
        self.batch_started
            .map_or(false, |started| started.elapsed() >= self.max_wait)
    }

    /// Take everything, ordered by target id.
    pub fn take(&mut self) -> Vec<PendingWrite> {
        self.batch_started = None;
        let mut batch: Vec<PendingWrite> = self.pending.drain().map(|(_, p)| p).collect();
        batch.sort_by(|a, b| a.write.target_id.cmp(&b.write.target_id));
        batch
    }

    /// Put back a batch that failed to write. Anything pushed since
    /// [`take`](Self::take) is newer and merged on top.
    pub fn restore(&mut self, batch: Vec<PendingWrite>) {
        for older in batch {
            let merged = match self.pending.remove(&older.write.target_id) {
                Some(newer) => PendingWrite::merge(older, newer),
                None => older,
            };
            self.pending.insert(merged.write.target_id.clone(), merged);
        }
        if !self.pending.is_empty() {
            self.batch_started = Some(Instant::now());
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Consumer task owning the store side of the poller.
pub struct Writer {
    repo: Arc<dyn LiveStatusRepo>,
    assigner: Arc<dyn Assigner>,
    buffer: WriteBuffer,
    flush_interval: Duration,
    written_since_summary: usize,
    last_summary: Instant,
}

impl Writer {
    pub fn new(
        repo: Arc<dyn LiveStatusRepo>,
        assigner: Arc<dyn Assigner>,
        max_batch: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            repo,
            assigner,
            buffer: WriteBuffer::new(max_batch, flush_interval),
            flush_interval,
            written_since_summary: 0,
            last_summary: Instant::now(),
        }
    }

    /// Consume until every sender is dropped, then drain what is left.
    pub async fn run(mut self, mut rx: mpsc::Receiver<LiveUpdate>) {
        loop {
            match tokio::time::timeout(self.flush_interval, rx.recv()).await {
                Ok(Some(update)) => self.buffer.push(update),
                Ok(None) => break,
                Err(_) => {}
            }
            while let Ok(update) = rx.try_recv() {
                self.buffer.push(update);
            }
            if self.buffer.should_flush() {
                self.flush().await;
            }
            self.log_summary();
        }

        for _ in 0..FINAL_FLUSH_ATTEMPTS {
            if self.buffer.is_empty() {
                break;
            }
            self.flush().await;
        }
        if !self.buffer.is_empty() {
            error!(rows = self.buffer.len(), "writer stopped with unwritten live status");
        }
        info!("live status writer drained");
    }

    async fn flush(&mut self) -> bool {
        let batch = self.buffer.take();
        if batch.is_empty() {
            return true;
        }
        let writes: Vec<LiveWrite> = batch.iter().map(|p| p.write.clone()).collect();

        match self.repo.write_batch(&writes).await {
            Ok(()) => {
                self.written_since_summary += writes.len();
                for pending in batch {
                    for transition in &pending.transitions {
                        let target = &pending.write.target_id;
                        match transition {
                            Transition::Started => {
                                let worker = self.assigner.assign(target).await;
                                info!(target = %target, worker = ?worker, "went live");
                            }
                            Transition::Ended => {
                                self.assigner.clear(target).await;
                                info!(target = %target, "went offline");
                            }
                        }
                    }
                }
                true
            }
            Err(e) => {
                warn!(rows = writes.len(), error = %e, "live status batch failed, will retry");
                self.buffer.restore(batch);
                false
            }
        }
    }

    fn log_summary(&mut self) {
        if self.last_summary.elapsed() < SUMMARY_INTERVAL {
            return;
        }
        if self.written_since_summary > 0 {
            info!(rows = self.written_since_summary, "live status rows written");
        } else {
            debug!("no live status rows written");
        }
        self.written_since_summary = 0;
        self.last_summary = Instant::now();
    }
}
