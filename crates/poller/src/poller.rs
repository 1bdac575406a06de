//! The polling loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tapedeck_core::config::PollerConfig;
use tapedeck_core::{instance_index, PollOutcome, Target, Transition, WorkerType};
use tapedeck_store::{InstanceRepo, TargetRepo};

use crate::error::PollError;
use crate::schedule::{cycle_budget, lane_plan, shard_targets, stagger_offsets};
use crate::source::StatusSource;
use crate::writer::LiveUpdate;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub window: Duration,
    pub min_interval: Duration,
    pub queue_capacity: usize,
    pub reload_every_cycles: u64,
}

impl From<&PollerConfig> for PollerSettings {
    fn from(c: &PollerConfig) -> Self {
        Self {
            window: Duration::from_millis(c.window_ms),
            min_interval: Duration::from_millis(c.min_interval_ms),
            queue_capacity: c.queue_capacity.max(1),
            reload_every_cycles: c.reload_every_cycles.max(1),
        }
    }
}

/// Per-cycle counters, returned for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    pub live: usize,
    pub unknown: usize,
    pub started: usize,
    pub ended: usize,
    pub elapsed: Duration,
    pub budget: Duration,
}

/// True once more than 80% of the write queue is in use.
pub(crate) fn queue_pressure(used: usize, capacity: usize) -> bool {
    used * 5 > capacity * 4
}

pub struct StatusPoller {
    instance_id: String,
    settings: PollerSettings,
    source: Arc<dyn StatusSource>,
    catalog: Arc<dyn TargetRepo>,
    registry: Option<Arc<dyn InstanceRepo>>,
    tx: mpsc::Sender<LiveUpdate>,
    targets: Vec<Arc<Target>>,
    /// Last definite answer per target.
    previous: HashMap<String, bool>,
}

impl StatusPoller {
    pub fn new(
        instance_id: impl Into<String>,
        settings: PollerSettings,
        source: Arc<dyn StatusSource>,
        catalog: Arc<dyn TargetRepo>,
        registry: Option<Arc<dyn InstanceRepo>>,
        tx: mpsc::Sender<LiveUpdate>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            settings,
            source,
            catalog,
            registry,
            tx,
            targets: Vec::new(),
            previous: HashMap::new(),
        }
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    /// Fail fast when this instance's shard letter exceeds the active poller count.
    pub async fn validate_shard(&self) -> Result<(), PollError> {
        let (Some(registry), Some(index)) = (&self.registry, instance_index(&self.instance_id)) else {
            return Ok(());
        };
        let active = registry.active_ids(WorkerType::Poller).await?.len();
        if active > 1 && index >= active {
            return Err(PollError::ShardOutOfRange {
                instance: self.instance_id.clone(),
                index,
                active,
            });
        }
        Ok(())
    }

    /// Reload the catalog, apply sharding and prune state of removed targets.
    /// On failure the current list is kept.
    pub async fn reload_targets(&mut self) {
        let all = match self.catalog.enabled_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, kept = self.targets.len(), "target reload failed, keeping current list");
                return;
            }
        };
        let total = all.len();
        let mine = self.shard(all).await;

        let keep: HashSet<&str> = mine.iter().map(|t| t.id.as_str()).collect();
        let before = self.previous.len();
        self.previous.retain(|id, _| keep.contains(id.as_str()));
        let pruned = before - self.previous.len();

        self.targets = mine.into_iter().map(Arc::new).collect();
        info!(
            instance = %self.instance_id,
            targets = self.targets.len(),
            total,
            pruned,
            "targets reloaded"
        );
    }

    async fn shard(&self, all: Vec<Target>) -> Vec<Target> {
        let (Some(registry), Some(index)) = (&self.registry, instance_index(&self.instance_id)) else {
            return all;
        };
        match registry.active_ids(WorkerType::Poller).await {
            Ok(active) if active.len() > 1 && index < active.len() => {
                shard_targets(&all, index, active.len())
            }
            Ok(active) if active.len() > 1 => {
                warn!(instance = %self.instance_id, index, active = active.len(), "shard index out of range, polling everything");
                all
            }
            Ok(_) => all,
            Err(e) => {
                warn!(error = %e, "poller registry unavailable, polling everything");
                all
            }
        }
    }

    pub fn budget(&self) -> Duration {
        cycle_budget(self.settings.window, self.settings.min_interval, self.targets.len())
    }

    /// Poll every target once.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let n = self.targets.len();
        let budget = self.budget();
        let mut report = CycleReport { budget, ..Default::default() };
        if n == 0 {
            return report;
        }

        let offsets = stagger_offsets(budget, n);
        let lanes = self.source.lanes().max(1);
        let plan = lane_plan(n, lanes, &mut rand::thread_rng());
        let permits = Arc::new(Semaphore::new(lanes));
        let started = Instant::now();

        let mut in_flight: FuturesUnordered<_> = self
            .targets
            .iter()
            .cloned()
            .zip(offsets)
            .zip(plan)
            .map(|((target, offset), lane)| {
                let source = self.source.clone();
                let permits = permits.clone();
                async move {
                    tokio::time::sleep_until(started + offset).await;
                    let outcome = match permits.acquire_owned().await {
                        Ok(_permit) => source.poll(lane, &target).await,
                        Err(_) => PollOutcome::Unknown,
                    };
                    (target, outcome)
                }
            })
            .collect();

        let mut backpressure_warned = false;
        while let Some((target, outcome)) = in_flight.next().await {
            report.polled += 1;
            let previous = self.previous.get(&target.id).copied();
            let transition = Transition::between(previous, &outcome);
            match outcome.as_bool() {
                Some(live) => {
                    self.previous.insert(target.id.clone(), live);
                    if live {
                        report.live += 1;
                    }
                }
                None => {
                    report.unknown += 1;
                    continue;
                }
            }
            match transition {
                Some(Transition::Started) => report.started += 1,
                Some(Transition::Ended) => report.ended += 1,
                None => {}
            }

            let Some(update) = LiveUpdate::from_poll(&target, outcome, Utc::now(), transition) else {
                continue;
            };

            let used = self.tx.max_capacity() - self.tx.capacity();
            if !backpressure_warned && queue_pressure(used, self.tx.max_capacity()) {
                warn!(queued = used, capacity = self.tx.max_capacity(), "write queue above 80%");
                backpressure_warned = true;
            }
            if self.tx.send(update).await.is_err() {
                warn!(target = %target.id, "writer gone, dropping update");
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    /// Cycle until `shutdown` is notified. Dropping the poller afterwards
    /// closes the write queue so the writer drains.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        let mut cycle: u64 = 0;
        loop {
            if cycle % self.settings.reload_every_cycles == 0 {
                self.reload_targets().await;
            }
            let report = self.run_cycle().await;
            cycle += 1;

            debug!(
                cycle,
                polled = report.polled,
                live = report.live,
                unknown = report.unknown,
                started = report.started,
                ended = report.ended,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "cycle complete"
            );

            if report.elapsed >= report.budget {
                if report.polled > 0 {
                    warn!(
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        budget_ms = report.budget.as_millis() as u64,
                        "cycle overran its budget, starting next cycle immediately"
                    );
                }
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::task::yield_now() => {}
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(report.budget - report.elapsed) => {}
            }
        }
        info!(instance = %self.instance_id, cycles = cycle, "poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tapedeck_store::memory::MemoryRepository;

    /// Scripted source: each target answers from its own queue, then Unknown.
    #[derive(Default)]
    struct ScriptedSource {
        lanes: usize,
        script: Mutex<HashMap<String, Vec<PollOutcome>>>,
        starts: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedSource {
        fn with(lanes: usize, script: &[(&str, &[PollOutcome])]) -> Self {
            let map = script
                .iter()
                .map(|(id, outcomes)| (id.to_string(), outcomes.iter().rev().copied().collect()))
                .collect();
            Self { lanes, script: Mutex::new(map), starts: Mutex::default() }
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        fn lanes(&self) -> usize {
            self.lanes
        }

        async fn poll(&self, _lane: usize, target: &Target) -> PollOutcome {
            self.starts.lock().unwrap().push((target.id.clone(), Instant::now()));
            self.script
                .lock()
                .unwrap()
                .get_mut(&target.id)
                .and_then(|q| q.pop())
                .unwrap_or(PollOutcome::Unknown)
        }
    }

    /// Answers NotLive after sleeping the next scripted delay.
    #[derive(Default)]
    struct SlowSource {
        delays: Mutex<Vec<Duration>>,
        starts: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl StatusSource for SlowSource {
        fn lanes(&self) -> usize {
            1
        }

        async fn poll(&self, _lane: usize, target: &Target) -> PollOutcome {
            self.starts.lock().unwrap().push((target.id.clone(), Instant::now()));
            let delay = self.delays.lock().unwrap().pop().unwrap_or_default();
            tokio::time::sleep(delay).await;
            PollOutcome::NotLive
        }
    }

    const LIVE: PollOutcome = PollOutcome::Live { started_at: None };

    fn settings() -> PollerSettings {
        PollerSettings {
            window: Duration::from_secs(5),
            min_interval: Duration::from_secs(5),
            queue_capacity: 100,
            reload_every_cycles: 10,
        }
    }

    fn catalog(ids: &[&str]) -> Arc<MemoryRepository> {
        let repo = Arc::new(MemoryRepository::new());
        repo.set_targets(ids.iter().map(|id| Target::new(*id, format!("{id} name"))).collect());
        repo
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_derived_from_previous_state() {
        let source = Arc::new(ScriptedSource::with(
            2,
            &[
                ("a", &[LIVE, LIVE, PollOutcome::NotLive]),
                ("b", &[PollOutcome::NotLive, PollOutcome::Unknown, LIVE]),
            ],
        ));
        let (tx, mut rx) = mpsc::channel(100);
        let mut poller = StatusPoller::new("poller", settings(), source, catalog(&["a", "b"]), None, tx);
        poller.reload_targets().await;

        let r1 = poller.run_cycle().await;
        assert_eq!((r1.started, r1.ended, r1.unknown), (1, 0, 0));
        let r2 = poller.run_cycle().await;
        assert_eq!((r2.started, r2.ended, r2.unknown), (0, 0, 1));
        let r3 = poller.run_cycle().await;
        assert_eq!((r3.started, r3.ended), (1, 1));

        let mut updates = Vec::new();
        while let Ok(u) = rx.try_recv() {
            updates.push(u);
        }
        // The unknown answer in cycle two is not forwarded.
        assert_eq!(updates.len(), 5);
        let a_transitions: Vec<_> = updates
            .iter()
            .filter(|u| u.target_id == "a")
            .map(|u| u.transition)
            .collect();
        assert_eq!(a_transitions, vec![Some(Transition::Started), None, Some(Transition::Ended)]);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_are_staggered_across_the_budget() {
        let ids = ["a", "b", "c", "d"];
        let source = Arc::new(ScriptedSource::with(4, &[]));
        let (tx, _rx) = mpsc::channel(100);
        let mut poller =
            StatusPoller::new("poller", settings(), source.clone(), catalog(&ids), None, tx);
        poller.reload_targets().await;

        let report = poller.run_cycle().await;
        assert_eq!(report.polled, 4);
        assert_eq!(report.unknown, 4);

        let starts = source.starts.lock().unwrap().clone();
        let first = starts.iter().map(|(_, at)| *at).min().unwrap();
        let mut offsets: Vec<Duration> = starts.iter().map(|(_, at)| *at - first).collect();
        offsets.sort();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_millis(1250),
                Duration::from_millis(2500),
                Duration::from_millis(3750)
            ]
        );
        assert!(report.elapsed < report.budget);
    }

    #[test]
    fn queue_pressure_above_eighty_percent() {
        assert!(!queue_pressure(0, 100));
        assert!(!queue_pressure(80, 100));
        assert!(queue_pressure(81, 100));
        assert!(queue_pressure(100, 100));
        assert!(!queue_pressure(0, 1));
        assert!(queue_pressure(1, 1));
        assert!(!queue_pressure(4, 5));
        assert!(queue_pressure(5, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_overruns_sleeps_reloads_and_stops() {
        let repo = catalog(&["a"]);
        let source = Arc::new(SlowSource::default());
        // The first poll overruns the 5s budget.
        source.delays.lock().unwrap().push(Duration::from_secs(7));
        let (tx, _rx) = mpsc::channel(100);
        let poller = StatusPoller::new(
            "poller",
            PollerSettings { reload_every_cycles: 2, ..settings() },
            source.clone(),
            repo.clone(),
            None,
            tx,
        );
        let shutdown = Arc::new(Notify::new());
        let t0 = Instant::now();
        let handle = tokio::spawn(poller.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        repo.set_targets(vec![Target::new("a", "a name"), Target::new("b", "b name")]);
        tokio::time::sleep(Duration::from_secs(15)).await;

        let starts: Vec<(String, u128)> = source
            .starts
            .lock()
            .unwrap()
            .iter()
            .map(|(id, at)| (id.clone(), (*at - t0).as_millis()))
            .collect();
        assert_eq!(
            starts,
            vec![
                // cycle 0 overruns, cycle 1 starts at once without reloading
                ("a".to_string(), 0),
                ("a".to_string(), 7_000),
                // cycle 1 sleeps out its budget, cycle 2 reloads and sees b
                ("a".to_string(), 12_000),
                ("b".to_string(), 14_500),
            ]
        );

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn reload_prunes_removed_targets() {
        let repo = catalog(&["a", "b"]);
        let source = Arc::new(ScriptedSource::with(1, &[("a", &[LIVE]), ("b", &[LIVE])]));
        let (tx, _rx) = mpsc::channel(100);
        let mut poller = StatusPoller::new("poller", settings(), source, repo.clone(), None, tx);
        poller.reload_targets().await;
        poller.previous.insert("a".into(), true);
        poller.previous.insert("b".into(), true);

        repo.set_targets(vec![Target::new("a", "a name")]);
        poller.reload_targets().await;
        assert_eq!(poller.targets().len(), 1);
        assert!(poller.previous.contains_key("a"));
        assert!(!poller.previous.contains_key("b"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_targets() {
        let repo = catalog(&["a", "b"]);
        let source = Arc::new(ScriptedSource::with(1, &[]));
        let (tx, _rx) = mpsc::channel(100);
        let mut poller = StatusPoller::new("poller", settings(), source, repo.clone(), None, tx);
        poller.reload_targets().await;
        repo.set_unavailable(true);
        poller.reload_targets().await;
        assert_eq!(poller.targets().len(), 2);
    }

    #[tokio::test]
    async fn shards_by_active_poller_count() {
        let repo = catalog(&["a", "b", "c", "d", "e"]);
        repo.add_worker("poller-a", WorkerType::Poller, 1);
        repo.add_worker("poller-b", WorkerType::Poller, 1);
        let source = Arc::new(ScriptedSource::with(1, &[]));

        let (tx, _rx) = mpsc::channel(100);
        let mut second = StatusPoller::new(
            "poller-b",
            settings(),
            source.clone(),
            repo.clone(),
            Some(repo.clone() as Arc<dyn InstanceRepo>),
            tx,
        );
        second.reload_targets().await;
        let ids: Vec<&str> = second.targets().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "e"]);

        let (tx, _rx) = mpsc::channel(100);
        let registry: Arc<dyn InstanceRepo> = repo.clone();
        let third = StatusPoller::new("poller-c", settings(), source, repo, Some(registry), tx);
        assert!(matches!(
            third.validate_shard().await,
            Err(PollError::ShardOutOfRange { index: 2, active: 2, .. })
        ));
    }
}
