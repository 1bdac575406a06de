//! The per-worker reconciliation loop body.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tapedeck_core::config::SupervisorConfig;
use tapedeck_core::naming::TargetMatcher;
use tapedeck_core::Target;

use crate::activity::{Activity, ActivityProbe};
use crate::process::{ProcessControl, ProcessInfo};

#[cfg(test)]
mod tests;

/// Live targets assigned to this worker, with their broadcast start time.
pub type LiveView = HashMap<String, Option<DateTime<Utc>>>;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Adopted processes are left alone this long before the first activity check.
    pub adopted_grace: Duration,
    /// Owned processes are left alone this long after (re)start.
    pub owned_grace: Duration,
    /// Owned processes survive this long after the target was last seen live.
    pub stop_delay: Duration,
    /// Same, for adopted processes.
    pub adopted_stop_window: Duration,
    pub kill_wait: Duration,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            adopted_grace: Duration::from_secs(cfg.adopted_grace_secs),
            owned_grace: Duration::from_secs(cfg.owned_grace_secs),
            stop_delay: Duration::from_secs(cfg.stop_delay_secs),
            adopted_stop_window: Duration::from_secs(cfg.adopted_stop_window_secs),
            kill_wait: Duration::from_secs(cfg.kill_wait_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    NoProcess,
    /// Found running without having been started by this supervisor.
    Adopted { pid: u32, adopted_at: DateTime<Utc> },
    Owned { pid: u32, started_at: DateTime<Utc> },
}

impl SlotState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            SlotState::NoProcess => None,
            SlotState::Adopted { pid, .. } | SlotState::Owned { pid, .. } => Some(*pid),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    last_live: Option<DateTime<Utc>>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub processes: usize,
    pub duplicates_killed: usize,
    pub adopted: usize,
    pub promoted: usize,
    pub restarted: usize,
    pub spawned: usize,
    pub stopped: usize,
    pub spawn_failures: usize,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.duplicates_killed + self.adopted + self.promoted + self.restarted + self.spawned
            + self.stopped
            + self.spawn_failures
            == 0
    }
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

/// Owns the target → process table for one capture worker.
pub struct ProcessSupervisor<C, A> {
    control: C,
    probe: A,
    settings: SupervisorSettings,
    targets: HashMap<String, Target>,
    matcher: TargetMatcher,
    excluded: HashSet<String>,
    slots: HashMap<String, Slot>,
}

impl<C: ProcessControl, A: ActivityProbe> ProcessSupervisor<C, A> {
    pub fn new(control: C, probe: A, settings: SupervisorSettings) -> Self {
        Self {
            control,
            probe,
            settings,
            targets: HashMap::new(),
            matcher: TargetMatcher::default(),
            excluded: HashSet::new(),
            slots: HashMap::new(),
        }
    }

    pub fn set_targets(&mut self, targets: Vec<Target>) {
        self.matcher = TargetMatcher::new(&targets);
        self.probe.retarget(&targets);
        self.targets = targets.into_iter().map(|t| (t.id.clone(), t)).collect();
    }

    pub fn set_excluded(&mut self, excluded: impl IntoIterator<Item = String>) {
        self.excluded = excluded.into_iter().collect();
    }

    pub fn slot(&self, target_id: &str) -> Option<SlotState> {
        self.slots.get(target_id).map(|s| s.state)
    }

    pub fn tracked(&self) -> usize {
        self.slots.len()
    }

    /// Reconcile once. `live` is `None` when the live view could not be
    /// read; then only deduplication and adoption run.
    pub fn tick(&mut self, now: DateTime<Utc>, live: Option<&LiveView>) -> TickReport {
        let mut report = TickReport::default();

        let survivors = self.deduplicate(&mut report);
        self.adopt(now, &survivors, &mut report);

        let Some(live) = live else {
            debug!("live view unknown, skipping lifecycle decisions");
            return report;
        };

        let mut held_back = HashSet::new();
        let ids: Vec<String> = self.slots.keys().cloned().collect();
        for id in ids {
            let Some(mut slot) = self.slots.get(&id).copied() else {
                continue;
            };
            let is_live = live.contains_key(&id);
            if is_live {
                slot.last_live = Some(now);
            }
            slot.state = match slot.state {
                SlotState::Adopted { pid, adopted_at } => {
                    self.step_adopted(
                        &id,
                        pid,
                        adopted_at,
                        is_live,
                        slot.last_live,
                        now,
                        &mut held_back,
                        &mut report,
                    )
                }
                SlotState::Owned { pid, started_at } => {
                    self.step_owned(
                        &id,
                        pid,
                        started_at,
                        is_live,
                        slot.last_live,
                        now,
                        &mut held_back,
                        &mut report,
                    )
                }
                SlotState::NoProcess => SlotState::NoProcess,
            };
            self.slots.insert(id, slot);
        }

        let mut wanted: Vec<&String> = live.keys().collect();
        wanted.sort();
        for id in wanted {
            if self.excluded.contains(id) || held_back.contains(id) {
                continue;
            }
            let running = self.slots.get(id).and_then(|s| s.state.pid()).is_some();
            if running {
                continue;
            }
            let state = self.start(id, now, &mut report);
            if state != SlotState::NoProcess {
                report.spawned += 1;
            }
            self.slots.insert(id.clone(), Slot { state, last_live: Some(now) });
        }

        self.slots
            .retain(|id, slot| slot.state != SlotState::NoProcess || live.contains_key(id));

        report
    }

    /// Group capture processes by target and terminate all but the earliest.
    fn deduplicate(&mut self, report: &mut TickReport) -> HashMap<String, ProcessInfo> {
        let processes = self.control.scan();
        report.processes = processes.len();

        let mut groups: HashMap<String, Vec<ProcessInfo>> = HashMap::new();
        for process in processes {
            let Some(matched) = self.matcher.resolve_capture_arg(&process.capture_name) else {
                debug!(pid = process.pid, name = %process.capture_name, "capture process for unknown target");
                continue;
            };
            if matched.is_fallback() {
                debug!(pid = process.pid, target = %matched.target_id(), "capture process matched by fallback name");
            }
            let id = matched.target_id().to_string();
            if self.excluded.contains(&id) {
                continue;
            }
            groups.entry(id).or_default().push(process);
        }

        let mut survivors = HashMap::new();
        for (id, mut group) in groups {
            group.sort_by_key(|p| (p.started_at, p.pid));
            let mut rest = group.into_iter();
            let Some(keep) = rest.next() else {
                continue;
            };
            for extra in rest {
                warn!(target = %id, pid = extra.pid, kept = keep.pid, "terminating duplicate capture");
                if !self.control.terminate(extra.pid, self.settings.kill_wait) {
                    warn!(target = %id, pid = extra.pid, "duplicate capture survived termination");
                }
                report.duplicates_killed += 1;
            }
            survivors.insert(id, keep);
        }
        survivors
    }

    /// Track survivors we did not know about and forget vanished processes.
    fn adopt(&mut self, now: DateTime<Utc>, survivors: &HashMap<String, ProcessInfo>, report: &mut TickReport) {
        for (id, process) in survivors {
            let slot = self.slots.entry(id.clone()).or_insert(Slot {
                state: SlotState::NoProcess,
                last_live: None,
            });
            if slot.state.pid() == Some(process.pid) {
                continue;
            }
            info!(target = %id, pid = process.pid, "adopting running capture");
            slot.state = SlotState::Adopted { pid: process.pid, adopted_at: now };
            slot.last_live = Some(now);
            report.adopted += 1;
        }

        for (id, slot) in self.slots.iter_mut() {
            if let Some(pid) = slot.state.pid() {
                if !survivors.contains_key(id) {
                    info!(target = %id, pid, "capture process is gone");
                    slot.state = SlotState::NoProcess;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_adopted(
        &mut self,
        id: &str,
        pid: u32,
        adopted_at: DateTime<Utc>,
        is_live: bool,
        last_live: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        held_back: &mut HashSet<String>,
        report: &mut TickReport,
    ) -> SlotState {
        let current = SlotState::Adopted { pid, adopted_at };

        if !is_live {
            let quiet_for = last_live.map(|t| elapsed(now, t)).unwrap_or(Duration::MAX);
            if quiet_for >= self.settings.adopted_stop_window {
                info!(target = %id, pid, "stopping adopted capture, target not live");
                self.kill(id, pid);
                report.stopped += 1;
                return SlotState::NoProcess;
            }
            return current;
        }

        if elapsed(now, adopted_at) < self.settings.adopted_grace {
            return current;
        }
        let Some(target) = self.targets.get(id) else {
            return current;
        };
        match self.probe.check(target, now, adopted_at) {
            Activity::Fresh => {
                info!(target = %id, pid, "adopted capture is active, taking ownership");
                report.promoted += 1;
                SlotState::Owned { pid, started_at: now }
            }
            Activity::Starting => current,
            Activity::Stale(reason) => {
                warn!(target = %id, pid, ?reason, "adopted capture is stale, terminating");
                self.kill(id, pid);
                held_back.insert(id.to_string());
                report.stopped += 1;
                SlotState::NoProcess
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_owned(
        &mut self,
        id: &str,
        pid: u32,
        started_at: DateTime<Utc>,
        is_live: bool,
        last_live: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        held_back: &mut HashSet<String>,
        report: &mut TickReport,
    ) -> SlotState {
        let current = SlotState::Owned { pid, started_at };

        if !is_live {
            let quiet_for = last_live.map(|t| elapsed(now, t)).unwrap_or(Duration::MAX);
            if quiet_for >= self.settings.stop_delay {
                info!(target = %id, pid, "broadcast ended, stopping capture");
                self.kill(id, pid);
                report.stopped += 1;
                return SlotState::NoProcess;
            }
            return current;
        }

        if elapsed(now, started_at) <= self.settings.owned_grace {
            return current;
        }
        let Some(target) = self.targets.get(id) else {
            return current;
        };
        match self.probe.check(target, now, started_at) {
            Activity::Fresh | Activity::Starting => current,
            Activity::Stale(reason) => {
                warn!(target = %id, pid, ?reason, "capture is stale, restarting");
                if !self.kill(id, pid) {
                    return current;
                }
                held_back.insert(id.to_string());
                let next = self.start(id, now, report);
                if next != SlotState::NoProcess {
                    report.restarted += 1;
                }
                next
            }
        }
    }

    fn kill(&mut self, id: &str, pid: u32) -> bool {
        let gone = self.control.terminate(pid, self.settings.kill_wait);
        if !gone {
            warn!(target = %id, pid, "capture survived termination");
        }
        gone
    }

    /// Spawn a capture; failures leave the slot empty for the next tick.
    fn start(&mut self, id: &str, now: DateTime<Utc>, report: &mut TickReport) -> SlotState {
        let Some(target) = self.targets.get(id) else {
            warn!(target = %id, "live target missing from catalog, cannot capture");
            return SlotState::NoProcess;
        };
        match self.control.spawn(target) {
            Ok(pid) => {
                info!(target = %id, pid, "capture started");
                SlotState::Owned { pid, started_at: now }
            }
            Err(e) => {
                warn!(target = %id, error = %e, "capture spawn failed, retrying next tick");
                report.spawn_failures += 1;
                SlotState::NoProcess
            }
        }
    }
}
