use std::sync::{Arc, Mutex};

use chrono::TimeZone;

use super::*;
use crate::activity::StaleReason;
use crate::error::SupervisorError;

// ── Fakes ─────────────────────────────────────────────────────

#[derive(Default)]
struct FakeOs {
    procs: Vec<ProcessInfo>,
    next_pid: u32,
    spawned: Vec<String>,
    killed: Vec<u32>,
    fail_spawn: bool,
}

#[derive(Clone, Default)]
struct FakeControl(Arc<Mutex<FakeOs>>);

impl FakeControl {
    fn with_process(self, pid: u32, started_secs: i64, name: &str) -> Self {
        self.0.lock().unwrap().procs.push(ProcessInfo {
            pid,
            started_at: t(started_secs),
            capture_name: name.to_string(),
        });
        self
    }

    fn killed(&self) -> Vec<u32> {
        self.0.lock().unwrap().killed.clone()
    }

    fn spawned(&self) -> Vec<String> {
        self.0.lock().unwrap().spawned.clone()
    }
}

impl ProcessControl for FakeControl {
    fn scan(&mut self) -> Vec<ProcessInfo> {
        self.0.lock().unwrap().procs.clone()
    }

    fn spawn(&mut self, target: &Target) -> Result<u32, SupervisorError> {
        let mut os = self.0.lock().unwrap();
        if os.fail_spawn {
            return Err(SupervisorError::ExitedImmediately {
                target: target.id.clone(),
                status: "exit status: 1".into(),
            });
        }
        os.next_pid += 1;
        let pid = 1000 + os.next_pid;
        os.procs.push(ProcessInfo {
            pid,
            started_at: t(0),
            capture_name: target.capture_name().to_string(),
        });
        os.spawned.push(target.id.clone());
        Ok(pid)
    }

    fn terminate(&mut self, pid: u32, _wait: Duration) -> bool {
        let mut os = self.0.lock().unwrap();
        os.procs.retain(|p| p.pid != pid);
        os.killed.push(pid);
        true
    }
}

#[derive(Clone)]
struct FakeProbe(Arc<Mutex<(Activity, usize)>>);

impl FakeProbe {
    fn new() -> Self {
        Self(Arc::new(Mutex::new((Activity::Fresh, 0))))
    }

    fn set(&self, activity: Activity) {
        self.0.lock().unwrap().0 = activity;
    }

    fn checks(&self) -> usize {
        self.0.lock().unwrap().1
    }
}

impl ActivityProbe for FakeProbe {
    fn check(&self, _target: &Target, _now: DateTime<Utc>, _since: DateTime<Utc>) -> Activity {
        let mut state = self.0.lock().unwrap();
        state.1 += 1;
        state.0.clone()
    }
}

// ── Helpers ───────────────────────────────────────────────────

const ID: &str = "hashimoto_haruna";

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        adopted_grace: Duration::from_secs(10),
        owned_grace: Duration::from_secs(35),
        stop_delay: Duration::from_secs(300),
        adopted_stop_window: Duration::from_secs(30),
        kill_wait: Duration::from_secs(3),
    }
}

fn supervisor(control: &FakeControl, probe: &FakeProbe) -> ProcessSupervisor<FakeControl, FakeProbe> {
    let mut sup = ProcessSupervisor::new(control.clone(), probe.clone(), settings());
    sup.set_targets(vec![
        Target::new(ID, "Hashimoto Haruna"),
        Target::new("kyoka_shinohara", "Shinohara Kyoka"),
    ]);
    sup
}

fn live(ids: &[&str]) -> LiveView {
    ids.iter().map(|id| (id.to_string(), Some(t(0)))).collect()
}

fn stale() -> Activity {
    Activity::Stale(StaleReason::Inactive { idle: Duration::from_secs(200) })
}

// ── Spawning ──────────────────────────────────────────────────

#[test]
fn live_target_without_process_is_spawned_once() {
    let control = FakeControl::default();
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    let report = sup.tick(t(0), Some(&live(&[ID])));
    assert_eq!(report.spawned, 1);
    assert!(matches!(sup.slot(ID), Some(SlotState::Owned { started_at, .. }) if started_at == t(0)));

    let report = sup.tick(t(3), Some(&live(&[ID])));
    assert!(report.is_quiet());
    assert_eq!(control.spawned(), vec![ID.to_string()]);
}

#[test]
fn spawn_failure_is_retried_next_tick() {
    let control = FakeControl::default();
    control.0.lock().unwrap().fail_spawn = true;
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    let report = sup.tick(t(0), Some(&live(&[ID])));
    assert_eq!(report.spawn_failures, 1);
    assert_eq!(sup.slot(ID), Some(SlotState::NoProcess));

    control.0.lock().unwrap().fail_spawn = false;
    let report = sup.tick(t(3), Some(&live(&[ID])));
    assert_eq!(report.spawned, 1);
}

#[test]
fn vanished_process_is_respawned() {
    let control = FakeControl::default();
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), Some(&live(&[ID])));
    control.0.lock().unwrap().procs.clear();

    let report = sup.tick(t(3), Some(&live(&[ID])));
    assert_eq!(report.spawned, 1);
    assert_eq!(control.spawned().len(), 2);
}

// ── Owned lifecycle ───────────────────────────────────────────

#[test]
fn fresh_capture_past_grace_is_left_alone() {
    let control = FakeControl::default();
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), Some(&live(&[ID])));
    let report = sup.tick(t(36), Some(&live(&[ID])));

    assert!(report.is_quiet());
    assert_eq!(probe.checks(), 1);
    assert!(control.killed().is_empty());
}

#[test]
fn stale_capture_past_grace_is_restarted_exactly_once() {
    let control = FakeControl::default();
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), Some(&live(&[ID])));
    let first = sup.slot(ID).and_then(|s| s.pid()).unwrap();
    probe.set(stale());

    let report = sup.tick(t(36), Some(&live(&[ID])));
    assert_eq!(report.restarted, 1);
    assert_eq!(report.spawned, 0);
    assert_eq!(control.killed(), vec![first]);
    assert_eq!(control.spawned().len(), 2);
    assert!(matches!(sup.slot(ID), Some(SlotState::Owned { started_at, .. }) if started_at == t(36)));

    // The replacement gets its own grace period.
    let report = sup.tick(t(39), Some(&live(&[ID])));
    assert!(report.is_quiet());
    assert_eq!(control.killed().len(), 1);
}

#[test]
fn activity_is_not_checked_inside_grace() {
    let control = FakeControl::default();
    let probe = FakeProbe::new();
    probe.set(stale());
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), Some(&live(&[ID])));
    sup.tick(t(30), Some(&live(&[ID])));
    sup.tick(t(35), Some(&live(&[ID])));

    assert_eq!(probe.checks(), 0);
    assert!(control.killed().is_empty());
}

#[test]
fn owned_capture_stops_after_stop_delay() {
    let control = FakeControl::default();
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), Some(&live(&[ID])));
    let report = sup.tick(t(100), Some(&live(&[])));
    assert_eq!(report.stopped, 0);

    let report = sup.tick(t(300), Some(&live(&[])));
    assert_eq!(report.stopped, 1);
    assert_eq!(control.killed().len(), 1);
    assert_eq!(sup.slot(ID), None);
}

// ── Adoption ──────────────────────────────────────────────────

#[test]
fn duplicates_keep_the_earliest_process() {
    let control = FakeControl::default()
        .with_process(7, 10, "Hashimoto Haruna")
        .with_process(8, 5, "Hashimoto Haruna")
        .with_process(9, 20, "hashimoto haruna");
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    let report = sup.tick(t(30), None);
    assert_eq!(report.duplicates_killed, 2);
    let mut killed = control.killed();
    killed.sort();
    assert_eq!(killed, vec![7, 9]);
    assert_eq!(sup.slot(ID), Some(SlotState::Adopted { pid: 8, adopted_at: t(30) }));
}

#[test]
fn unknown_live_view_only_adopts() {
    let control = FakeControl::default().with_process(8, 0, "Hashimoto Haruna");
    let probe = FakeProbe::new();
    probe.set(stale());
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), None);
    let report = sup.tick(t(600), None);

    assert_eq!(report.adopted, 0);
    assert!(control.spawned().is_empty());
    assert!(control.killed().is_empty());
    assert_eq!(probe.checks(), 0);
}

#[test]
fn adopted_fresh_capture_is_promoted_after_grace() {
    let control = FakeControl::default().with_process(8, 0, "Hashimoto Haruna");
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    let report = sup.tick(t(0), Some(&live(&[ID])));
    assert_eq!(report.adopted, 1);
    assert_eq!(report.spawned, 0);

    sup.tick(t(5), Some(&live(&[ID])));
    assert_eq!(probe.checks(), 0);

    let report = sup.tick(t(10), Some(&live(&[ID])));
    assert_eq!(report.promoted, 1);
    assert_eq!(sup.slot(ID), Some(SlotState::Owned { pid: 8, started_at: t(10) }));
}

#[test]
fn adopted_stale_capture_is_killed_and_respawned_next_tick() {
    let control = FakeControl::default().with_process(8, 0, "Hashimoto Haruna");
    let probe = FakeProbe::new();
    probe.set(stale());
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), Some(&live(&[ID])));
    let report = sup.tick(t(10), Some(&live(&[ID])));
    assert_eq!(report.stopped, 1);
    assert_eq!(report.spawned, 0);
    assert_eq!(control.killed(), vec![8]);
    assert_eq!(sup.slot(ID), Some(SlotState::NoProcess));

    let report = sup.tick(t(13), Some(&live(&[ID])));
    assert_eq!(report.spawned, 1);
}

#[test]
fn adopted_capture_of_offline_target_uses_short_window() {
    let control = FakeControl::default().with_process(8, 0, "Hashimoto Haruna");
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);

    sup.tick(t(0), Some(&live(&[])));
    let report = sup.tick(t(20), Some(&live(&[])));
    assert_eq!(report.stopped, 0);

    let report = sup.tick(t(30), Some(&live(&[])));
    assert_eq!(report.stopped, 1);
    assert_eq!(control.killed(), vec![8]);
}

#[test]
fn excluded_and_unknown_processes_are_ignored() {
    let control = FakeControl::default()
        .with_process(8, 0, "Hashimoto Haruna")
        .with_process(9, 0, "Nobody Here");
    let probe = FakeProbe::new();
    let mut sup = supervisor(&control, &probe);
    sup.set_excluded([ID.to_string()]);

    let report = sup.tick(t(0), Some(&live(&[ID])));
    assert_eq!(report.adopted, 0);
    assert_eq!(report.spawned, 0);
    assert!(control.killed().is_empty());
    assert_eq!(sup.tracked(), 0);
}
