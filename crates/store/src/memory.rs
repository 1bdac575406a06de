//! In-memory repositories for tests.
//!
//! Mirrors the PostgreSQL semantics the workers rely on: the enabled
//! assignment uniqueness rule, active-only load ranking, history
//! open/close and started_at retention.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tapedeck_core::{
    Assignment, LiveState, Target, WorkerInstance, WorkerLoad, WorkerStatus, WorkerType,
};

use crate::error::StoreError;
use crate::repo::{
    AssignmentRepo, HistoryEvent, InstanceRepo, LiveStatusRepo, LiveWrite, TargetRepo,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub target_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    live: HashMap<String, LiveState>,
    history: Vec<HistoryRow>,
    instances: BTreeMap<String, WorkerInstance>,
    assignments: Vec<Assignment>,
    targets: Vec<Target>,
    batches: usize,
    inserts: usize,
    unavailable: bool,
    /// (target, winner): the next insert for `target` loses a race to `winner`.
    race: Option<(String, String)>,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory repository poisoned")
    }

    fn check(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let state = self.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory repository offline".into()));
        }
        Ok(state)
    }

    // ── Test setup and inspection ────────────────────────────────────

    pub fn add_worker(&self, instance_id: &str, worker_type: WorkerType, max_capacity: i32) {
        self.lock().instances.insert(
            instance_id.to_string(),
            WorkerInstance {
                instance_id: instance_id.to_string(),
                worker_type,
                display_name: None,
                max_capacity,
                status: WorkerStatus::Active,
                last_heartbeat: None,
            },
        );
    }

    pub fn set_targets(&self, targets: Vec<Target>) {
        self.lock().targets = targets;
    }

    pub fn set_live(&self, target_id: &str, is_live: bool, at: DateTime<Utc>) {
        self.lock().live.insert(
            target_id.to_string(),
            LiveState {
                target_id: target_id.to_string(),
                is_live,
                started_at: is_live.then_some(at),
                last_check: at,
            },
        );
    }

    pub fn assign_directly(&self, target_id: &str, worker_id: &str, assigned_by: &str) {
        self.lock().assignments.push(Assignment {
            target_id: target_id.to_string(),
            worker_id: worker_id.to_string(),
            worker_type: WorkerType::Capture,
            enabled: true,
            assigned_by: assigned_by.to_string(),
            assigned_at: Utc::now(),
        });
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make the next insert for `target_id` fail as if `winner` had
    /// committed the same assignment first.
    pub fn race_next_insert(&self, target_id: &str, winner: &str) {
        self.lock().race = Some((target_id.to_string(), winner.to_string()));
    }

    pub fn live_state(&self, target_id: &str) -> Option<LiveState> {
        self.lock().live.get(target_id).cloned()
    }

    pub fn history(&self) -> Vec<HistoryRow> {
        self.lock().history.clone()
    }

    pub fn assignments(&self) -> Vec<Assignment> {
        self.lock().assignments.clone()
    }

    pub fn instance(&self, instance_id: &str) -> Option<WorkerInstance> {
        self.lock().instances.get(instance_id).cloned()
    }

    /// Successful assignment inserts so far.
    pub fn insert_count(&self) -> usize {
        self.lock().inserts
    }

    pub fn batch_count(&self) -> usize {
        self.lock().batches
    }
}

fn enabled_for<'a>(
    assignments: &'a [Assignment],
    target_id: &str,
    worker_type: WorkerType,
) -> Option<&'a Assignment> {
    assignments
        .iter()
        .find(|a| a.enabled && a.target_id == target_id && a.worker_type == worker_type)
}

#[async_trait]
impl LiveStatusRepo for MemoryRepository {
    async fn write_batch(&self, batch: &[LiveWrite]) -> Result<(), StoreError> {
        let mut state = self.check()?;
        state.batches += 1;
        for w in batch {
            let previous_start = state.live.get(&w.target_id).and_then(|s| s.started_at);
            let started_at = if w.is_live { w.started_at.or(previous_start) } else { None };
            state.live.insert(
                w.target_id.clone(),
                LiveState {
                    target_id: w.target_id.clone(),
                    is_live: w.is_live,
                    started_at,
                    last_check: w.checked_at,
                },
            );
            for event in &w.history {
                match *event {
                    HistoryEvent::Opened { at } => state.history.push(HistoryRow {
                        target_id: w.target_id.clone(),
                        started_at: at,
                        ended_at: None,
                    }),
                    HistoryEvent::Closed { at } => {
                        if let Some(open) = state
                            .history
                            .iter_mut()
                            .rev()
                            .find(|h| h.target_id == w.target_id && h.ended_at.is_none())
                        {
                            open.ended_at = Some(at);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn live_targets_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>, StoreError> {
        let state = self.check()?;
        Ok(state
            .assignments
            .iter()
            .filter(|a| a.enabled && a.worker_id == worker_id && a.worker_type == WorkerType::Capture)
            .filter_map(|a| state.live.get(&a.target_id))
            .filter(|s| s.is_live)
            .map(|s| (s.target_id.clone(), s.started_at))
            .collect())
    }

    async fn is_live(&self, target_id: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.check()?.live.get(target_id).map(|s| s.is_live))
    }
}

#[async_trait]
impl AssignmentRepo for MemoryRepository {
    async fn enabled_assignment(
        &self,
        target_id: &str,
        worker_type: WorkerType,
    ) -> Result<Option<Assignment>, StoreError> {
        let state = self.check()?;
        Ok(enabled_for(&state.assignments, target_id, worker_type).cloned())
    }

    async fn worker_loads(&self, worker_type: WorkerType) -> Result<Vec<WorkerLoad>, StoreError> {
        let state = self.check()?;
        let mut loads: Vec<WorkerLoad> = state
            .instances
            .values()
            .filter(|i| i.worker_type == worker_type && i.status == WorkerStatus::Active)
            .map(|i| WorkerLoad {
                instance_id: i.instance_id.clone(),
                max_capacity: i.max_capacity,
                current_load: state
                    .assignments
                    .iter()
                    .filter(|a| a.enabled && a.worker_id == i.instance_id)
                    .count() as i64,
            })
            .collect();
        loads.sort_by(|a, b| {
            a.current_load
                .cmp(&b.current_load)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(loads)
    }

    async fn insert_assignment(
        &self,
        target_id: &str,
        worker_id: &str,
        worker_type: WorkerType,
        assigned_by: &str,
    ) -> Result<Assignment, StoreError> {
        let mut state = self.check()?;

        if let Some((raced, winner)) = state.race.take() {
            if raced == target_id {
                state.assignments.push(Assignment {
                    target_id: target_id.to_string(),
                    worker_id: winner,
                    worker_type,
                    enabled: true,
                    assigned_by: assigned_by.to_string(),
                    assigned_at: Utc::now(),
                });
                return Err(StoreError::UniqueViolation(target_id.to_string()));
            }
            state.race = Some((raced, winner));
        }

        if enabled_for(&state.assignments, target_id, worker_type).is_some() {
            return Err(StoreError::UniqueViolation(target_id.to_string()));
        }
        let assignment = Assignment {
            target_id: target_id.to_string(),
            worker_id: worker_id.to_string(),
            worker_type,
            enabled: true,
            assigned_by: assigned_by.to_string(),
            assigned_at: Utc::now(),
        };
        state.assignments.push(assignment.clone());
        state.inserts += 1;
        Ok(assignment)
    }

    async fn delete_assignments(
        &self,
        target_id: &str,
        worker_type: WorkerType,
        assigned_by: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut state = self.check()?;
        let before = state.assignments.len();
        state.assignments.retain(|a| {
            !(a.target_id == target_id
                && a.worker_type == worker_type
                && assigned_by.map_or(true, |by| a.assigned_by == by))
        });
        Ok((before - state.assignments.len()) as u64)
    }

    async fn list_assignments(&self, worker_id: Option<&str>) -> Result<Vec<Assignment>, StoreError> {
        let state = self.check()?;
        Ok(state
            .assignments
            .iter()
            .filter(|a| worker_id.map_or(true, |w| a.worker_id == w))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InstanceRepo for MemoryRepository {
    async fn list_instances(&self) -> Result<Vec<WorkerInstance>, StoreError> {
        Ok(self.check()?.instances.values().cloned().collect())
    }

    async fn register(&self, instance: &WorkerInstance) -> Result<(), StoreError> {
        self.check()?
            .instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn set_status(&self, instance_id: &str, status: WorkerStatus) -> Result<bool, StoreError> {
        let mut state = self.check()?;
        Ok(match state.instances.get_mut(instance_id) {
            Some(i) => {
                i.status = status;
                true
            }
            None => false,
        })
    }

    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.check()?;
        Ok(match state.instances.get_mut(instance_id) {
            Some(i) => {
                i.last_heartbeat = Some(at);
                true
            }
            None => false,
        })
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool, StoreError> {
        let mut state = self.check()?;
        let removed = state.instances.remove(instance_id).is_some();
        if removed {
            state.assignments.retain(|a| a.worker_id != instance_id);
        }
        Ok(removed)
    }

    async fn active_ids(&self, worker_type: WorkerType) -> Result<Vec<String>, StoreError> {
        Ok(self
            .check()?
            .instances
            .values()
            .filter(|i| i.worker_type == worker_type && i.status == WorkerStatus::Active)
            .map(|i| i.instance_id.clone())
            .collect())
    }
}

#[async_trait]
impl TargetRepo for MemoryRepository {
    async fn enabled_targets(&self) -> Result<Vec<Target>, StoreError> {
        Ok(self.check()?.targets.iter().filter(|t| t.enabled).cloned().collect())
    }
}
