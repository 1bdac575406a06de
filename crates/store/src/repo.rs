//! Repository traits shared by the workers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tapedeck_core::{Assignment, Target, WorkerInstance, WorkerLoad, WorkerStatus, WorkerType};

use crate::error::StoreError;

/// History bookkeeping carried alongside a live-status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEvent {
    Opened { at: DateTime<Utc> },
    Closed { at: DateTime<Utc> },
}

/// One deduplicated row of a batched live-status flush.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveWrite {
    pub target_id: String,
    pub room_id: Option<i64>,
    pub group_name: Option<String>,
    pub team_name: Option<String>,
    pub is_live: bool,
    /// Only meaningful when live; `None` keeps the stored value.
    pub started_at: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
    /// Applied in order after the upsert.
    pub history: Vec<HistoryEvent>,
}

#[async_trait]
pub trait LiveStatusRepo: Send + Sync {
    /// Upsert all rows and apply their history events in one transaction.
    async fn write_batch(&self, batch: &[LiveWrite]) -> Result<(), StoreError>;

    /// Live targets with an enabled capture assignment to `worker_id`,
    /// mapped to their recorded start time.
    async fn live_targets_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>, StoreError>;

    /// `None` when the target has never been observed.
    async fn is_live(&self, target_id: &str) -> Result<Option<bool>, StoreError>;
}

#[async_trait]
pub trait AssignmentRepo: Send + Sync {
    async fn enabled_assignment(
        &self,
        target_id: &str,
        worker_type: WorkerType,
    ) -> Result<Option<Assignment>, StoreError>;

    /// Active workers of a type with their enabled-assignment counts,
    /// least loaded first (ties by instance id).
    async fn worker_loads(&self, worker_type: WorkerType) -> Result<Vec<WorkerLoad>, StoreError>;

    /// Insert an enabled assignment. Returns
    /// [`StoreError::UniqueViolation`] when one already exists.
    async fn insert_assignment(
        &self,
        target_id: &str,
        worker_id: &str,
        worker_type: WorkerType,
        assigned_by: &str,
    ) -> Result<Assignment, StoreError>;

    /// Delete assignments for a target, restricted to one `assigned_by`
    /// value when given. Returns the number of rows removed.
    async fn delete_assignments(
        &self,
        target_id: &str,
        worker_type: WorkerType,
        assigned_by: Option<&str>,
    ) -> Result<u64, StoreError>;

    async fn list_assignments(&self, worker_id: Option<&str>) -> Result<Vec<Assignment>, StoreError>;
}

#[async_trait]
pub trait InstanceRepo: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<WorkerInstance>, StoreError>;

    /// Insert or update the registry row.
    async fn register(&self, instance: &WorkerInstance) -> Result<(), StoreError>;

    async fn set_status(&self, instance_id: &str, status: WorkerStatus) -> Result<bool, StoreError>;

    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn delete_instance(&self, instance_id: &str) -> Result<bool, StoreError>;

    /// Ids of active instances of a type, sorted.
    async fn active_ids(&self, worker_type: WorkerType) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait TargetRepo: Send + Sync {
    async fn enabled_targets(&self) -> Result<Vec<Target>, StoreError>;
}
