//! Least-loaded assignment of live targets to capture workers.
//!
//! [`LoadBalancer::assign`] is idempotent and safe to call from several
//! pollers at once: the store's unique index on enabled assignments decides
//! races, and the loser re-reads the winning row. Only assignments created by
//! the automatic policy are ever removed by [`LoadBalancer::clear`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use tapedeck_core::{WorkerType, AUTO_ON_LIVE};
use tapedeck_store::{AssignmentRepo, StoreError};

/// Reaction to live transitions, as seen by the poller.
#[async_trait]
pub trait Assigner: Send + Sync {
    /// Bind a target that just went live. Returns the responsible worker.
    async fn assign(&self, target_id: &str) -> Option<String>;

    /// Drop the automatic binding of a target that went offline.
    async fn clear(&self, target_id: &str);
}

pub struct LoadBalancer {
    repo: Arc<dyn AssignmentRepo>,
    worker_type: WorkerType,
}

impl LoadBalancer {
    pub fn new(repo: Arc<dyn AssignmentRepo>) -> Self {
        Self { repo, worker_type: WorkerType::Capture }
    }

    /// Current worker for a target, if any enabled assignment exists.
    pub async fn current(&self, target_id: &str) -> Option<String> {
        match self.repo.enabled_assignment(target_id, self.worker_type).await {
            Ok(found) => found.map(|a| a.worker_id),
            Err(e) => {
                warn!(target = %target_id, error = %e, "failed to read assignment");
                None
            }
        }
    }

    async fn try_assign(&self, target_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(existing) = self.repo.enabled_assignment(target_id, self.worker_type).await? {
            debug!(target = %target_id, worker = %existing.worker_id, "already assigned");
            return Ok(Some(existing.worker_id));
        }

        let loads = self.repo.worker_loads(self.worker_type).await?;
        let Some(chosen) = loads.first() else {
            error!(target = %target_id, "no active capture workers available");
            return Ok(None);
        };
        if chosen.is_saturated() {
            warn!(
                target = %target_id,
                worker = %chosen.instance_id,
                load = chosen.current_load,
                capacity = chosen.max_capacity,
                "least loaded worker is at capacity, assigning anyway"
            );
        }

        match self
            .repo
            .insert_assignment(target_id, &chosen.instance_id, self.worker_type, AUTO_ON_LIVE)
            .await
        {
            Ok(assignment) => {
                info!(
                    target = %target_id,
                    worker = %assignment.worker_id,
                    load = chosen.current_load + 1,
                    "assigned"
                );
                Ok(Some(assignment.worker_id))
            }
            Err(e) if e.is_unique_violation() => {
                let winner = self
                    .repo
                    .enabled_assignment(target_id, self.worker_type)
                    .await?
                    .map(|a| a.worker_id);
                debug!(target = %target_id, worker = ?winner, "lost assignment race, using winner");
                Ok(winner)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Assigner for LoadBalancer {
    async fn assign(&self, target_id: &str) -> Option<String> {
        match self.try_assign(target_id).await {
            Ok(worker) => worker,
            Err(e) => {
                error!(target = %target_id, error = %e, "assignment failed");
                None
            }
        }
    }

    async fn clear(&self, target_id: &str) {
        match self
            .repo
            .delete_assignments(target_id, self.worker_type, Some(AUTO_ON_LIVE))
            .await
        {
            Ok(0) => debug!(target = %target_id, "no automatic assignment to clear"),
            Ok(n) => info!(target = %target_id, removed = n, "assignment cleared"),
            Err(e) => error!(target = %target_id, error = %e, "failed to clear assignment"),
        }
    }
}
