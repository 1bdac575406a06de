//! PostgreSQL implementation of the repository traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::debug;

use tapedeck_core::{Assignment, Target, WorkerInstance, WorkerLoad, WorkerStatus, WorkerType};

use crate::db::Database;
use crate::error::{is_connection_error, map_unique_violation, StoreError};
use crate::repo::{
    AssignmentRepo, HistoryEvent, InstanceRepo, LiveStatusRepo, LiveWrite, TargetRepo,
};

// ── Rows ─────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct AssignmentRow {
    target_id: String,
    worker_id: String,
    worker_type: String,
    enabled: bool,
    assigned_by: String,
    assigned_at: DateTime<Utc>,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = StoreError;

    fn try_from(row: AssignmentRow) -> Result<Self, Self::Error> {
        Ok(Assignment {
            target_id: row.target_id,
            worker_id: row.worker_id,
            worker_type: row.worker_type.parse()?,
            enabled: row.enabled,
            assigned_by: row.assigned_by,
            assigned_at: row.assigned_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct InstanceRow {
    instance_id: String,
    worker_type: String,
    display_name: Option<String>,
    max_capacity: i32,
    status: String,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for WorkerInstance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(WorkerInstance {
            instance_id: row.instance_id,
            worker_type: row.worker_type.parse()?,
            display_name: row.display_name,
            max_capacity: row.max_capacity,
            status: row.status.parse()?,
            last_heartbeat: row.last_heartbeat,
        })
    }
}

#[derive(Debug, FromRow)]
struct LoadRow {
    instance_id: String,
    max_capacity: i32,
    current_load: i64,
}

#[derive(Debug, FromRow)]
struct TargetRow {
    id: String,
    display_name: String,
    local_name: Option<String>,
    room_id: Option<i64>,
    team: Option<String>,
    stream_key: Option<String>,
    naming_override: Option<String>,
    enabled: bool,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        Target {
            id: row.id,
            display_name: row.display_name,
            local_name: row.local_name,
            room_id: row.room_id,
            team: row.team,
            stream_key: row.stream_key,
            naming_override: row.naming_override,
            enabled: row.enabled,
        }
    }
}

const ASSIGNMENT_COLUMNS: &str = "target_id, worker_id, worker_type, enabled, assigned_by, assigned_at";

// ── Repository ───────────────────────────────────────────────────────

/// All repository traits over one [`Database`].
#[derive(Clone)]
pub struct PgRepository {
    db: Arc<Database>,
}

impl PgRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl LiveStatusRepo for PgRepository {
    async fn write_batch(&self, batch: &[LiveWrite]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let pool = self.db.pool().await?;

        let mut ids = Vec::with_capacity(batch.len());
        let mut rooms = Vec::with_capacity(batch.len());
        let mut groups = Vec::with_capacity(batch.len());
        let mut teams = Vec::with_capacity(batch.len());
        let mut lives = Vec::with_capacity(batch.len());
        let mut starts = Vec::with_capacity(batch.len());
        let mut checks = Vec::with_capacity(batch.len());
        for w in batch {
            ids.push(w.target_id.clone());
            rooms.push(w.room_id);
            groups.push(w.group_name.clone());
            teams.push(w.team_name.clone());
            lives.push(w.is_live);
            starts.push(if w.is_live { w.started_at } else { None });
            checks.push(w.checked_at);
        }

        let result = async {
            let mut tx = pool.begin().await?;

            sqlx::query(
                "INSERT INTO live_status (target_id, room_id, group_name, team_name, is_live, started_at, last_check)
                 SELECT * FROM UNNEST($1::text[], $2::int8[], $3::text[], $4::text[], $5::bool[], $6::timestamptz[], $7::timestamptz[])
                 ON CONFLICT (target_id) DO UPDATE SET
                     room_id    = COALESCE(EXCLUDED.room_id, live_status.room_id),
                     group_name = EXCLUDED.group_name,
                     team_name  = EXCLUDED.team_name,
                     is_live    = EXCLUDED.is_live,
                     started_at = CASE WHEN EXCLUDED.is_live
                                       THEN COALESCE(EXCLUDED.started_at, live_status.started_at)
                                       ELSE NULL END,
                     last_check = EXCLUDED.last_check",
            )
            .bind(&ids)
            .bind(&rooms)
            .bind(&groups)
            .bind(&teams)
            .bind(&lives)
            .bind(&starts)
            .bind(&checks)
            .execute(&mut *tx)
            .await?;

            for w in batch {
                for event in &w.history {
                    match event {
                        HistoryEvent::Opened { at } => {
                            sqlx::query(
                                "INSERT INTO live_history (target_id, room_id, started_at) VALUES ($1, $2, $3)",
                            )
                            .bind(&w.target_id)
                            .bind(w.room_id)
                            .bind(*at)
                            .execute(&mut *tx)
                            .await?;
                        }
                        HistoryEvent::Closed { at } => {
                            sqlx::query(
                                "UPDATE live_history SET
                                     ended_at = $2::timestamptz,
                                     duration_minutes = GREATEST(0, EXTRACT(EPOCH FROM ($2::timestamptz - started_at)) / 60)::int
                                 WHERE id = (
                                     SELECT id FROM live_history
                                     WHERE target_id = $1 AND ended_at IS NULL
                                     ORDER BY started_at DESC LIMIT 1
                                 )",
                            )
                            .bind(&w.target_id)
                            .bind(*at)
                            .execute(&mut *tx)
                            .await?;
                        }
                    }
                }
            }

            tx.commit().await
        }
        .await;

        self.db.observe(result).await?;
        debug!(rows = batch.len(), "live status batch written");
        Ok(())
    }

    async fn live_targets_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_as::<_, (String, Option<DateTime<Utc>>)>(
            "SELECT s.target_id, s.started_at
             FROM live_status s
             JOIN assignments a ON a.target_id = s.target_id
             WHERE a.worker_id = $1 AND a.worker_type = 'capture' AND a.enabled AND s.is_live",
        )
        .bind(worker_id)
        .fetch_all(&pool)
        .await;
        let rows = self.db.observe(result).await?;
        Ok(rows.into_iter().collect())
    }

    async fn is_live(&self, target_id: &str) -> Result<Option<bool>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_scalar::<_, bool>("SELECT is_live FROM live_status WHERE target_id = $1")
            .bind(target_id)
            .fetch_optional(&pool)
            .await;
        self.db.observe(result).await
    }
}

#[async_trait]
impl AssignmentRepo for PgRepository {
    async fn enabled_assignment(
        &self,
        target_id: &str,
        worker_type: WorkerType,
    ) -> Result<Option<Assignment>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
             WHERE target_id = $1 AND worker_type = $2 AND enabled
             ORDER BY assigned_at ASC LIMIT 1"
        ))
        .bind(target_id)
        .bind(worker_type.as_str())
        .fetch_optional(&pool)
        .await;
        self.db.observe(result).await?.map(Assignment::try_from).transpose()
    }

    async fn worker_loads(&self, worker_type: WorkerType) -> Result<Vec<WorkerLoad>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_as::<_, LoadRow>(
            "SELECT i.instance_id, i.max_capacity, COUNT(a.id) AS current_load
             FROM instances i
             LEFT JOIN assignments a ON a.worker_id = i.instance_id AND a.enabled
             WHERE i.worker_type = $1 AND i.status = 'active'
             GROUP BY i.instance_id, i.max_capacity
             ORDER BY current_load ASC, i.instance_id ASC",
        )
        .bind(worker_type.as_str())
        .fetch_all(&pool)
        .await;
        let rows = self.db.observe(result).await?;
        Ok(rows
            .into_iter()
            .map(|r| WorkerLoad {
                instance_id: r.instance_id,
                max_capacity: r.max_capacity,
                current_load: r.current_load,
            })
            .collect())
    }

    async fn insert_assignment(
        &self,
        target_id: &str,
        worker_id: &str,
        worker_type: WorkerType,
        assigned_by: &str,
    ) -> Result<Assignment, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_as::<_, AssignmentRow>(&format!(
            "INSERT INTO assignments (target_id, worker_id, worker_type, enabled, assigned_by)
             VALUES ($1, $2, $3, TRUE, $4)
             RETURNING {ASSIGNMENT_COLUMNS}"
        ))
        .bind(target_id)
        .bind(worker_id)
        .bind(worker_type.as_str())
        .bind(assigned_by)
        .fetch_one(&pool)
        .await;

        match result {
            Ok(row) => Assignment::try_from(row),
            Err(e) if !is_connection_error(&e) => Err(map_unique_violation(
                e,
                &format!("{}/{}", target_id, worker_type),
            )),
            Err(e) => self.db.observe(Err(e)).await,
        }
    }

    async fn delete_assignments(
        &self,
        target_id: &str,
        worker_type: WorkerType,
        assigned_by: Option<&str>,
    ) -> Result<u64, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query(
            "DELETE FROM assignments
             WHERE target_id = $1 AND worker_type = $2
               AND ($3::text IS NULL OR assigned_by = $3)",
        )
        .bind(target_id)
        .bind(worker_type.as_str())
        .bind(assigned_by)
        .execute(&pool)
        .await;
        Ok(self.db.observe(result).await?.rows_affected())
    }

    async fn list_assignments(&self, worker_id: Option<&str>) -> Result<Vec<Assignment>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
             WHERE ($1::text IS NULL OR worker_id = $1)
             ORDER BY worker_id, target_id"
        ))
        .bind(worker_id)
        .fetch_all(&pool)
        .await;
        self.db
            .observe(result)
            .await?
            .into_iter()
            .map(Assignment::try_from)
            .collect()
    }
}

#[async_trait]
impl InstanceRepo for PgRepository {
    async fn list_instances(&self) -> Result<Vec<WorkerInstance>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_as::<_, InstanceRow>(
            "SELECT instance_id, worker_type, display_name, max_capacity, status, last_heartbeat
             FROM instances ORDER BY worker_type, instance_id",
        )
        .fetch_all(&pool)
        .await;
        self.db
            .observe(result)
            .await?
            .into_iter()
            .map(WorkerInstance::try_from)
            .collect()
    }

    async fn register(&self, instance: &WorkerInstance) -> Result<(), StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query(
            "INSERT INTO instances (instance_id, worker_type, display_name, max_capacity, status, last_heartbeat)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (instance_id) DO UPDATE SET
                 worker_type    = EXCLUDED.worker_type,
                 display_name   = EXCLUDED.display_name,
                 max_capacity   = EXCLUDED.max_capacity,
                 status         = EXCLUDED.status,
                 last_heartbeat = COALESCE(EXCLUDED.last_heartbeat, instances.last_heartbeat)",
        )
        .bind(&instance.instance_id)
        .bind(instance.worker_type.as_str())
        .bind(&instance.display_name)
        .bind(instance.max_capacity)
        .bind(instance.status.as_str())
        .bind(instance.last_heartbeat)
        .execute(&pool)
        .await;
        self.db.observe(result).await?;
        Ok(())
    }

    async fn set_status(&self, instance_id: &str, status: WorkerStatus) -> Result<bool, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query("UPDATE instances SET status = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(status.as_str())
            .execute(&pool)
            .await;
        Ok(self.db.observe(result).await?.rows_affected() > 0)
    }

    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query("UPDATE instances SET last_heartbeat = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(at)
            .execute(&pool)
            .await;
        Ok(self.db.observe(result).await?.rows_affected() > 0)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&pool)
            .await;
        Ok(self.db.observe(result).await?.rows_affected() > 0)
    }

    async fn active_ids(&self, worker_type: WorkerType) -> Result<Vec<String>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_scalar::<_, String>(
            "SELECT instance_id FROM instances
             WHERE worker_type = $1 AND status = 'active'
             ORDER BY instance_id",
        )
        .bind(worker_type.as_str())
        .fetch_all(&pool)
        .await;
        self.db.observe(result).await
    }
}

#[async_trait]
impl TargetRepo for PgRepository {
    async fn enabled_targets(&self) -> Result<Vec<Target>, StoreError> {
        let pool = self.db.pool().await?;
        let result = sqlx::query_as::<_, TargetRow>(
            "SELECT id, display_name, local_name, room_id, team, stream_key, naming_override, enabled
             FROM targets WHERE enabled ORDER BY id",
        )
        .fetch_all(&pool)
        .await;
        Ok(self.db.observe(result).await?.into_iter().map(Target::from).collect())
    }
}
