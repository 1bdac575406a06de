//! Lazily (re)connecting PostgreSQL handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use tapedeck_core::config::PostgresConfig;

use crate::error::{is_connection_error, StoreError};

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared connection pool that is (re)built on demand.
///
/// A call site asks for the pool through [`Database::pool`]; when no healthy
/// pool exists, up to `attempts` connections are tried before the call fails
/// with [`StoreError::Unavailable`]. Queries report their outcome through
/// [`Database::observe`] so a dropped connection invalidates the pool.
pub struct Database {
    url: String,
    max_connections: u32,
    attempts: u32,
    pool: RwLock<Option<PgPool>>,
    migrated: AtomicBool,
}

impl Database {
    pub fn new(config: &PostgresConfig) -> Self {
        Self {
            url: config.database_url(),
            max_connections: config.max_connections,
            attempts: config.connect_attempts.max(1),
            pool: RwLock::new(None),
            migrated: AtomicBool::new(false),
        }
    }

    /// Try to connect once up front. Failure is logged, not fatal: the
    /// next call site reconnects.
    pub async fn warm_up(&self) {
        match self.pool().await {
            Ok(_) => info!("PostgreSQL connected"),
            Err(e) => warn!(error = %e, "PostgreSQL not reachable at startup, will retry lazily"),
        }
    }

    pub async fn pool(&self) -> Result<PgPool, StoreError> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.as_ref() {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match self.open().await {
                Ok(pool) => {
                    if attempt > 1 {
                        info!(attempt, "PostgreSQL reconnected");
                    }
                    *guard = Some(pool.clone());
                    return Ok(pool);
                }
                Err(e) => {
                    warn!(attempt, attempts = self.attempts, error = %e, "PostgreSQL connect failed");
                    last_error = e.to_string();
                    if attempt < self.attempts {
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                }
            }
        }
        Err(StoreError::Unavailable(last_error))
    }

    async fn open(&self) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&self.url)
            .await?;

        if !self.migrated.load(Ordering::Acquire) {
            sqlx::migrate!("../../migrations").run(&pool).await?;
            self.migrated.store(true, Ordering::Release);
            info!("Database migrations applied successfully");
        }
        Ok(pool)
    }

    /// Pass a query result through, dropping the pool on connection loss.
    pub async fn observe<T>(&self, result: Result<T, sqlx::Error>) -> Result<T, StoreError> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                if is_connection_error(&e) {
                    warn!(error = %e, "PostgreSQL connection lost, pool dropped");
                    self.invalidate().await;
                }
                Err(StoreError::Database(e))
            }
        }
    }

    pub async fn invalidate(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
    }
}
