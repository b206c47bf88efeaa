use crate::backend::{StatusCounts, StoreTransaction, TaskBackend, TaskFilter, TaskOrder};
use crate::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const COLUMNS: &str = "id, status, payload, created_at, claimed_at, assigned_worker, \
                       attempt_count, timeout_count, last_error, updated_at";

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PgConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for PgConfig {
    fn default() -> Self {
        PgConfig {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 5,
            max_lifetime_secs: 1800,
        }
    }
}

impl PgConfig {
    /// Connection URL with any password replaced, for logging.
    pub fn redacted_url(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme), Some(at)) if at > scheme => {
                let credentials = &self.url[scheme + 3..at];
                match credentials.split_once(':') {
                    Some((user, _)) => format!(
                        "{}{}:***{}",
                        &self.url[..scheme + 3],
                        user,
                        &self.url[at..]
                    ),
                    None => self.url.clone(),
                }
            }
            _ => self.url.clone(),
        }
    }
}

/// PostgreSQL backend. Claims rely on `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(config: &PgConfig) -> Result<Self> {
        info!("Connecting to {}", config.redacted_url());
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Database connected"
        );
        Ok(PgBackend { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgBackend { pool }
    }

    /// Apply embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    status: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    assigned_worker: Option<String>,
    attempt_count: i32,
    timeout_count: i32,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Task> {
        let corrupt = |reason: String| StoreError::Corrupt {
            task_id: row.id,
            reason,
        };
        let status: TaskStatus = row.status.parse().map_err(|e| corrupt(format!("{}", e)))?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| corrupt(format!("negative attempt_count {}", row.attempt_count)))?;
        let timeout_count = u32::try_from(row.timeout_count)
            .map_err(|_| corrupt(format!("negative timeout_count {}", row.timeout_count)))?;

        Ok(Task {
            id: row.id,
            status,
            payload: row.payload,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            assigned_worker: row.assigned_worker,
            attempt_count,
            timeout_count,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

fn push_filter(qb: &mut QueryBuilder<'static, Postgres>, filter: &TaskFilter) {
    qb.push(" WHERE TRUE");
    if let Some(id) = filter.id {
        qb.push(" AND id = ").push_bind(id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(cutoff) = filter.claimed_before {
        qb.push(" AND claimed_at < ").push_bind(cutoff);
    }
}

fn select_query(
    filter: &TaskFilter,
    order: TaskOrder,
    limit: usize,
    offset: usize,
    lock: Option<&'static str>,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT ");
    qb.push(COLUMNS).push(" FROM tasks");
    push_filter(&mut qb, filter);
    qb.push(" ORDER BY ").push(order.sql());
    qb.push(" LIMIT ").push_bind(to_i64(limit));
    if offset > 0 {
        qb.push(" OFFSET ").push_bind(to_i64(offset));
    }
    if let Some(lock) = lock {
        qb.push(lock);
    }
    qb
}

fn count_to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// LIMIT/OFFSET binds saturate instead of wrapping negative.
fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskBackend for PgBackend {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, status, payload, created_at, claimed_at, assigned_worker,
                attempt_count, timeout_count, last_error, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.id)
        .bind(task.status.as_str())
        .bind(&task.payload)
        .bind(task.created_at)
        .bind(task.claimed_at)
        .bind(task.assigned_worker.as_deref())
        .bind(count_to_i32(task.attempt_count))
        .bind(count_to_i32(task.timeout_count))
        .bind(task.last_error.as_deref())
        .bind(task.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(task.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM tasks WHERE id = $1", COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Task::try_from).transpose()
    }

    async fn list(&self, filter: &TaskFilter, limit: usize, offset: usize) -> Result<Vec<Task>> {
        let mut qb = select_query(filter, TaskOrder::CreatedAtDesc, limit, offset, None);
        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        into_tasks(rows)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let status: TaskStatus = status.parse()?;
            counts.add(status, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn purge(&self, filter: &TaskFilter) -> Result<u64> {
        // Rows held by an open claim transaction are left alone.
        let mut qb = QueryBuilder::new("DELETE FROM tasks WHERE id IN (SELECT id FROM tasks");
        push_filter(&mut qb, filter);
        qb.push(" FOR UPDATE SKIP LOCKED)");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn name(&self) -> &'static str {
        "postgresql"
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn select_for_update_skip_locked(
        &mut self,
        filter: &TaskFilter,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let mut qb = select_query(filter, order, limit, 0, Some(" FOR UPDATE SKIP LOCKED"));
        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&mut *self.tx).await?;
        debug!(rows = rows.len(), "skip-locked select");
        into_tasks(rows)
    }

    async fn select_for_update(
        &mut self,
        filter: &TaskFilter,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let mut qb = select_query(filter, order, limit, 0, Some(" FOR UPDATE"));
        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&mut *self.tx).await?;
        into_tasks(rows)
    }

    async fn update(&mut self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                claimed_at = $3,
                assigned_worker = $4,
                attempt_count = $5,
                timeout_count = $6,
                last_error = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.status.as_str())
        .bind(task.claimed_at)
        .bind(task.assigned_worker.as_deref())
        .bind(count_to_i32(task.attempt_count))
        .bind(count_to_i32(task.timeout_count))
        .bind(task.last_error.as_deref())
        .bind(task.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.id));
        }
        Ok(())
    }

    async fn now(&mut self) -> Result<DateTime<Utc>> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(now)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
