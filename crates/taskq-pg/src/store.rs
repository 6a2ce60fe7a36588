//! PgTaskStore - PostgreSQL 上の正本
//!
//! # ロック戦略
//! - mutex key ごとに `pg_try_advisory_xact_lock`（待たない、commit/rollback で解放）
//! - グループの行は `FOR UPDATE OF q, t SKIP LOCKED`（他ワーカーの行は飛ばす）
//!
//! ID は ULID の文字列（プレフィックスなし）で保存します。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::debug;

use taskq_core::domain::{
    EntryId, HandlerKey, NewEntry, Payload, QueueEntry, Run, RunId, StoreError, Task, TaskId,
    TaskStatus,
};
use taskq_core::ports::{Candidate, StoreTx, TaskStore};

fn backend(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn corrupt(what: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {value}"))
}

fn db_id<T: taskq_core::domain::ids::IdMarker>(id: taskq_core::domain::ids::Id<T>) -> String {
    id.as_ulid().to_string()
}

fn parse_retries(retries: i32) -> Result<u32, StoreError> {
    u32::try_from(retries).map_err(|_| corrupt("negative retries", retries))
}

/// PostgreSQL implementation of [`TaskStore`].
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new connection pool.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(backend)?;

        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PgTx { tx }))
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: String,
    name: String,
    status: String,
    handler: String,
    args: Value,
    kwargs: Value,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id: TaskId = row.id.parse().map_err(|_| corrupt("task id", &row.id))?;
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|_| corrupt("task status", &row.status))?;
        let args = match row.args {
            Value::Array(args) => args,
            other => return Err(corrupt("task args", other)),
        };
        let kwargs = match row.kwargs {
            Value::Object(kwargs) => kwargs,
            other => return Err(corrupt("task kwargs", other)),
        };
        Ok(Task {
            id,
            name: row.name,
            status,
            handler: HandlerKey::new(row.handler),
            payload: Payload { args, kwargs },
            created: row.created,
            updated: row.updated,
        })
    }
}

#[derive(FromRow)]
struct EntryRow {
    id: i64,
    task_id: String,
    priority: i32,
    mutex: String,
    retries: i32,
    created: DateTime<Utc>,
    not_before: Option<DateTime<Utc>>,
}

impl TryFrom<EntryRow> for QueueEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(QueueEntry {
            id: EntryId::new(row.id),
            task_id: row
                .task_id
                .parse()
                .map_err(|_| corrupt("entry task id", &row.task_id))?,
            priority: row.priority,
            mutex: row.mutex,
            retries: parse_retries(row.retries)?,
            created: row.created,
            not_before: row.not_before,
        })
    }
}

/// Entry joined with its task; task columns are prefixed with `t_`.
#[derive(FromRow)]
struct CandidateRow {
    #[sqlx(flatten)]
    entry: EntryRow,
    t_name: String,
    t_status: String,
    t_handler: String,
    t_args: Value,
    t_kwargs: Value,
    t_created: DateTime<Utc>,
    t_updated: DateTime<Utc>,
}

impl TryFrom<CandidateRow> for Candidate {
    type Error = StoreError;

    fn try_from(row: CandidateRow) -> Result<Self, Self::Error> {
        let task = Task::try_from(TaskRow {
            id: row.entry.task_id.clone(),
            name: row.t_name,
            status: row.t_status,
            handler: row.t_handler,
            args: row.t_args,
            kwargs: row.t_kwargs,
            created: row.t_created,
            updated: row.t_updated,
        })?;
        Ok(Candidate {
            entry: QueueEntry::try_from(row.entry)?,
            task,
        })
    }
}

#[derive(FromRow)]
struct RunRow {
    id: String,
    task_id: String,
    output: Option<Value>,
    error: Option<Value>,
    created: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let id: RunId = row.id.parse().map_err(|_| corrupt("run id", &row.id))?;
        let task_id: TaskId = row
            .task_id
            .parse()
            .map_err(|_| corrupt("run task id", &row.task_id))?;
        Ok(Run {
            id,
            task_id,
            output: row.output,
            error: row.error,
            created: row.created,
        })
    }
}

const ELIGIBLE: &str = "t.status IN ('NEW', 'RETRY') AND (q.not_before IS NULL OR q.not_before <= $2)";

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_task(&mut self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO taskq_tasks (id, name, status, handler, args, kwargs, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(db_id(task.id))
        .bind(&task.name)
        .bind(task.status.as_str())
        .bind(task.handler.as_str())
        .bind(Value::Array(task.payload.args.clone()))
        .bind(Value::Object(task.payload.kwargs.clone()))
        .bind(task.created)
        .bind(task.updated)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn insert_entry(&mut self, entry: NewEntry) -> Result<QueueEntry, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            INSERT INTO taskq_queue (task_id, priority, mutex, retries, created)
            VALUES ($1, $2, $3, 0, $4)
            RETURNING id, task_id, priority, mutex, retries, created, not_before
            "#,
        )
        .bind(db_id(entry.task_id))
        .bind(entry.priority)
        .bind(&entry.mutex)
        .bind(entry.created)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(backend)?;
        QueueEntry::try_from(row)
    }

    async fn get_task(&mut self, id: TaskId, for_update: bool) -> Result<Option<Task>, StoreError> {
        let sql = if for_update {
            "SELECT id, name, status, handler, args, kwargs, created, updated \
             FROM taskq_tasks WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT id, name, status, handler, args, kwargs, created, updated \
             FROM taskq_tasks WHERE id = $1"
        };
        let row = sqlx::query_as::<_, TaskRow>(sql)
            .bind(db_id(id))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)?;
        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&mut self, include_completed: bool) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, name, status, handler, args, kwargs, created, updated
            FROM taskq_tasks
            WHERE $1 OR status <> 'COMPLETED'
            ORDER BY created, id
            "#,
        )
        .bind(include_completed)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn entry_for_task(&mut self, task_id: TaskId) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT id, task_id, priority, mutex, retries, created, not_before
            FROM taskq_queue
            WHERE task_id = $1
            "#,
        )
        .bind(db_id(task_id))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(backend)?;
        row.map(QueueEntry::try_from).transpose()
    }

    async fn next_mutex(
        &mut self,
        now: DateTime<Utc>,
        skip: &[String],
    ) -> Result<Option<String>, StoreError> {
        let sql = format!(
            r#"
            SELECT q.mutex
            FROM taskq_queue q
            JOIN taskq_tasks t ON t.id = q.task_id
            WHERE NOT (q.mutex = ANY($1)) AND {ELIGIBLE}
            ORDER BY q.priority DESC, q.created, q.id
            LIMIT 1
            "#
        );
        sqlx::query_scalar::<_, String>(&sql)
            .bind(skip)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)
    }

    async fn try_lock_mutex(&mut self, mutex: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(mutex)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(backend)
    }

    async fn lock_mutex(&mut self, mutex: &str) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(mutex)
            .execute(&mut *self.tx)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn lock_group(
        &mut self,
        mutex: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let sql = format!(
            r#"
            SELECT q.id, q.task_id, q.priority, q.mutex, q.retries, q.created, q.not_before,
                   t.name AS t_name, t.status AS t_status, t.handler AS t_handler,
                   t.args AS t_args, t.kwargs AS t_kwargs,
                   t.created AS t_created, t.updated AS t_updated
            FROM taskq_queue q
            JOIN taskq_tasks t ON t.id = q.task_id
            WHERE q.mutex = $1 AND {ELIGIBLE}
            ORDER BY q.priority DESC, q.created, q.id
            FOR UPDATE OF q, t SKIP LOCKED
            "#
        );
        let rows = sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(mutex)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(backend)?;
        debug!(%mutex, rows = rows.len(), "locked mutex group");
        rows.into_iter().map(Candidate::try_from).collect()
    }

    async fn has_in_flight(&mut self, mutex: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM taskq_queue q
                JOIN taskq_tasks t ON t.id = q.task_id
                WHERE q.mutex = $1 AND t.status = 'PROGRESS'
            )
            "#,
        )
        .bind(mutex)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(backend)
    }

    async fn set_status(
        &mut self,
        ids: &[TaskId],
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ids: Vec<String> = ids.iter().copied().map(db_id).collect();
        let updated = sqlx::query(
            "UPDATE taskq_tasks SET status = $1, updated = $2 WHERE id = ANY($3)",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(&ids)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?
        .rows_affected();

        if updated != ids.len() as u64 {
            return Err(StoreError::Conflict(format!(
                "updated {updated} of {} tasks",
                ids.len()
            )));
        }
        Ok(())
    }

    async fn delete_entries(&mut self, ids: &[EntryId]) -> Result<(), StoreError> {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        sqlx::query("DELETE FROM taskq_queue WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn requeue_entry(
        &mut self,
        id: EntryId,
        retries: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let retries = i32::try_from(retries)
            .map_err(|_| StoreError::Conflict(format!("retry counter overflow on {id}")))?;
        let updated = sqlx::query(
            "UPDATE taskq_queue SET retries = $1, not_before = $2 WHERE id = $3",
        )
        .bind(retries)
        .bind(not_before)
        .bind(id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::Conflict(format!("unknown {id}")));
        }
        Ok(())
    }

    async fn unblock_mutex(
        &mut self,
        mutex: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE taskq_tasks t
            SET status = 'NEW', updated = $2
            FROM taskq_queue q
            WHERE q.task_id = t.id AND q.mutex = $1 AND t.status = 'BLOCKED'
            RETURNING t.id
            "#,
        )
        .bind(mutex)
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;

        ids.into_iter()
            .map(|id| id.parse().map_err(|_| corrupt("task id", &id)))
            .collect()
    }

    async fn insert_run(&mut self, run: &Run) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO taskq_task_runs (id, task_id, output, error, created)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(db_id(run.id))
        .bind(db_id(run.task_id))
        .bind(&run.output)
        .bind(&run.error)
        .bind(run.created)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_runs(&mut self, task_id: TaskId) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, task_id, output, error, created
            FROM taskq_task_runs
            WHERE task_id = $1
            ORDER BY created, id
            "#,
        )
        .bind(db_id(task_id))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn delete_runs(&mut self, task_id: TaskId) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM taskq_task_runs WHERE task_id = $1")
            .bind(db_id(task_id))
            .execute(&mut *self.tx)
            .await
            .map_err(backend)?
            .rows_affected();
        Ok(deleted)
    }

    async fn count_by_status(&mut self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM taskq_tasks GROUP BY status ORDER BY status",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|(status, n)| {
                let status: TaskStatus =
                    status.parse().map_err(|_| corrupt("task status", &status))?;
                Ok((status, u64::try_from(n).unwrap_or(0)))
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(backend)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(backend)
    }
}
