//! Postgres-backed task store implementation.
//!
//! All tasks live in one table (default `tasks`). Every trait operation is a
//! single SQL statement, so each one is atomic on its own and no transaction
//! spans more than one round-trip.
//!
//! ## Leasing
//!
//! `lease_next` selects the oldest eligible row with `FOR UPDATE SKIP LOCKED`
//! and stamps `locked_at` in the same statement. Concurrent leasers skip rows
//! another transaction is already claiming instead of waiting on them, and the
//! lease window is evaluated against the database clock (`now()`) so skew
//! between worker hosts cannot let two workers hold the same lease.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskStoreError |
//! |------------|----------------------|----------------|
//! | Database (unique violation) on insert | `23505` | `DuplicateId` |
//! | Row decode failure | N/A | `Corrupt` |
//! | Anything else (pool closed, network, other database errors) | any | `Unavailable` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use taskforge_core::{RetryStrategy, Task, TaskId};

use super::filter::TaskFilter;
use super::r#trait::{Reschedule, TaskStore, TaskStoreError};

const DEFAULT_TABLE: &str = "tasks";

const COLUMNS: &str = "task_id, name, data, task_group, start_at, repeat_every_ms, \
    retry_strategy, locked_at, processed_at, failed_at, error_msg, retries, result, created_at";

/// Postgres-backed task store.
///
/// `Clone` is cheap: clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    table: String,
}

impl PostgresTaskStore {
    /// Use the default `tasks` table.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Use a custom table; the name must be a plain SQL identifier.
    pub fn with_table(pool: PgPool, table: &str) -> Result<Self, TaskStoreError> {
        Ok(Self {
            pool: Arc::new(pool),
            table: validate_table_name(table)?,
        })
    }

    /// Open a connection pool and make sure the table and indexes exist.
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, TaskStoreError> {
        let table = validate_table_name(table)?;
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self {
            pool: Arc::new(pool),
            table,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_task(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Task>, TaskStoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|row| decode_task(&row)).transpose()
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        let t = &self.table;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    seq BIGSERIAL NOT NULL,
                    task_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    data JSONB NOT NULL,
                    task_group TEXT NULL,
                    start_at TIMESTAMPTZ NOT NULL,
                    repeat_every_ms BIGINT NOT NULL DEFAULT 0,
                    retry_strategy TEXT NOT NULL DEFAULT 'pow1',
                    locked_at TIMESTAMPTZ NOT NULL DEFAULT to_timestamp(0),
                    processed_at TIMESTAMPTZ NULL,
                    failed_at TIMESTAMPTZ NULL,
                    error_msg TEXT NULL,
                    retries INTEGER NOT NULL DEFAULT 0,
                    result JSONB NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    CHECK (task_group IS NULL OR repeat_every_ms = 0)
                )
                "#
            ),
            // Leasing predicate.
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_lease_idx ON {t} (processed_at, start_at, locked_at)"
            ),
            // Predecessor lookup.
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_group_idx ON {t} (task_group, created_at, seq) \
                 WHERE task_group IS NOT NULL"
            ),
            // Creation ordering.
            format!("CREATE INDEX IF NOT EXISTS {t}_created_idx ON {t} (created_at, seq)"),
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }

        debug!(table = %t, "task table and indexes ensured");
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_name = %task.name), err)]
    async fn insert_unique(&self, task: Task) -> Result<Task, TaskStoreError> {
        let sql = format!(
            r#"
            INSERT INTO {t} ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
            t = self.table
        );

        sqlx::query(&sql)
            .bind(task.id.as_str())
            .bind(&task.name)
            .bind(&task.data)
            .bind(task.group.as_deref())
            .bind(task.start_at)
            .bind(duration_to_millis(task.repeat_every))
            .bind(task.retry_strategy.to_string())
            .bind(task.locked_at)
            .bind(task.processed_at)
            .bind(task.failed_at)
            .bind(task.error_msg.as_deref())
            .bind(i32::try_from(task.retries).unwrap_or(i32::MAX))
            .bind(task.result.as_ref())
            .bind(task.created_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    TaskStoreError::DuplicateId(task.id.clone())
                } else {
                    map_sqlx_error("insert_unique", e)
                }
            })?;

        Ok(task)
    }

    #[instrument(skip(self), err)]
    async fn lease_next(&self, lease: Duration) -> Result<Option<Task>, TaskStoreError> {
        // `previous_locked_at` lets the statement hand back the pre-lease record.
        let sql = format!(
            r#"
            WITH next AS (
                SELECT task_id, locked_at AS previous_locked_at
                FROM {t}
                WHERE processed_at IS NULL
                  AND start_at <= now()
                  AND locked_at < now() - ($1::bigint * interval '1 millisecond')
                ORDER BY created_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {t} AS t
            SET locked_at = now()
            FROM next
            WHERE t.task_id = next.task_id
            RETURNING
                t.task_id, t.name, t.data, t.task_group, t.start_at, t.repeat_every_ms,
                t.retry_strategy, next.previous_locked_at AS locked_at, t.processed_at,
                t.failed_at, t.error_msg, t.retries, t.result, t.created_at
            "#,
            t = self.table
        );

        self.fetch_one_task(
            "lease_next",
            sqlx::query(&sql).bind(duration_to_millis(lease)),
        )
        .await
    }

    #[instrument(skip(self), fields(successor = %successor), err)]
    async fn find_predecessor(
        &self,
        group: &str,
        successor: &TaskId,
    ) -> Result<Option<Task>, TaskStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM {t} AS p
            WHERE p.task_group = $1
              AND (p.created_at, p.seq) < (
                  SELECT s.created_at, s.seq FROM {t} AS s WHERE s.task_id = $2
              )
            ORDER BY p.created_at DESC, p.seq DESC
            LIMIT 1
            "#,
            t = self.table
        );

        self.fetch_one_task(
            "find_predecessor",
            sqlx::query(&sql).bind(group).bind(successor.as_str()),
        )
        .await
    }

    #[instrument(skip(self, message), fields(task_id = %id), err)]
    async fn mark_failed(
        &self,
        id: &TaskId,
        message: &str,
    ) -> Result<Option<Task>, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {t}
            SET failed_at = now(), error_msg = $2, retries = retries + 1
            WHERE task_id = $1
            RETURNING {COLUMNS}
            "#,
            t = self.table
        );

        self.fetch_one_task(
            "mark_failed",
            sqlx::query(&sql).bind(id.as_str()).bind(message),
        )
        .await
    }

    #[instrument(skip(self, result), fields(task_id = %id), err)]
    async fn mark_processed(
        &self,
        id: &TaskId,
        result: JsonValue,
    ) -> Result<Option<Task>, TaskStoreError> {
        // Assignments read the old row, so a second commit changes nothing.
        let sql = format!(
            r#"
            UPDATE {t}
            SET processed_at = COALESCE(processed_at, now()),
                result = CASE WHEN processed_at IS NULL THEN $2 ELSE result END
            WHERE task_id = $1
            RETURNING {COLUMNS}
            "#,
            t = self.table
        );

        self.fetch_one_task(
            "mark_processed",
            sqlx::query(&sql).bind(id.as_str()).bind(&result),
        )
        .await
    }

    #[instrument(
        skip(self, reschedule),
        fields(task_id = %id, start_at = %reschedule.start_at, reset_lease = reschedule.reset_lease),
        err
    )]
    async fn reschedule(
        &self,
        id: &TaskId,
        reschedule: Reschedule,
    ) -> Result<Option<Task>, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {t}
            SET start_at = $2,
                locked_at = CASE WHEN $3 THEN to_timestamp(0) ELSE locked_at END,
                retries = CASE WHEN $4 THEN 0 ELSE retries END,
                result = COALESCE($5, result)
            WHERE task_id = $1
            RETURNING {COLUMNS}
            "#,
            t = self.table
        );

        self.fetch_one_task(
            "reschedule",
            sqlx::query(&sql)
                .bind(id.as_str())
                .bind(reschedule.start_at)
                .bind(reschedule.reset_lease)
                .bind(reschedule.reset_retries)
                .bind(reschedule.result.as_ref()),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn find(&self, filter: &TaskFilter) -> Result<Option<Task>, TaskStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM {t}
            WHERE {FILTER}
            ORDER BY created_at ASC, seq ASC
            LIMIT 1
            "#,
            t = self.table
        );

        self.fetch_one_task("find", bind_filter(sqlx::query(&sql), filter))
            .await
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, filter: &TaskFilter) -> Result<u64, TaskStoreError> {
        let sql = format!("DELETE FROM {t} WHERE {FILTER}", t = self.table);

        let done = bind_filter(sqlx::query(&sql), filter)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;

        Ok(done.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Optional predicates of [`TaskFilter`]; `NULL` parameters match everything.
const FILTER: &str = "($1::text IS NULL OR task_id = $1) \
    AND ($2::text IS NULL OR name = $2) \
    AND ($3::text IS NULL OR task_group = $3) \
    AND ($4::boolean IS NULL OR (processed_at IS NOT NULL) = $4) \
    AND ($5::boolean IS NULL OR (failed_at IS NOT NULL) = $5)";

fn bind_filter<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    filter: &'q TaskFilter,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(filter.id.as_ref().map(|id| id.as_str()))
        .bind(filter.name.as_deref())
        .bind(filter.group.as_deref())
        .bind(filter.processed)
        .bind(filter.failed)
}

/// Accept only plain identifiers; the name is interpolated into SQL.
fn validate_table_name(table: &str) -> Result<String, TaskStoreError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && table.len() <= 48 {
        Ok(table.to_string())
    } else {
        Err(TaskStoreError::Invalid(format!(
            "table name {table:?} must be a plain identifier of at most 48 characters"
        )))
    }
}

fn duration_to_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Map SQLx errors to TaskStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => TaskStoreError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            TaskStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            TaskStoreError::Corrupt(format!("{} in {}", err, operation))
        }
        _ => TaskStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    task_id: String,
    name: String,
    data: JsonValue,
    task_group: Option<String>,
    start_at: DateTime<Utc>,
    repeat_every_ms: i64,
    retry_strategy: String,
    locked_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    error_msg: Option<String>,
    retries: i32,
    result: Option<JsonValue>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            data: row.try_get("data")?,
            task_group: row.try_get("task_group")?,
            start_at: row.try_get("start_at")?,
            repeat_every_ms: row.try_get("repeat_every_ms")?,
            retry_strategy: row.try_get("retry_strategy")?,
            locked_at: row.try_get("locked_at")?,
            processed_at: row.try_get("processed_at")?,
            failed_at: row.try_get("failed_at")?,
            error_msg: row.try_get("error_msg")?,
            retries: row.try_get("retries")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = TaskId::new(row.task_id)
            .map_err(|e| TaskStoreError::Corrupt(format!("task_id: {e}")))?;
        let retry_strategy: RetryStrategy = row
            .retry_strategy
            .parse()
            .map_err(|e| TaskStoreError::Corrupt(format!("retry_strategy: {e}")))?;

        Ok(Task {
            id,
            name: row.name,
            data: row.data,
            group: row.task_group,
            start_at: row.start_at,
            repeat_every: Duration::from_millis(u64::try_from(row.repeat_every_ms).unwrap_or(0)),
            retry_strategy,
            locked_at: row.locked_at,
            processed_at: row.processed_at,
            failed_at: row.failed_at,
            error_msg: row.error_msg,
            retries: u32::try_from(row.retries).unwrap_or(0),
            result: row.result,
            created_at: row.created_at,
        })
    }
}

fn decode_task(row: &PgRow) -> Result<Task, TaskStoreError> {
    let row = TaskRow::from_row(row)
        .map_err(|e| TaskStoreError::Corrupt(format!("failed to deserialize task row: {}", e)))?;
    row.try_into()
}
