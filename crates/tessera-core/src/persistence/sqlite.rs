// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Same semantics as the PostgreSQL backend. SQLite has no row locks, so
//! every write transaction runs under one writer lock per database and the
//! free functions here can work row by row without lock ordering concerns.
//! Array columns are stored as JSON text.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::CoreError;

use super::{
    AggregateCandidate, AggregateRequest, AssignedTask, ConcurrencySlot, ConditionEventType,
    ConditionSatisfaction, Dag, DequeuedItem, Event, ExpiredRuntime, ExpressionEval,
    HintedEventKey, HoldingArea, INSERT_CHUNK_SIZE, InitialState, MATCH_COLUMNS,
    MATCH_CONDITION_COLUMNS, Match, MatchColumns, MatchCondition, MatchKind, MatchTarget, NewDag,
    NewEvent, NewMatch, NewTask, NewTaskEvent, Persistence, PersistenceTx, PromotedAttempt,
    RateLimitedRequeue, ReleasedTask, ReplayedTasks, RetrySchedule, SatisfiedMatch, SlotCandidate,
    TASK_COLUMNS, Task, TaskAttempt, TaskColumns, TaskEvent, TaskReplay, WorkflowConcurrencySlot,
    WorkflowSlotColumns, aggregate_requests, all_groups_satisfied, canonical_attempts,
    check_replay_keys, merge_match_data, now, plan_aggregate_fill, plan_slot_fill,
    schedule_timeout_at, validate_new_events, validate_new_matches, validate_new_tasks,
    validate_replays, winning_action,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// Every clone shares one writer lock; do not build two providers over
    /// the same database file.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/tessera.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = connect(&url, 5, Duration::from_secs(30)).await?;

        crate::migrations::SQLITE
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self::new(pool))
    }
}

/// Open a pool. File databases use WAL so readers do not block the writer;
/// `busy_timeout` bounds how long a connection waits for a file lock.
///
/// In-memory databases are per connection, so they get a single connection.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    busy_timeout: Duration,
) -> Result<SqlitePool, CoreError> {
    let in_memory = database_url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { max_connections })
        .connect_with(options)
        .await?;
    Ok(pool)
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(sqlx::FromRow)]
struct TaskRow {
    #[sqlx(flatten)]
    columns: TaskColumns,
    concurrency_parent_strategy_ids: Json<Vec<Option<i64>>>,
    concurrency_strategy_ids: Json<Vec<i64>>,
    concurrency_keys: Json<Vec<String>>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, CoreError> {
        self.columns.into_task(
            self.concurrency_parent_strategy_ids.0,
            self.concurrency_strategy_ids.0,
            self.concurrency_keys.0,
        )
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowSlotRow {
    #[sqlx(flatten)]
    columns: WorkflowSlotColumns,
    child_strategy_ids: Json<Vec<i64>>,
}

#[derive(sqlx::FromRow)]
struct ReleaseSummaryRow {
    retry_count: i32,
    queue: String,
    external_id: Uuid,
    step_readable_id: String,
    workflow_run_id: Uuid,
    concurrency_strategy_ids: Json<Vec<i64>>,
}

/// Push `(VALUES (?, ?), ...)` for a list of task keys.
fn push_task_keys(qb: &mut QueryBuilder<'_, Sqlite>, keys: &[(i64, DateTime<Utc>)]) {
    qb.push("(VALUES ");
    for (i, (id, inserted_at)) in keys.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push("(")
            .push_bind(*id)
            .push(", ")
            .push_bind(*inserted_at)
            .push(")");
    }
    qb.push(")");
}

/// Merge `extra` into a sorted, deduplicated id list.
fn merge_ids(mut ids: Vec<i64>, extra: &[i64]) -> Vec<i64> {
    ids.extend_from_slice(extra);
    ids.sort_unstable();
    ids.dedup();
    ids
}

// ============================================================================
// Task Store
// ============================================================================

/// Insert DAG rows, returned in input order.
pub async fn create_dags(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    dags: &[NewDag],
) -> Result<Vec<Dag>, CoreError> {
    let inserted_at = now();
    let mut by_external_id = HashMap::with_capacity(dags.len());

    for chunk in dags.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO dags (inserted_at, tenant_id, external_id, display_name, workflow_id, \
             workflow_version_id, parent_task_external_id) ",
        );
        qb.push_values(chunk, |mut b, dag| {
            b.push_bind(inserted_at)
                .push_bind(tenant_id)
                .push_bind(dag.external_id)
                .push_bind(&dag.display_name)
                .push_bind(dag.workflow_id)
                .push_bind(dag.workflow_version_id)
                .push_bind(dag.parent_task_external_id);
        });
        qb.push(
            " RETURNING id, inserted_at, tenant_id, external_id, display_name, workflow_id, \
             workflow_version_id, parent_task_external_id",
        );
        let rows: Vec<Dag> = qb.build_query_as().fetch_all(&mut *conn).await?;
        by_external_id.extend(rows.into_iter().map(|d| (d.external_id, d)));
    }

    dags.iter()
        .map(|d| {
            by_external_id
                .remove(&d.external_id)
                .ok_or_else(|| CoreError::DatabaseError {
                    operation: "create_dags".to_string(),
                    details: format!("dag {} was not returned by insert", d.external_id),
                })
        })
        .collect()
}

/// Insert tasks and enqueue the queued ones. Returns tasks in input order.
pub async fn create_tasks(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    tasks: &[NewTask],
) -> Result<Vec<Task>, CoreError> {
    validate_new_tasks(tasks)?;
    let inserted_at = now();
    let mut by_external_id = HashMap::with_capacity(tasks.len());

    for chunk in tasks.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO tasks (inserted_at, tenant_id, external_id, queue, action_id, step_id, \
             step_readable_id, step_index, workflow_id, workflow_version_id, workflow_run_id, \
             schedule_timeout_secs, step_timeout_secs, priority, sticky, desired_worker_id, \
             display_name, input, retry_backoff_factor, retry_max_backoff_secs, \
             additional_metadata, initial_state, initial_state_reason, dag_id, dag_inserted_at, \
             parent_task_external_id, parent_task_id, parent_task_inserted_at, child_index, \
             child_key, concurrency_parent_strategy_ids, concurrency_strategy_ids, \
             concurrency_keys) ",
        );
        qb.push_values(chunk, |mut b, task| {
            let dims = &task.step.concurrency;
            b.push_bind(inserted_at)
                .push_bind(tenant_id)
                .push_bind(task.external_id)
                .push_bind(&task.step.queue)
                .push_bind(&task.step.action_id)
                .push_bind(task.step.step_id)
                .push_bind(&task.step.step_readable_id)
                .push_bind(task.step.step_index)
                .push_bind(task.step.workflow_id)
                .push_bind(task.step.workflow_version_id)
                .push_bind(task.workflow_run_id)
                .push_bind(task.step.schedule_timeout_secs)
                .push_bind(task.step.step_timeout_secs)
                .push_bind(task.priority)
                .push_bind(task.step.sticky.as_str())
                .push_bind(task.desired_worker_id)
                .push_bind(&task.step.display_name)
                .push_bind(&task.input)
                .push_bind(task.step.retry_backoff_factor)
                .push_bind(task.step.retry_max_backoff_secs)
                .push_bind(&task.additional_metadata)
                .push_bind(task.initial_state.as_str())
                .push_bind(task.initial_state_reason.as_deref())
                .push_bind(task.dag.map(|d| d.dag_id))
                .push_bind(task.dag.map(|d| d.dag_inserted_at))
                .push_bind(task.parent.map(|p| p.external_id))
                .push_bind(task.parent.map(|p| p.task_id))
                .push_bind(task.parent.map(|p| p.inserted_at))
                .push_bind(task.child_index)
                .push_bind(task.child_key.as_deref())
                .push_bind(Json(
                    dims.iter().map(|d| d.parent_strategy_id).collect::<Vec<_>>(),
                ))
                .push_bind(Json(dims.iter().map(|d| d.strategy_id).collect::<Vec<_>>()))
                .push_bind(Json(dims.iter().map(|d| d.key.clone()).collect::<Vec<_>>()));
        });
        qb.push(" RETURNING ").push(TASK_COLUMNS);
        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
        for row in rows {
            let task = row.into_task()?;
            by_external_id.insert(task.external_id, task);
        }
    }

    let created: Vec<Task> = tasks
        .iter()
        .map(|t| {
            by_external_id
                .remove(&t.external_id)
                .ok_or_else(|| CoreError::DatabaseError {
                    operation: "create_tasks".to_string(),
                    details: format!("task {} was not returned by insert", t.external_id),
                })
        })
        .collect::<Result<_, _>>()?;

    enqueue_tasks(conn, &created, inserted_at).await?;
    Ok(created)
}

/// Load a task by primary key.
pub async fn get_task(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Option<Task>, CoreError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? AND id = ? AND inserted_at = ?"
    );
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(tenant_id)
        .bind(task_id)
        .bind(inserted_at)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task).transpose()
}

/// Load a task by logical id.
pub async fn get_task_by_external_id(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    external_id: Uuid,
) -> Result<Option<Task>, CoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? AND external_id = ?");
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task).transpose()
}

async fn load_task(
    conn: &mut SqliteConnection,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Option<Task>, CoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ? AND inserted_at = ?");
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(task_id)
        .bind(inserted_at)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task).transpose()
}

/// Load tasks in id order. Callers hold the writer lock, which already
/// excludes every other writer.
pub async fn lock_tasks(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    keys: &[(i64, DateTime<Utc>)],
) -> Result<Vec<Task>, CoreError> {
    let mut keys = keys.to_vec();
    keys.sort();
    keys.dedup();
    let mut tasks = Vec::with_capacity(keys.len());
    for (task_id, inserted_at) in keys {
        if let Some(task) = get_task(conn, tenant_id, task_id, inserted_at).await? {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

/// Replay tasks under a new attempt. Fails with `TaskNotFound` if any task is
/// missing; nothing is written in that case.
pub async fn replay_tasks(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    replays: &[TaskReplay],
) -> Result<ReplayedTasks, CoreError> {
    validate_replays(replays)?;

    let mut current = Vec::with_capacity(replays.len());
    for replay in replays {
        let task = get_task(conn, tenant_id, replay.task_id, replay.inserted_at)
            .await?
            .ok_or(CoreError::TaskNotFound {
                task_id: replay.task_id,
            })?;
        check_replay_keys(replay, &task)?;
        current.push(task.attempt());
    }
    let superseded = release_tasks(conn, tenant_id, &current).await?;

    let sql = format!(
        r#"
        UPDATE tasks
        SET retry_count = retry_count + 1,
            app_retry_count = 0,
            internal_retry_count = 0,
            initial_state = ?,
            initial_state_reason = ?,
            concurrency_keys = ?,
            input = COALESCE(?, input)
        WHERE tenant_id = ? AND id = ? AND inserted_at = ?
        RETURNING {TASK_COLUMNS}
        "#
    );
    let mut replayed = Vec::with_capacity(replays.len());
    for replay in replays {
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(replay.initial_state.as_str())
            .bind(replay.initial_state_reason.as_deref())
            .bind(Json(&replay.concurrency_keys))
            .bind(&replay.input)
            .bind(tenant_id)
            .bind(replay.task_id)
            .bind(replay.inserted_at)
            .fetch_one(&mut *conn)
            .await?;
        replayed.push(row.into_task()?);
    }

    enqueue_tasks(conn, &replayed, now()).await?;
    Ok(ReplayedTasks {
        tasks: replayed,
        superseded,
    })
}

/// Append task events; duplicates of keyed events are dropped.
pub async fn insert_task_events(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    events: &[NewTaskEvent],
) -> Result<u64, CoreError> {
    let created_at = now();
    let mut written = 0;
    for chunk in events.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO task_events (inserted_at, tenant_id, task_id, task_inserted_at, \
             retry_count, event_type, event_key, data, external_id, created_at) ",
        );
        qb.push_values(chunk, |mut b, event| {
            b.push_bind(created_at)
                .push_bind(tenant_id)
                .push_bind(event.task_id)
                .push_bind(event.task_inserted_at)
                .push_bind(event.retry_count)
                .push_bind(event.event_type.as_str())
                .push_bind(event.event_key.as_deref())
                .push_bind(&event.data)
                .push_bind(event.external_id)
                .push_bind(created_at);
        });
        qb.push(
            " ON CONFLICT (tenant_id, task_id, task_inserted_at, event_type, event_key) DO NOTHING",
        );
        written += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

/// List a task's events, oldest first.
pub async fn list_task_events(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Vec<TaskEvent>, CoreError> {
    let events = sqlx::query_as::<_, TaskEvent>(
        r#"
        SELECT id, tenant_id, task_id, task_inserted_at, retry_count, event_type, event_key,
               data, external_id, created_at
        FROM task_events
        WHERE tenant_id = ? AND task_id = ? AND task_inserted_at = ?
        ORDER BY id
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(inserted_at)
    .fetch_all(&mut *conn)
    .await?;
    Ok(events)
}

/// Upsert expression evaluations; the last value for a key wins.
pub async fn upsert_expression_evals(
    conn: &mut SqliteConnection,
    evals: &[ExpressionEval],
) -> Result<(), CoreError> {
    for chunk in evals.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO task_expression_evals (task_id, task_inserted_at, kind, key, value_str, \
             value_int) ",
        );
        qb.push_values(chunk, |mut b, eval| {
            b.push_bind(eval.task_id)
                .push_bind(eval.task_inserted_at)
                .push_bind(eval.kind.as_str())
                .push_bind(&eval.key)
                .push_bind(eval.value_str.as_deref())
                .push_bind(eval.value_int);
        });
        qb.push(
            " ON CONFLICT (task_id, task_inserted_at, kind, key) DO UPDATE \
             SET value_str = excluded.value_str, value_int = excluded.value_int",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// List a task's cached expression evaluations.
pub async fn list_expression_evals(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Vec<ExpressionEval>, CoreError> {
    let evals = sqlx::query_as::<_, ExpressionEval>(
        r#"
        SELECT e.task_id, e.task_inserted_at, e.kind, e.key, e.value_str, e.value_int
        FROM task_expression_evals e
        WHERE e.task_id = ? AND e.task_inserted_at = ?
          AND EXISTS (
              SELECT 1 FROM tasks t
              WHERE t.id = e.task_id AND t.inserted_at = e.task_inserted_at AND t.tenant_id = ?
          )
        ORDER BY e.kind, e.key
        "#,
    )
    .bind(task_id)
    .bind(inserted_at)
    .bind(tenant_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(evals)
}

// ============================================================================
// Enqueue
// ============================================================================

/// Put queued attempts into their first holding state.
pub async fn enqueue_tasks(
    conn: &mut SqliteConnection,
    tasks: &[Task],
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let (direct, limited): (Vec<&Task>, Vec<&Task>) = tasks
        .iter()
        .filter(|t| t.initial_state == InitialState::Queued)
        .partition(|t| t.step.concurrency.is_empty());

    insert_queue_items(conn, &direct, now).await?;
    upsert_workflow_slots(conn, &aggregate_requests(limited.iter().copied())).await?;
    insert_concurrency_slots(conn, &limited, now).await?;
    Ok(())
}

async fn insert_queue_items(
    conn: &mut SqliteConnection,
    tasks: &[&Task],
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    for chunk in tasks.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO queue_items (tenant_id, queue, task_id, task_inserted_at, external_id, \
             action_id, step_id, workflow_id, workflow_run_id, schedule_timeout_at, \
             step_timeout_secs, priority, sticky, desired_worker_id, retry_count) ",
        );
        qb.push_values(chunk, |mut b, task| {
            b.push_bind(task.tenant_id)
                .push_bind(&task.step.queue)
                .push_bind(task.id)
                .push_bind(task.inserted_at)
                .push_bind(task.external_id)
                .push_bind(&task.step.action_id)
                .push_bind(task.step.step_id)
                .push_bind(task.step.workflow_id)
                .push_bind(task.workflow_run_id)
                .push_bind(schedule_timeout_at(task, now))
                .push_bind(task.step.step_timeout_secs)
                .push_bind(task.priority)
                .push_bind(task.step.sticky.as_str())
                .push_bind(task.desired_worker_id)
                .push_bind(task.retry_count);
        });
        qb.push(" ON CONFLICT (task_id, task_inserted_at, retry_count) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn upsert_workflow_slots(
    conn: &mut SqliteConnection,
    requests: &[AggregateRequest],
) -> Result<(), CoreError> {
    for req in requests {
        let existing: Option<Json<Vec<i64>>> = sqlx::query_scalar(
            r#"
            SELECT child_strategy_ids FROM workflow_concurrency_slots
            WHERE strategy_id = ? AND workflow_version_id = ? AND workflow_run_id = ?
            "#,
        )
        .bind(req.strategy_id)
        .bind(req.workflow_version_id)
        .bind(req.workflow_run_id)
        .fetch_optional(&mut *conn)
        .await?;

        match existing {
            Some(Json(children)) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_concurrency_slots SET child_strategy_ids = ?
                    WHERE strategy_id = ? AND workflow_version_id = ? AND workflow_run_id = ?
                    "#,
                )
                .bind(Json(merge_ids(children, &req.child_strategy_ids)))
                .bind(req.strategy_id)
                .bind(req.workflow_version_id)
                .bind(req.workflow_run_id)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO workflow_concurrency_slots (tenant_id, workflow_id,
                        workflow_version_id, workflow_run_id, strategy_id, child_strategy_ids,
                        priority, key)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(req.tenant_id)
                .bind(req.workflow_id)
                .bind(req.workflow_version_id)
                .bind(req.workflow_run_id)
                .bind(req.strategy_id)
                .bind(Json(&req.child_strategy_ids))
                .bind(req.priority)
                .bind(&req.key)
                .execute(&mut *conn)
                .await?;
            }
        }
    }
    Ok(())
}

async fn insert_concurrency_slots(
    conn: &mut SqliteConnection,
    tasks: &[&Task],
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let rows: Vec<_> = tasks
        .iter()
        .flat_map(|t| t.step.concurrency.iter().map(move |d| (*t, d)))
        .collect();

    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO concurrency_slots (task_id, task_inserted_at, task_retry_count, \
             external_id, tenant_id, workflow_id, workflow_version_id, workflow_run_id, \
             strategy_id, parent_strategy_id, priority, key, schedule_timeout_at) ",
        );
        qb.push_values(chunk, |mut b, (task, dim)| {
            b.push_bind(task.id)
                .push_bind(task.inserted_at)
                .push_bind(task.retry_count)
                .push_bind(task.external_id)
                .push_bind(task.tenant_id)
                .push_bind(task.step.workflow_id)
                .push_bind(task.step.workflow_version_id)
                .push_bind(task.workflow_run_id)
                .push_bind(dim.strategy_id)
                .push_bind(dim.parent_strategy_id)
                .push_bind(task.priority)
                .push_bind(&dim.key)
                .push_bind(schedule_timeout_at(task, now));
        });
        qb.push(
            " ON CONFLICT (task_id, task_inserted_at, task_retry_count, strategy_id) DO NOTHING",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

// ============================================================================
// Holding areas and dispatch
// ============================================================================

/// Dequeue up to `limit` attempts for a worker (`priority DESC, id ASC`) and
/// record the runtimes.
pub async fn assign_queued_tasks(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    queue: &str,
    worker_id: Uuid,
    limit: i64,
) -> Result<Vec<AssignedTask>, CoreError> {
    let items = sqlx::query_as::<_, DequeuedItem>(
        r#"
        SELECT id, task_id, task_inserted_at, retry_count, external_id, action_id,
               step_timeout_secs, priority
        FROM queue_items
        WHERE tenant_id = ?1
          AND queue = ?2
          AND (sticky <> 'HARD' OR desired_worker_id IS NULL OR desired_worker_id = ?3)
        ORDER BY priority DESC, id ASC
        LIMIT ?4
        "#,
    )
    .bind(tenant_id)
    .bind(queue)
    .bind(worker_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let now = now();
    let mut assigned = Vec::with_capacity(items.len());
    for item in items {
        sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(item.id)
            .execute(&mut *conn)
            .await?;
        let task = item.into_assigned(worker_id, now);

        sqlx::query(
            r#"
            INSERT INTO task_runtimes (task_id, task_inserted_at, retry_count, tenant_id,
                worker_id, timeout_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(task.attempt.task_id)
        .bind(task.attempt.inserted_at)
        .bind(task.attempt.retry_count)
        .bind(tenant_id)
        .bind(worker_id)
        .bind(task.timeout_at)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO task_runtime_slots (task_id, task_inserted_at, retry_count, tenant_id,
                worker_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(task.attempt.task_id)
        .bind(task.attempt.inserted_at)
        .bind(task.attempt.retry_count)
        .bind(tenant_id)
        .bind(worker_id)
        .execute(&mut *conn)
        .await?;

        assigned.push(task);
    }
    Ok(assigned)
}

/// Move queued attempts to the rate-limited holding area. Attempts that are
/// not queued are ignored.
pub async fn move_to_rate_limited(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    requeues: &[RateLimitedRequeue],
) -> Result<Vec<TaskAttempt>, CoreError> {
    let mut requeues = requeues.to_vec();
    requeues.sort_by_key(|r| r.attempt);
    requeues.dedup_by_key(|r| r.attempt);

    let mut moved = Vec::new();
    for requeue in requeues {
        let a = requeue.attempt;
        let inserted = sqlx::query(
            r#"
            INSERT INTO rate_limited_queue_items (requeue_after, tenant_id, queue, task_id,
                task_inserted_at, external_id, action_id, step_id, workflow_id,
                workflow_run_id, schedule_timeout_at, step_timeout_secs, priority, sticky,
                desired_worker_id, retry_count)
            SELECT ?1, tenant_id, queue, task_id, task_inserted_at, external_id, action_id,
                   step_id, workflow_id, workflow_run_id, schedule_timeout_at,
                   step_timeout_secs, priority, sticky, desired_worker_id, retry_count
            FROM queue_items
            WHERE tenant_id = ?2 AND task_id = ?3 AND task_inserted_at = ?4 AND retry_count = ?5
            ON CONFLICT (task_id, task_inserted_at, retry_count) DO NOTHING
            "#,
        )
        .bind(requeue.requeue_after)
        .bind(tenant_id)
        .bind(a.task_id)
        .bind(a.inserted_at)
        .bind(a.retry_count)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            DELETE FROM queue_items
            WHERE tenant_id = ? AND task_id = ? AND task_inserted_at = ? AND retry_count = ?
            "#,
        )
        .bind(tenant_id)
        .bind(a.task_id)
        .bind(a.inserted_at)
        .bind(a.retry_count)
        .execute(&mut *conn)
        .await?;

        if inserted > 0 {
            moved.push(a);
        }
    }
    Ok(moved)
}

/// Release failed current attempts and hold their successors in the retry
/// queue. Stale attempts are ignored.
pub async fn schedule_retries(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    retries: &[RetrySchedule],
) -> Result<Vec<Task>, CoreError> {
    let mut retries = retries.to_vec();
    retries.sort_by_key(|r| r.attempt);
    retries.dedup_by_key(|r| r.attempt.task_id);

    let mut current = Vec::with_capacity(retries.len());
    for retry in retries {
        let task = get_task(conn, tenant_id, retry.attempt.task_id, retry.attempt.inserted_at)
            .await?;
        if task.is_some_and(|t| t.retry_count == retry.attempt.retry_count) {
            current.push(retry);
        }
    }
    if current.is_empty() {
        return Ok(Vec::new());
    }

    let attempts: Vec<TaskAttempt> = current.iter().map(|r| r.attempt).collect();
    release_tasks(conn, tenant_id, &attempts).await?;

    let sql = format!(
        r#"
        UPDATE tasks
        SET retry_count = retry_count + 1,
            app_retry_count = app_retry_count + CASE WHEN ?1 THEN 1 ELSE 0 END,
            internal_retry_count = internal_retry_count + CASE WHEN ?1 THEN 0 ELSE 1 END
        WHERE tenant_id = ?2 AND id = ?3 AND inserted_at = ?4
        RETURNING {TASK_COLUMNS}
        "#
    );
    let mut updated = Vec::with_capacity(current.len());
    for retry in &current {
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(retry.is_app_retry)
            .bind(tenant_id)
            .bind(retry.attempt.task_id)
            .bind(retry.attempt.inserted_at)
            .fetch_one(&mut *conn)
            .await?;
        let task = row.into_task()?;

        sqlx::query(
            r#"
            INSERT INTO retry_queue_items (task_id, task_inserted_at, task_retry_count,
                retry_after, tenant_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(task.id)
        .bind(task.inserted_at)
        .bind(task.retry_count)
        .bind(retry.retry_after)
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;

        updated.push(task);
    }
    Ok(updated)
}

/// Re-enqueue retry items whose backoff has elapsed. Superseded attempts are
/// dropped.
pub async fn promote_due_retries(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<PromotedAttempt>, CoreError> {
    let due = sqlx::query_as::<_, (i64, DateTime<Utc>, i32)>(
        r#"
        SELECT task_id, task_inserted_at, task_retry_count
        FROM retry_queue_items
        WHERE retry_after <= ?
        ORDER BY task_id, task_inserted_at, task_retry_count
        LIMIT ?
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut tasks = Vec::with_capacity(due.len());
    for (task_id, inserted_at, retry_count) in due {
        sqlx::query(
            r#"
            DELETE FROM retry_queue_items
            WHERE task_id = ? AND task_inserted_at = ? AND task_retry_count = ?
            "#,
        )
        .bind(task_id)
        .bind(inserted_at)
        .bind(retry_count)
        .execute(&mut *conn)
        .await?;

        if let Some(mut task) = load_task(conn, task_id, inserted_at).await?
            && task.retry_count == retry_count
        {
            task.initial_state = InitialState::Queued;
            tasks.push(task);
        }
    }

    enqueue_tasks(conn, &tasks, now).await?;
    Ok(tasks
        .iter()
        .map(|t| PromotedAttempt {
            tenant_id: t.tenant_id,
            attempt: t.attempt(),
        })
        .collect())
}

/// Re-enqueue rate-limited items whose requeue time has passed.
pub async fn promote_due_rate_limited(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<PromotedAttempt>, CoreError> {
    let due = sqlx::query_as::<_, (Uuid, i64, DateTime<Utc>, i32)>(
        r#"
        SELECT tenant_id, task_id, task_inserted_at, retry_count
        FROM rate_limited_queue_items
        WHERE requeue_after <= ?
        ORDER BY task_id, task_inserted_at, retry_count
        LIMIT ?
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut promoted = Vec::with_capacity(due.len());
    for (tenant_id, task_id, inserted_at, retry_count) in due {
        let inserted = sqlx::query(
            r#"
            INSERT INTO queue_items (tenant_id, queue, task_id, task_inserted_at, external_id,
                action_id, step_id, workflow_id, workflow_run_id, schedule_timeout_at,
                step_timeout_secs, priority, sticky, desired_worker_id, retry_count)
            SELECT tenant_id, queue, task_id, task_inserted_at, external_id, action_id,
                   step_id, workflow_id, workflow_run_id, schedule_timeout_at,
                   step_timeout_secs, priority, sticky, desired_worker_id, retry_count
            FROM rate_limited_queue_items
            WHERE task_id = ?1 AND task_inserted_at = ?2 AND retry_count = ?3
            ON CONFLICT (task_id, task_inserted_at, retry_count) DO NOTHING
            "#,
        )
        .bind(task_id)
        .bind(inserted_at)
        .bind(retry_count)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            DELETE FROM rate_limited_queue_items
            WHERE task_id = ? AND task_inserted_at = ? AND retry_count = ?
            "#,
        )
        .bind(task_id)
        .bind(inserted_at)
        .bind(retry_count)
        .execute(&mut *conn)
        .await?;

        if inserted > 0 {
            promoted.push(PromotedAttempt {
                tenant_id,
                attempt: TaskAttempt::new(task_id, inserted_at, retry_count),
            });
        }
    }
    Ok(promoted)
}

/// Holding areas an attempt is currently present in.
pub async fn holding_areas(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    attempt: TaskAttempt,
) -> Result<Vec<HoldingArea>, CoreError> {
    let (in_queue, in_retry, in_rate_limited) = sqlx::query_as::<_, (bool, bool, bool)>(
        r#"
        SELECT
            EXISTS (SELECT 1 FROM queue_items
                    WHERE tenant_id = ?1 AND task_id = ?2 AND task_inserted_at = ?3
                      AND retry_count = ?4),
            EXISTS (SELECT 1 FROM retry_queue_items
                    WHERE tenant_id = ?1 AND task_id = ?2 AND task_inserted_at = ?3
                      AND task_retry_count = ?4),
            EXISTS (SELECT 1 FROM rate_limited_queue_items
                    WHERE tenant_id = ?1 AND task_id = ?2 AND task_inserted_at = ?3
                      AND retry_count = ?4)
        "#,
    )
    .bind(tenant_id)
    .bind(attempt.task_id)
    .bind(attempt.inserted_at)
    .bind(attempt.retry_count)
    .fetch_one(&mut *conn)
    .await?;

    let mut areas = Vec::new();
    if in_queue {
        areas.push(HoldingArea::Queue);
    }
    if in_retry {
        areas.push(HoldingArea::Retry);
    }
    if in_rate_limited {
        areas.push(HoldingArea::RateLimited);
    }
    Ok(areas)
}

// ============================================================================
// Concurrency Slot Manager
// ============================================================================

/// Fill workflow aggregates of a strategy, at most `max_runs` per key.
pub async fn fill_workflow_concurrency_slots(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    strategy_id: i64,
    max_runs: i64,
) -> Result<u64, CoreError> {
    let candidates = sqlx::query_as::<_, AggregateCandidate>(
        r#"
        SELECT workflow_version_id, workflow_run_id, priority, key, is_filled, sort_id
        FROM workflow_concurrency_slots
        WHERE tenant_id = ? AND strategy_id = ?
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut filled = 0;
    for candidate in plan_aggregate_fill(candidates, max_runs) {
        filled += sqlx::query(
            r#"
            UPDATE workflow_concurrency_slots SET is_filled = 1
            WHERE strategy_id = ? AND workflow_version_id = ? AND workflow_run_id = ?
            "#,
        )
        .bind(strategy_id)
        .bind(candidate.workflow_version_id)
        .bind(candidate.workflow_run_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(filled)
}

/// Fill per-task slots of a strategy and queue attempts whose slots are now
/// all filled.
pub async fn fill_concurrency_slots(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    strategy_id: i64,
    max_runs: i64,
) -> Result<Vec<TaskAttempt>, CoreError> {
    let filled_aggregates: HashSet<(i64, Uuid, Uuid)> =
        sqlx::query_as::<_, (i64, Uuid, Uuid)>(
            r#"
            SELECT strategy_id, workflow_version_id, workflow_run_id
            FROM workflow_concurrency_slots
            WHERE tenant_id = ?1 AND is_filled = 1
              AND strategy_id IN (
                  SELECT DISTINCT parent_strategy_id FROM concurrency_slots
                  WHERE tenant_id = ?1 AND strategy_id = ?2 AND parent_strategy_id IS NOT NULL
              )
            "#,
        )
        .bind(tenant_id)
        .bind(strategy_id)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .collect();

    let candidates = sqlx::query_as::<_, SlotCandidate>(
        r#"
        SELECT task_id, task_inserted_at, task_retry_count, parent_strategy_id,
               workflow_version_id, workflow_run_id, priority, key, is_filled, sort_id
        FROM concurrency_slots
        WHERE tenant_id = ? AND strategy_id = ?
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .fetch_all(&mut *conn)
    .await?;

    let picked = plan_slot_fill(candidates, &filled_aggregates, max_runs);
    let attempts = canonical_attempts(&picked.iter().map(SlotCandidate::attempt).collect::<Vec<_>>());

    let mut ready = Vec::new();
    for attempt in &attempts {
        sqlx::query(
            r#"
            UPDATE concurrency_slots SET is_filled = 1
            WHERE strategy_id = ? AND task_id = ? AND task_inserted_at = ? AND task_retry_count = ?
            "#,
        )
        .bind(strategy_id)
        .bind(attempt.task_id)
        .bind(attempt.inserted_at)
        .bind(attempt.retry_count)
        .execute(&mut *conn)
        .await?;

        let all_filled: bool = sqlx::query_scalar(
            r#"
            SELECT MIN(is_filled) = 1 FROM concurrency_slots
            WHERE task_id = ? AND task_inserted_at = ? AND task_retry_count = ?
            "#,
        )
        .bind(attempt.task_id)
        .bind(attempt.inserted_at)
        .bind(attempt.retry_count)
        .fetch_one(&mut *conn)
        .await?;
        if !all_filled {
            continue;
        }

        if let Some(task) = load_task(conn, attempt.task_id, attempt.inserted_at).await?
            && task.retry_count == attempt.retry_count
        {
            ready.push(task);
        }
    }

    let refs: Vec<&Task> = ready.iter().collect();
    insert_queue_items(conn, &refs, now()).await?;
    Ok(ready.iter().map(Task::attempt).collect())
}

/// Per-task slots of a task, all attempts.
pub async fn list_concurrency_slots(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Vec<ConcurrencySlot>, CoreError> {
    let slots = sqlx::query_as::<_, ConcurrencySlot>(
        r#"
        SELECT sort_id, task_id, task_inserted_at, task_retry_count, external_id, tenant_id,
               workflow_id, workflow_version_id, workflow_run_id, strategy_id,
               parent_strategy_id, priority, key, is_filled, schedule_timeout_at
        FROM concurrency_slots
        WHERE tenant_id = ? AND task_id = ? AND task_inserted_at = ?
        ORDER BY task_retry_count, strategy_id
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(inserted_at)
    .fetch_all(&mut *conn)
    .await?;
    Ok(slots)
}

/// Aggregate slot of a workflow run for a strategy.
pub async fn get_workflow_concurrency_slot(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    strategy_id: i64,
    workflow_version_id: Uuid,
    workflow_run_id: Uuid,
) -> Result<Option<WorkflowConcurrencySlot>, CoreError> {
    let row: Option<WorkflowSlotRow> = sqlx::query_as(
        r#"
        SELECT sort_id, tenant_id, workflow_id, workflow_version_id, workflow_run_id,
               strategy_id, child_strategy_ids, priority, key, is_filled
        FROM workflow_concurrency_slots
        WHERE tenant_id = ?
          AND strategy_id = ? AND workflow_version_id = ? AND workflow_run_id = ?
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .bind(workflow_version_id)
    .bind(workflow_run_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|r| r.columns.into_slot(r.child_strategy_ids.0)))
}

/// Delete the per-task slots of `attempts` and drop aggregates left without
/// slots.
async fn release_concurrency_slots(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    attempts: &[TaskAttempt],
) -> Result<(), CoreError> {
    let mut parents: BTreeSet<(i64, Uuid, Uuid)> = BTreeSet::new();
    for attempt in attempts {
        let deleted = sqlx::query_as::<_, (Option<i64>, Uuid, Uuid)>(
            r#"
            DELETE FROM concurrency_slots
            WHERE tenant_id = ? AND task_id = ? AND task_inserted_at = ? AND task_retry_count = ?
            RETURNING parent_strategy_id, workflow_version_id, workflow_run_id
            "#,
        )
        .bind(tenant_id)
        .bind(attempt.task_id)
        .bind(attempt.inserted_at)
        .bind(attempt.retry_count)
        .fetch_all(&mut *conn)
        .await?;
        parents.extend(
            deleted
                .into_iter()
                .filter_map(|(parent, version, run)| parent.map(|p| (p, version, run))),
        );
    }

    for (strategy_id, version, run) in parents {
        let remaining: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM concurrency_slots
            WHERE parent_strategy_id = ? AND workflow_version_id = ? AND workflow_run_id = ?
            "#,
        )
        .bind(strategy_id)
        .bind(version)
        .bind(run)
        .fetch_one(&mut *conn)
        .await?;

        if remaining == 0 {
            sqlx::query(
                r#"
                DELETE FROM workflow_concurrency_slots
                WHERE strategy_id = ? AND workflow_version_id = ? AND workflow_run_id = ?
                "#,
            )
            .bind(strategy_id)
            .bind(version)
            .bind(run)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

// ============================================================================
// Release Coordinator
// ============================================================================

async fn delete_attempt_row(
    conn: &mut SqliteConnection,
    table: &str,
    retry_column: &str,
    tenant_id: Uuid,
    attempt: &TaskAttempt,
) -> Result<u64, CoreError> {
    let sql = format!(
        "DELETE FROM {table} \
         WHERE tenant_id = ? AND task_id = ? AND task_inserted_at = ? AND {retry_column} = ?"
    );
    let result = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(attempt.task_id)
        .bind(attempt.inserted_at)
        .bind(attempt.retry_count)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Remove runtime, holding-area and concurrency state of the attempts and
/// summarise them in input order. Attempts whose task does not exist are
/// omitted.
pub async fn release_tasks(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    attempts: &[TaskAttempt],
) -> Result<Vec<ReleasedTask>, CoreError> {
    let sorted = canonical_attempts(attempts);
    let mut workers = HashMap::new();

    for attempt in &sorted {
        delete_attempt_row(conn, "task_runtime_slots", "retry_count", tenant_id, attempt).await?;
        let worker: Option<Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM task_runtimes
            WHERE tenant_id = ? AND task_id = ? AND task_inserted_at = ? AND retry_count = ?
            RETURNING worker_id
            "#,
        )
        .bind(tenant_id)
        .bind(attempt.task_id)
        .bind(attempt.inserted_at)
        .bind(attempt.retry_count)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(worker) = worker {
            workers.insert(*attempt, worker);
        }

        delete_attempt_row(conn, "retry_queue_items", "task_retry_count", tenant_id, attempt)
            .await?;
        delete_attempt_row(conn, "queue_items", "retry_count", tenant_id, attempt).await?;
        delete_attempt_row(conn, "rate_limited_queue_items", "retry_count", tenant_id, attempt)
            .await?;
    }

    release_concurrency_slots(conn, tenant_id, &sorted).await?;

    let mut summaries = HashMap::with_capacity(sorted.len());
    for attempt in &sorted {
        let row: Option<ReleaseSummaryRow> = sqlx::query_as(
            r#"
            SELECT retry_count, queue, external_id, step_readable_id, workflow_run_id,
                   concurrency_strategy_ids
            FROM tasks
            WHERE tenant_id = ? AND id = ? AND inserted_at = ?
            "#,
        )
        .bind(tenant_id)
        .bind(attempt.task_id)
        .bind(attempt.inserted_at)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = row {
            summaries.insert(
                *attempt,
                ReleasedTask {
                    attempt: *attempt,
                    queue: row.queue,
                    external_id: row.external_id,
                    step_readable_id: row.step_readable_id,
                    workflow_run_id: row.workflow_run_id,
                    worker_id: workers.get(attempt).copied(),
                    is_current_retry: row.retry_count == attempt.retry_count,
                    concurrency_strategy_ids: row.concurrency_strategy_ids.0,
                },
            );
        }
    }

    Ok(attempts
        .iter()
        .filter_map(|a| summaries.remove(a))
        .collect())
}

/// Runtimes whose timeout has passed, oldest first.
pub async fn list_expired_runtimes(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ExpiredRuntime>, CoreError> {
    let rows = sqlx::query_as::<_, ExpiredRuntime>(
        r#"
        SELECT tenant_id, task_id, task_inserted_at, retry_count, worker_id
        FROM task_runtimes
        WHERE timeout_at <= ?
        ORDER BY timeout_at, task_id
        LIMIT ?
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

// ============================================================================
// Match Engine
// ============================================================================

async fn insert_matches(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    matches: &[NewMatch],
    kind: MatchKind,
) -> Result<Vec<Match>, CoreError> {
    validate_new_matches(matches, kind)?;
    let created_at = now();
    let sql = format!(
        r#"
        INSERT INTO matches (tenant_id, kind, existing_data, created_at, signal_task_id,
            signal_task_inserted_at, signal_external_id, signal_key, trigger_dag_id,
            trigger_dag_inserted_at, trigger_step_id, trigger_external_id,
            trigger_workflow_run_id, trigger_parent_task_external_id, trigger_parent_task_id,
            trigger_parent_task_inserted_at, trigger_child_index, trigger_child_key,
            trigger_priority, trigger_step_config)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {MATCH_COLUMNS}
        "#
    );

    let mut created = Vec::with_capacity(matches.len());
    for m in matches {
        let query = sqlx::query_as::<_, MatchColumns>(&sql)
            .bind(tenant_id)
            .bind(m.target.kind().as_str())
            .bind(&m.existing_data)
            .bind(created_at);
        let query = match &m.target {
            MatchTarget::Signal(signal) => query
                .bind(Some(signal.task_id))
                .bind(Some(signal.task_inserted_at))
                .bind(Some(signal.external_id))
                .bind(Some(signal.signal_key.as_str()))
                .bind(None::<i64>)
                .bind(None::<DateTime<Utc>>)
                .bind(None::<Uuid>)
                .bind(None::<Uuid>)
                .bind(None::<Uuid>)
                .bind(None::<Uuid>)
                .bind(None::<i64>)
                .bind(None::<DateTime<Utc>>)
                .bind(None::<i64>)
                .bind(None::<String>)
                .bind(None::<i32>)
                .bind(None::<serde_json::Value>),
            MatchTarget::DagTrigger(trigger) => query
                .bind(None::<i64>)
                .bind(None::<DateTime<Utc>>)
                .bind(None::<Uuid>)
                .bind(None::<String>)
                .bind(Some(trigger.dag.dag_id))
                .bind(Some(trigger.dag.dag_inserted_at))
                .bind(Some(trigger.step.step_id))
                .bind(Some(trigger.external_id))
                .bind(Some(trigger.workflow_run_id))
                .bind(trigger.parent.map(|p| p.external_id))
                .bind(trigger.parent.map(|p| p.task_id))
                .bind(trigger.parent.map(|p| p.inserted_at))
                .bind(trigger.child_index)
                .bind(trigger.child_key.clone())
                .bind(trigger.priority)
                .bind(Some(serde_json::to_value(&trigger.step)?)),
        };
        let matched = Match::try_from(query.fetch_one(&mut *conn).await?)?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO match_conditions (match_id, tenant_id, registered_at, event_type, \
             event_key, event_resource_hint, readable_data_key, expression, or_group_id, \
             action) ",
        );
        qb.push_values(&m.conditions, |mut b, c| {
            b.push_bind(matched.id)
                .push_bind(tenant_id)
                .push_bind(created_at)
                .push_bind(c.event_type.as_str())
                .push_bind(&c.event_key)
                .push_bind(c.event_resource_hint.as_deref())
                .push_bind(&c.readable_data_key)
                .push_bind(c.expression.as_deref())
                .push_bind(c.or_group_id)
                .push_bind(c.action.as_str());
        });
        qb.build().execute(&mut *conn).await?;

        created.push(matched);
    }
    Ok(created)
}

/// Insert DAG-trigger matches with their conditions.
pub async fn create_matches_for_dag_triggers(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    matches: &[NewMatch],
) -> Result<Vec<Match>, CoreError> {
    insert_matches(conn, tenant_id, matches, MatchKind::Trigger).await
}

/// Insert signal matches with their conditions.
pub async fn create_signal_matches(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    matches: &[NewMatch],
) -> Result<Vec<Match>, CoreError> {
    insert_matches(conn, tenant_id, matches, MatchKind::Signal).await
}

/// Unsatisfied conditions matching `(event_key, resource_hint)` pairs.
pub async fn list_match_conditions_with_hint(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    event_type: ConditionEventType,
    keys: &[HintedEventKey],
) -> Result<Vec<MatchCondition>, CoreError> {
    let mut conditions = Vec::new();
    for chunk in keys.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(MATCH_CONDITION_COLUMNS)
            .push(" FROM match_conditions WHERE tenant_id = ")
            .push_bind(tenant_id)
            .push(" AND event_type = ")
            .push_bind(event_type.as_str())
            .push(
                " AND is_satisfied = 0 AND event_resource_hint IS NOT NULL \
                 AND (event_key, event_resource_hint) IN (VALUES ",
            );
        for (i, key) in chunk.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push("(")
                .push_bind(&key.event_key)
                .push(", ")
                .push_bind(&key.resource_hint)
                .push(")");
        }
        qb.push(")");
        let found: Vec<MatchCondition> = qb.build_query_as().fetch_all(&mut *conn).await?;
        conditions.extend(found);
    }
    conditions.sort_by_key(|c| c.id);
    conditions.dedup_by_key(|c| c.id);
    Ok(conditions)
}

/// Unsatisfied conditions without a hint matching the event keys.
pub async fn list_match_conditions_without_hint(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    event_type: ConditionEventType,
    event_keys: &[String],
) -> Result<Vec<MatchCondition>, CoreError> {
    let mut conditions = Vec::new();
    for chunk in event_keys.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(MATCH_CONDITION_COLUMNS)
            .push(" FROM match_conditions WHERE tenant_id = ")
            .push_bind(tenant_id)
            .push(" AND event_type = ")
            .push_bind(event_type.as_str())
            .push(" AND is_satisfied = 0 AND event_resource_hint IS NULL AND event_key IN (");
        let mut separated = qb.separated(", ");
        for key in chunk {
            separated.push_bind(key);
        }
        qb.push(")");
        let found: Vec<MatchCondition> = qb.build_query_as().fetch_all(&mut *conn).await?;
        conditions.extend(found);
    }
    conditions.sort_by_key(|c| c.id);
    conditions.dedup_by_key(|c| c.id);
    Ok(conditions)
}

/// Conditions of a match, in creation order.
pub async fn list_match_conditions(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    match_id: i64,
) -> Result<Vec<MatchCondition>, CoreError> {
    let sql = format!(
        "SELECT {MATCH_CONDITION_COLUMNS} FROM match_conditions \
         WHERE tenant_id = ? AND match_id = ? ORDER BY id"
    );
    let conditions = sqlx::query_as::<_, MatchCondition>(&sql)
        .bind(tenant_id)
        .bind(match_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(conditions)
}

/// Mark conditions satisfied and fire the matches whose or-groups are now
/// all satisfied. A satisfied match never fires again.
pub async fn satisfy_match_conditions(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    satisfactions: &[ConditionSatisfaction],
) -> Result<Vec<SatisfiedMatch>, CoreError> {
    let mut match_ids: Vec<i64> = satisfactions.iter().map(|s| s.match_id).collect();
    match_ids.sort_unstable();
    match_ids.dedup();

    let mut open = Vec::with_capacity(match_ids.len());
    for match_id in match_ids {
        let satisfied: Option<bool> =
            sqlx::query_scalar("SELECT is_satisfied FROM matches WHERE tenant_id = ? AND id = ?")
                .bind(tenant_id)
                .bind(match_id)
                .fetch_optional(&mut *conn)
                .await?;
        if satisfied == Some(false) {
            open.push(match_id);
        }
    }

    let mut ordered: Vec<&ConditionSatisfaction> = satisfactions
        .iter()
        .filter(|s| open.binary_search(&s.match_id).is_ok())
        .collect();
    ordered.sort_by_key(|s| (s.match_id, s.condition_id));
    for satisfaction in ordered {
        sqlx::query(
            r#"
            UPDATE match_conditions
            SET is_satisfied = 1, data = ?
            WHERE tenant_id = ? AND match_id = ? AND id = ? AND is_satisfied = 0
            "#,
        )
        .bind(&satisfaction.data)
        .bind(tenant_id)
        .bind(satisfaction.match_id)
        .bind(satisfaction.condition_id)
        .execute(&mut *conn)
        .await?;
    }

    let fire_sql = format!(
        "UPDATE matches SET is_satisfied = 1, existing_data = ? WHERE id = ? \
         RETURNING {MATCH_COLUMNS}"
    );
    let mut fired = Vec::new();
    for match_id in open {
        let conditions = list_match_conditions(conn, tenant_id, match_id).await?;
        if !all_groups_satisfied(&conditions) {
            continue;
        }
        let existing: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT existing_data FROM matches WHERE id = ?")
                .bind(match_id)
                .fetch_one(&mut *conn)
                .await?;
        let merged = merge_match_data(existing, &conditions);
        let row: MatchColumns = sqlx::query_as(&fire_sql)
            .bind(&merged)
            .bind(match_id)
            .fetch_one(&mut *conn)
            .await?;
        fired.push(SatisfiedMatch {
            matched: Match::try_from(row)?,
            action: winning_action(&conditions),
        });
    }
    Ok(fired)
}

/// Load a match by id.
pub async fn get_match(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    match_id: i64,
) -> Result<Option<Match>, CoreError> {
    let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE tenant_id = ? AND id = ?");
    let row: Option<MatchColumns> = sqlx::query_as(&sql)
        .bind(tenant_id)
        .bind(match_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Match::try_from).transpose()
}

// ============================================================================
// Bulk Event Ingestion
// ============================================================================

/// Insert external events, returned in input order. No deduplication.
pub async fn bulk_create_events(
    conn: &mut SqliteConnection,
    events: &[NewEvent],
) -> Result<Vec<Event>, CoreError> {
    validate_new_events(events)?;
    let seen_default = now();
    let mut created = Vec::with_capacity(events.len());
    for event in events {
        let row = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events (seen_at, tenant_id, external_id, key, payload,
                additional_metadata, scope, triggering_webhook_name)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, seen_at, tenant_id, external_id, key, payload, additional_metadata,
                      scope, triggering_webhook_name
            "#,
        )
        .bind(event.seen_at.unwrap_or(seen_default))
        .bind(event.tenant_id)
        .bind(event.external_id)
        .bind(&event.key)
        .bind(&event.payload)
        .bind(&event.additional_metadata)
        .bind(event.scope.as_deref())
        .bind(event.triggering_webhook_name.as_deref())
        .fetch_one(&mut *conn)
        .await?;
        created.push(row);
    }
    Ok(created)
}

// ============================================================================
// Maintenance
// ============================================================================

/// Delete up to `limit` tasks inserted before `cutoff` with everything keyed
/// by them, then old events, old matches (fired or still waiting) and
/// orphaned DAGs.
pub async fn purge_before(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64, CoreError> {
    let doomed = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
        "SELECT id, inserted_at FROM tasks WHERE inserted_at < ? ORDER BY inserted_at, id LIMIT ?",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut deleted = 0u64;
    for chunk in doomed.chunks(INSERT_CHUNK_SIZE) {
        for table in [
            "task_events",
            "task_expression_evals",
            "task_runtime_slots",
            "task_runtimes",
            "queue_items",
            "retry_queue_items",
            "rate_limited_queue_items",
            "concurrency_slots",
        ] {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "DELETE FROM {table} WHERE (task_id, task_inserted_at) IN "
            ));
            push_task_keys(&mut qb, chunk);
            deleted += qb.build().execute(&mut *conn).await?.rows_affected();
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM tasks WHERE (id, inserted_at) IN ");
        push_task_keys(&mut qb, chunk);
        deleted += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    deleted += sqlx::query(
        r#"
        DELETE FROM workflow_concurrency_slots
        WHERE NOT EXISTS (
            SELECT 1 FROM concurrency_slots c
            WHERE c.parent_strategy_id = workflow_concurrency_slots.strategy_id
              AND c.workflow_version_id = workflow_concurrency_slots.workflow_version_id
              AND c.workflow_run_id = workflow_concurrency_slots.workflow_run_id
        )
        "#,
    )
    .execute(&mut *conn)
    .await?
    .rows_affected();

    deleted += sqlx::query(
        r#"
        DELETE FROM events WHERE id IN (
            SELECT id FROM events WHERE seen_at < ? ORDER BY seen_at LIMIT ?
        )
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    deleted += sqlx::query(
        r#"
        DELETE FROM matches WHERE id IN (
            SELECT id FROM matches
            WHERE created_at < ?
            ORDER BY id
            LIMIT ?
        )
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    deleted += sqlx::query(
        r#"
        DELETE FROM dags WHERE id IN (
            SELECT d.id FROM dags d
            WHERE d.inserted_at < ?
              AND NOT EXISTS (
                  SELECT 1 FROM tasks t
                  WHERE t.dag_id = d.id AND t.dag_inserted_at = d.inserted_at
              )
            ORDER BY d.inserted_at
            LIMIT ?
        )
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(deleted)
}

// ============================================================================
// Persistence Trait Implementation
// ============================================================================

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn begin(&self) -> Result<Box<dyn PersistenceTx>, CoreError> {
        let guard = self.write_lock.clone().lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx, _guard: guard }))
    }

    async fn create_dags(&self, tenant_id: Uuid, dags: &[NewDag]) -> Result<Vec<Dag>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let created = create_dags(&mut tx, tenant_id, dags)
            .await
            .map_err(|e| e.during("create_dags"))?;
        tx.commit().await?;
        Ok(created)
    }

    async fn create_tasks(
        &self,
        tenant_id: Uuid,
        tasks: &[NewTask],
    ) -> Result<Vec<Task>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let created = create_tasks(&mut tx, tenant_id, tasks)
            .await
            .map_err(|e| e.during("create_tasks"))?;
        tx.commit().await?;
        Ok(created)
    }

    async fn get_task(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Option<Task>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        get_task(&mut conn, tenant_id, task_id, inserted_at).await
    }

    async fn get_task_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
    ) -> Result<Option<Task>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        get_task_by_external_id(&mut conn, tenant_id, external_id).await
    }

    async fn replay_tasks(
        &self,
        tenant_id: Uuid,
        replays: &[TaskReplay],
    ) -> Result<ReplayedTasks, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let replayed = replay_tasks(&mut tx, tenant_id, replays)
            .await
            .map_err(|e| e.during("replay_tasks"))?;
        tx.commit().await?;
        Ok(replayed)
    }

    async fn insert_task_events(
        &self,
        tenant_id: Uuid,
        events: &[NewTaskEvent],
    ) -> Result<u64, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let written = insert_task_events(&mut tx, tenant_id, events)
            .await
            .map_err(|e| e.during("insert_task_events"))?;
        tx.commit().await?;
        Ok(written)
    }

    async fn list_task_events(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<TaskEvent>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        list_task_events(&mut conn, tenant_id, task_id, inserted_at).await
    }

    async fn upsert_expression_evals(&self, evals: &[ExpressionEval]) -> Result<(), CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        upsert_expression_evals(&mut tx, evals)
            .await
            .map_err(|e| e.during("upsert_expression_evals"))?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_expression_evals(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<ExpressionEval>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        list_expression_evals(&mut conn, tenant_id, task_id, inserted_at).await
    }

    async fn assign_queued_tasks(
        &self,
        tenant_id: Uuid,
        queue: &str,
        worker_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AssignedTask>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let assigned = assign_queued_tasks(&mut tx, tenant_id, queue, worker_id, limit)
            .await
            .map_err(|e| e.during("assign_queued_tasks"))?;
        tx.commit().await?;
        Ok(assigned)
    }

    async fn move_to_rate_limited(
        &self,
        tenant_id: Uuid,
        requeues: &[RateLimitedRequeue],
    ) -> Result<Vec<TaskAttempt>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let moved = move_to_rate_limited(&mut tx, tenant_id, requeues)
            .await
            .map_err(|e| e.during("move_to_rate_limited"))?;
        tx.commit().await?;
        Ok(moved)
    }

    async fn schedule_retries(
        &self,
        tenant_id: Uuid,
        retries: &[RetrySchedule],
    ) -> Result<Vec<Task>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let updated = schedule_retries(&mut tx, tenant_id, retries)
            .await
            .map_err(|e| e.during("schedule_retries"))?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn promote_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromotedAttempt>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let promoted = promote_due_retries(&mut tx, now, limit)
            .await
            .map_err(|e| e.during("promote_due_retries"))?;
        tx.commit().await?;
        Ok(promoted)
    }

    async fn promote_due_rate_limited(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromotedAttempt>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let promoted = promote_due_rate_limited(&mut tx, now, limit)
            .await
            .map_err(|e| e.during("promote_due_rate_limited"))?;
        tx.commit().await?;
        Ok(promoted)
    }

    async fn holding_areas(
        &self,
        tenant_id: Uuid,
        attempt: TaskAttempt,
    ) -> Result<Vec<HoldingArea>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        holding_areas(&mut conn, tenant_id, attempt).await
    }

    async fn fill_workflow_concurrency_slots(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<u64, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let filled = fill_workflow_concurrency_slots(&mut tx, tenant_id, strategy_id, max_runs)
            .await
            .map_err(|e| e.during("fill_workflow_concurrency_slots"))?;
        tx.commit().await?;
        Ok(filled)
    }

    async fn fill_concurrency_slots(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<Vec<TaskAttempt>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let queued = fill_concurrency_slots(&mut tx, tenant_id, strategy_id, max_runs)
            .await
            .map_err(|e| e.during("fill_concurrency_slots"))?;
        tx.commit().await?;
        Ok(queued)
    }

    async fn list_concurrency_slots(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<ConcurrencySlot>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        list_concurrency_slots(&mut conn, tenant_id, task_id, inserted_at).await
    }

    async fn get_workflow_concurrency_slot(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        workflow_version_id: Uuid,
        workflow_run_id: Uuid,
    ) -> Result<Option<WorkflowConcurrencySlot>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        get_workflow_concurrency_slot(
            &mut conn,
            tenant_id,
            strategy_id,
            workflow_version_id,
            workflow_run_id,
        )
        .await
    }

    async fn release_tasks(
        &self,
        tenant_id: Uuid,
        attempts: &[TaskAttempt],
    ) -> Result<Vec<ReleasedTask>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let released = release_tasks(&mut tx, tenant_id, attempts)
            .await
            .map_err(|e| e.during("release_tasks"))?;
        tx.commit().await?;
        Ok(released)
    }

    async fn list_expired_runtimes(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExpiredRuntime>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        list_expired_runtimes(&mut conn, now, limit).await
    }

    async fn create_matches_for_dag_triggers(
        &self,
        tenant_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<Match>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let created = create_matches_for_dag_triggers(&mut tx, tenant_id, matches)
            .await
            .map_err(|e| e.during("create_matches_for_dag_triggers"))?;
        tx.commit().await?;
        Ok(created)
    }

    async fn create_signal_matches(
        &self,
        tenant_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<Match>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let created = create_signal_matches(&mut tx, tenant_id, matches)
            .await
            .map_err(|e| e.during("create_signal_matches"))?;
        tx.commit().await?;
        Ok(created)
    }

    async fn list_match_conditions_with_hint(
        &self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        keys: &[HintedEventKey],
    ) -> Result<Vec<MatchCondition>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        list_match_conditions_with_hint(&mut conn, tenant_id, event_type, keys).await
    }

    async fn list_match_conditions_without_hint(
        &self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        event_keys: &[String],
    ) -> Result<Vec<MatchCondition>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        list_match_conditions_without_hint(&mut conn, tenant_id, event_type, event_keys).await
    }

    async fn satisfy_match_conditions(
        &self,
        tenant_id: Uuid,
        satisfactions: &[ConditionSatisfaction],
    ) -> Result<Vec<SatisfiedMatch>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let fired = satisfy_match_conditions(&mut tx, tenant_id, satisfactions)
            .await
            .map_err(|e| e.during("satisfy_match_conditions"))?;
        tx.commit().await?;
        Ok(fired)
    }

    async fn get_match(&self, tenant_id: Uuid, match_id: i64) -> Result<Option<Match>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        get_match(&mut conn, tenant_id, match_id).await
    }

    async fn list_match_conditions(
        &self,
        tenant_id: Uuid,
        match_id: i64,
    ) -> Result<Vec<MatchCondition>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        list_match_conditions(&mut conn, tenant_id, match_id).await
    }

    async fn bulk_create_events(&self, events: &[NewEvent]) -> Result<Vec<Event>, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let created = bulk_create_events(&mut tx, events)
            .await
            .map_err(|e| e.during("bulk_create_events"))?;
        tx.commit().await?;
        Ok(created)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let deleted = purge_before(&mut tx, cutoff, limit)
            .await
            .map_err(|e| e.during("purge_before"))?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Open write transaction. Holds the provider's writer lock; `tx` is declared
/// first so it rolls back before the lock is released.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl PersistenceTx for SqliteTx {
    async fn create_tasks(
        &mut self,
        tenant_id: Uuid,
        tasks: &[NewTask],
    ) -> Result<Vec<Task>, CoreError> {
        create_tasks(&mut self.tx, tenant_id, tasks)
            .await
            .map_err(|e| e.during("create_tasks"))
    }

    async fn lock_tasks(
        &mut self,
        tenant_id: Uuid,
        keys: &[(i64, DateTime<Utc>)],
    ) -> Result<Vec<Task>, CoreError> {
        lock_tasks(&mut self.tx, tenant_id, keys)
            .await
            .map_err(|e| e.during("lock_tasks"))
    }

    async fn get_task(
        &mut self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Option<Task>, CoreError> {
        get_task(&mut self.tx, tenant_id, task_id, inserted_at).await
    }

    async fn replay_tasks(
        &mut self,
        tenant_id: Uuid,
        replays: &[TaskReplay],
    ) -> Result<ReplayedTasks, CoreError> {
        replay_tasks(&mut self.tx, tenant_id, replays)
            .await
            .map_err(|e| e.during("replay_tasks"))
    }

    async fn insert_task_events(
        &mut self,
        tenant_id: Uuid,
        events: &[NewTaskEvent],
    ) -> Result<u64, CoreError> {
        insert_task_events(&mut self.tx, tenant_id, events)
            .await
            .map_err(|e| e.during("insert_task_events"))
    }

    async fn assign_queued_tasks(
        &mut self,
        tenant_id: Uuid,
        queue: &str,
        worker_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AssignedTask>, CoreError> {
        assign_queued_tasks(&mut self.tx, tenant_id, queue, worker_id, limit)
            .await
            .map_err(|e| e.during("assign_queued_tasks"))
    }

    async fn move_to_rate_limited(
        &mut self,
        tenant_id: Uuid,
        requeues: &[RateLimitedRequeue],
    ) -> Result<Vec<TaskAttempt>, CoreError> {
        move_to_rate_limited(&mut self.tx, tenant_id, requeues)
            .await
            .map_err(|e| e.during("move_to_rate_limited"))
    }

    async fn schedule_retries(
        &mut self,
        tenant_id: Uuid,
        retries: &[RetrySchedule],
    ) -> Result<Vec<Task>, CoreError> {
        schedule_retries(&mut self.tx, tenant_id, retries)
            .await
            .map_err(|e| e.during("schedule_retries"))
    }

    async fn fill_concurrency_slots(
        &mut self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<Vec<TaskAttempt>, CoreError> {
        fill_concurrency_slots(&mut self.tx, tenant_id, strategy_id, max_runs)
            .await
            .map_err(|e| e.during("fill_concurrency_slots"))
    }

    async fn release_tasks(
        &mut self,
        tenant_id: Uuid,
        attempts: &[TaskAttempt],
    ) -> Result<Vec<ReleasedTask>, CoreError> {
        release_tasks(&mut self.tx, tenant_id, attempts)
            .await
            .map_err(|e| e.during("release_tasks"))
    }

    async fn list_match_conditions_with_hint(
        &mut self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        keys: &[HintedEventKey],
    ) -> Result<Vec<MatchCondition>, CoreError> {
        list_match_conditions_with_hint(&mut self.tx, tenant_id, event_type, keys).await
    }

    async fn list_match_conditions_without_hint(
        &mut self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        event_keys: &[String],
    ) -> Result<Vec<MatchCondition>, CoreError> {
        list_match_conditions_without_hint(&mut self.tx, tenant_id, event_type, event_keys).await
    }

    async fn satisfy_match_conditions(
        &mut self,
        tenant_id: Uuid,
        satisfactions: &[ConditionSatisfaction],
    ) -> Result<Vec<SatisfiedMatch>, CoreError> {
        satisfy_match_conditions(&mut self.tx, tenant_id, satisfactions)
            .await
            .map_err(|e| e.during("satisfy_match_conditions"))
    }

    async fn bulk_create_events(&mut self, events: &[NewEvent]) -> Result<Vec<Event>, CoreError> {
        bulk_create_events(&mut self.tx, events)
            .await
            .map_err(|e| e.during("bulk_create_events"))
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}
