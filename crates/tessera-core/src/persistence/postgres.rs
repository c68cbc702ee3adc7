// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for tessera-core.
//!
//! Every operation is available as a free function over `&mut PgConnection`
//! so callers can compose several of them in one transaction; the
//! [`Persistence`] impl wraps each in its own transaction.
//!
//! Multi-row mutations lock before they mutate, always in one of two
//! canonical orders: `(task_id, task_inserted_at, retry_count)` for attempt
//! rows and `(strategy_id, workflow_version_id, workflow_run_id)` for
//! workflow aggregates. Two batches with overlapping membership therefore
//! serialise instead of deadlocking.
//!
//! A release locks its task rows `FOR UPDATE` before it reads any holding
//! area. Paths that move an attempt between holding areas take `FOR SHARE
//! SKIP LOCKED` on the task row: they either commit before the release sees
//! the holding areas, or leave that attempt where it is.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::error::CoreError;

use super::{
    AggregateCandidate, AggregateRequest, AssignedTask, ConcurrencyDimension, ConcurrencySlot,
    ConditionEventType, ConditionSatisfaction, Dag, DequeuedItem, Event, ExpiredRuntime,
    ExpressionEval, HintedEventKey, HoldingArea, INSERT_CHUNK_SIZE, InitialState,
    MATCH_COLUMNS, MATCH_CONDITION_COLUMNS, Match, MatchColumns, MatchCondition, MatchKind,
    MatchTarget, NewDag, NewEvent, NewMatch, NewMatchCondition, NewTask, NewTaskEvent, Persistence,
    PersistenceTx, PromotedAttempt, RateLimitedRequeue, ReleasedTask, ReleasedTaskColumns,
    ReplayedTasks, RetrySchedule, SatisfiedMatch, SlotCandidate, TASK_COLUMNS, Task, TaskAttempt,
    TaskColumns, TaskEvent, TaskReplay, WorkflowConcurrencySlot, WorkflowSlotColumns,
    aggregate_requests, all_groups_satisfied, canonical_attempts, check_replay_keys,
    merge_match_data, now, plan_aggregate_fill, plan_slot_fill, schedule_timeout_at,
    validate_new_events, validate_new_matches, validate_new_tasks, validate_replays,
    winning_action,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open a pool whose connections enforce `statement_timeout`, so lock waits
/// beyond it fail as retryable contention.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    statement_timeout: Duration,
) -> Result<PgPool, CoreError> {
    let options = PgConnectOptions::from_str(database_url)?
        .options([("statement_timeout", statement_timeout.as_millis().to_string())]);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
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
    concurrency_parent_strategy_ids: Vec<Option<i64>>,
    concurrency_strategy_ids: Vec<i64>,
    concurrency_keys: Vec<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, CoreError> {
        self.columns.into_task(
            self.concurrency_parent_strategy_ids,
            self.concurrency_strategy_ids,
            self.concurrency_keys,
        )
    }
}

fn decode_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>, CoreError> {
    rows.into_iter().map(TaskRow::into_task).collect()
}

#[derive(sqlx::FromRow)]
struct WorkflowSlotRow {
    #[sqlx(flatten)]
    columns: WorkflowSlotColumns,
    child_strategy_ids: Vec<i64>,
}

#[derive(sqlx::FromRow)]
struct ReleasedRow {
    #[sqlx(flatten)]
    columns: ReleasedTaskColumns,
    concurrency_strategy_ids: Vec<i64>,
}

/// Split attempts into the three arrays bound to `UNNEST`.
fn attempt_arrays(attempts: &[TaskAttempt]) -> (Vec<i64>, Vec<DateTime<Utc>>, Vec<i32>) {
    let mut ids = Vec::with_capacity(attempts.len());
    let mut inserted_ats = Vec::with_capacity(attempts.len());
    let mut retry_counts = Vec::with_capacity(attempts.len());
    for attempt in attempts {
        ids.push(attempt.task_id);
        inserted_ats.push(attempt.inserted_at);
        retry_counts.push(attempt.retry_count);
    }
    (ids, inserted_ats, retry_counts)
}

fn concurrency_arrays(dims: &[ConcurrencyDimension]) -> (Vec<Option<i64>>, Vec<i64>, Vec<String>) {
    (
        dims.iter().map(|d| d.parent_strategy_id).collect(),
        dims.iter().map(|d| d.strategy_id).collect(),
        dims.iter().map(|d| d.key.clone()).collect(),
    )
}

/// Reserve `count` ids from a table's serial sequence so inserted rows can be
/// correlated with their inputs.
async fn reserve_ids(conn: &mut PgConnection, table: &str, count: usize) -> Result<Vec<i64>, CoreError> {
    let ids = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT nextval(pg_get_serial_sequence($1, 'id'))
        FROM generate_series(1::BIGINT, $2::BIGINT)
        "#,
    )
    .bind(table)
    .bind(count as i64)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

// ============================================================================
// Task Store
// ============================================================================

/// Insert DAG rows, returned in input order.
pub async fn create_dags(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    dags: &[NewDag],
) -> Result<Vec<Dag>, CoreError> {
    if dags.is_empty() {
        return Ok(Vec::new());
    }
    let inserted_at = now();
    let mut by_external_id = HashMap::with_capacity(dags.len());

    for chunk in dags.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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
    conn: &mut PgConnection,
    tenant_id: Uuid,
    tasks: &[NewTask],
) -> Result<Vec<Task>, CoreError> {
    validate_new_tasks(tasks)?;
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let inserted_at = now();
    let mut by_external_id = HashMap::with_capacity(tasks.len());

    for chunk in tasks.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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
            let (parent_ids, strategy_ids, keys) = concurrency_arrays(&task.step.concurrency);
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
                .push_bind(parent_ids)
                .push_bind(strategy_ids)
                .push_bind(keys);
        });
        qb.push(" RETURNING ").push(TASK_COLUMNS);
        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
        for task in decode_tasks(rows)? {
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
    conn: &mut PgConnection,
    tenant_id: Uuid,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Option<Task>, CoreError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = $1 AND id = $2 AND inserted_at = $3"
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
    conn: &mut PgConnection,
    tenant_id: Uuid,
    external_id: Uuid,
) -> Result<Option<Task>, CoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = $1 AND external_id = $2");
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task).transpose()
}

/// Lock tasks in id order. Missing tasks are absent from the result.
pub async fn lock_tasks(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    keys: &[(i64, DateTime<Utc>)],
) -> Result<Vec<Task>, CoreError> {
    let (ids, inserted_ats): (Vec<i64>, Vec<DateTime<Utc>>) = keys.iter().copied().unzip();
    let sql = format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE tenant_id = $1
          AND (id, inserted_at) IN (SELECT * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[]))
        ORDER BY id, inserted_at
        FOR UPDATE
        "#
    );
    let rows: Vec<TaskRow> = sqlx::query_as(&sql)
        .bind(tenant_id)
        .bind(&ids)
        .bind(&inserted_ats)
        .fetch_all(&mut *conn)
        .await?;
    decode_tasks(rows)
}

/// Share-lock tasks in id order, skipping tasks a release holds. Skipped and
/// missing tasks are absent from the result.
async fn share_unreleased_tasks(
    conn: &mut PgConnection,
    keys: &[(i64, DateTime<Utc>)],
) -> Result<Vec<Task>, CoreError> {
    let (ids, inserted_ats): (Vec<i64>, Vec<DateTime<Utc>>) = keys.iter().copied().unzip();
    let sql = format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE (id, inserted_at) IN (SELECT * FROM UNNEST($1::BIGINT[], $2::TIMESTAMPTZ[]))
        ORDER BY id, inserted_at
        FOR SHARE SKIP LOCKED
        "#
    );
    let rows: Vec<TaskRow> = sqlx::query_as(&sql)
        .bind(&ids)
        .bind(&inserted_ats)
        .fetch_all(&mut *conn)
        .await?;
    decode_tasks(rows)
}

async fn load_tasks(
    conn: &mut PgConnection,
    keys: &[(i64, DateTime<Utc>)],
) -> Result<Vec<Task>, CoreError> {
    let (ids, inserted_ats): (Vec<i64>, Vec<DateTime<Utc>>) = keys.iter().copied().unzip();
    let sql = format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE (id, inserted_at) IN (SELECT * FROM UNNEST($1::BIGINT[], $2::TIMESTAMPTZ[]))
        ORDER BY id, inserted_at
        "#
    );
    let rows: Vec<TaskRow> = sqlx::query_as(&sql)
        .bind(&ids)
        .bind(&inserted_ats)
        .fetch_all(&mut *conn)
        .await?;
    decode_tasks(rows)
}

/// Replay tasks under a new attempt. Fails with `TaskNotFound` if any task is
/// missing; nothing is written in that case.
pub async fn replay_tasks(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    replays: &[TaskReplay],
) -> Result<ReplayedTasks, CoreError> {
    validate_replays(replays)?;
    if replays.is_empty() {
        return Ok(ReplayedTasks::default());
    }

    let keys: Vec<_> = replays.iter().map(|r| (r.task_id, r.inserted_at)).collect();
    let locked = lock_tasks(conn, tenant_id, &keys).await?;
    let locked: HashMap<(i64, DateTime<Utc>), Task> =
        locked.into_iter().map(|t| ((t.id, t.inserted_at), t)).collect();

    for replay in replays {
        let task = locked
            .get(&(replay.task_id, replay.inserted_at))
            .ok_or(CoreError::TaskNotFound {
                task_id: replay.task_id,
            })?;
        check_replay_keys(replay, task)?;
    }

    let current: Vec<TaskAttempt> = replays
        .iter()
        .filter_map(|r| locked.get(&(r.task_id, r.inserted_at)).map(Task::attempt))
        .collect();
    let superseded = release_tasks(conn, tenant_id, &current).await?;

    let mut ordered: Vec<&TaskReplay> = replays.iter().collect();
    ordered.sort_by_key(|r| (r.task_id, r.inserted_at));

    let sql = format!(
        r#"
        UPDATE tasks
        SET retry_count = retry_count + 1,
            app_retry_count = 0,
            internal_retry_count = 0,
            initial_state = $4,
            initial_state_reason = $5,
            concurrency_keys = $6,
            input = COALESCE($7, input)
        WHERE tenant_id = $1 AND id = $2 AND inserted_at = $3
        RETURNING {TASK_COLUMNS}
        "#
    );
    let mut replayed = HashMap::with_capacity(ordered.len());
    for replay in ordered {
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(replay.task_id)
            .bind(replay.inserted_at)
            .bind(replay.initial_state.as_str())
            .bind(replay.initial_state_reason.as_deref())
            .bind(&replay.concurrency_keys)
            .bind(&replay.input)
            .fetch_one(&mut *conn)
            .await?;
        let task = row.into_task()?;
        replayed.insert((task.id, task.inserted_at), task);
    }

    let result: Vec<Task> = replays
        .iter()
        .filter_map(|r| replayed.get(&(r.task_id, r.inserted_at)).cloned())
        .collect();
    enqueue_tasks(conn, &result, now()).await?;
    Ok(ReplayedTasks {
        tasks: result,
        superseded,
    })
}

/// Append task events; duplicates of keyed events are dropped.
pub async fn insert_task_events(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    events: &[NewTaskEvent],
) -> Result<u64, CoreError> {
    let created_at = now();
    let mut written = 0;
    for chunk in events.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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
    conn: &mut PgConnection,
    tenant_id: Uuid,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Vec<TaskEvent>, CoreError> {
    let events = sqlx::query_as::<_, TaskEvent>(
        r#"
        SELECT id, tenant_id, task_id, task_inserted_at, retry_count, event_type, event_key,
               data, external_id, created_at
        FROM task_events
        WHERE tenant_id = $1 AND task_id = $2 AND task_inserted_at = $3
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
    conn: &mut PgConnection,
    evals: &[ExpressionEval],
) -> Result<(), CoreError> {
    // One statement cannot update the same row twice.
    let mut latest: HashMap<(i64, DateTime<Utc>, &str, &str), &ExpressionEval> = HashMap::new();
    for eval in evals {
        latest.insert(
            (eval.task_id, eval.task_inserted_at, eval.kind.as_str(), eval.key.as_str()),
            eval,
        );
    }
    let deduped: Vec<&ExpressionEval> = latest.into_values().collect();

    for chunk in deduped.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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
             SET value_str = EXCLUDED.value_str, value_int = EXCLUDED.value_int",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// List a task's cached expression evaluations.
pub async fn list_expression_evals(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    task_id: i64,
    inserted_at: DateTime<Utc>,
) -> Result<Vec<ExpressionEval>, CoreError> {
    let evals = sqlx::query_as::<_, ExpressionEval>(
        r#"
        SELECT e.task_id, e.task_inserted_at, e.kind, e.key, e.value_str, e.value_int
        FROM task_expression_evals e
        WHERE e.task_id = $2 AND e.task_inserted_at = $3
          AND EXISTS (
              SELECT 1 FROM tasks t
              WHERE t.id = e.task_id AND t.inserted_at = e.task_inserted_at AND t.tenant_id = $1
          )
        ORDER BY e.kind, e.key
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(inserted_at)
    .fetch_all(&mut *conn)
    .await?;
    Ok(evals)
}

// ============================================================================
// Enqueue
// ============================================================================

/// Put queued attempts into their first holding state: a queue item when the
/// task has no concurrency dimensions, otherwise unfilled concurrency slots.
pub async fn enqueue_tasks(
    conn: &mut PgConnection,
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
    conn: &mut PgConnection,
    tasks: &[&Task],
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    for chunk in tasks.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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
    conn: &mut PgConnection,
    requests: &[AggregateRequest],
) -> Result<(), CoreError> {
    for chunk in requests.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO workflow_concurrency_slots (tenant_id, workflow_id, workflow_version_id, \
             workflow_run_id, strategy_id, child_strategy_ids, priority, key) ",
        );
        qb.push_values(chunk, |mut b, req| {
            b.push_bind(req.tenant_id)
                .push_bind(req.workflow_id)
                .push_bind(req.workflow_version_id)
                .push_bind(req.workflow_run_id)
                .push_bind(req.strategy_id)
                .push_bind(&req.child_strategy_ids)
                .push_bind(req.priority)
                .push_bind(&req.key);
        });
        qb.push(
            " ON CONFLICT (strategy_id, workflow_version_id, workflow_run_id) DO UPDATE \
             SET child_strategy_ids = ( \
                 SELECT ARRAY_AGG(DISTINCT c ORDER BY c) \
                 FROM UNNEST(workflow_concurrency_slots.child_strategy_ids \
                             || EXCLUDED.child_strategy_ids) AS c)",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_concurrency_slots(
    conn: &mut PgConnection,
    tasks: &[&Task],
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let rows: Vec<(&Task, &ConcurrencyDimension)> = tasks
        .iter()
        .flat_map(|t| t.step.concurrency.iter().map(move |d| (*t, d)))
        .collect();

    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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

/// Dequeue up to `limit` attempts for a worker (`priority DESC, id ASC`),
/// skipping rows other dispatchers hold and attempts being released, and
/// record the runtimes.
pub async fn assign_queued_tasks(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    queue: &str,
    worker_id: Uuid,
    limit: i64,
) -> Result<Vec<AssignedTask>, CoreError> {
    let mut items = sqlx::query_as::<_, DequeuedItem>(
        r#"
        WITH candidates AS (
            SELECT q.id
            FROM queue_items q
            JOIN tasks t ON t.id = q.task_id AND t.inserted_at = q.task_inserted_at
            WHERE q.tenant_id = $1
              AND q.queue = $2
              AND (q.sticky <> 'HARD' OR q.desired_worker_id IS NULL OR q.desired_worker_id = $3)
            ORDER BY q.priority DESC, q.id ASC
            LIMIT $4
            FOR UPDATE OF q SKIP LOCKED
            FOR SHARE OF t SKIP LOCKED
        )
        DELETE FROM queue_items q
        USING candidates c
        WHERE q.id = c.id
        RETURNING q.id, q.task_id, q.task_inserted_at, q.retry_count, q.external_id,
                  q.action_id, q.step_timeout_secs, q.priority
        "#,
    )
    .bind(tenant_id)
    .bind(queue)
    .bind(worker_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    if items.is_empty() {
        return Ok(Vec::new());
    }
    items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let now = now();
    let assigned: Vec<AssignedTask> = items
        .into_iter()
        .map(|item| item.into_assigned(worker_id, now))
        .collect();

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO task_runtimes (task_id, task_inserted_at, retry_count, tenant_id, worker_id, \
         timeout_at) ",
    );
    qb.push_values(&assigned, |mut b, a| {
        b.push_bind(a.attempt.task_id)
            .push_bind(a.attempt.inserted_at)
            .push_bind(a.attempt.retry_count)
            .push_bind(tenant_id)
            .push_bind(worker_id)
            .push_bind(a.timeout_at);
    });
    qb.push(" ON CONFLICT DO NOTHING");
    qb.build().execute(&mut *conn).await?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO task_runtime_slots (task_id, task_inserted_at, retry_count, tenant_id, \
         worker_id) ",
    );
    qb.push_values(&assigned, |mut b, a| {
        b.push_bind(a.attempt.task_id)
            .push_bind(a.attempt.inserted_at)
            .push_bind(a.attempt.retry_count)
            .push_bind(tenant_id)
            .push_bind(worker_id);
    });
    qb.push(" ON CONFLICT DO NOTHING");
    qb.build().execute(&mut *conn).await?;

    Ok(assigned)
}

/// Move queued attempts to the rate-limited holding area. Attempts that are
/// not queued, or are being released, are ignored.
pub async fn move_to_rate_limited(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    requeues: &[RateLimitedRequeue],
) -> Result<Vec<TaskAttempt>, CoreError> {
    let mut requeues = requeues.to_vec();
    requeues.sort_by_key(|r| r.attempt);
    requeues.dedup_by_key(|r| r.attempt);
    if requeues.is_empty() {
        return Ok(Vec::new());
    }

    let attempts: Vec<TaskAttempt> = requeues.iter().map(|r| r.attempt).collect();
    let (ids, inserted_ats, retry_counts) = attempt_arrays(&attempts);
    let requeue_afters: Vec<DateTime<Utc>> = requeues.iter().map(|r| r.requeue_after).collect();

    let rows = sqlx::query_as::<_, (i64, DateTime<Utc>, i32)>(
        r#"
        WITH input AS (
            SELECT * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::INTEGER[], $5::TIMESTAMPTZ[])
                AS i(task_id, task_inserted_at, retry_count, requeue_after)
        ),
        locked AS (
            SELECT q.id
            FROM queue_items q
            JOIN input i USING (task_id, task_inserted_at, retry_count)
            JOIN tasks t ON t.id = q.task_id AND t.inserted_at = q.task_inserted_at
            WHERE q.tenant_id = $1
            ORDER BY q.task_id, q.task_inserted_at, q.retry_count
            FOR UPDATE OF q
            FOR SHARE OF t SKIP LOCKED
        ),
        moved AS (
            DELETE FROM queue_items q
            USING locked l
            WHERE q.id = l.id
            RETURNING q.tenant_id, q.queue, q.task_id, q.task_inserted_at, q.external_id,
                      q.action_id, q.step_id, q.workflow_id, q.workflow_run_id,
                      q.schedule_timeout_at, q.step_timeout_secs, q.priority, q.sticky,
                      q.desired_worker_id, q.retry_count
        )
        INSERT INTO rate_limited_queue_items (
            requeue_after, tenant_id, queue, task_id, task_inserted_at, external_id, action_id,
            step_id, workflow_id, workflow_run_id, schedule_timeout_at, step_timeout_secs,
            priority, sticky, desired_worker_id, retry_count
        )
        SELECT i.requeue_after, m.tenant_id, m.queue, m.task_id, m.task_inserted_at,
               m.external_id, m.action_id, m.step_id, m.workflow_id, m.workflow_run_id,
               m.schedule_timeout_at, m.step_timeout_secs, m.priority, m.sticky,
               m.desired_worker_id, m.retry_count
        FROM moved m
        JOIN input i USING (task_id, task_inserted_at, retry_count)
        ORDER BY m.task_id, m.task_inserted_at, m.retry_count
        ON CONFLICT (task_id, task_inserted_at, retry_count) DO NOTHING
        RETURNING task_id, task_inserted_at, retry_count
        "#,
    )
    .bind(tenant_id)
    .bind(&ids)
    .bind(&inserted_ats)
    .bind(&retry_counts)
    .bind(&requeue_afters)
    .fetch_all(&mut *conn)
    .await?;

    let mut moved: Vec<TaskAttempt> = rows
        .into_iter()
        .map(|(id, at, rc)| TaskAttempt::new(id, at, rc))
        .collect();
    moved.sort();
    Ok(moved)
}

/// Release failed current attempts and hold their successors in the retry
/// queue. Stale attempts are ignored.
pub async fn schedule_retries(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    retries: &[RetrySchedule],
) -> Result<Vec<Task>, CoreError> {
    let mut retries = retries.to_vec();
    retries.sort_by_key(|r| r.attempt);
    retries.dedup_by_key(|r| r.attempt.task_id);
    if retries.is_empty() {
        return Ok(Vec::new());
    }

    let keys: Vec<_> = retries
        .iter()
        .map(|r| (r.attempt.task_id, r.attempt.inserted_at))
        .collect();
    let locked: HashMap<(i64, DateTime<Utc>), Task> = lock_tasks(conn, tenant_id, &keys)
        .await?
        .into_iter()
        .map(|t| ((t.id, t.inserted_at), t))
        .collect();

    let current: Vec<RetrySchedule> = retries
        .into_iter()
        .filter(|r| {
            locked
                .get(&(r.attempt.task_id, r.attempt.inserted_at))
                .is_some_and(|t| t.retry_count == r.attempt.retry_count)
        })
        .collect();
    if current.is_empty() {
        return Ok(Vec::new());
    }

    let attempts: Vec<TaskAttempt> = current.iter().map(|r| r.attempt).collect();
    release_tasks(conn, tenant_id, &attempts).await?;

    let sql = format!(
        r#"
        UPDATE tasks
        SET retry_count = retry_count + 1,
            app_retry_count = app_retry_count + CASE WHEN $4 THEN 1 ELSE 0 END,
            internal_retry_count = internal_retry_count + CASE WHEN $4 THEN 0 ELSE 1 END
        WHERE tenant_id = $1 AND id = $2 AND inserted_at = $3
        RETURNING {TASK_COLUMNS}
        "#
    );
    let mut updated = Vec::with_capacity(current.len());
    for retry in &current {
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(retry.attempt.task_id)
            .bind(retry.attempt.inserted_at)
            .bind(retry.is_app_retry)
            .fetch_one(&mut *conn)
            .await?;
        updated.push(row.into_task()?);
    }

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO retry_queue_items (task_id, task_inserted_at, task_retry_count, retry_after, \
         tenant_id) ",
    );
    qb.push_values(updated.iter().zip(&current), |mut b, (task, retry)| {
        b.push_bind(task.id)
            .push_bind(task.inserted_at)
            .push_bind(task.retry_count)
            .push_bind(retry.retry_after)
            .push_bind(tenant_id);
    });
    qb.push(" ON CONFLICT DO NOTHING");
    qb.build().execute(&mut *conn).await?;

    Ok(updated)
}

/// Re-enqueue retry items whose backoff has elapsed, skipping rows locked by
/// other sweepers, attempts being released, and attempts superseded in the
/// meantime.
pub async fn promote_due_retries(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<PromotedAttempt>, CoreError> {
    let due = sqlx::query_as::<_, (Uuid, i64, DateTime<Utc>, i32)>(
        r#"
        WITH due AS (
            SELECT r.task_id, r.task_inserted_at, r.task_retry_count
            FROM retry_queue_items r
            JOIN tasks t ON t.id = r.task_id AND t.inserted_at = r.task_inserted_at
            WHERE r.retry_after <= $1
            ORDER BY r.task_id, r.task_inserted_at, r.task_retry_count
            LIMIT $2
            FOR UPDATE OF r SKIP LOCKED
            FOR SHARE OF t SKIP LOCKED
        )
        DELETE FROM retry_queue_items r
        USING due d
        WHERE r.task_id = d.task_id
          AND r.task_inserted_at = d.task_inserted_at
          AND r.task_retry_count = d.task_retry_count
        RETURNING r.tenant_id, r.task_id, r.task_inserted_at, r.task_retry_count
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    if due.is_empty() {
        return Ok(Vec::new());
    }

    let wanted: HashSet<TaskAttempt> = due
        .iter()
        .map(|(_, id, at, rc)| TaskAttempt::new(*id, *at, *rc))
        .collect();
    let keys: Vec<_> = due.iter().map(|(_, id, at, _)| (*id, *at)).collect();
    let tasks: Vec<Task> = load_tasks(conn, &keys)
        .await?
        .into_iter()
        .filter(|t| wanted.contains(&t.attempt()))
        .map(|mut t| {
            // A retry always re-enters as queued.
            t.initial_state = InitialState::Queued;
            t
        })
        .collect();

    enqueue_tasks(conn, &tasks, now).await?;
    Ok(tasks
        .iter()
        .map(|t| PromotedAttempt {
            tenant_id: t.tenant_id,
            attempt: t.attempt(),
        })
        .collect())
}

/// Re-enqueue rate-limited items whose requeue time has passed, skipping
/// attempts being released.
pub async fn promote_due_rate_limited(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<PromotedAttempt>, CoreError> {
    let rows = sqlx::query_as::<_, (Uuid, i64, DateTime<Utc>, i32)>(
        r#"
        WITH due AS (
            SELECT r.task_id, r.task_inserted_at, r.retry_count
            FROM rate_limited_queue_items r
            JOIN tasks t ON t.id = r.task_id AND t.inserted_at = r.task_inserted_at
            WHERE r.requeue_after <= $1
            ORDER BY r.task_id, r.task_inserted_at, r.retry_count
            LIMIT $2
            FOR UPDATE OF r SKIP LOCKED
            FOR SHARE OF t SKIP LOCKED
        ),
        moved AS (
            DELETE FROM rate_limited_queue_items r
            USING due d
            WHERE r.task_id = d.task_id
              AND r.task_inserted_at = d.task_inserted_at
              AND r.retry_count = d.retry_count
            RETURNING r.tenant_id, r.queue, r.task_id, r.task_inserted_at, r.external_id,
                      r.action_id, r.step_id, r.workflow_id, r.workflow_run_id,
                      r.schedule_timeout_at, r.step_timeout_secs, r.priority, r.sticky,
                      r.desired_worker_id, r.retry_count
        )
        INSERT INTO queue_items (
            tenant_id, queue, task_id, task_inserted_at, external_id, action_id, step_id,
            workflow_id, workflow_run_id, schedule_timeout_at, step_timeout_secs, priority,
            sticky, desired_worker_id, retry_count
        )
        SELECT tenant_id, queue, task_id, task_inserted_at, external_id, action_id, step_id,
               workflow_id, workflow_run_id, schedule_timeout_at, step_timeout_secs, priority,
               sticky, desired_worker_id, retry_count
        FROM moved
        ORDER BY task_id, task_inserted_at, retry_count
        ON CONFLICT (task_id, task_inserted_at, retry_count) DO NOTHING
        RETURNING tenant_id, task_id, task_inserted_at, retry_count
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut promoted: Vec<PromotedAttempt> = rows
        .into_iter()
        .map(|(tenant_id, id, at, rc)| PromotedAttempt {
            tenant_id,
            attempt: TaskAttempt::new(id, at, rc),
        })
        .collect();
    promoted.sort_by_key(|p| p.attempt);
    Ok(promoted)
}

/// Holding areas an attempt is currently present in.
pub async fn holding_areas(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    attempt: TaskAttempt,
) -> Result<Vec<HoldingArea>, CoreError> {
    let (in_queue, in_retry, in_rate_limited) = sqlx::query_as::<_, (bool, bool, bool)>(
        r#"
        SELECT
            EXISTS (SELECT 1 FROM queue_items
                    WHERE tenant_id = $1 AND task_id = $2 AND task_inserted_at = $3
                      AND retry_count = $4),
            EXISTS (SELECT 1 FROM retry_queue_items
                    WHERE tenant_id = $1 AND task_id = $2 AND task_inserted_at = $3
                      AND task_retry_count = $4),
            EXISTS (SELECT 1 FROM rate_limited_queue_items
                    WHERE tenant_id = $1 AND task_id = $2 AND task_inserted_at = $3
                      AND retry_count = $4)
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
    conn: &mut PgConnection,
    tenant_id: Uuid,
    strategy_id: i64,
    max_runs: i64,
) -> Result<u64, CoreError> {
    let candidates = sqlx::query_as::<_, AggregateCandidate>(
        r#"
        SELECT workflow_version_id, workflow_run_id, priority, key, is_filled, sort_id
        FROM workflow_concurrency_slots
        WHERE tenant_id = $1 AND strategy_id = $2
        ORDER BY strategy_id, workflow_version_id, workflow_run_id
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .fetch_all(&mut *conn)
    .await?;

    let picked = plan_aggregate_fill(candidates, max_runs);
    if picked.is_empty() {
        return Ok(0);
    }

    let versions: Vec<Uuid> = picked.iter().map(|c| c.workflow_version_id).collect();
    let runs: Vec<Uuid> = picked.iter().map(|c| c.workflow_run_id).collect();
    let result = sqlx::query(
        r#"
        UPDATE workflow_concurrency_slots
        SET is_filled = TRUE
        WHERE strategy_id = $1
          AND (workflow_version_id, workflow_run_id) IN
              (SELECT * FROM UNNEST($2::UUID[], $3::UUID[]))
        "#,
    )
    .bind(strategy_id)
    .bind(&versions)
    .bind(&runs)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Fill per-task slots of a strategy and queue attempts whose slots are now
/// all filled.
pub async fn fill_concurrency_slots(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    strategy_id: i64,
    max_runs: i64,
) -> Result<Vec<TaskAttempt>, CoreError> {
    // Aggregates first, matching the release lock order.
    let filled_aggregates: HashSet<(i64, Uuid, Uuid)> =
        sqlx::query_as::<_, (i64, Uuid, Uuid, bool)>(
            r#"
            SELECT w.strategy_id, w.workflow_version_id, w.workflow_run_id, w.is_filled
            FROM workflow_concurrency_slots w
            WHERE w.tenant_id = $1
              AND (w.strategy_id, w.workflow_version_id, w.workflow_run_id) IN (
                  SELECT c.parent_strategy_id, c.workflow_version_id, c.workflow_run_id
                  FROM concurrency_slots c
                  WHERE c.tenant_id = $1 AND c.strategy_id = $2
                    AND c.parent_strategy_id IS NOT NULL
              )
            ORDER BY w.strategy_id, w.workflow_version_id, w.workflow_run_id
            FOR SHARE
            "#,
        )
        .bind(tenant_id)
        .bind(strategy_id)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .filter(|(_, _, _, is_filled)| *is_filled)
        .map(|(s, v, r, _)| (s, v, r))
        .collect();

    let candidates = sqlx::query_as::<_, SlotCandidate>(
        r#"
        SELECT task_id, task_inserted_at, task_retry_count, parent_strategy_id,
               workflow_version_id, workflow_run_id, priority, key, is_filled, sort_id
        FROM concurrency_slots
        WHERE tenant_id = $1 AND strategy_id = $2
        ORDER BY task_id, task_inserted_at, task_retry_count
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .fetch_all(&mut *conn)
    .await?;

    let picked = plan_slot_fill(candidates, &filled_aggregates, max_runs);
    if picked.is_empty() {
        return Ok(Vec::new());
    }

    let attempts = canonical_attempts(&picked.iter().map(SlotCandidate::attempt).collect::<Vec<_>>());
    let (ids, inserted_ats, retry_counts) = attempt_arrays(&attempts);
    sqlx::query(
        r#"
        UPDATE concurrency_slots
        SET is_filled = TRUE
        WHERE strategy_id = $1
          AND (task_id, task_inserted_at, task_retry_count) IN
              (SELECT * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::INTEGER[]))
        "#,
    )
    .bind(strategy_id)
    .bind(&ids)
    .bind(&inserted_ats)
    .bind(&retry_counts)
    .execute(&mut *conn)
    .await?;

    let ready: HashSet<TaskAttempt> = sqlx::query_as::<_, (i64, DateTime<Utc>, i32)>(
        r#"
        SELECT task_id, task_inserted_at, task_retry_count
        FROM concurrency_slots
        WHERE (task_id, task_inserted_at, task_retry_count) IN
              (SELECT * FROM UNNEST($1::BIGINT[], $2::TIMESTAMPTZ[], $3::INTEGER[]))
        GROUP BY task_id, task_inserted_at, task_retry_count
        HAVING BOOL_AND(is_filled)
        "#,
    )
    .bind(&ids)
    .bind(&inserted_ats)
    .bind(&retry_counts)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|(id, at, rc)| TaskAttempt::new(id, at, rc))
    .collect();

    if ready.is_empty() {
        return Ok(Vec::new());
    }

    // A task locked by a release is about to lose these slots; do not queue it.
    let keys: Vec<_> = ready.iter().map(|a| (a.task_id, a.inserted_at)).collect();
    let tasks: Vec<Task> = share_unreleased_tasks(conn, &keys)
        .await?
        .into_iter()
        .filter(|t| ready.contains(&t.attempt()))
        .collect();
    let refs: Vec<&Task> = tasks.iter().collect();
    insert_queue_items(conn, &refs, now()).await?;

    let mut queued: Vec<TaskAttempt> = tasks.iter().map(Task::attempt).collect();
    queued.sort();
    Ok(queued)
}

/// Per-task slots of a task, all attempts.
pub async fn list_concurrency_slots(
    conn: &mut PgConnection,
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
        WHERE tenant_id = $1 AND task_id = $2 AND task_inserted_at = $3
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
    conn: &mut PgConnection,
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
        WHERE tenant_id = $1
          AND strategy_id = $2 AND workflow_version_id = $3 AND workflow_run_id = $4
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .bind(workflow_version_id)
    .bind(workflow_run_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|r| r.columns.into_slot(r.child_strategy_ids)))
}

/// Lock the workflow aggregates owning the per-task slots of `attempts`, in
/// `(strategy_id, workflow_version_id, workflow_run_id)` order.
pub async fn lock_parent_concurrency_slots(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    attempts: &[TaskAttempt],
) -> Result<Vec<(i64, Uuid, Uuid)>, CoreError> {
    let (ids, inserted_ats, retry_counts) = attempt_arrays(attempts);
    let locked = sqlx::query_as::<_, (i64, Uuid, Uuid)>(
        r#"
        SELECT w.strategy_id, w.workflow_version_id, w.workflow_run_id
        FROM workflow_concurrency_slots w
        WHERE (w.strategy_id, w.workflow_version_id, w.workflow_run_id) IN (
            SELECT c.parent_strategy_id, c.workflow_version_id, c.workflow_run_id
            FROM concurrency_slots c
            WHERE c.tenant_id = $1
              AND c.parent_strategy_id IS NOT NULL
              AND (c.task_id, c.task_inserted_at, c.task_retry_count) IN
                  (SELECT * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::INTEGER[]))
        )
        ORDER BY w.strategy_id, w.workflow_version_id, w.workflow_run_id
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(&ids)
    .bind(&inserted_ats)
    .bind(&retry_counts)
    .fetch_all(&mut *conn)
    .await?;
    Ok(locked)
}

/// Delete the per-task slots of `attempts`. Must run after
/// [`lock_parent_concurrency_slots`] in the same transaction.
///
/// Aggregates left without per-task slots are deleted.
pub async fn release_concurrency_slots(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    attempts: &[TaskAttempt],
    locked_aggregates: &[(i64, Uuid, Uuid)],
) -> Result<u64, CoreError> {
    let (ids, inserted_ats, retry_counts) = attempt_arrays(attempts);
    let deleted = sqlx::query(
        r#"
        WITH locked AS (
            SELECT task_id, task_inserted_at, task_retry_count, strategy_id
            FROM concurrency_slots
            WHERE tenant_id = $1
              AND (task_id, task_inserted_at, task_retry_count) IN
                  (SELECT * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::INTEGER[]))
            ORDER BY task_id, task_inserted_at, task_retry_count, strategy_id
            FOR UPDATE
        )
        DELETE FROM concurrency_slots c
        USING locked l
        WHERE c.task_id = l.task_id
          AND c.task_inserted_at = l.task_inserted_at
          AND c.task_retry_count = l.task_retry_count
          AND c.strategy_id = l.strategy_id
        "#,
    )
    .bind(tenant_id)
    .bind(&ids)
    .bind(&inserted_ats)
    .bind(&retry_counts)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if locked_aggregates.is_empty() {
        return Ok(deleted);
    }

    let strategies: Vec<i64> = locked_aggregates.iter().map(|a| a.0).collect();
    let versions: Vec<Uuid> = locked_aggregates.iter().map(|a| a.1).collect();
    let runs: Vec<Uuid> = locked_aggregates.iter().map(|a| a.2).collect();
    sqlx::query(
        r#"
        DELETE FROM workflow_concurrency_slots w
        WHERE (w.strategy_id, w.workflow_version_id, w.workflow_run_id) IN
              (SELECT * FROM UNNEST($1::BIGINT[], $2::UUID[], $3::UUID[]))
          AND NOT EXISTS (
              SELECT 1 FROM concurrency_slots c
              WHERE c.parent_strategy_id = w.strategy_id
                AND c.workflow_version_id = w.workflow_version_id
                AND c.workflow_run_id = w.workflow_run_id
          )
        "#,
    )
    .bind(&strategies)
    .bind(&versions)
    .bind(&runs)
    .execute(&mut *conn)
    .await?;

    Ok(deleted)
}

// ============================================================================
// Release Coordinator
// ============================================================================

/// Lock and delete the rows of one attempt-keyed holding table.
async fn release_attempt_rows(
    conn: &mut PgConnection,
    table: &str,
    retry_column: &str,
    tenant_id: Uuid,
    arrays: &(Vec<i64>, Vec<DateTime<Utc>>, Vec<i32>),
) -> Result<u64, CoreError> {
    let sql = format!(
        r#"
        WITH locked AS (
            SELECT task_id, task_inserted_at, {retry_column}
            FROM {table}
            WHERE tenant_id = $1
              AND (task_id, task_inserted_at, {retry_column}) IN
                  (SELECT * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::INTEGER[]))
            ORDER BY task_id, task_inserted_at, {retry_column}
            FOR UPDATE
        )
        DELETE FROM {table} t
        USING locked l
        WHERE t.task_id = l.task_id
          AND t.task_inserted_at = l.task_inserted_at
          AND t.{retry_column} = l.{retry_column}
        "#
    );
    let result = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(&arrays.0)
        .bind(&arrays.1)
        .bind(&arrays.2)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Atomically remove runtime, holding-area and concurrency state of the
/// attempts and summarise them in input order. Attempts whose task does not
/// exist are omitted.
pub async fn release_tasks(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    attempts: &[TaskAttempt],
) -> Result<Vec<ReleasedTask>, CoreError> {
    let sorted = canonical_attempts(attempts);
    if sorted.is_empty() {
        return Ok(Vec::new());
    }
    let arrays = attempt_arrays(&sorted);

    // 0. task rows, so no dispatcher moves these attempts under us
    let mut keys: Vec<(i64, DateTime<Utc>)> =
        sorted.iter().map(|a| (a.task_id, a.inserted_at)).collect();
    keys.dedup();
    lock_tasks(conn, tenant_id, &keys).await?;

    // 1. runtime slots, then runtimes (capturing the worker)
    release_attempt_rows(conn, "task_runtime_slots", "retry_count", tenant_id, &arrays).await?;
    let workers: HashMap<TaskAttempt, Uuid> = sqlx::query_as::<_, (i64, DateTime<Utc>, i32, Uuid)>(
        r#"
        WITH locked AS (
            SELECT task_id, task_inserted_at, retry_count
            FROM task_runtimes
            WHERE tenant_id = $1
              AND (task_id, task_inserted_at, retry_count) IN
                  (SELECT * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::INTEGER[]))
            ORDER BY task_id, task_inserted_at, retry_count
            FOR UPDATE
        )
        DELETE FROM task_runtimes r
        USING locked l
        WHERE r.task_id = l.task_id
          AND r.task_inserted_at = l.task_inserted_at
          AND r.retry_count = l.retry_count
        RETURNING r.task_id, r.task_inserted_at, r.retry_count, r.worker_id
        "#,
    )
    .bind(tenant_id)
    .bind(&arrays.0)
    .bind(&arrays.1)
    .bind(&arrays.2)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|(id, at, rc, worker)| (TaskAttempt::new(id, at, rc), worker))
    .collect();

    // 2. holding areas
    release_attempt_rows(conn, "retry_queue_items", "task_retry_count", tenant_id, &arrays).await?;
    release_attempt_rows(conn, "queue_items", "retry_count", tenant_id, &arrays).await?;
    release_attempt_rows(conn, "rate_limited_queue_items", "retry_count", tenant_id, &arrays)
        .await?;

    // 3. aggregates before per-task slots
    let locked_aggregates = lock_parent_concurrency_slots(conn, tenant_id, &sorted).await?;
    release_concurrency_slots(conn, tenant_id, &sorted, &locked_aggregates).await?;

    // 4. summaries
    let rows: Vec<ReleasedRow> = sqlx::query_as(
        r#"
        SELECT t.id AS task_id, t.inserted_at AS task_inserted_at, i.retry_count,
               t.retry_count AS current_retry_count, t.queue, t.external_id,
               t.step_readable_id, t.workflow_run_id, t.concurrency_strategy_ids
        FROM tasks t
        JOIN UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::INTEGER[])
            AS i(task_id, task_inserted_at, retry_count)
          ON t.id = i.task_id AND t.inserted_at = i.task_inserted_at
        WHERE t.tenant_id = $1
        "#,
    )
    .bind(tenant_id)
    .bind(&arrays.0)
    .bind(&arrays.1)
    .bind(&arrays.2)
    .fetch_all(&mut *conn)
    .await?;

    let mut summaries: HashMap<TaskAttempt, ReleasedTask> = rows
        .into_iter()
        .map(|row| {
            let c = row.columns;
            let attempt = TaskAttempt::new(c.task_id, c.task_inserted_at, c.retry_count);
            let released = ReleasedTask {
                attempt,
                queue: c.queue,
                external_id: c.external_id,
                step_readable_id: c.step_readable_id,
                workflow_run_id: c.workflow_run_id,
                worker_id: workers.get(&attempt).copied(),
                is_current_retry: c.current_retry_count == c.retry_count,
                concurrency_strategy_ids: row.concurrency_strategy_ids,
            };
            (attempt, released)
        })
        .collect();

    Ok(attempts
        .iter()
        .filter_map(|a| summaries.remove(a))
        .collect())
}

/// Runtimes whose timeout has passed, oldest first.
pub async fn list_expired_runtimes(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ExpiredRuntime>, CoreError> {
    let rows = sqlx::query_as::<_, ExpiredRuntime>(
        r#"
        SELECT tenant_id, task_id, task_inserted_at, retry_count, worker_id
        FROM task_runtimes
        WHERE timeout_at <= $1
        ORDER BY timeout_at, task_id
        LIMIT $2
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
    conn: &mut PgConnection,
    tenant_id: Uuid,
    matches: &[NewMatch],
    kind: MatchKind,
) -> Result<Vec<Match>, CoreError> {
    validate_new_matches(matches, kind)?;
    if matches.is_empty() {
        return Ok(Vec::new());
    }
    let created_at = now();
    let ids = reserve_ids(conn, "matches", matches.len()).await?;
    let rows: Vec<(i64, &NewMatch)> = ids.iter().copied().zip(matches).collect();

    let mut by_id = HashMap::with_capacity(matches.len());
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO matches (id, tenant_id, kind, existing_data, created_at, signal_task_id, \
             signal_task_inserted_at, signal_external_id, signal_key, trigger_dag_id, \
             trigger_dag_inserted_at, trigger_step_id, trigger_external_id, \
             trigger_workflow_run_id, trigger_parent_task_external_id, trigger_parent_task_id, \
             trigger_parent_task_inserted_at, trigger_child_index, trigger_child_key, \
             trigger_priority, trigger_step_config) ",
        );
        let mut encode_error = None;
        qb.push_values(chunk, |mut b, (id, m)| {
            b.push_bind(*id)
                .push_bind(tenant_id)
                .push_bind(m.target.kind().as_str())
                .push_bind(&m.existing_data)
                .push_bind(created_at);
            match &m.target {
                MatchTarget::Signal(signal) => {
                    b.push_bind(Some(signal.task_id))
                        .push_bind(Some(signal.task_inserted_at))
                        .push_bind(Some(signal.external_id))
                        .push_bind(Some(signal.signal_key.as_str()))
                        .push_bind(None::<i64>)
                        .push_bind(None::<DateTime<Utc>>)
                        .push_bind(None::<Uuid>)
                        .push_bind(None::<Uuid>)
                        .push_bind(None::<Uuid>)
                        .push_bind(None::<Uuid>)
                        .push_bind(None::<i64>)
                        .push_bind(None::<DateTime<Utc>>)
                        .push_bind(None::<i64>)
                        .push_bind(None::<String>)
                        .push_bind(None::<i32>)
                        .push_bind(None::<serde_json::Value>);
                }
                MatchTarget::DagTrigger(trigger) => {
                    let step_config = match serde_json::to_value(&trigger.step) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            encode_error = Some(e);
                            None
                        }
                    };
                    b.push_bind(None::<i64>)
                        .push_bind(None::<DateTime<Utc>>)
                        .push_bind(None::<Uuid>)
                        .push_bind(None::<String>)
                        .push_bind(Some(trigger.dag.dag_id))
                        .push_bind(Some(trigger.dag.dag_inserted_at))
                        .push_bind(Some(trigger.step.step_id))
                        .push_bind(Some(trigger.external_id))
                        .push_bind(Some(trigger.workflow_run_id))
                        .push_bind(trigger.parent.map(|p| p.external_id))
                        .push_bind(trigger.parent.map(|p| p.task_id))
                        .push_bind(trigger.parent.map(|p| p.inserted_at))
                        .push_bind(trigger.child_index)
                        .push_bind(trigger.child_key.clone())
                        .push_bind(trigger.priority)
                        .push_bind(step_config);
                }
            }
        });
        if let Some(e) = encode_error {
            return Err(e.into());
        }
        qb.push(" RETURNING ").push(MATCH_COLUMNS);
        let inserted: Vec<MatchColumns> = qb.build_query_as().fetch_all(&mut *conn).await?;
        for row in inserted {
            let m = Match::try_from(row)?;
            by_id.insert(m.id, m);
        }
    }

    let conditions: Vec<(i64, &NewMatchCondition)> = rows
        .iter()
        .flat_map(|(id, m)| m.conditions.iter().map(move |c| (*id, c)))
        .collect();
    for chunk in conditions.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO match_conditions (match_id, tenant_id, registered_at, event_type, \
             event_key, event_resource_hint, readable_data_key, expression, or_group_id, \
             action) ",
        );
        qb.push_values(chunk, |mut b, (match_id, c)| {
            b.push_bind(*match_id)
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
    }

    ids.iter()
        .map(|id| {
            by_id.remove(id).ok_or_else(|| CoreError::DatabaseError {
                operation: "create_matches".to_string(),
                details: format!("match {} was not returned by insert", id),
            })
        })
        .collect()
}

/// Insert DAG-trigger matches with their conditions.
pub async fn create_matches_for_dag_triggers(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    matches: &[NewMatch],
) -> Result<Vec<Match>, CoreError> {
    insert_matches(conn, tenant_id, matches, MatchKind::Trigger).await
}

/// Insert signal matches with their conditions.
pub async fn create_signal_matches(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    matches: &[NewMatch],
) -> Result<Vec<Match>, CoreError> {
    insert_matches(conn, tenant_id, matches, MatchKind::Signal).await
}

/// Unsatisfied conditions matching `(event_key, resource_hint)` pairs.
pub async fn list_match_conditions_with_hint(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    event_type: ConditionEventType,
    keys: &[HintedEventKey],
) -> Result<Vec<MatchCondition>, CoreError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let event_keys: Vec<&str> = keys.iter().map(|k| k.event_key.as_str()).collect();
    let hints: Vec<&str> = keys.iter().map(|k| k.resource_hint.as_str()).collect();
    let sql = format!(
        r#"
        SELECT {MATCH_CONDITION_COLUMNS}
        FROM match_conditions
        WHERE tenant_id = $1
          AND event_type = $2
          AND NOT is_satisfied
          AND event_resource_hint IS NOT NULL
          AND (event_key, event_resource_hint) IN
              (SELECT * FROM UNNEST($3::TEXT[], $4::TEXT[]))
        ORDER BY id
        "#
    );
    let conditions = sqlx::query_as::<_, MatchCondition>(&sql)
        .bind(tenant_id)
        .bind(event_type.as_str())
        .bind(&event_keys)
        .bind(&hints)
        .fetch_all(&mut *conn)
        .await?;
    Ok(conditions)
}

/// Unsatisfied conditions without a hint matching the event keys.
pub async fn list_match_conditions_without_hint(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    event_type: ConditionEventType,
    event_keys: &[String],
) -> Result<Vec<MatchCondition>, CoreError> {
    if event_keys.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        r#"
        SELECT {MATCH_CONDITION_COLUMNS}
        FROM match_conditions
        WHERE tenant_id = $1
          AND event_type = $2
          AND NOT is_satisfied
          AND event_resource_hint IS NULL
          AND event_key = ANY($3)
        ORDER BY id
        "#
    );
    let conditions = sqlx::query_as::<_, MatchCondition>(&sql)
        .bind(tenant_id)
        .bind(event_type.as_str())
        .bind(event_keys)
        .fetch_all(&mut *conn)
        .await?;
    Ok(conditions)
}

/// Conditions of a match, in creation order.
pub async fn list_match_conditions(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    match_id: i64,
) -> Result<Vec<MatchCondition>, CoreError> {
    let sql = format!(
        "SELECT {MATCH_CONDITION_COLUMNS} FROM match_conditions \
         WHERE tenant_id = $1 AND match_id = $2 ORDER BY id"
    );
    let conditions = sqlx::query_as::<_, MatchCondition>(&sql)
        .bind(tenant_id)
        .bind(match_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(conditions)
}

/// Mark conditions satisfied and fire the matches whose or-groups are now
/// all satisfied. Matches are locked in id order, so concurrent callers
/// satisfying different conditions of one match serialise and exactly one
/// of them fires it.
pub async fn satisfy_match_conditions(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    satisfactions: &[ConditionSatisfaction],
) -> Result<Vec<SatisfiedMatch>, CoreError> {
    let mut match_ids: Vec<i64> = satisfactions.iter().map(|s| s.match_id).collect();
    match_ids.sort_unstable();
    match_ids.dedup();
    if match_ids.is_empty() {
        return Ok(Vec::new());
    }

    let open: HashSet<i64> = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT id FROM matches
        WHERE tenant_id = $1 AND id = ANY($2) AND NOT is_satisfied
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(&match_ids)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect();
    if open.is_empty() {
        return Ok(Vec::new());
    }

    let mut ordered: Vec<&ConditionSatisfaction> = satisfactions
        .iter()
        .filter(|s| open.contains(&s.match_id))
        .collect();
    ordered.sort_by_key(|s| (s.match_id, s.condition_id));
    for satisfaction in ordered {
        sqlx::query(
            r#"
            UPDATE match_conditions
            SET is_satisfied = TRUE, data = $4
            WHERE tenant_id = $1 AND match_id = $2 AND id = $3 AND NOT is_satisfied
            "#,
        )
        .bind(tenant_id)
        .bind(satisfaction.match_id)
        .bind(satisfaction.condition_id)
        .bind(&satisfaction.data)
        .execute(&mut *conn)
        .await?;
    }

    let open_ids: Vec<i64> = match_ids.into_iter().filter(|id| open.contains(id)).collect();
    let sql = format!(
        "SELECT {MATCH_CONDITION_COLUMNS} FROM match_conditions \
         WHERE match_id = ANY($1) ORDER BY match_id, id"
    );
    let conditions = sqlx::query_as::<_, MatchCondition>(&sql)
        .bind(&open_ids)
        .fetch_all(&mut *conn)
        .await?;
    let mut by_match: HashMap<i64, Vec<MatchCondition>> = HashMap::new();
    for condition in conditions {
        by_match.entry(condition.match_id).or_default().push(condition);
    }

    let fire_sql = format!(
        r#"
        UPDATE matches m
        SET is_satisfied = TRUE, existing_data = $2
        WHERE m.id = $1
        RETURNING {MATCH_COLUMNS}
        "#
    );
    let mut fired = Vec::new();
    for match_id in open_ids {
        let Some(conditions) = by_match.get(&match_id) else {
            continue;
        };
        if !all_groups_satisfied(conditions) {
            continue;
        }
        let existing: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT existing_data FROM matches WHERE id = $1")
                .bind(match_id)
                .fetch_one(&mut *conn)
                .await?;
        let merged = merge_match_data(existing, conditions);
        let row: MatchColumns = sqlx::query_as(&fire_sql)
            .bind(match_id)
            .bind(&merged)
            .fetch_one(&mut *conn)
            .await?;
        fired.push(SatisfiedMatch {
            matched: Match::try_from(row)?,
            action: winning_action(conditions),
        });
    }
    Ok(fired)
}

/// Load a match by id.
pub async fn get_match(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    match_id: i64,
) -> Result<Option<Match>, CoreError> {
    let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE tenant_id = $1 AND id = $2");
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
    conn: &mut PgConnection,
    events: &[NewEvent],
) -> Result<Vec<Event>, CoreError> {
    validate_new_events(events)?;
    if events.is_empty() {
        return Ok(Vec::new());
    }
    let seen_default = now();
    let ids = reserve_ids(conn, "events", events.len()).await?;
    let rows: Vec<(i64, &NewEvent)> = ids.iter().copied().zip(events).collect();

    let mut by_id = HashMap::with_capacity(events.len());
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO events (id, seen_at, tenant_id, external_id, key, payload, \
             additional_metadata, scope, triggering_webhook_name) ",
        );
        qb.push_values(chunk, |mut b, (id, event)| {
            b.push_bind(*id)
                .push_bind(event.seen_at.unwrap_or(seen_default))
                .push_bind(event.tenant_id)
                .push_bind(event.external_id)
                .push_bind(&event.key)
                .push_bind(&event.payload)
                .push_bind(&event.additional_metadata)
                .push_bind(event.scope.as_deref())
                .push_bind(event.triggering_webhook_name.as_deref());
        });
        qb.push(
            " RETURNING id, seen_at, tenant_id, external_id, key, payload, additional_metadata, \
             scope, triggering_webhook_name",
        );
        let inserted: Vec<Event> = qb.build_query_as().fetch_all(&mut *conn).await?;
        by_id.extend(inserted.into_iter().map(|e| (e.id, e)));
    }

    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

// ============================================================================
// Maintenance
// ============================================================================

/// Delete up to `limit` tasks inserted before `cutoff` with everything keyed
/// by them, then old events, old matches (fired or still waiting) and
/// orphaned DAGs.
pub async fn purge_before(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64, CoreError> {
    let doomed = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
        r#"
        SELECT id, inserted_at FROM tasks
        WHERE inserted_at < $1
        ORDER BY inserted_at, id
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut deleted = 0u64;
    if !doomed.is_empty() {
        let (ids, inserted_ats): (Vec<i64>, Vec<DateTime<Utc>>) = doomed.into_iter().unzip();
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
            let sql = format!(
                "DELETE FROM {table} WHERE (task_id, task_inserted_at) IN \
                 (SELECT * FROM UNNEST($1::BIGINT[], $2::TIMESTAMPTZ[]))"
            );
            deleted += sqlx::query(&sql)
                .bind(&ids)
                .bind(&inserted_ats)
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
        deleted += sqlx::query(
            "DELETE FROM tasks WHERE (id, inserted_at) IN \
             (SELECT * FROM UNNEST($1::BIGINT[], $2::TIMESTAMPTZ[]))",
        )
        .bind(&ids)
        .bind(&inserted_ats)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }

    deleted += sqlx::query(
        r#"
        DELETE FROM workflow_concurrency_slots w
        WHERE NOT EXISTS (
            SELECT 1 FROM concurrency_slots c
            WHERE c.parent_strategy_id = w.strategy_id
              AND c.workflow_version_id = w.workflow_version_id
              AND c.workflow_run_id = w.workflow_run_id
        )
        "#,
    )
    .execute(&mut *conn)
    .await?
    .rows_affected();

    deleted += sqlx::query(
        r#"
        DELETE FROM events WHERE (id, seen_at) IN (
            SELECT id, seen_at FROM events WHERE seen_at < $1 ORDER BY seen_at LIMIT $2
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
            WHERE created_at < $1
            ORDER BY id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
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
        DELETE FROM dags WHERE (id, inserted_at) IN (
            SELECT d.id, d.inserted_at FROM dags d
            WHERE d.inserted_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM tasks t
                  WHERE t.dag_id = d.id AND t.dag_inserted_at = d.inserted_at
              )
            ORDER BY d.inserted_at
            LIMIT $2
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

/// Check the database is reachable.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, CoreError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(true)
}

// ============================================================================
// Persistence Trait Implementation
// ============================================================================

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn begin(&self) -> Result<Box<dyn PersistenceTx>, CoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx { tx }))
    }

    async fn create_dags(&self, tenant_id: Uuid, dags: &[NewDag]) -> Result<Vec<Dag>, CoreError> {
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
        let mut tx = self.pool.begin().await?;
        let created = bulk_create_events(&mut tx, events)
            .await
            .map_err(|e| e.during("bulk_create_events"))?;
        tx.commit().await?;
        Ok(created)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = purge_before(&mut tx, cutoff, limit)
            .await
            .map_err(|e| e.during("purge_before"))?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        health_check_db(&self.pool).await
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Open transaction on a pooled connection. Row locks taken through it are
/// held until commit or drop.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PersistenceTx for PostgresTx {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{StepConfig, StickyStrategy, TaskEventType};
    use serde_json::json;

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        crate::migrations::POSTGRES.run(&pool).await.ok()?;
        Some(pool)
    }

    fn step(queue: &str) -> StepConfig {
        StepConfig {
            queue: queue.to_string(),
            action_id: "demo:step".to_string(),
            step_id: Uuid::new_v4(),
            step_readable_id: "step".to_string(),
            step_index: 0,
            workflow_id: Uuid::new_v4(),
            workflow_version_id: Uuid::new_v4(),
            display_name: "step".to_string(),
            schedule_timeout_secs: 300,
            step_timeout_secs: Some(60),
            sticky: StickyStrategy::None,
            retry_backoff_factor: None,
            retry_max_backoff_secs: None,
            concurrency: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);
        let tenant = Uuid::new_v4();
        let run = Uuid::new_v4();

        let created = persistence
            .create_tasks(tenant, &[NewTask::queued(run, step("pg-unit"), json!({"n": 1}))])
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        let task = &created[0];

        let loaded = persistence
            .get_task(tenant, task.id, task.inserted_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&loaded, task);

        let by_external = persistence
            .get_task_by_external_id(tenant, task.external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_external.id, task.id);

        let areas = persistence.holding_areas(tenant, task.attempt()).await.unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue]);
    }

    #[tokio::test]
    async fn test_keyed_task_events_are_deduplicated() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);
        let tenant = Uuid::new_v4();
        let task = persistence
            .create_tasks(
                tenant,
                &[NewTask::queued(Uuid::new_v4(), step("pg-unit"), json!({}))],
            )
            .await
            .unwrap()
            .remove(0);

        let event = NewTaskEvent {
            task_id: task.id,
            task_inserted_at: task.inserted_at,
            retry_count: 0,
            event_type: TaskEventType::Completed,
            event_key: Some("0".to_string()),
            data: Some(json!({"ok": true})),
            external_id: Some(task.external_id),
        };
        let written = persistence
            .insert_task_events(tenant, &[event.clone(), event.clone()])
            .await
            .unwrap();
        assert_eq!(written, 1);
        let written = persistence.insert_task_events(tenant, &[event]).await.unwrap();
        assert_eq!(written, 0);

        let events = persistence
            .list_task_events(tenant, task.id, task.inserted_at)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
