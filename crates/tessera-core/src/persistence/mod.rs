// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for tessera-core.
//!
//! This module defines the record types shared by every backend, the
//! [`Persistence`] trait used by the coordinator, and two implementations:
//! PostgreSQL (production, row-level locks) and SQLite (embedded and tests,
//! a single writer lock per database).

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

/// Maximum rows per bulk `INSERT` statement; larger batches are chunked
/// inside the same transaction.
pub(crate) const INSERT_CHUNK_SIZE: usize = 500;

/// Runtime timeout applied when a step declares none.
pub const DEFAULT_STEP_TIMEOUT_SECS: i32 = 300;

/// Current time at the storage precision shared by both backends.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Columns selected for every [`Task`] read, shared by both backends.
pub(crate) const TASK_COLUMNS: &str = "id, inserted_at, tenant_id, external_id, queue, action_id, \
     step_id, step_readable_id, step_index, workflow_id, workflow_version_id, workflow_run_id, \
     schedule_timeout_secs, step_timeout_secs, priority, sticky, desired_worker_id, display_name, \
     input, retry_count, internal_retry_count, app_retry_count, retry_backoff_factor, \
     retry_max_backoff_secs, additional_metadata, initial_state, initial_state_reason, dag_id, \
     dag_inserted_at, parent_task_external_id, parent_task_id, parent_task_inserted_at, \
     child_index, child_key, concurrency_parent_strategy_ids, concurrency_strategy_ids, \
     concurrency_keys";

/// Columns selected for every [`Match`] read.
pub(crate) const MATCH_COLUMNS: &str = "id, tenant_id, kind, is_satisfied, existing_data, \
     created_at, signal_task_id, signal_task_inserted_at, signal_external_id, signal_key, \
     trigger_dag_id, trigger_dag_inserted_at, trigger_step_id, trigger_external_id, \
     trigger_workflow_run_id, trigger_parent_task_external_id, trigger_parent_task_id, \
     trigger_parent_task_inserted_at, trigger_child_index, trigger_child_key, trigger_priority, \
     trigger_step_config";

/// Columns selected for every [`MatchCondition`] read.
pub(crate) const MATCH_CONDITION_COLUMNS: &str = "id, match_id, tenant_id, event_type, event_key, \
     event_resource_hint, readable_data_key, expression, or_group_id, action, is_satisfied, data";

// ============================================================================
// Enumerations
// ============================================================================

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Returns the stored string representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parse the stored string representation.
            pub fn parse(s: &str) -> Result<Self, CoreError> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CoreError::DatabaseError {
                        operation: "decode".to_string(),
                        details: format!("unknown {} '{}'", $label, other),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum! {
    /// State a task is created in.
    InitialState, "initial state" {
        /// Enqueued for dispatch (directly or through concurrency slots).
        Queued => "QUEUED",
        /// Created already cancelled; never dispatched.
        Cancelled => "CANCELLED",
        /// Created already failed; never dispatched.
        Failed => "FAILED",
        /// Created skipped; never dispatched.
        Skipped => "SKIPPED",
    }
}

text_enum! {
    /// Worker affinity strategy.
    StickyStrategy, "sticky strategy" {
        /// No affinity.
        None => "NONE",
        /// Prefer the desired worker.
        Soft => "SOFT",
        /// Only the desired worker may run the task.
        Hard => "HARD",
    }
}

text_enum! {
    /// Type of an append-only task event.
    TaskEventType, "task event type" {
        /// Attempt entered the queue.
        Queued => "QUEUED",
        /// Attempt handed to a worker.
        Assigned => "ASSIGNED",
        /// Attempt finished successfully.
        Completed => "COMPLETED",
        /// Attempt failed permanently.
        Failed => "FAILED",
        /// Attempt was cancelled.
        Cancelled => "CANCELLED",
        /// Attempt exceeded its step timeout.
        TimedOut => "TIMED_OUT",
        /// Task was created skipped.
        Skipped => "SKIPPED",
        /// Attempt failed and a retry was scheduled.
        RetryScheduled => "RETRY_SCHEDULED",
        /// Attempt was moved to the rate-limited holding area.
        RateLimited => "RATE_LIMITED",
        /// Task was replayed under a new attempt.
        Replayed => "REPLAYED",
        /// A signal the task waited on has arrived.
        SignalCompleted => "SIGNAL_COMPLETED",
    }
}

text_enum! {
    /// Kind of a cached expression evaluation.
    ExpressionEvalKind, "expression eval kind" {
        /// Evaluated concurrency key.
        ConcurrencyKey => "CONCURRENCY_KEY",
        /// Evaluated priority.
        Priority => "PRIORITY",
        /// Evaluated desired worker id.
        DesiredWorkerId => "DESIRED_WORKER_ID",
    }
}

text_enum! {
    /// Discriminant of a [`Match`].
    MatchKind, "match kind" {
        /// Creates a DAG task once satisfied.
        Trigger => "TRIGGER",
        /// Releases a signal to a waiting task once satisfied.
        Signal => "SIGNAL",
    }
}

text_enum! {
    /// Origin of the event a condition waits for.
    ConditionEventType, "condition event type" {
        /// Emitted by the engine itself (task completed, failed, ...).
        Internal => "INTERNAL",
        /// Ingested from outside through bulk event ingestion.
        User => "USER",
    }
}

text_enum! {
    /// What a satisfied condition does to the task its match creates.
    ConditionAction, "condition action" {
        /// Create the task queued.
        Create => "CREATE",
        /// Create the task skipped.
        Skip => "SKIP",
        /// Create the task cancelled.
        Cancel => "CANCEL",
    }
}

impl ConditionAction {
    /// Severity used to pick the winning action of a fired match.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Create => 0,
            Self::Skip => 1,
            Self::Cancel => 2,
        }
    }

    /// Initial state of a task created by a match fired with this action.
    pub fn initial_state(&self) -> InitialState {
        match self {
            Self::Create => InitialState::Queued,
            Self::Skip => InitialState::Skipped,
            Self::Cancel => InitialState::Cancelled,
        }
    }
}

/// Holding area a task attempt can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldingArea {
    /// `queue_items`: ready for dispatch.
    Queue,
    /// `retry_queue_items`: waiting for its retry backoff.
    Retry,
    /// `rate_limited_queue_items`: waiting for rate-limit capacity.
    RateLimited,
}

// ============================================================================
// Identifiers
// ============================================================================

/// One attempt of a task: `(task_id, inserted_at, retry_count)`.
///
/// The derived ordering is the canonical lock order used by every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskAttempt {
    /// Task primary key.
    pub task_id: i64,
    /// Task partition key.
    pub inserted_at: DateTime<Utc>,
    /// Attempt number.
    pub retry_count: i32,
}

impl TaskAttempt {
    /// Create an attempt identifier.
    pub fn new(task_id: i64, inserted_at: DateTime<Utc>, retry_count: i32) -> Self {
        Self {
            task_id,
            inserted_at,
            retry_count,
        }
    }
}

/// Sort and deduplicate attempts into canonical lock order.
pub(crate) fn canonical_attempts(attempts: &[TaskAttempt]) -> Vec<TaskAttempt> {
    let mut sorted = attempts.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// Reference to a DAG row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagRef {
    /// DAG primary key.
    pub dag_id: i64,
    /// DAG partition key.
    pub dag_inserted_at: DateTime<Utc>,
}

/// Reference to the task that spawned another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentTaskRef {
    /// Parent task primary key.
    pub task_id: i64,
    /// Parent task partition key.
    pub inserted_at: DateTime<Utc>,
    /// Parent task logical id.
    pub external_id: Uuid,
}

// ============================================================================
// Tasks
// ============================================================================

/// One concurrency dimension a task participates in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyDimension {
    /// Workflow-level strategy this step strategy is nested under.
    pub parent_strategy_id: Option<i64>,
    /// Step-level strategy.
    pub strategy_id: i64,
    /// Evaluated concurrency key.
    pub key: String,
}

/// Everything needed to materialise a workflow step as a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Queue the task is dispatched from.
    pub queue: String,
    /// Action workers register for.
    pub action_id: String,
    /// Step definition id.
    pub step_id: Uuid,
    /// Human-readable step id, also the key of its output in dependants' input.
    pub step_readable_id: String,
    /// Position of the step in its workflow.
    pub step_index: i64,
    /// Workflow definition id.
    pub workflow_id: Uuid,
    /// Workflow version id.
    pub workflow_version_id: Uuid,
    /// Display name of created tasks.
    pub display_name: String,
    /// Seconds a queued attempt may wait before it is considered stale.
    pub schedule_timeout_secs: i32,
    /// Seconds an assigned attempt may run.
    pub step_timeout_secs: Option<i32>,
    /// Worker affinity.
    pub sticky: StickyStrategy,
    /// Exponential backoff factor for retries.
    pub retry_backoff_factor: Option<f64>,
    /// Upper bound on the retry backoff.
    pub retry_max_backoff_secs: Option<i32>,
    /// Concurrency dimensions, index-aligned.
    #[serde(default)]
    pub concurrency: Vec<ConcurrencyDimension>,
}

/// Input for bulk task creation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Logical id, stable across retries and replays.
    pub external_id: Uuid,
    /// Workflow run the task belongs to.
    pub workflow_run_id: Uuid,
    /// Step configuration.
    pub step: StepConfig,
    /// Dispatch priority (higher first).
    pub priority: i32,
    /// Worker the task should run on.
    pub desired_worker_id: Option<Uuid>,
    /// Opaque input payload.
    pub input: Value,
    /// Caller-defined metadata.
    pub additional_metadata: Option<Value>,
    /// State the task is created in.
    pub initial_state: InitialState,
    /// Why the task was created in a non-queued state.
    pub initial_state_reason: Option<String>,
    /// DAG the task is a node of.
    pub dag: Option<DagRef>,
    /// Task that spawned this one.
    pub parent: Option<ParentTaskRef>,
    /// Position among the parent's children.
    pub child_index: Option<i64>,
    /// Caller-defined child key.
    pub child_key: Option<String>,
}

impl NewTask {
    /// Create a queued task with defaults for every optional field.
    pub fn queued(workflow_run_id: Uuid, step: StepConfig, input: Value) -> Self {
        Self {
            external_id: Uuid::new_v4(),
            workflow_run_id,
            step,
            priority: 1,
            desired_worker_id: None,
            input,
            additional_metadata: None,
            initial_state: InitialState::Queued,
            initial_state_reason: None,
            dag: None,
            parent: None,
            child_index: None,
            child_key: None,
        }
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Primary key.
    pub id: i64,
    /// Partition key.
    pub inserted_at: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Logical id.
    pub external_id: Uuid,
    /// Workflow run the task belongs to.
    pub workflow_run_id: Uuid,
    /// Step configuration the task was created from.
    pub step: StepConfig,
    /// Dispatch priority.
    pub priority: i32,
    /// Worker affinity target.
    pub desired_worker_id: Option<Uuid>,
    /// Opaque input payload.
    pub input: Value,
    /// Current attempt.
    pub retry_count: i32,
    /// Retries caused by engine-side failures in the current attempt lineage.
    pub internal_retry_count: i32,
    /// Retries caused by application failures in the current attempt lineage.
    pub app_retry_count: i32,
    /// Caller-defined metadata.
    pub additional_metadata: Option<Value>,
    /// State the current attempt was created in.
    pub initial_state: InitialState,
    /// Reason for a non-queued initial state.
    pub initial_state_reason: Option<String>,
    /// DAG linkage.
    pub dag: Option<DagRef>,
    /// Parent task linkage.
    pub parent: Option<ParentTaskRef>,
    /// Position among the parent's children.
    pub child_index: Option<i64>,
    /// Caller-defined child key.
    pub child_key: Option<String>,
}

impl Task {
    /// Identifier of the current attempt.
    pub fn attempt(&self) -> TaskAttempt {
        TaskAttempt::new(self.id, self.inserted_at, self.retry_count)
    }

    /// Step strategy ids, index-aligned with the concurrency keys.
    pub fn concurrency_strategy_ids(&self) -> Vec<i64> {
        self.step.concurrency.iter().map(|d| d.strategy_id).collect()
    }
}

/// Column set shared by both backends' task rows; the concurrency arrays are
/// decoded per backend.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskColumns {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub tenant_id: Uuid,
    pub external_id: Uuid,
    pub queue: String,
    pub action_id: String,
    pub step_id: Uuid,
    pub step_readable_id: String,
    pub step_index: i64,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub workflow_run_id: Uuid,
    pub schedule_timeout_secs: i32,
    pub step_timeout_secs: Option<i32>,
    pub priority: i32,
    #[sqlx(try_from = "String")]
    pub sticky: StickyStrategy,
    pub desired_worker_id: Option<Uuid>,
    pub display_name: String,
    pub input: Value,
    pub retry_count: i32,
    pub internal_retry_count: i32,
    pub app_retry_count: i32,
    pub retry_backoff_factor: Option<f64>,
    pub retry_max_backoff_secs: Option<i32>,
    pub additional_metadata: Option<Value>,
    #[sqlx(try_from = "String")]
    pub initial_state: InitialState,
    pub initial_state_reason: Option<String>,
    pub dag_id: Option<i64>,
    pub dag_inserted_at: Option<DateTime<Utc>>,
    pub parent_task_external_id: Option<Uuid>,
    pub parent_task_id: Option<i64>,
    pub parent_task_inserted_at: Option<DateTime<Utc>>,
    pub child_index: Option<i64>,
    pub child_key: Option<String>,
}

impl TaskColumns {
    /// Assemble a [`Task`], zipping the three concurrency arrays.
    ///
    /// Fails if the arrays are not the same length.
    pub(crate) fn into_task(
        self,
        parent_strategy_ids: Vec<Option<i64>>,
        strategy_ids: Vec<i64>,
        keys: Vec<String>,
    ) -> Result<Task, CoreError> {
        if parent_strategy_ids.len() != strategy_ids.len() || strategy_ids.len() != keys.len() {
            return Err(CoreError::DatabaseError {
                operation: "decode".to_string(),
                details: format!(
                    "task {} has misaligned concurrency arrays ({}, {}, {})",
                    self.id,
                    parent_strategy_ids.len(),
                    strategy_ids.len(),
                    keys.len()
                ),
            });
        }

        let concurrency = parent_strategy_ids
            .into_iter()
            .zip(strategy_ids)
            .zip(keys)
            .map(|((parent_strategy_id, strategy_id), key)| ConcurrencyDimension {
                parent_strategy_id,
                strategy_id,
                key,
            })
            .collect();

        let dag = match (self.dag_id, self.dag_inserted_at) {
            (Some(dag_id), Some(dag_inserted_at)) => Some(DagRef {
                dag_id,
                dag_inserted_at,
            }),
            _ => None,
        };

        let parent = match (
            self.parent_task_id,
            self.parent_task_inserted_at,
            self.parent_task_external_id,
        ) {
            (Some(task_id), Some(inserted_at), Some(external_id)) => Some(ParentTaskRef {
                task_id,
                inserted_at,
                external_id,
            }),
            _ => None,
        };

        Ok(Task {
            id: self.id,
            inserted_at: self.inserted_at,
            tenant_id: self.tenant_id,
            external_id: self.external_id,
            workflow_run_id: self.workflow_run_id,
            step: StepConfig {
                queue: self.queue,
                action_id: self.action_id,
                step_id: self.step_id,
                step_readable_id: self.step_readable_id,
                step_index: self.step_index,
                workflow_id: self.workflow_id,
                workflow_version_id: self.workflow_version_id,
                display_name: self.display_name,
                schedule_timeout_secs: self.schedule_timeout_secs,
                step_timeout_secs: self.step_timeout_secs,
                sticky: self.sticky,
                retry_backoff_factor: self.retry_backoff_factor,
                retry_max_backoff_secs: self.retry_max_backoff_secs,
                concurrency,
            },
            priority: self.priority,
            desired_worker_id: self.desired_worker_id,
            input: self.input,
            retry_count: self.retry_count,
            internal_retry_count: self.internal_retry_count,
            app_retry_count: self.app_retry_count,
            additional_metadata: self.additional_metadata,
            initial_state: self.initial_state,
            initial_state_reason: self.initial_state_reason,
            dag,
            parent,
            child_index: self.child_index,
            child_key: self.child_key,
        })
    }
}

/// Input for replaying a task under a new attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReplay {
    /// Task primary key.
    pub task_id: i64,
    /// Task partition key.
    pub inserted_at: DateTime<Utc>,
    /// Replacement input; the existing input is kept when `None`.
    pub input: Option<Value>,
    /// State of the new attempt.
    pub initial_state: InitialState,
    /// Reason for the new state.
    pub initial_state_reason: Option<String>,
    /// New concurrency keys, index-aligned with the task's strategies.
    pub concurrency_keys: Vec<String>,
}

/// Result of replaying tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayedTasks {
    /// Tasks under their new attempt, in input order.
    pub tasks: Vec<Task>,
    /// Release summaries of the superseded attempts, in input order. Workers
    /// still running one of them should be told to stop.
    pub superseded: Vec<ReleasedTask>,
}

/// DAG creation input.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDag {
    /// Logical id of the run.
    pub external_id: Uuid,
    /// Display name.
    pub display_name: String,
    /// Workflow definition id.
    pub workflow_id: Uuid,
    /// Workflow version id.
    pub workflow_version_id: Uuid,
    /// Task that spawned this run, if any.
    pub parent_task_external_id: Option<Uuid>,
}

/// A persisted DAG.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Dag {
    /// Primary key.
    pub id: i64,
    /// Partition key.
    pub inserted_at: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Logical id of the run.
    pub external_id: Uuid,
    /// Display name.
    pub display_name: String,
    /// Workflow definition id.
    pub workflow_id: Uuid,
    /// Workflow version id.
    pub workflow_version_id: Uuid,
    /// Task that spawned this run.
    pub parent_task_external_id: Option<Uuid>,
}

impl Dag {
    /// Reference used by tasks and triggers.
    pub fn as_ref(&self) -> DagRef {
        DagRef {
            dag_id: self.id,
            dag_inserted_at: self.inserted_at,
        }
    }
}

/// Input for an append-only task event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskEvent {
    /// Task primary key.
    pub task_id: i64,
    /// Task partition key.
    pub task_inserted_at: DateTime<Utc>,
    /// Attempt the event belongs to.
    pub retry_count: i32,
    /// Event type.
    pub event_type: TaskEventType,
    /// Deduplication key; keyed events are stored at most once per task and type.
    pub event_key: Option<String>,
    /// Payload.
    pub data: Option<Value>,
    /// Logical id of the task.
    pub external_id: Option<Uuid>,
}

/// A persisted task event.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskEvent {
    /// Primary key.
    pub id: i64,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Task primary key.
    pub task_id: i64,
    /// Task partition key.
    pub task_inserted_at: DateTime<Utc>,
    /// Attempt the event belongs to.
    pub retry_count: i32,
    /// Event type.
    #[sqlx(try_from = "String")]
    pub event_type: TaskEventType,
    /// Deduplication key.
    pub event_key: Option<String>,
    /// Payload.
    pub data: Option<Value>,
    /// Logical id of the task.
    pub external_id: Option<Uuid>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// Cached expression evaluation for a task.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ExpressionEval {
    /// Task primary key.
    pub task_id: i64,
    /// Task partition key.
    pub task_inserted_at: DateTime<Utc>,
    /// What the expression computes.
    #[sqlx(try_from = "String")]
    pub kind: ExpressionEvalKind,
    /// Expression identifier within its kind.
    pub key: String,
    /// String result.
    pub value_str: Option<String>,
    /// Integer result.
    pub value_int: Option<i64>,
}

// ============================================================================
// Holding areas, runtimes, release
// ============================================================================

/// An attempt handed to a worker by [`Persistence::assign_queued_tasks`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedTask {
    /// The assigned attempt.
    pub attempt: TaskAttempt,
    /// Logical task id.
    pub external_id: Uuid,
    /// Action the worker must run.
    pub action_id: String,
    /// Worker the attempt was assigned to.
    pub worker_id: Uuid,
    /// When the attempt times out.
    pub timeout_at: DateTime<Utc>,
}

/// Request to move a queued attempt to the rate-limited holding area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitedRequeue {
    /// The queued attempt.
    pub attempt: TaskAttempt,
    /// Earliest time the attempt may be queued again.
    pub requeue_after: DateTime<Utc>,
}

/// Request to retry a failed attempt later.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySchedule {
    /// The failed attempt.
    pub attempt: TaskAttempt,
    /// Earliest time the new attempt may be queued.
    pub retry_after: DateTime<Utc>,
    /// Application failure (bumps `app_retry_count`) versus engine failure
    /// (bumps `internal_retry_count`).
    pub is_app_retry: bool,
}

/// Result of releasing one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedTask {
    /// The released attempt.
    pub attempt: TaskAttempt,
    /// Queue of the task.
    pub queue: String,
    /// Logical task id.
    pub external_id: Uuid,
    /// Readable step id.
    pub step_readable_id: String,
    /// Workflow run of the task.
    pub workflow_run_id: Uuid,
    /// Worker the attempt was assigned to, if any.
    pub worker_id: Option<Uuid>,
    /// Whether the attempt is the task's current attempt.
    pub is_current_retry: bool,
    /// Step strategies whose capacity may have been freed.
    pub concurrency_strategy_ids: Vec<i64>,
}

/// Row shape of the release summary query, shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ReleasedTaskColumns {
    pub task_id: i64,
    pub task_inserted_at: DateTime<Utc>,
    pub retry_count: i32,
    pub current_retry_count: i32,
    pub queue: String,
    pub external_id: Uuid,
    pub step_readable_id: String,
    pub workflow_run_id: Uuid,
}

/// Expired runtime found by [`Persistence::list_expired_runtimes`].
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct ExpiredRuntime {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Task primary key.
    pub task_id: i64,
    /// Task partition key.
    pub task_inserted_at: DateTime<Utc>,
    /// Attempt.
    pub retry_count: i32,
    /// Worker running the attempt.
    pub worker_id: Uuid,
}

impl ExpiredRuntime {
    /// Identifier of the expired attempt.
    pub fn attempt(&self) -> TaskAttempt {
        TaskAttempt::new(self.task_id, self.task_inserted_at, self.retry_count)
    }
}

/// Attempt moved back into the queue by a promotion sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotedAttempt {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// The attempt.
    pub attempt: TaskAttempt,
}

// ============================================================================
// Concurrency slots
// ============================================================================

/// Per-attempt concurrency reservation for one dimension.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ConcurrencySlot {
    /// Fill order within a key.
    pub sort_id: i64,
    /// Task primary key.
    pub task_id: i64,
    /// Task partition key.
    pub task_inserted_at: DateTime<Utc>,
    /// Attempt.
    pub task_retry_count: i32,
    /// Logical task id.
    pub external_id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Workflow id.
    pub workflow_id: Uuid,
    /// Workflow version id.
    pub workflow_version_id: Uuid,
    /// Workflow run id.
    pub workflow_run_id: Uuid,
    /// Step strategy.
    pub strategy_id: i64,
    /// Workflow strategy, if nested.
    pub parent_strategy_id: Option<i64>,
    /// Fill priority.
    pub priority: i32,
    /// Concurrency key.
    pub key: String,
    /// Whether the reservation holds capacity.
    pub is_filled: bool,
    /// When the waiting attempt becomes stale.
    pub schedule_timeout_at: DateTime<Utc>,
}

/// Per-run aggregate reservation for a workflow strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConcurrencySlot {
    /// Fill order within a key.
    pub sort_id: i64,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Workflow id.
    pub workflow_id: Uuid,
    /// Workflow version id.
    pub workflow_version_id: Uuid,
    /// Workflow run id.
    pub workflow_run_id: Uuid,
    /// Workflow strategy.
    pub strategy_id: i64,
    /// Step strategies registered under this aggregate.
    pub child_strategy_ids: Vec<i64>,
    /// Fill priority.
    pub priority: i32,
    /// Concurrency key.
    pub key: String,
    /// Whether the aggregate holds capacity.
    pub is_filled: bool,
}

/// Column set of a workflow slot row without its arrays.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkflowSlotColumns {
    pub sort_id: i64,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub workflow_run_id: Uuid,
    pub strategy_id: i64,
    pub priority: i32,
    pub key: String,
    pub is_filled: bool,
}

impl WorkflowSlotColumns {
    pub(crate) fn into_slot(self, child_strategy_ids: Vec<i64>) -> WorkflowConcurrencySlot {
        WorkflowConcurrencySlot {
            sort_id: self.sort_id,
            tenant_id: self.tenant_id,
            workflow_id: self.workflow_id,
            workflow_version_id: self.workflow_version_id,
            workflow_run_id: self.workflow_run_id,
            strategy_id: self.strategy_id,
            child_strategy_ids,
            priority: self.priority,
            key: self.key,
            is_filled: self.is_filled,
        }
    }
}

/// Workflow aggregate to upsert when attempts enter the concurrency path.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AggregateRequest {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub workflow_run_id: Uuid,
    pub strategy_id: i64,
    pub child_strategy_ids: Vec<i64>,
    pub priority: i32,
    pub key: String,
}

/// Group the nested dimensions of `tasks` into one request per aggregate,
/// in canonical `(strategy_id, workflow_version_id, workflow_run_id)` order.
pub(crate) fn aggregate_requests<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
) -> Vec<AggregateRequest> {
    let mut requests: BTreeMap<(i64, Uuid, Uuid), AggregateRequest> = BTreeMap::new();
    for task in tasks {
        for dim in &task.step.concurrency {
            let Some(parent) = dim.parent_strategy_id else {
                continue;
            };
            let entry = requests
                .entry((parent, task.step.workflow_version_id, task.workflow_run_id))
                .or_insert_with(|| AggregateRequest {
                    tenant_id: task.tenant_id,
                    workflow_id: task.step.workflow_id,
                    workflow_version_id: task.step.workflow_version_id,
                    workflow_run_id: task.workflow_run_id,
                    strategy_id: parent,
                    child_strategy_ids: Vec::new(),
                    priority: task.priority,
                    key: dim.key.clone(),
                });
            if !entry.child_strategy_ids.contains(&dim.strategy_id) {
                entry.child_strategy_ids.push(dim.strategy_id);
                entry.child_strategy_ids.sort_unstable();
            }
            entry.priority = entry.priority.max(task.priority);
        }
    }
    requests.into_values().collect()
}

/// When a queued attempt of `task` becomes stale.
pub(crate) fn schedule_timeout_at(task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::seconds(i64::from(task.step.schedule_timeout_secs))
}

/// When an attempt assigned at `now` times out.
pub(crate) fn runtime_timeout_at(step_timeout_secs: Option<i32>, now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = step_timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
    now + chrono::Duration::seconds(i64::from(secs))
}

/// Workflow aggregate row considered by a fill pass.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AggregateCandidate {
    pub workflow_version_id: Uuid,
    pub workflow_run_id: Uuid,
    pub priority: i32,
    pub key: String,
    pub is_filled: bool,
    pub sort_id: i64,
}

/// Per-task slot row considered by a fill pass.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SlotCandidate {
    pub task_id: i64,
    pub task_inserted_at: DateTime<Utc>,
    pub task_retry_count: i32,
    pub parent_strategy_id: Option<i64>,
    pub workflow_version_id: Uuid,
    pub workflow_run_id: Uuid,
    pub priority: i32,
    pub key: String,
    pub is_filled: bool,
    pub sort_id: i64,
}

impl SlotCandidate {
    pub(crate) fn attempt(&self) -> TaskAttempt {
        TaskAttempt::new(self.task_id, self.task_inserted_at, self.task_retry_count)
    }
}

/// Aggregates to fill, in fill order (`priority DESC, sort_id ASC`).
pub(crate) fn plan_aggregate_fill(
    mut candidates: Vec<AggregateCandidate>,
    max_runs: i64,
) -> Vec<AggregateCandidate> {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sort_id.cmp(&b.sort_id)));
    let picked = select_slots_to_fill(
        candidates.iter().map(|c| (c.is_filled, c.key.as_str(), true)),
        max_runs,
    );
    picked.into_iter().map(|i| candidates[i].clone()).collect()
}

/// Per-task slots to fill, in fill order. A slot nested under a workflow
/// strategy is only eligible while its aggregate is filled.
pub(crate) fn plan_slot_fill(
    mut candidates: Vec<SlotCandidate>,
    filled_aggregates: &HashSet<(i64, Uuid, Uuid)>,
    max_runs: i64,
) -> Vec<SlotCandidate> {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sort_id.cmp(&b.sort_id)));
    let picked = select_slots_to_fill(
        candidates.iter().map(|c| {
            let eligible = match c.parent_strategy_id {
                Some(parent) => filled_aggregates.contains(&(
                    parent,
                    c.workflow_version_id,
                    c.workflow_run_id,
                )),
                None => true,
            };
            (c.is_filled, c.key.as_str(), eligible)
        }),
        max_runs,
    );
    picked.into_iter().map(|i| candidates[i].clone()).collect()
}

/// Queue item removed by a dequeue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct DequeuedItem {
    pub id: i64,
    pub task_id: i64,
    pub task_inserted_at: DateTime<Utc>,
    pub retry_count: i32,
    pub external_id: Uuid,
    pub action_id: String,
    pub step_timeout_secs: Option<i32>,
    pub priority: i32,
}

impl DequeuedItem {
    pub(crate) fn into_assigned(self, worker_id: Uuid, now: DateTime<Utc>) -> AssignedTask {
        AssignedTask {
            attempt: TaskAttempt::new(self.task_id, self.task_inserted_at, self.retry_count),
            external_id: self.external_id,
            action_id: self.action_id,
            worker_id,
            timeout_at: runtime_timeout_at(self.step_timeout_secs, now),
        }
    }
}

/// Pick the slots to fill: per key, admit unfilled candidates in the given
/// order until `max_runs` slots of that key are filled.
///
/// `slots` is `(is_filled, key, eligible)` in fill order; returns indexes.
pub(crate) fn select_slots_to_fill<'a>(
    slots: impl IntoIterator<Item = (bool, &'a str, bool)>,
    max_runs: i64,
) -> Vec<usize> {
    let slots: Vec<_> = slots.into_iter().collect();
    let mut filled: std::collections::HashMap<&str, i64> = std::collections::HashMap::new();
    for (is_filled, key, _) in &slots {
        if *is_filled {
            *filled.entry(key).or_default() += 1;
        }
    }

    let mut picked = Vec::new();
    for (index, (is_filled, key, eligible)) in slots.iter().enumerate() {
        if *is_filled || !*eligible {
            continue;
        }
        let count = filled.entry(key).or_default();
        if *count < max_runs {
            *count += 1;
            picked.push(index);
        }
    }
    picked
}

// ============================================================================
// Matches
// ============================================================================

/// DAG node waiting to be created once its dependencies resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct DagTrigger {
    /// DAG the created task belongs to.
    pub dag: DagRef,
    /// Step to materialise.
    pub step: StepConfig,
    /// Logical id the created task will carry.
    pub external_id: Uuid,
    /// Workflow run of the DAG.
    pub workflow_run_id: Uuid,
    /// Parent linkage of the created task.
    pub parent: Option<ParentTaskRef>,
    /// Child index of the created task.
    pub child_index: Option<i64>,
    /// Child key of the created task.
    pub child_key: Option<String>,
    /// Priority override of the created task.
    pub priority: Option<i32>,
}

/// Task waiting on an external signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalTarget {
    /// Waiting task primary key.
    pub task_id: i64,
    /// Waiting task partition key.
    pub task_inserted_at: DateTime<Utc>,
    /// Waiting task logical id.
    pub external_id: Uuid,
    /// Key of the signal; also the dedup key of the resulting task event.
    pub signal_key: String,
}

/// What a match does when it fires.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchTarget {
    /// Create a DAG task.
    DagTrigger(Box<DagTrigger>),
    /// Release a signal to a waiting task.
    Signal(SignalTarget),
}

impl MatchTarget {
    /// Discriminant stored in the `kind` column.
    pub fn kind(&self) -> MatchKind {
        match self {
            Self::DagTrigger(_) => MatchKind::Trigger,
            Self::Signal(_) => MatchKind::Signal,
        }
    }
}

/// Input for one match condition.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatchCondition {
    /// Event origin.
    pub event_type: ConditionEventType,
    /// Event key.
    pub event_key: String,
    /// Optional resource the event must be scoped to.
    pub event_resource_hint: Option<String>,
    /// Key the event payload is stored under in the match data.
    pub readable_data_key: String,
    /// Optional filter expression over the event payload.
    pub expression: Option<String>,
    /// Conditions sharing a group are alternatives.
    pub or_group_id: Uuid,
    /// Effect on the created task.
    pub action: ConditionAction,
}

/// Input for one match and its conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatch {
    /// What the match does when it fires.
    pub target: MatchTarget,
    /// Payload carried into the fired match's data.
    pub existing_data: Option<Value>,
    /// Conditions; at least one.
    pub conditions: Vec<NewMatchCondition>,
}

/// A persisted match.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Primary key.
    pub id: i64,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Whether the match has fired.
    pub is_satisfied: bool,
    /// Carried payload, merged with condition data when fired.
    pub existing_data: Option<Value>,
    /// What the match does when it fires.
    pub target: MatchTarget,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Raw match row shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MatchColumns {
    pub id: i64,
    pub tenant_id: Uuid,
    #[sqlx(try_from = "String")]
    pub kind: MatchKind,
    pub is_satisfied: bool,
    pub existing_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub signal_task_id: Option<i64>,
    pub signal_task_inserted_at: Option<DateTime<Utc>>,
    pub signal_external_id: Option<Uuid>,
    pub signal_key: Option<String>,
    pub trigger_dag_id: Option<i64>,
    pub trigger_dag_inserted_at: Option<DateTime<Utc>>,
    pub trigger_step_id: Option<Uuid>,
    pub trigger_external_id: Option<Uuid>,
    pub trigger_workflow_run_id: Option<Uuid>,
    pub trigger_parent_task_external_id: Option<Uuid>,
    pub trigger_parent_task_id: Option<i64>,
    pub trigger_parent_task_inserted_at: Option<DateTime<Utc>>,
    pub trigger_child_index: Option<i64>,
    pub trigger_child_key: Option<String>,
    pub trigger_priority: Option<i32>,
    pub trigger_step_config: Option<Value>,
}

fn missing_column(match_id: i64, column: &str) -> CoreError {
    CoreError::DatabaseError {
        operation: "decode".to_string(),
        details: format!("match {} is missing {}", match_id, column),
    }
}

impl TryFrom<MatchColumns> for Match {
    type Error = CoreError;

    fn try_from(row: MatchColumns) -> Result<Self, Self::Error> {
        let id = row.id;
        let target = match row.kind {
            MatchKind::Signal => MatchTarget::Signal(SignalTarget {
                task_id: row
                    .signal_task_id
                    .ok_or_else(|| missing_column(id, "signal_task_id"))?,
                task_inserted_at: row
                    .signal_task_inserted_at
                    .ok_or_else(|| missing_column(id, "signal_task_inserted_at"))?,
                external_id: row
                    .signal_external_id
                    .ok_or_else(|| missing_column(id, "signal_external_id"))?,
                signal_key: row
                    .signal_key
                    .ok_or_else(|| missing_column(id, "signal_key"))?,
            }),
            MatchKind::Trigger => {
                let step_config = row
                    .trigger_step_config
                    .ok_or_else(|| missing_column(id, "trigger_step_config"))?;
                let parent = match (
                    row.trigger_parent_task_id,
                    row.trigger_parent_task_inserted_at,
                    row.trigger_parent_task_external_id,
                ) {
                    (Some(task_id), Some(inserted_at), Some(external_id)) => Some(ParentTaskRef {
                        task_id,
                        inserted_at,
                        external_id,
                    }),
                    _ => None,
                };
                MatchTarget::DagTrigger(Box::new(DagTrigger {
                    dag: DagRef {
                        dag_id: row
                            .trigger_dag_id
                            .ok_or_else(|| missing_column(id, "trigger_dag_id"))?,
                        dag_inserted_at: row
                            .trigger_dag_inserted_at
                            .ok_or_else(|| missing_column(id, "trigger_dag_inserted_at"))?,
                    },
                    step: serde_json::from_value(step_config)?,
                    external_id: row
                        .trigger_external_id
                        .ok_or_else(|| missing_column(id, "trigger_external_id"))?,
                    workflow_run_id: row
                        .trigger_workflow_run_id
                        .ok_or_else(|| missing_column(id, "trigger_workflow_run_id"))?,
                    parent,
                    child_index: row.trigger_child_index,
                    child_key: row.trigger_child_key,
                    priority: row.trigger_priority,
                }))
            }
        };

        Ok(Match {
            id,
            tenant_id: row.tenant_id,
            is_satisfied: row.is_satisfied,
            existing_data: row.existing_data,
            target,
            created_at: row.created_at,
        })
    }
}

/// A persisted match condition.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MatchCondition {
    /// Primary key.
    pub id: i64,
    /// Owning match.
    pub match_id: i64,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Event origin.
    #[sqlx(try_from = "String")]
    pub event_type: ConditionEventType,
    /// Event key.
    pub event_key: String,
    /// Resource hint.
    pub event_resource_hint: Option<String>,
    /// Key the payload is stored under.
    pub readable_data_key: String,
    /// Filter expression.
    pub expression: Option<String>,
    /// Alternative group.
    pub or_group_id: Uuid,
    /// Effect on the created task.
    #[sqlx(try_from = "String")]
    pub action: ConditionAction,
    /// Whether an event has satisfied the condition.
    pub is_satisfied: bool,
    /// Payload of the satisfying event.
    pub data: Option<Value>,
}

/// A match that fired during [`Persistence::satisfy_match_conditions`].
#[derive(Debug, Clone, PartialEq)]
pub struct SatisfiedMatch {
    /// The match, with `existing_data` holding the merged payload.
    pub matched: Match,
    /// Most severe action among the satisfied conditions.
    pub action: ConditionAction,
}

/// Most severe action among the satisfied conditions.
pub(crate) fn winning_action(conditions: &[MatchCondition]) -> ConditionAction {
    conditions
        .iter()
        .filter(|c| c.is_satisfied)
        .map(|c| c.action)
        .max_by_key(|a| a.severity())
        .unwrap_or(ConditionAction::Create)
}

/// Event key plus resource hint for the hinted lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HintedEventKey {
    /// Event key.
    pub event_key: String,
    /// Resource hint.
    pub resource_hint: String,
}

/// Marks one condition satisfied by an event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionSatisfaction {
    /// Owning match.
    pub match_id: i64,
    /// Condition satisfied.
    pub condition_id: i64,
    /// Payload of the satisfying event.
    pub data: Option<Value>,
}

/// Whether every or-group of a match has a satisfied condition.
pub(crate) fn all_groups_satisfied(conditions: &[MatchCondition]) -> bool {
    let groups: HashSet<Uuid> = conditions.iter().map(|c| c.or_group_id).collect();
    let satisfied: HashSet<Uuid> = conditions
        .iter()
        .filter(|c| c.is_satisfied)
        .map(|c| c.or_group_id)
        .collect();
    !groups.is_empty() && groups == satisfied
}

/// Merge satisfied condition payloads into the carried match data.
///
/// Non-object carried data is kept under the `"input"` key.
pub(crate) fn merge_match_data(existing: Option<Value>, conditions: &[MatchCondition]) -> Value {
    let mut merged = match existing {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => serde_json::Map::new(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other);
            map
        }
    };
    for condition in conditions.iter().filter(|c| c.is_satisfied) {
        merged.insert(
            condition.readable_data_key.clone(),
            condition.data.clone().unwrap_or(Value::Null),
        );
    }
    Value::Object(merged)
}

// ============================================================================
// Events
// ============================================================================

/// Input for bulk event ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Logical id of the event.
    pub external_id: Uuid,
    /// When the event was observed; defaults to now.
    pub seen_at: Option<DateTime<Utc>>,
    /// Event key.
    pub key: String,
    /// Payload.
    pub payload: Value,
    /// Caller-defined metadata.
    pub additional_metadata: Option<Value>,
    /// Resource scope; used as the resource hint when matching.
    pub scope: Option<String>,
    /// Webhook the event arrived through.
    pub triggering_webhook_name: Option<String>,
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Event {
    /// Primary key.
    pub id: i64,
    /// Partition key.
    pub seen_at: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Logical id.
    pub external_id: Uuid,
    /// Event key.
    pub key: String,
    /// Payload.
    pub payload: Value,
    /// Caller-defined metadata.
    pub additional_metadata: Option<Value>,
    /// Resource scope.
    pub scope: Option<String>,
    /// Webhook the event arrived through.
    pub triggering_webhook_name: Option<String>,
}

// ============================================================================
// Validation
// ============================================================================

fn invalid(field: String, message: &str) -> CoreError {
    CoreError::ValidationError {
        field,
        message: message.to_string(),
    }
}

fn validate_step(field: &str, step: &StepConfig) -> Result<(), CoreError> {
    if step.queue.is_empty() {
        return Err(invalid(format!("{field}.queue"), "must not be empty"));
    }
    if step.action_id.is_empty() {
        return Err(invalid(format!("{field}.action_id"), "must not be empty"));
    }
    if step.step_readable_id.is_empty() {
        return Err(invalid(
            format!("{field}.step_readable_id"),
            "must not be empty",
        ));
    }
    if step.schedule_timeout_secs <= 0 {
        return Err(invalid(
            format!("{field}.schedule_timeout_secs"),
            "must be positive",
        ));
    }
    if step.step_timeout_secs.is_some_and(|secs| secs <= 0) {
        return Err(invalid(
            format!("{field}.step_timeout_secs"),
            "must be positive",
        ));
    }
    let mut strategies = HashSet::new();
    for (i, dim) in step.concurrency.iter().enumerate() {
        if dim.key.is_empty() {
            return Err(invalid(
                format!("{field}.concurrency[{i}].key"),
                "must not be empty",
            ));
        }
        if !strategies.insert(dim.strategy_id) {
            return Err(invalid(
                format!("{field}.concurrency[{i}].strategy_id"),
                "duplicate strategy",
            ));
        }
    }
    Ok(())
}

/// Validate a task batch before any row is written.
pub(crate) fn validate_new_tasks(tasks: &[NewTask]) -> Result<(), CoreError> {
    let mut external_ids = HashSet::new();
    for (i, task) in tasks.iter().enumerate() {
        let field = format!("tasks[{i}]");
        validate_step(&format!("{field}.step"), &task.step)?;
        if !external_ids.insert(task.external_id) {
            return Err(invalid(
                format!("{field}.external_id"),
                "duplicate external id in batch",
            ));
        }
        if task.child_index.is_some_and(|index| index < 0) {
            return Err(invalid(format!("{field}.child_index"), "must not be negative"));
        }
        if task.child_key.is_some() && task.parent.is_none() {
            return Err(invalid(format!("{field}.child_key"), "requires a parent task"));
        }
    }
    Ok(())
}

/// Validate a match batch before any row is written.
pub(crate) fn validate_new_matches(
    matches: &[NewMatch],
    expected: MatchKind,
) -> Result<(), CoreError> {
    for (i, m) in matches.iter().enumerate() {
        let field = format!("matches[{i}]");
        if m.target.kind() != expected {
            return Err(invalid(
                format!("{field}.target"),
                match expected {
                    MatchKind::Trigger => "expected a DAG trigger",
                    MatchKind::Signal => "expected a signal target",
                },
            ));
        }
        if m.conditions.is_empty() {
            return Err(invalid(
                format!("{field}.conditions"),
                "at least one condition is required",
            ));
        }
        for (j, c) in m.conditions.iter().enumerate() {
            if c.event_key.is_empty() {
                return Err(invalid(
                    format!("{field}.conditions[{j}].event_key"),
                    "must not be empty",
                ));
            }
            if c.readable_data_key.is_empty() {
                return Err(invalid(
                    format!("{field}.conditions[{j}].readable_data_key"),
                    "must not be empty",
                ));
            }
        }
        match &m.target {
            MatchTarget::DagTrigger(trigger) => {
                validate_step(&format!("{field}.target.step"), &trigger.step)?
            }
            MatchTarget::Signal(signal) if signal.signal_key.is_empty() => {
                return Err(invalid(
                    format!("{field}.target.signal_key"),
                    "must not be empty",
                ));
            }
            MatchTarget::Signal(_) => {}
        }
    }
    Ok(())
}

/// Validate an event batch before any row is written.
pub(crate) fn validate_new_events(events: &[NewEvent]) -> Result<(), CoreError> {
    for (i, event) in events.iter().enumerate() {
        if event.key.is_empty() {
            return Err(invalid(format!("events[{i}].key"), "must not be empty"));
        }
    }
    Ok(())
}

/// Validate a replay batch before any row is locked.
pub(crate) fn validate_replays(replays: &[TaskReplay]) -> Result<(), CoreError> {
    let mut seen = HashSet::new();
    for (i, replay) in replays.iter().enumerate() {
        if !seen.insert((replay.task_id, replay.inserted_at)) {
            return Err(invalid(format!("replays[{i}]"), "duplicate task in batch"));
        }
        if let Some(j) = replay.concurrency_keys.iter().position(String::is_empty) {
            return Err(invalid(
                format!("replays[{i}].concurrency_keys[{j}]"),
                "must not be empty",
            ));
        }
    }
    Ok(())
}

/// A replay must supply one key per concurrency dimension of the task.
pub(crate) fn check_replay_keys(replay: &TaskReplay, task: &Task) -> Result<(), CoreError> {
    if replay.concurrency_keys.len() != task.step.concurrency.len() {
        return Err(CoreError::ValidationError {
            field: format!("replays[task {}].concurrency_keys", replay.task_id),
            message: format!(
                "expected {} keys, got {}",
                task.step.concurrency.len(),
                replay.concurrency_keys.len()
            ),
        });
    }
    Ok(())
}

// ============================================================================
// Persistence trait
// ============================================================================

/// Persistence interface used by the coordinator and maintenance worker.
///
/// Every method is one transaction: either the whole batch is applied or
/// nothing is. [`Persistence::begin`] opens a [`PersistenceTx`] for flows
/// that must apply several operations atomically.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Open a transaction. On SQLite it holds the writer lock until it is
    /// committed or dropped, so no other write through this provider can run
    /// meanwhile.
    async fn begin(&self) -> Result<Box<dyn PersistenceTx>, CoreError>;

    // ========================================================================
    // Task Store
    // ========================================================================

    /// Insert DAG rows.
    async fn create_dags(&self, tenant_id: Uuid, dags: &[NewDag]) -> Result<Vec<Dag>, CoreError>;

    /// Insert tasks and enqueue the queued ones (queue item or concurrency
    /// slots). Returns the tasks in input order.
    async fn create_tasks(&self, tenant_id: Uuid, tasks: &[NewTask])
    -> Result<Vec<Task>, CoreError>;

    /// Load a task by primary key.
    async fn get_task(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Option<Task>, CoreError>;

    /// Load a task by logical id.
    async fn get_task_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
    ) -> Result<Option<Task>, CoreError>;

    /// Replay tasks under a new attempt: lock, release the current attempt,
    /// bump the retry count, and re-enqueue.
    async fn replay_tasks(
        &self,
        tenant_id: Uuid,
        replays: &[TaskReplay],
    ) -> Result<ReplayedTasks, CoreError>;

    /// Append task events, dropping duplicates of keyed events. Returns the
    /// number of rows written.
    async fn insert_task_events(
        &self,
        tenant_id: Uuid,
        events: &[NewTaskEvent],
    ) -> Result<u64, CoreError>;

    /// List a task's events, oldest first.
    async fn list_task_events(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<TaskEvent>, CoreError>;

    /// Upsert cached expression evaluations (last write wins).
    async fn upsert_expression_evals(&self, evals: &[ExpressionEval]) -> Result<(), CoreError>;

    /// List a task's cached expression evaluations.
    async fn list_expression_evals(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<ExpressionEval>, CoreError>;

    // ========================================================================
    // Holding areas and dispatch
    // ========================================================================

    /// Dequeue up to `limit` attempts of a queue for a worker.
    async fn assign_queued_tasks(
        &self,
        tenant_id: Uuid,
        queue: &str,
        worker_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AssignedTask>, CoreError>;

    /// Move queued attempts to the rate-limited holding area.
    async fn move_to_rate_limited(
        &self,
        tenant_id: Uuid,
        requeues: &[RateLimitedRequeue],
    ) -> Result<Vec<TaskAttempt>, CoreError>;

    /// Release failed current attempts and hold their successors in the
    /// retry queue. Returns the updated tasks.
    async fn schedule_retries(
        &self,
        tenant_id: Uuid,
        retries: &[RetrySchedule],
    ) -> Result<Vec<Task>, CoreError>;

    /// Re-enqueue retry items whose backoff has elapsed.
    async fn promote_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromotedAttempt>, CoreError>;

    /// Re-enqueue rate-limited items whose requeue time has passed.
    async fn promote_due_rate_limited(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromotedAttempt>, CoreError>;

    /// Holding areas an attempt is currently present in.
    async fn holding_areas(
        &self,
        tenant_id: Uuid,
        attempt: TaskAttempt,
    ) -> Result<Vec<HoldingArea>, CoreError>;

    // ========================================================================
    // Concurrency
    // ========================================================================

    /// Fill workflow aggregates of a strategy, at most `max_runs` per key.
    /// Returns the number newly filled.
    async fn fill_workflow_concurrency_slots(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<u64, CoreError>;

    /// Fill per-task slots of a strategy, at most `max_runs` per key, and
    /// queue attempts whose slots are all filled. Returns those attempts.
    async fn fill_concurrency_slots(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<Vec<TaskAttempt>, CoreError>;

    /// Per-task slots of a task, all attempts.
    async fn list_concurrency_slots(
        &self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<ConcurrencySlot>, CoreError>;

    /// Aggregate slot of a workflow run for a strategy.
    async fn get_workflow_concurrency_slot(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        workflow_version_id: Uuid,
        workflow_run_id: Uuid,
    ) -> Result<Option<WorkflowConcurrencySlot>, CoreError>;

    // ========================================================================
    // Release Coordinator
    // ========================================================================

    /// Atomically remove runtime, holding-area and concurrency state of the
    /// attempts. Idempotent per attempt.
    async fn release_tasks(
        &self,
        tenant_id: Uuid,
        attempts: &[TaskAttempt],
    ) -> Result<Vec<ReleasedTask>, CoreError>;

    /// Runtimes whose timeout has passed, oldest first.
    async fn list_expired_runtimes(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExpiredRuntime>, CoreError>;

    // ========================================================================
    // Match Engine
    // ========================================================================

    /// Insert DAG-trigger matches with their conditions.
    async fn create_matches_for_dag_triggers(
        &self,
        tenant_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<Match>, CoreError>;

    /// Insert signal matches with their conditions.
    async fn create_signal_matches(
        &self,
        tenant_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<Match>, CoreError>;

    /// Unsatisfied conditions matching `(event_key, resource_hint)` pairs.
    /// Never returns a condition without a hint.
    async fn list_match_conditions_with_hint(
        &self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        keys: &[HintedEventKey],
    ) -> Result<Vec<MatchCondition>, CoreError>;

    /// Unsatisfied conditions without a hint matching the event keys.
    async fn list_match_conditions_without_hint(
        &self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        event_keys: &[String],
    ) -> Result<Vec<MatchCondition>, CoreError>;

    /// Mark conditions satisfied and fire the matches that became satisfied.
    /// Each match fires at most once across all callers.
    async fn satisfy_match_conditions(
        &self,
        tenant_id: Uuid,
        satisfactions: &[ConditionSatisfaction],
    ) -> Result<Vec<SatisfiedMatch>, CoreError>;

    /// Load a match by id.
    async fn get_match(&self, tenant_id: Uuid, match_id: i64) -> Result<Option<Match>, CoreError>;

    /// Conditions of a match, in creation order.
    async fn list_match_conditions(
        &self,
        tenant_id: Uuid,
        match_id: i64,
    ) -> Result<Vec<MatchCondition>, CoreError>;

    // ========================================================================
    // Bulk Event Ingestion
    // ========================================================================

    /// Insert external events. No deduplication.
    async fn bulk_create_events(&self, events: &[NewEvent]) -> Result<Vec<Event>, CoreError>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Delete up to `limit` tasks inserted before `cutoff` (with their
    /// events, evals and transient rows) plus events and matches older than
    /// `cutoff`, satisfied or not. Returns the number of rows deleted.
    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, CoreError>;

    /// Check the database is reachable.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Operations of one open transaction. Nothing is visible to other
/// transactions until [`PersistenceTx::commit`]; dropping the handle rolls
/// back.
///
/// Methods mirror their [`Persistence`] counterparts.
#[async_trait]
pub trait PersistenceTx: Send {
    /// See [`Persistence::create_tasks`].
    async fn create_tasks(
        &mut self,
        tenant_id: Uuid,
        tasks: &[NewTask],
    ) -> Result<Vec<Task>, CoreError>;

    /// Lock tasks until commit, in id order. Missing tasks are absent from
    /// the result.
    async fn lock_tasks(
        &mut self,
        tenant_id: Uuid,
        keys: &[(i64, DateTime<Utc>)],
    ) -> Result<Vec<Task>, CoreError>;

    /// See [`Persistence::get_task`].
    async fn get_task(
        &mut self,
        tenant_id: Uuid,
        task_id: i64,
        inserted_at: DateTime<Utc>,
    ) -> Result<Option<Task>, CoreError>;

    /// See [`Persistence::replay_tasks`].
    async fn replay_tasks(
        &mut self,
        tenant_id: Uuid,
        replays: &[TaskReplay],
    ) -> Result<ReplayedTasks, CoreError>;

    /// See [`Persistence::insert_task_events`].
    async fn insert_task_events(
        &mut self,
        tenant_id: Uuid,
        events: &[NewTaskEvent],
    ) -> Result<u64, CoreError>;

    /// See [`Persistence::assign_queued_tasks`].
    async fn assign_queued_tasks(
        &mut self,
        tenant_id: Uuid,
        queue: &str,
        worker_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AssignedTask>, CoreError>;

    /// See [`Persistence::move_to_rate_limited`].
    async fn move_to_rate_limited(
        &mut self,
        tenant_id: Uuid,
        requeues: &[RateLimitedRequeue],
    ) -> Result<Vec<TaskAttempt>, CoreError>;

    /// See [`Persistence::schedule_retries`].
    async fn schedule_retries(
        &mut self,
        tenant_id: Uuid,
        retries: &[RetrySchedule],
    ) -> Result<Vec<Task>, CoreError>;

    /// See [`Persistence::fill_concurrency_slots`].
    async fn fill_concurrency_slots(
        &mut self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<Vec<TaskAttempt>, CoreError>;

    /// See [`Persistence::release_tasks`].
    async fn release_tasks(
        &mut self,
        tenant_id: Uuid,
        attempts: &[TaskAttempt],
    ) -> Result<Vec<ReleasedTask>, CoreError>;

    /// See [`Persistence::list_match_conditions_with_hint`].
    async fn list_match_conditions_with_hint(
        &mut self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        keys: &[HintedEventKey],
    ) -> Result<Vec<MatchCondition>, CoreError>;

    /// See [`Persistence::list_match_conditions_without_hint`].
    async fn list_match_conditions_without_hint(
        &mut self,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        event_keys: &[String],
    ) -> Result<Vec<MatchCondition>, CoreError>;

    /// See [`Persistence::satisfy_match_conditions`].
    async fn satisfy_match_conditions(
        &mut self,
        tenant_id: Uuid,
        satisfactions: &[ConditionSatisfaction],
    ) -> Result<Vec<SatisfiedMatch>, CoreError>;

    /// See [`Persistence::bulk_create_events`].
    async fn bulk_create_events(&mut self, events: &[NewEvent]) -> Result<Vec<Event>, CoreError>;

    /// Commit everything done through this handle.
    async fn commit(self: Box<Self>) -> Result<(), CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step() -> StepConfig {
        StepConfig {
            queue: "default".to_string(),
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

    fn condition(group: Uuid, satisfied: bool, key: &str, data: Value) -> MatchCondition {
        MatchCondition {
            id: 1,
            match_id: 1,
            tenant_id: Uuid::nil(),
            event_type: ConditionEventType::Internal,
            event_key: "task.completed".to_string(),
            event_resource_hint: None,
            readable_data_key: key.to_string(),
            expression: None,
            or_group_id: group,
            action: ConditionAction::Create,
            is_satisfied: satisfied,
            data: Some(data),
        }
    }

    #[test]
    fn test_text_enum_round_trip_and_unknown() {
        assert_eq!(TaskEventType::parse("TIMED_OUT").unwrap(), TaskEventType::TimedOut);
        assert_eq!(InitialState::Skipped.as_str(), "SKIPPED");
        let err = MatchKind::parse("BOGUS").unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_attempt_ordering_is_canonical() {
        let t0 = Utc::now();
        let attempts = vec![
            TaskAttempt::new(5, t0, 0),
            TaskAttempt::new(2, t0, 1),
            TaskAttempt::new(2, t0, 0),
            TaskAttempt::new(5, t0, 0),
        ];
        let sorted = canonical_attempts(&attempts);
        assert_eq!(
            sorted,
            vec![
                TaskAttempt::new(2, t0, 0),
                TaskAttempt::new(2, t0, 1),
                TaskAttempt::new(5, t0, 0),
            ]
        );
    }

    #[test]
    fn test_validate_rejects_bad_batches() {
        let run = Uuid::new_v4();
        let good = NewTask::queued(run, step(), json!({}));
        assert!(validate_new_tasks(std::slice::from_ref(&good)).is_ok());

        let mut empty_queue = good.clone();
        empty_queue.step.queue.clear();
        let err = validate_new_tasks(&[good.clone(), empty_queue]).unwrap_err();
        assert!(matches!(err, CoreError::ValidationError { ref field, .. } if field == "tasks[1].step.queue"));

        let err = validate_new_tasks(&[good.clone(), good.clone()]).unwrap_err();
        assert!(err.to_string().contains("duplicate external id"));

        let mut bad_key = good.clone();
        bad_key.external_id = Uuid::new_v4();
        bad_key.step.concurrency = vec![ConcurrencyDimension {
            parent_strategy_id: None,
            strategy_id: 1,
            key: String::new(),
        }];
        assert!(validate_new_tasks(&[bad_key]).is_err());

        let mut orphan_child = good;
        orphan_child.child_key = Some("k".to_string());
        assert!(validate_new_tasks(&[orphan_child]).is_err());
    }

    #[test]
    fn test_validate_matches_rejects_wrong_kind() {
        let signal = NewMatch {
            target: MatchTarget::Signal(SignalTarget {
                task_id: 1,
                task_inserted_at: Utc::now(),
                external_id: Uuid::new_v4(),
                signal_key: "approval".to_string(),
            }),
            existing_data: None,
            conditions: vec![NewMatchCondition {
                event_type: ConditionEventType::User,
                event_key: "approved".to_string(),
                event_resource_hint: None,
                readable_data_key: "approval".to_string(),
                expression: None,
                or_group_id: Uuid::new_v4(),
                action: ConditionAction::Create,
            }],
        };
        assert!(validate_new_matches(std::slice::from_ref(&signal), MatchKind::Signal).is_ok());
        assert!(validate_new_matches(&[signal], MatchKind::Trigger).is_err());
    }

    #[test]
    fn test_all_groups_satisfied() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let partial = vec![
            condition(a, true, "a", json!(1)),
            condition(b, false, "b", json!(2)),
        ];
        assert!(!all_groups_satisfied(&partial));

        let alternatives = vec![
            condition(a, true, "a", json!(1)),
            condition(a, false, "a_failed", json!(null)),
            condition(b, true, "b", json!(2)),
        ];
        assert!(all_groups_satisfied(&alternatives));
        assert!(!all_groups_satisfied(&[]));
    }

    #[test]
    fn test_merge_match_data() {
        let a = Uuid::new_v4();
        let merged = merge_match_data(
            Some(json!({"input": {"n": 1}})),
            &[
                condition(a, true, "parent", json!({"ok": true})),
                condition(a, false, "ignored", json!(0)),
            ],
        );
        assert_eq!(merged, json!({"input": {"n": 1}, "parent": {"ok": true}}));

        let wrapped = merge_match_data(Some(json!(42)), &[]);
        assert_eq!(wrapped, json!({"input": 42}));
    }

    #[test]
    fn test_select_slots_to_fill_respects_max_runs_per_key() {
        let slots = vec![
            (true, "a", true),
            (false, "a", true),
            (false, "b", true),
            (false, "b", false),
            (false, "b", true),
        ];
        assert_eq!(select_slots_to_fill(slots.clone(), 1), vec![2]);
        assert_eq!(select_slots_to_fill(slots, 2), vec![1, 2, 4]);
    }

    #[test]
    fn test_condition_action_severity() {
        let winner = [ConditionAction::Create, ConditionAction::Cancel, ConditionAction::Skip]
            .into_iter()
            .max_by_key(|a| a.severity())
            .unwrap();
        assert_eq!(winner, ConditionAction::Cancel);
        assert_eq!(winner.initial_state(), InitialState::Cancelled);
    }
}
