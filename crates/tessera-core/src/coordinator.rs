// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task lifecycle coordination.
//!
//! [`TaskCoordinator`] composes the persistence operations into the flows a
//! scheduler needs: finishing attempts (complete, fail, cancel, time out),
//! dispatch bookkeeping, event ingestion and match firing. Every outcome is
//! recorded in the task event log and published as an internal event so
//! dependent DAG steps and signal waiters resolve through the match engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::persistence::{
    AssignedTask, ConditionAction, ConditionEventType, ConditionSatisfaction, Dag, DagTrigger,
    Event, HintedEventKey, InitialState, Match, MatchTarget, NewDag, NewEvent, NewMatch,
    NewMatchCondition, NewTask, NewTaskEvent, Persistence, PersistenceTx, RateLimitedRequeue,
    ReleasedTask, ReplayedTasks, RetrySchedule, SatisfiedMatch, StepConfig, Task, TaskAttempt,
    TaskEventType, TaskReplay,
};

/// Internal event published when an attempt completes.
pub const TASK_COMPLETED: &str = "task.completed";
/// Internal event published when an attempt fails for good or times out.
pub const TASK_FAILED: &str = "task.failed";
/// Internal event published when an attempt is cancelled.
pub const TASK_CANCELLED: &str = "task.cancelled";
/// Internal event published when a task is created skipped.
pub const TASK_SKIPPED: &str = "task.skipped";

/// Backoff cap when a step sets a factor but no maximum.
const DEFAULT_MAX_BACKOFF_SECS: i32 = 86_400;

/// Priority of tasks created by a trigger that does not set one.
const DEFAULT_TRIGGER_PRIORITY: i32 = 1;

// ============================================================================
// Expressions
// ============================================================================

/// Decides whether a condition's expression accepts an event payload.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against `payload`.
    fn accepts(&self, expression: &str, payload: &Value) -> bool;
}

/// Evaluator that accepts every payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ExpressionEvaluator for AcceptAll {
    fn accepts(&self, _expression: &str, _payload: &Value) -> bool {
        true
    }
}

// ============================================================================
// Inputs and reports
// ============================================================================

/// An event offered to the match engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchableEvent {
    /// Event key.
    pub key: String,
    /// Resource hint; `None` matches only conditions without a hint.
    pub resource_hint: Option<String>,
    /// Payload stored on the satisfied condition.
    pub payload: Value,
}

impl MatchableEvent {
    /// Internal event about a task, hinted by its external id.
    pub fn for_task(key: &str, external_id: Uuid, payload: Value) -> Self {
        Self {
            key: key.to_string(),
            resource_hint: Some(external_id.to_string()),
            payload,
        }
    }
}

/// A successful attempt and its output.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    /// The attempt that finished.
    pub attempt: TaskAttempt,
    /// Output passed to dependants.
    pub output: Option<Value>,
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    /// The attempt that failed.
    pub attempt: TaskAttempt,
    /// Error payload recorded on the event.
    pub error: Option<Value>,
    /// Schedule another attempt instead of failing the task.
    pub retry: bool,
}

/// What firing matches produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchEffects {
    /// Matches that fired, in firing order.
    pub fired_matches: Vec<i64>,
    /// Tasks created by DAG-trigger matches, including cascaded ones.
    pub created_tasks: Vec<Task>,
    /// Current attempts that received a `SIGNAL_COMPLETED` event.
    pub signalled_tasks: Vec<TaskAttempt>,
}

impl MatchEffects {
    fn extend(&mut self, other: MatchEffects) {
        self.fired_matches.extend(other.fired_matches);
        self.created_tasks.extend(other.created_tasks);
        self.signalled_tasks.extend(other.signalled_tasks);
    }
}

/// Result of finishing a batch of attempts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseReport {
    /// Release summaries in input order (tasks that no longer exist are
    /// omitted).
    pub released: Vec<ReleasedTask>,
    /// Tasks moved to a new attempt by a retry.
    pub retried: Vec<Task>,
    /// Downstream effects of the published internal events.
    pub effects: MatchEffects,
}

/// Result of ingesting external events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Persisted events in input order.
    pub events: Vec<Event>,
    /// Downstream effects.
    pub effects: MatchEffects,
}

// ============================================================================
// Helpers
// ============================================================================

/// Conditions for a step that runs after `parent_external_id`: one or-group
/// where completion creates the step, a skip skips it, and a failure or
/// cancellation cancels it. Parent data lands under `readable_data_key`.
pub fn dependency_conditions(
    parent_external_id: Uuid,
    readable_data_key: &str,
) -> Vec<NewMatchCondition> {
    let or_group_id = Uuid::new_v4();
    [
        (TASK_COMPLETED, ConditionAction::Create),
        (TASK_SKIPPED, ConditionAction::Skip),
        (TASK_FAILED, ConditionAction::Cancel),
        (TASK_CANCELLED, ConditionAction::Cancel),
    ]
    .into_iter()
    .map(|(event_key, action)| NewMatchCondition {
        event_type: ConditionEventType::Internal,
        event_key: event_key.to_string(),
        event_resource_hint: Some(parent_external_id.to_string()),
        readable_data_key: readable_data_key.to_string(),
        expression: None,
        or_group_id,
        action,
    })
    .collect()
}

/// Delay before the next attempt: `1s * factor^app_retry_count`, capped at
/// the step's maximum backoff. Steps without a factor retry immediately.
pub fn retry_delay(step: &StepConfig, app_retry_count: i32) -> chrono::Duration {
    let Some(factor) = step.retry_backoff_factor else {
        return chrono::Duration::zero();
    };
    let cap = f64::from(step.retry_max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS));
    let secs = factor.powi(app_retry_count).min(cap).max(0.0);
    chrono::Duration::milliseconds((secs * 1000.0) as i64)
}

/// Event for one attempt, keyed by its retry count so repeats are dropped.
fn attempt_event(
    attempt: TaskAttempt,
    external_id: Uuid,
    event_type: TaskEventType,
    data: Option<Value>,
) -> NewTaskEvent {
    NewTaskEvent {
        task_id: attempt.task_id,
        task_inserted_at: attempt.inserted_at,
        retry_count: attempt.retry_count,
        event_type,
        event_key: Some(attempt.retry_count.to_string()),
        data,
        external_id: Some(external_id),
    }
}

fn reason_data(reason: Option<&str>) -> Option<Value> {
    reason.map(|r| json!({ "reason": r }))
}

/// Task a fired DAG trigger creates.
fn trigger_task(trigger: DagTrigger, data: Option<Value>, action: ConditionAction) -> NewTask {
    let initial_state_reason = match action {
        ConditionAction::Create => None,
        ConditionAction::Skip => Some("dependency was skipped".to_string()),
        ConditionAction::Cancel => Some("dependency failed or was cancelled".to_string()),
    };
    NewTask {
        external_id: trigger.external_id,
        workflow_run_id: trigger.workflow_run_id,
        step: trigger.step,
        priority: trigger.priority.unwrap_or(DEFAULT_TRIGGER_PRIORITY),
        desired_worker_id: None,
        input: data.unwrap_or_else(|| json!({})),
        additional_metadata: None,
        initial_state: action.initial_state(),
        initial_state_reason,
        dag: Some(trigger.dag),
        parent: trigger.parent,
        child_index: trigger.child_index,
        child_key: trigger.child_key,
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Orchestrates task lifecycles over a [`Persistence`] backend.
#[derive(Clone)]
pub struct TaskCoordinator {
    persistence: Arc<dyn Persistence>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl std::fmt::Debug for TaskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCoordinator")
            .field("persistence", &"...")
            .field("evaluator", &"...")
            .finish()
    }
}

impl TaskCoordinator {
    /// Create a coordinator that accepts every condition expression.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            evaluator: Arc::new(AcceptAll),
        }
    }

    /// Replace the expression evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// The persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    /// Register DAG runs.
    pub async fn create_dags(&self, tenant_id: Uuid, dags: &[NewDag]) -> Result<Vec<Dag>> {
        let created = self.persistence.create_dags(tenant_id, dags).await?;
        debug!(tenant_id = %tenant_id, count = created.len(), "Created DAGs");
        Ok(created)
    }

    /// Create tasks. Queued tasks get a `QUEUED` event; tasks created in a
    /// terminal state get their outcome event and resolve their dependants.
    #[instrument(skip(self, tasks), fields(tenant_id = %tenant_id, count = tasks.len()))]
    pub async fn create_tasks(&self, tenant_id: Uuid, tasks: &[NewTask]) -> Result<Vec<Task>> {
        let mut tx = self.persistence.begin().await?;
        let (created, internal) = self.materialize(&mut *tx, tenant_id, tasks).await?;
        let effects = self
            .propagate(&mut *tx, tenant_id, ConditionEventType::Internal, internal)
            .await?;
        tx.commit().await?;
        info!(
            created = created.len(),
            cascaded = effects.created_tasks.len(),
            "Created tasks"
        );
        Ok(created)
    }

    /// Register matches that create DAG steps once their conditions hold.
    pub async fn create_dag_triggers(
        &self,
        tenant_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<Match>> {
        let created = self
            .persistence
            .create_matches_for_dag_triggers(tenant_id, matches)
            .await?;
        debug!(tenant_id = %tenant_id, count = created.len(), "Created DAG triggers");
        Ok(created)
    }

    /// Register matches that signal a running task.
    pub async fn create_signal_matches(
        &self,
        tenant_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<Match>> {
        let created = self
            .persistence
            .create_signal_matches(tenant_id, matches)
            .await?;
        debug!(tenant_id = %tenant_id, count = created.len(), "Created signal matches");
        Ok(created)
    }

    /// Replay tasks under a new attempt and record `REPLAYED` events. The
    /// superseded attempts are reported so their workers can be stopped.
    #[instrument(skip(self, replays), fields(tenant_id = %tenant_id, count = replays.len()))]
    pub async fn replay_tasks(
        &self,
        tenant_id: Uuid,
        replays: &[TaskReplay],
    ) -> Result<ReplayedTasks> {
        let mut tx = self.persistence.begin().await?;
        let replayed = tx.replay_tasks(tenant_id, replays).await?;
        let events: Vec<NewTaskEvent> = replayed
            .tasks
            .iter()
            .map(|t| attempt_event(t.attempt(), t.external_id, TaskEventType::Replayed, None))
            .collect();
        tx.insert_task_events(tenant_id, &events).await?;
        tx.commit().await?;

        for running in replayed.superseded.iter().filter(|r| r.worker_id.is_some()) {
            info!(
                task_id = running.attempt.task_id,
                retry_count = running.attempt.retry_count,
                worker_id = ?running.worker_id,
                "Replay superseded a running attempt"
            );
        }
        info!(replayed = replayed.tasks.len(), "Replayed tasks");
        Ok(replayed)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Dequeue attempts for a worker and record `ASSIGNED` events.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, worker_id = %worker_id))]
    pub async fn assign_tasks(
        &self,
        tenant_id: Uuid,
        queue: &str,
        worker_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AssignedTask>> {
        let mut tx = self.persistence.begin().await?;
        let assigned = tx
            .assign_queued_tasks(tenant_id, queue, worker_id, limit)
            .await?;
        if assigned.is_empty() {
            return Ok(assigned);
        }
        let events: Vec<NewTaskEvent> = assigned
            .iter()
            .map(|a| {
                attempt_event(
                    a.attempt,
                    a.external_id,
                    TaskEventType::Assigned,
                    Some(json!({ "worker_id": a.worker_id })),
                )
            })
            .collect();
        tx.insert_task_events(tenant_id, &events).await?;
        tx.commit().await?;
        debug!(count = assigned.len(), "Assigned tasks");
        Ok(assigned)
    }

    /// Hold queued attempts until `requeue_after` and record
    /// `RATE_LIMITED` events.
    pub async fn rate_limit_tasks(
        &self,
        tenant_id: Uuid,
        requeues: &[RateLimitedRequeue],
    ) -> Result<Vec<TaskAttempt>> {
        let mut tx = self.persistence.begin().await?;
        let moved = tx.move_to_rate_limited(tenant_id, requeues).await?;
        let requeue_at: HashMap<TaskAttempt, DateTime<Utc>> = requeues
            .iter()
            .map(|r| (r.attempt, r.requeue_after))
            .collect();
        let events: Vec<NewTaskEvent> = moved
            .iter()
            .map(|a| NewTaskEvent {
                task_id: a.task_id,
                task_inserted_at: a.inserted_at,
                retry_count: a.retry_count,
                event_type: TaskEventType::RateLimited,
                event_key: None,
                data: requeue_at.get(a).map(|at| json!({ "requeue_after": at })),
                external_id: None,
            })
            .collect();
        tx.insert_task_events(tenant_id, &events).await?;
        tx.commit().await?;
        debug!(tenant_id = %tenant_id, count = moved.len(), "Rate limited tasks");
        Ok(moved)
    }

    /// Fill workflow-level aggregates of a strategy.
    pub async fn fill_workflow_slots(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<u64> {
        let filled = self
            .persistence
            .fill_workflow_concurrency_slots(tenant_id, strategy_id, max_runs)
            .await?;
        debug!(tenant_id = %tenant_id, strategy_id, filled, "Filled workflow slots");
        Ok(filled)
    }

    /// Fill per-task slots of a strategy. Returns the attempts that became
    /// queued.
    pub async fn fill_task_slots(
        &self,
        tenant_id: Uuid,
        strategy_id: i64,
        max_runs: i64,
    ) -> Result<Vec<TaskAttempt>> {
        let queued = self
            .persistence
            .fill_concurrency_slots(tenant_id, strategy_id, max_runs)
            .await?;
        debug!(tenant_id = %tenant_id, strategy_id, queued = queued.len(), "Filled task slots");
        Ok(queued)
    }

    // ------------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------------

    /// Complete attempts; dependants receive the outputs.
    #[instrument(skip(self, outcomes), fields(tenant_id = %tenant_id, count = outcomes.len()))]
    pub async fn complete_tasks(
        &self,
        tenant_id: Uuid,
        outcomes: &[TaskOutcome],
    ) -> Result<ReleaseReport> {
        let attempts = outcomes
            .iter()
            .map(|o| (o.attempt, o.output.clone()))
            .collect();
        self.finish(tenant_id, attempts, TaskEventType::Completed, TASK_COMPLETED)
            .await
    }

    /// Fail attempts. Failures with `retry` set schedule the next attempt
    /// after the step's backoff; the rest fail their task. Both happen in one
    /// transaction.
    #[instrument(skip(self, failures), fields(tenant_id = %tenant_id, count = failures.len()))]
    pub async fn fail_tasks(
        &self,
        tenant_id: Uuid,
        failures: &[TaskFailure],
    ) -> Result<ReleaseReport> {
        if failures.is_empty() {
            return Ok(ReleaseReport::default());
        }
        let (retries, terminal): (Vec<&TaskFailure>, Vec<&TaskFailure>) =
            failures.iter().partition(|f| f.retry);

        let mut tx = self.persistence.begin().await?;
        // Every task up front, in one canonical order.
        let keys: Vec<(i64, DateTime<Utc>)> = failures
            .iter()
            .map(|f| (f.attempt.task_id, f.attempt.inserted_at))
            .collect();
        let tasks: HashMap<(i64, DateTime<Utc>), Task> = tx
            .lock_tasks(tenant_id, &keys)
            .await?
            .into_iter()
            .map(|t| ((t.id, t.inserted_at), t))
            .collect();

        let now = Utc::now();
        let mut schedules = Vec::with_capacity(retries.len());
        let mut retry_events = Vec::with_capacity(retries.len());
        for failure in retries {
            let attempt = failure.attempt;
            let Some(task) = tasks.get(&(attempt.task_id, attempt.inserted_at)) else {
                continue;
            };
            if task.retry_count != attempt.retry_count {
                continue;
            }
            schedules.push(RetrySchedule {
                attempt,
                retry_after: now + retry_delay(&task.step, task.app_retry_count),
                is_app_retry: true,
            });
            retry_events.push(attempt_event(
                attempt,
                task.external_id,
                TaskEventType::RetryScheduled,
                failure.error.clone(),
            ));
        }

        let retried = if schedules.is_empty() {
            Vec::new()
        } else {
            tx.schedule_retries(tenant_id, &schedules).await?
        };
        let retried_keys: HashSet<(i64, DateTime<Utc>)> =
            retried.iter().map(|t| (t.id, t.inserted_at)).collect();
        retry_events.retain(|e| retried_keys.contains(&(e.task_id, e.task_inserted_at)));
        tx.insert_task_events(tenant_id, &retry_events).await?;

        let attempts = terminal
            .iter()
            .map(|f| (f.attempt, f.error.clone()))
            .collect();
        let mut report = self
            .release_and_publish(&mut *tx, tenant_id, attempts, TaskEventType::Failed, TASK_FAILED)
            .await?;
        tx.commit().await?;

        if !retried.is_empty() {
            info!(retried = retried.len(), "Scheduled retries");
        }
        log_finished(&report, TaskEventType::Failed);
        report.retried = retried;
        Ok(report)
    }

    /// Cancel attempts.
    #[instrument(skip(self, attempts), fields(tenant_id = %tenant_id, count = attempts.len()))]
    pub async fn cancel_tasks(
        &self,
        tenant_id: Uuid,
        attempts: &[TaskAttempt],
        reason: Option<&str>,
    ) -> Result<ReleaseReport> {
        let data = reason_data(reason);
        let attempts = attempts.iter().map(|a| (*a, data.clone())).collect();
        self.finish(tenant_id, attempts, TaskEventType::Cancelled, TASK_CANCELLED)
            .await
    }

    /// Time out attempts. Dependants see a failure.
    #[instrument(skip(self, attempts), fields(tenant_id = %tenant_id, count = attempts.len()))]
    pub async fn time_out_tasks(
        &self,
        tenant_id: Uuid,
        attempts: &[TaskAttempt],
    ) -> Result<ReleaseReport> {
        let data = reason_data(Some("timed out"));
        let attempts = attempts.iter().map(|a| (*a, data.clone())).collect();
        self.finish(tenant_id, attempts, TaskEventType::TimedOut, TASK_FAILED)
            .await
    }

    /// Time out runtimes whose deadline has passed. Returns the number of
    /// attempts released as current.
    pub async fn time_out_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<usize> {
        let expired = self.persistence.list_expired_runtimes(now, limit).await?;
        let mut by_tenant: BTreeMap<Uuid, Vec<TaskAttempt>> = BTreeMap::new();
        for runtime in &expired {
            by_tenant
                .entry(runtime.tenant_id)
                .or_default()
                .push(runtime.attempt());
        }

        let mut timed_out = 0;
        for (tenant_id, attempts) in by_tenant {
            let report = self.time_out_tasks(tenant_id, &attempts).await?;
            timed_out += report
                .released
                .iter()
                .filter(|r| r.is_current_retry)
                .count();
        }
        Ok(timed_out)
    }

    /// Release attempts and publish the outcome of current ones, all in one
    /// transaction.
    async fn finish(
        &self,
        tenant_id: Uuid,
        attempts: Vec<(TaskAttempt, Option<Value>)>,
        event_type: TaskEventType,
        internal_key: &str,
    ) -> Result<ReleaseReport> {
        if attempts.is_empty() {
            return Ok(ReleaseReport::default());
        }
        let mut tx = self.persistence.begin().await?;
        let report = self
            .release_and_publish(&mut *tx, tenant_id, attempts, event_type, internal_key)
            .await?;
        tx.commit().await?;
        log_finished(&report, event_type);
        Ok(report)
    }

    /// Release attempts, record the outcome of current ones and run it
    /// through the match engine. Stale attempts are released silently.
    async fn release_and_publish(
        &self,
        tx: &mut dyn PersistenceTx,
        tenant_id: Uuid,
        attempts: Vec<(TaskAttempt, Option<Value>)>,
        event_type: TaskEventType,
        internal_key: &str,
    ) -> Result<ReleaseReport> {
        if attempts.is_empty() {
            return Ok(ReleaseReport::default());
        }
        let ids: Vec<TaskAttempt> = attempts.iter().map(|(a, _)| *a).collect();
        let released = tx.release_tasks(tenant_id, &ids).await?;
        let data: HashMap<TaskAttempt, Option<Value>> = attempts.into_iter().collect();

        let mut events = Vec::with_capacity(released.len());
        let mut internal = Vec::with_capacity(released.len());
        for r in released.iter().filter(|r| r.is_current_retry) {
            let payload = data.get(&r.attempt).cloned().flatten();
            internal.push(MatchableEvent::for_task(
                internal_key,
                r.external_id,
                payload.clone().unwrap_or(Value::Null),
            ));
            events.push(attempt_event(r.attempt, r.external_id, event_type, payload));
        }
        tx.insert_task_events(tenant_id, &events).await?;

        let effects = self
            .propagate(tx, tenant_id, ConditionEventType::Internal, internal)
            .await?;
        Ok(ReleaseReport {
            released,
            retried: Vec::new(),
            effects,
        })
    }

    // ------------------------------------------------------------------------
    // Events and matches
    // ------------------------------------------------------------------------

    /// Persist external events and run them through the match engine. An
    /// event's `scope` is its resource hint.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn ingest_events(&self, events: &[NewEvent]) -> Result<IngestReport> {
        let mut tx = self.persistence.begin().await?;
        let created = tx.bulk_create_events(events).await?;

        let mut by_tenant: BTreeMap<Uuid, Vec<MatchableEvent>> = BTreeMap::new();
        for event in &created {
            by_tenant
                .entry(event.tenant_id)
                .or_default()
                .push(MatchableEvent {
                    key: event.key.clone(),
                    resource_hint: event.scope.clone(),
                    payload: event.payload.clone(),
                });
        }

        let mut effects = MatchEffects::default();
        for (tenant_id, matchable) in by_tenant {
            effects.extend(
                self.propagate(&mut *tx, tenant_id, ConditionEventType::User, matchable)
                    .await?,
            );
        }
        tx.commit().await?;
        info!(
            events = created.len(),
            fired = effects.fired_matches.len(),
            "Ingested events"
        );
        Ok(IngestReport {
            events: created,
            effects,
        })
    }

    /// Publish internal events (for example from an external runtime) and
    /// fire what they satisfy.
    pub async fn publish_internal_events(
        &self,
        tenant_id: Uuid,
        events: Vec<MatchableEvent>,
    ) -> Result<MatchEffects> {
        let mut tx = self.persistence.begin().await?;
        let effects = self
            .propagate(&mut *tx, tenant_id, ConditionEventType::Internal, events)
            .await?;
        tx.commit().await?;
        Ok(effects)
    }

    /// Match events, fire satisfied matches, and repeat with the internal
    /// events of tasks created in a terminal state until none are left.
    async fn propagate(
        &self,
        tx: &mut dyn PersistenceTx,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        events: Vec<MatchableEvent>,
    ) -> Result<MatchEffects> {
        let mut effects = MatchEffects::default();
        let mut event_type = event_type;
        let mut pending = events;
        let mut rounds = 0usize;

        // Ends because a match fires at most once.
        while !pending.is_empty() {
            let fired = self
                .match_events(tx, tenant_id, event_type, &pending)
                .await?;
            pending = self
                .fire_matches(tx, tenant_id, fired, &mut effects)
                .await?;
            event_type = ConditionEventType::Internal;
            rounds += 1;
        }
        if rounds > 1 {
            debug!(tenant_id = %tenant_id, rounds, "Match cascade settled");
        }
        Ok(effects)
    }

    /// Satisfy the conditions the events match. Each condition takes the
    /// payload of the first event that matches it and passes its expression.
    async fn match_events(
        &self,
        tx: &mut dyn PersistenceTx,
        tenant_id: Uuid,
        event_type: ConditionEventType,
        events: &[MatchableEvent],
    ) -> Result<Vec<SatisfiedMatch>> {
        let mut hinted: HashSet<HintedEventKey> = HashSet::new();
        let mut unhinted: Vec<String> = Vec::new();
        for event in events {
            match &event.resource_hint {
                Some(hint) => {
                    hinted.insert(HintedEventKey {
                        event_key: event.key.clone(),
                        resource_hint: hint.clone(),
                    });
                }
                None => unhinted.push(event.key.clone()),
            }
        }
        unhinted.sort_unstable();
        unhinted.dedup();

        let mut candidates = Vec::new();
        if !hinted.is_empty() {
            let keys: Vec<HintedEventKey> = hinted.into_iter().collect();
            candidates.extend(
                tx.list_match_conditions_with_hint(tenant_id, event_type, &keys)
                    .await?,
            );
        }
        if !unhinted.is_empty() {
            candidates.extend(
                tx.list_match_conditions_without_hint(tenant_id, event_type, &unhinted)
                    .await?,
            );
        }

        let satisfactions: Vec<ConditionSatisfaction> = candidates
            .iter()
            .filter_map(|condition| {
                events
                    .iter()
                    .find(|e| {
                        e.key == condition.event_key
                            && e.resource_hint == condition.event_resource_hint
                            && condition
                                .expression
                                .as_deref()
                                .is_none_or(|expr| self.evaluator.accepts(expr, &e.payload))
                    })
                    .map(|e| ConditionSatisfaction {
                        match_id: condition.match_id,
                        condition_id: condition.id,
                        data: Some(e.payload.clone()),
                    })
            })
            .collect();

        if satisfactions.is_empty() {
            return Ok(Vec::new());
        }
        tx.satisfy_match_conditions(tenant_id, &satisfactions).await
    }

    /// Apply fired matches. Returns the internal events of tasks created in
    /// a terminal state.
    async fn fire_matches(
        &self,
        tx: &mut dyn PersistenceTx,
        tenant_id: Uuid,
        fired: Vec<SatisfiedMatch>,
        effects: &mut MatchEffects,
    ) -> Result<Vec<MatchableEvent>> {
        let mut new_tasks = Vec::new();
        let mut signal_events = Vec::new();

        for SatisfiedMatch { matched, action } in fired {
            effects.fired_matches.push(matched.id);
            match matched.target {
                MatchTarget::DagTrigger(trigger) => {
                    new_tasks.push(trigger_task(*trigger, matched.existing_data, action));
                }
                MatchTarget::Signal(signal) => {
                    let Some(task) = tx
                        .get_task(tenant_id, signal.task_id, signal.task_inserted_at)
                        .await?
                    else {
                        warn!(
                            match_id = matched.id,
                            task_id = signal.task_id,
                            "Signal target no longer exists"
                        );
                        continue;
                    };
                    signal_events.push(NewTaskEvent {
                        task_id: task.id,
                        task_inserted_at: task.inserted_at,
                        retry_count: task.retry_count,
                        event_type: TaskEventType::SignalCompleted,
                        event_key: Some(signal.signal_key),
                        data: matched.existing_data,
                        external_id: Some(signal.external_id),
                    });
                    effects.signalled_tasks.push(task.attempt());
                }
            }
        }

        if !signal_events.is_empty() {
            tx.insert_task_events(tenant_id, &signal_events).await?;
        }
        if new_tasks.is_empty() {
            return Ok(Vec::new());
        }
        let (created, cascaded) = self.materialize(tx, tenant_id, &new_tasks).await?;
        effects.created_tasks.extend(created);
        Ok(cascaded)
    }

    /// Create tasks and their initial events. Returns the tasks and the
    /// internal events of those created in a terminal state.
    async fn materialize(
        &self,
        tx: &mut dyn PersistenceTx,
        tenant_id: Uuid,
        tasks: &[NewTask],
    ) -> Result<(Vec<Task>, Vec<MatchableEvent>)> {
        let created = tx.create_tasks(tenant_id, tasks).await?;

        let mut events = Vec::with_capacity(created.len());
        let mut internal = Vec::new();
        for task in &created {
            let data = reason_data(task.initial_state_reason.as_deref());
            let (event_type, internal_key) = match task.initial_state {
                InitialState::Queued => (TaskEventType::Queued, None),
                InitialState::Skipped => (TaskEventType::Skipped, Some(TASK_SKIPPED)),
                InitialState::Cancelled => (TaskEventType::Cancelled, Some(TASK_CANCELLED)),
                InitialState::Failed => (TaskEventType::Failed, Some(TASK_FAILED)),
            };
            if let Some(key) = internal_key {
                internal.push(MatchableEvent::for_task(
                    key,
                    task.external_id,
                    data.clone().unwrap_or(Value::Null),
                ));
            }
            events.push(attempt_event(task.attempt(), task.external_id, event_type, data));
        }
        tx.insert_task_events(tenant_id, &events).await?;
        Ok((created, internal))
    }
}

fn log_finished(report: &ReleaseReport, event_type: TaskEventType) {
    let stale = report
        .released
        .iter()
        .filter(|r| !r.is_current_retry)
        .count();
    if stale > 0 {
        debug!(stale, "Released superseded attempts");
    }
    debug!(
        released = report.released.len(),
        event_type = event_type.as_str(),
        fired = report.effects.fired_matches.len(),
        "Finished attempts"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        ConcurrencyDimension, HoldingArea, ParentTaskRef, SignalTarget, SqlitePersistence,
        StickyStrategy,
    };
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_coordinator() -> TaskCoordinator {
        test_coordinator_with_pool().await.0
    }

    async fn test_coordinator_with_pool() -> (TaskCoordinator, SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        let coordinator = TaskCoordinator::new(Arc::new(SqlitePersistence::new(pool.clone())));
        (coordinator, pool)
    }

    fn step(readable_id: &str) -> StepConfig {
        StepConfig {
            queue: "default".to_string(),
            action_id: format!("demo:{readable_id}"),
            step_id: Uuid::new_v4(),
            step_readable_id: readable_id.to_string(),
            step_index: 0,
            workflow_id: Uuid::nil(),
            workflow_version_id: Uuid::nil(),
            display_name: readable_id.to_string(),
            schedule_timeout_secs: 300,
            step_timeout_secs: Some(60),
            sticky: StickyStrategy::None,
            retry_backoff_factor: None,
            retry_max_backoff_secs: None,
            concurrency: vec![],
        }
    }

    async fn create_dag(coordinator: &TaskCoordinator, tenant: Uuid, run: Uuid) -> Dag {
        coordinator
            .create_dags(
                tenant,
                &[NewDag {
                    external_id: run,
                    display_name: "dag".to_string(),
                    workflow_id: Uuid::nil(),
                    workflow_version_id: Uuid::nil(),
                    parent_task_external_id: None,
                }],
            )
            .await
            .unwrap()
            .remove(0)
    }

    /// Trigger for a step that runs after `parent`.
    fn child_trigger(
        dag: &Dag,
        readable_id: &str,
        parent: ParentTaskRef,
        external_id: Uuid,
    ) -> NewMatch {
        NewMatch {
            target: MatchTarget::DagTrigger(Box::new(DagTrigger {
                dag: dag.as_ref(),
                step: step(readable_id),
                external_id,
                workflow_run_id: dag.external_id,
                parent: Some(parent),
                child_index: Some(0),
                child_key: None,
                priority: None,
            })),
            existing_data: None,
            conditions: dependency_conditions(parent.external_id, "parent"),
        }
    }

    fn root_task(dag: &Dag, readable_id: &str) -> NewTask {
        let mut task = NewTask::queued(dag.external_id, step(readable_id), json!({}));
        task.dag = Some(dag.as_ref());
        task
    }

    fn parent_ref(task: &Task) -> ParentTaskRef {
        ParentTaskRef {
            task_id: task.id,
            inserted_at: task.inserted_at,
            external_id: task.external_id,
        }
    }

    #[test]
    fn test_retry_delay() {
        let mut s = step("a");
        assert_eq!(retry_delay(&s, 3), chrono::Duration::zero());

        s.retry_backoff_factor = Some(2.0);
        assert_eq!(retry_delay(&s, 0), chrono::Duration::seconds(1));
        assert_eq!(retry_delay(&s, 3), chrono::Duration::seconds(8));

        s.retry_max_backoff_secs = Some(5);
        assert_eq!(retry_delay(&s, 3), chrono::Duration::seconds(5));
    }

    #[test]
    fn test_dependency_conditions_share_one_group() {
        let parent = Uuid::new_v4();
        let conditions = dependency_conditions(parent, "a");
        assert_eq!(conditions.len(), 4);
        assert!(conditions.iter().all(|c| c.or_group_id == conditions[0].or_group_id));
        assert!(
            conditions
                .iter()
                .all(|c| c.event_resource_hint.as_deref() == Some(parent.to_string().as_str()))
        );
        let cancels = conditions
            .iter()
            .filter(|c| c.action == ConditionAction::Cancel)
            .count();
        assert_eq!(cancels, 2);
    }

    #[tokio::test]
    async fn test_completing_parent_creates_child() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;

        let a = coordinator
            .create_tasks(tenant, &[root_task(&dag, "a")])
            .await
            .unwrap()
            .remove(0);
        let b_id = Uuid::new_v4();
        coordinator
            .create_dag_triggers(tenant, &[child_trigger(&dag, "b", parent_ref(&a), b_id)])
            .await
            .unwrap();

        let report = coordinator
            .complete_tasks(
                tenant,
                &[TaskOutcome {
                    attempt: a.attempt(),
                    output: Some(json!({"total": 42})),
                }],
            )
            .await
            .unwrap();

        assert_eq!(report.released.len(), 1);
        assert_eq!(report.effects.created_tasks.len(), 1);
        let b = &report.effects.created_tasks[0];
        assert_eq!(b.external_id, b_id);
        assert_eq!(b.parent.map(|p| p.external_id), Some(a.external_id));
        assert_eq!(b.child_index, Some(0));
        assert_eq!(b.initial_state, InitialState::Queued);
        assert_eq!(b.input, json!({"parent": {"total": 42}}));

        let areas = coordinator
            .persistence()
            .holding_areas(tenant, b.attempt())
            .await
            .unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue]);

        let events = coordinator
            .persistence()
            .list_task_events(tenant, a.id, a.inserted_at)
            .await
            .unwrap();
        let types: Vec<TaskEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![TaskEventType::Queued, TaskEventType::Completed]);
    }

    #[tokio::test]
    async fn test_completing_twice_fires_once() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let a = coordinator
            .create_tasks(tenant, &[root_task(&dag, "a")])
            .await
            .unwrap()
            .remove(0);
        coordinator
            .create_dag_triggers(
                tenant,
                &[child_trigger(&dag, "b", parent_ref(&a), Uuid::new_v4())],
            )
            .await
            .unwrap();

        let outcome = TaskOutcome {
            attempt: a.attempt(),
            output: None,
        };
        let first = coordinator
            .complete_tasks(tenant, std::slice::from_ref(&outcome))
            .await
            .unwrap();
        let second = coordinator.complete_tasks(tenant, &[outcome]).await.unwrap();

        assert_eq!(first.effects.created_tasks.len(), 1);
        assert!(second.effects.created_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_failure_cancels_dependant() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let a = coordinator
            .create_tasks(tenant, &[root_task(&dag, "a")])
            .await
            .unwrap()
            .remove(0);
        coordinator
            .create_dag_triggers(
                tenant,
                &[child_trigger(&dag, "b", parent_ref(&a), Uuid::new_v4())],
            )
            .await
            .unwrap();

        let report = coordinator
            .fail_tasks(
                tenant,
                &[TaskFailure {
                    attempt: a.attempt(),
                    error: Some(json!({"message": "boom"})),
                    retry: false,
                }],
            )
            .await
            .unwrap();

        let b = &report.effects.created_tasks[0];
        assert_eq!(b.initial_state, InitialState::Cancelled);
        let areas = coordinator
            .persistence()
            .holding_areas(tenant, b.attempt())
            .await
            .unwrap();
        assert!(areas.is_empty());
    }

    #[tokio::test]
    async fn test_skip_cascades_through_dag() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;

        // a -> b -> c, with a created skipped.
        let mut a_new = root_task(&dag, "a");
        a_new.initial_state = InitialState::Skipped;
        let a_ref = ParentTaskRef {
            task_id: 0,
            inserted_at: Utc::now(),
            external_id: a_new.external_id,
        };
        let b_id = Uuid::new_v4();
        let c_id = Uuid::new_v4();
        let b_ref = ParentTaskRef {
            external_id: b_id,
            ..a_ref
        };
        coordinator
            .create_dag_triggers(
                tenant,
                &[
                    child_trigger(&dag, "b", a_ref, b_id),
                    child_trigger(&dag, "c", b_ref, c_id),
                ],
            )
            .await
            .unwrap();

        coordinator.create_tasks(tenant, &[a_new]).await.unwrap();

        for id in [b_id, c_id] {
            let task = coordinator
                .persistence()
                .get_task_by_external_id(tenant, id)
                .await
                .unwrap()
                .expect("dependant should be created");
            assert_eq!(task.initial_state, InitialState::Skipped);
        }
    }

    #[tokio::test]
    async fn test_stale_completion_publishes_nothing() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let a = coordinator
            .create_tasks(tenant, &[root_task(&dag, "a")])
            .await
            .unwrap()
            .remove(0);
        coordinator
            .create_dag_triggers(
                tenant,
                &[child_trigger(&dag, "b", parent_ref(&a), Uuid::new_v4())],
            )
            .await
            .unwrap();

        let retried = coordinator
            .fail_tasks(
                tenant,
                &[TaskFailure {
                    attempt: a.attempt(),
                    error: None,
                    retry: true,
                }],
            )
            .await
            .unwrap();
        assert_eq!(retried.retried.len(), 1);
        assert_eq!(retried.retried[0].retry_count, 1);

        let report = coordinator
            .complete_tasks(
                tenant,
                &[TaskOutcome {
                    attempt: a.attempt(),
                    output: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(report.released.len(), 1);
        assert!(!report.released[0].is_current_retry);
        assert!(report.effects.fired_matches.is_empty());
    }

    #[tokio::test]
    async fn test_scoped_event_signals_task() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let task = coordinator
            .create_tasks(tenant, &[root_task(&dag, "wait")])
            .await
            .unwrap()
            .remove(0);

        coordinator
            .create_signal_matches(
                tenant,
                &[NewMatch {
                    target: MatchTarget::Signal(SignalTarget {
                        task_id: task.id,
                        task_inserted_at: task.inserted_at,
                        external_id: task.external_id,
                        signal_key: "approval".to_string(),
                    }),
                    existing_data: None,
                    conditions: vec![NewMatchCondition {
                        event_type: ConditionEventType::User,
                        event_key: "order.approved".to_string(),
                        event_resource_hint: Some("order-7".to_string()),
                        readable_data_key: "approval".to_string(),
                        expression: None,
                        or_group_id: Uuid::new_v4(),
                        action: ConditionAction::Create,
                    }],
                }],
            )
            .await
            .unwrap();

        let event = |scope: Option<&str>| NewEvent {
            tenant_id: tenant,
            external_id: Uuid::new_v4(),
            seen_at: None,
            key: "order.approved".to_string(),
            payload: json!({"by": "alice"}),
            additional_metadata: None,
            scope: scope.map(str::to_string),
            triggering_webhook_name: None,
        };

        // Unscoped and wrongly scoped events do not reach the hinted condition.
        let report = coordinator
            .ingest_events(&[event(None), event(Some("order-8"))])
            .await
            .unwrap();
        assert!(report.effects.signalled_tasks.is_empty());

        let report = coordinator.ingest_events(&[event(Some("order-7"))]).await.unwrap();
        assert_eq!(report.effects.signalled_tasks, vec![task.attempt()]);

        let events = coordinator
            .persistence()
            .list_task_events(tenant, task.id, task.inserted_at)
            .await
            .unwrap();
        let signal = events
            .iter()
            .find(|e| e.event_type == TaskEventType::SignalCompleted)
            .expect("signal event recorded");
        assert_eq!(signal.event_key.as_deref(), Some("approval"));
        assert_eq!(signal.data, Some(json!({"approval": {"by": "alice"}})));
    }

    #[tokio::test]
    async fn test_expression_evaluator_filters_payloads() {
        struct OnlyLarge;
        impl ExpressionEvaluator for OnlyLarge {
            fn accepts(&self, _expression: &str, payload: &Value) -> bool {
                payload["amount"].as_i64().is_some_and(|n| n > 100)
            }
        }

        let coordinator = test_coordinator()
            .await
            .with_evaluator(Arc::new(OnlyLarge));
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let b_id = Uuid::new_v4();
        coordinator
            .create_dag_triggers(
                tenant,
                &[NewMatch {
                    target: MatchTarget::DagTrigger(Box::new(DagTrigger {
                        dag: dag.as_ref(),
                        step: step("on_large_order"),
                        external_id: b_id,
                        workflow_run_id: dag.external_id,
                        parent: None,
                        child_index: None,
                        child_key: None,
                        priority: Some(3),
                    })),
                    existing_data: None,
                    conditions: vec![NewMatchCondition {
                        event_type: ConditionEventType::User,
                        event_key: "order.created".to_string(),
                        event_resource_hint: None,
                        readable_data_key: "order".to_string(),
                        expression: Some("input.amount > 100".to_string()),
                        or_group_id: Uuid::new_v4(),
                        action: ConditionAction::Create,
                    }],
                }],
            )
            .await
            .unwrap();

        let order = |amount: i64| NewEvent {
            tenant_id: tenant,
            external_id: Uuid::new_v4(),
            seen_at: None,
            key: "order.created".to_string(),
            payload: json!({"amount": amount}),
            additional_metadata: None,
            scope: None,
            triggering_webhook_name: None,
        };

        let report = coordinator.ingest_events(&[order(5)]).await.unwrap();
        assert!(report.effects.created_tasks.is_empty());

        let report = coordinator.ingest_events(&[order(500)]).await.unwrap();
        assert_eq!(report.effects.created_tasks.len(), 1);
        assert_eq!(report.effects.created_tasks[0].priority, 3);
        assert_eq!(
            report.effects.created_tasks[0].input,
            json!({"order": {"amount": 500}})
        );
    }

    #[tokio::test]
    async fn test_assign_and_time_out_expired() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let task = coordinator
            .create_tasks(tenant, &[root_task(&dag, "slow")])
            .await
            .unwrap()
            .remove(0);

        let worker = Uuid::new_v4();
        let assigned = coordinator
            .assign_tasks(tenant, "default", worker, 5)
            .await
            .unwrap();
        assert_eq!(assigned.len(), 1);

        assert_eq!(coordinator.time_out_expired(Utc::now(), 10).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(coordinator.time_out_expired(later, 10).await.unwrap(), 1);

        let events = coordinator
            .persistence()
            .list_task_events(tenant, task.id, task.inserted_at)
            .await
            .unwrap();
        assert!(events.iter().any(|e| e.event_type == TaskEventType::Assigned));
        assert!(events.iter().any(|e| e.event_type == TaskEventType::TimedOut));
    }

    #[tokio::test]
    async fn test_failed_trigger_creation_rolls_back_release() {
        let (coordinator, pool) = test_coordinator_with_pool().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let a = coordinator
            .create_tasks(tenant, &[root_task(&dag, "a")])
            .await
            .unwrap()
            .remove(0);
        let b_id = Uuid::new_v4();
        let trigger = coordinator
            .create_dag_triggers(tenant, &[child_trigger(&dag, "b", parent_ref(&a), b_id)])
            .await
            .unwrap()
            .remove(0);

        sqlx::query(
            "CREATE TRIGGER reject_b BEFORE INSERT ON tasks \
             WHEN NEW.step_readable_id = 'b' \
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let outcome = TaskOutcome {
            attempt: a.attempt(),
            output: Some(json!({"total": 1})),
        };
        let result = coordinator
            .complete_tasks(tenant, std::slice::from_ref(&outcome))
            .await;
        assert!(result.is_err());

        // Release, events and matching rolled back with the insert.
        let persistence = coordinator.persistence();
        let areas = persistence.holding_areas(tenant, a.attempt()).await.unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue]);
        let events = persistence
            .list_task_events(tenant, a.id, a.inserted_at)
            .await
            .unwrap();
        let types: Vec<TaskEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![TaskEventType::Queued]);
        let pending = persistence.get_match(tenant, trigger.id).await.unwrap().unwrap();
        assert!(!pending.is_satisfied);
        let conditions = persistence
            .list_match_conditions(tenant, trigger.id)
            .await
            .unwrap();
        assert!(conditions.iter().all(|c| !c.is_satisfied));

        sqlx::query("DROP TRIGGER reject_b")
            .execute(&pool)
            .await
            .unwrap();

        let report = coordinator.complete_tasks(tenant, &[outcome]).await.unwrap();
        assert_eq!(report.effects.created_tasks.len(), 1);
        assert_eq!(report.effects.created_tasks[0].external_id, b_id);
        assert_eq!(report.effects.fired_matches, vec![trigger.id]);
    }

    #[tokio::test]
    async fn test_fill_task_slots_queues_waiting_attempts() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let dag = create_dag(&coordinator, tenant, Uuid::new_v4()).await;
        let mut limited = root_task(&dag, "limited");
        limited.step.concurrency = vec![ConcurrencyDimension {
            parent_strategy_id: None,
            strategy_id: 11,
            key: "tenant-a".to_string(),
        }];
        let task = coordinator
            .create_tasks(tenant, &[limited])
            .await
            .unwrap()
            .remove(0);

        let queued = coordinator.fill_task_slots(tenant, 11, 2).await.unwrap();
        assert_eq!(queued, vec![task.attempt()]);
    }
}
