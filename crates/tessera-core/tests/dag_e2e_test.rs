// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end DAG runs through the coordinator: create, dispatch, complete
//! and cascade.

mod common;

use common::*;
use serde_json::json;
use tessera_core::coordinator::{TaskFailure, TaskOutcome, dependency_conditions};
use tessera_core::persistence::{
    Dag, DagTrigger, HoldingArea, InitialState, MatchTarget, NewMatch, ParentTaskRef, Task,
    TaskEventType, TaskReplay,
};
use uuid::Uuid;

fn parent_ref(task: &Task) -> ParentTaskRef {
    ParentTaskRef {
        task_id: task.id,
        inserted_at: task.inserted_at,
        external_id: task.external_id,
    }
}

/// Trigger for `readable_id` after each parent, one or-group per parent.
fn after(dag: &Dag, queue: &str, readable_id: &str, parents: &[(&Task, &str)]) -> (Uuid, NewMatch) {
    let external_id = Uuid::new_v4();
    let conditions = parents
        .iter()
        .flat_map(|(task, key)| dependency_conditions(task.external_id, key))
        .collect();
    let trigger = NewMatch {
        target: MatchTarget::DagTrigger(Box::new(DagTrigger {
            dag: dag.as_ref(),
            step: step(queue, readable_id),
            external_id,
            workflow_run_id: dag.external_id,
            parent: parents.first().map(|(task, _)| parent_ref(task)),
            child_index: Some(0),
            child_key: None,
            priority: None,
        })),
        existing_data: None,
        conditions,
    };
    (external_id, trigger)
}

async fn run_to_completion(ctx: &TestContext, queue: &str, output: serde_json::Value) -> Vec<Task> {
    let worker = Uuid::new_v4();
    let assigned = ctx
        .coordinator
        .assign_tasks(ctx.tenant_id, queue, worker, 10)
        .await
        .unwrap();
    let outcomes: Vec<TaskOutcome> = assigned
        .iter()
        .map(|a| TaskOutcome {
            attempt: a.attempt,
            output: Some(output.clone()),
        })
        .collect();
    ctx.coordinator
        .complete_tasks(ctx.tenant_id, &outcomes)
        .await
        .unwrap()
        .effects
        .created_tasks
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_step_dag() {
    for ctx in TestContext::all().await {
        let queue = format!("dag-{}", ctx.tenant_id);
        let dag = ctx.create_dag().await;
        let a = ctx.create_dag_task(&dag, step(&queue, "a")).await;
        let (b_id, trigger) = after(&dag, &queue, "b", &[(&a, "a")]);
        ctx.coordinator
            .create_dag_triggers(ctx.tenant_id, &[trigger])
            .await
            .unwrap();

        let created = run_to_completion(&ctx, &queue, json!({"rows": 3})).await;
        assert_eq!(created.len(), 1, "{}", ctx.name);
        let b = &created[0];
        assert_eq!(b.external_id, b_id, "{}", ctx.name);
        assert_eq!(b.workflow_run_id, dag.external_id, "{}", ctx.name);
        assert_eq!(b.dag, Some(dag.as_ref()), "{}", ctx.name);
        assert_eq!(b.parent.map(|p| p.external_id), Some(a.external_id), "{}", ctx.name);
        assert_eq!(b.child_index, Some(0), "{}", ctx.name);
        assert_eq!(b.input, json!({"a": {"rows": 3}}), "{}", ctx.name);

        let areas = ctx
            .persistence
            .holding_areas(ctx.tenant_id, b.attempt())
            .await
            .unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue], "{}", ctx.name);

        let created = run_to_completion(&ctx, &queue, json!({})).await;
        assert!(created.is_empty(), "{}", ctx.name);

        let events = ctx
            .persistence
            .list_task_events(ctx.tenant_id, b.id, b.inserted_at)
            .await
            .unwrap();
        let types: Vec<TaskEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![TaskEventType::Queued, TaskEventType::Assigned, TaskEventType::Completed],
            "{}",
            ctx.name
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_diamond_waits_for_both_parents() {
    for ctx in TestContext::all().await {
        let queue = format!("diamond-{}", ctx.tenant_id);
        let dag = ctx.create_dag().await;
        let b = ctx.create_dag_task(&dag, step(&queue, "b")).await;
        let c = ctx.create_dag_task(&dag, step(&queue, "c")).await;
        let (d_id, trigger) = after(&dag, &queue, "d", &[(&b, "b"), (&c, "c")]);
        ctx.coordinator
            .create_dag_triggers(ctx.tenant_id, &[trigger])
            .await
            .unwrap();

        let first = ctx
            .coordinator
            .complete_tasks(
                ctx.tenant_id,
                &[TaskOutcome {
                    attempt: b.attempt(),
                    output: Some(json!("left")),
                }],
            )
            .await
            .unwrap();
        assert!(first.effects.created_tasks.is_empty(), "{}", ctx.name);

        let second = ctx
            .coordinator
            .complete_tasks(
                ctx.tenant_id,
                &[TaskOutcome {
                    attempt: c.attempt(),
                    output: Some(json!("right")),
                }],
            )
            .await
            .unwrap();
        assert_eq!(second.effects.created_tasks.len(), 1, "{}", ctx.name);
        let d = &second.effects.created_tasks[0];
        assert_eq!(d.external_id, d_id, "{}", ctx.name);
        assert_eq!(d.input, json!({"b": "left", "c": "right"}), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_parent_cancels_chain() {
    for ctx in TestContext::all().await {
        let queue = format!("fail-{}", ctx.tenant_id);
        let dag = ctx.create_dag().await;
        let a = ctx.create_dag_task(&dag, step(&queue, "a")).await;
        let (b_id, b_trigger) = after(&dag, &queue, "b", &[(&a, "a")]);
        // c depends on b, which does not exist yet: reference it by id.
        let b_placeholder = Task {
            external_id: b_id,
            ..a.clone()
        };
        let (c_id, c_trigger) = after(&dag, &queue, "c", &[(&b_placeholder, "b")]);
        ctx.coordinator
            .create_dag_triggers(ctx.tenant_id, &[b_trigger, c_trigger])
            .await
            .unwrap();

        ctx.coordinator
            .fail_tasks(
                ctx.tenant_id,
                &[TaskFailure {
                    attempt: a.attempt(),
                    error: Some(json!({"message": "upstream down"})),
                    retry: false,
                }],
            )
            .await
            .unwrap();

        for id in [b_id, c_id] {
            let task = ctx
                .persistence
                .get_task_by_external_id(ctx.tenant_id, id)
                .await
                .unwrap()
                .expect("dependant created");
            assert_eq!(task.initial_state, InitialState::Cancelled, "{}", ctx.name);
            let areas = ctx
                .persistence
                .holding_areas(ctx.tenant_id, task.attempt())
                .await
                .unwrap();
            assert!(areas.is_empty(), "{}", ctx.name);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_requeues_with_new_input() {
    for ctx in TestContext::all().await {
        let queue = format!("replay-{}", ctx.tenant_id);
        let dag = ctx.create_dag().await;
        let a = ctx.create_dag_task(&dag, step(&queue, "a")).await;
        run_to_completion(&ctx, &queue, json!({})).await;

        let replayed = ctx
            .coordinator
            .replay_tasks(
                ctx.tenant_id,
                &[TaskReplay {
                    task_id: a.id,
                    inserted_at: a.inserted_at,
                    input: Some(json!({"again": true})),
                    initial_state: InitialState::Queued,
                    initial_state_reason: None,
                    concurrency_keys: vec![],
                }],
            )
            .await
            .unwrap();
        assert_eq!(replayed.tasks.len(), 1, "{}", ctx.name);
        let task = &replayed.tasks[0];
        assert_eq!(task.retry_count, 1, "{}", ctx.name);
        assert_eq!(task.input, json!({"again": true}), "{}", ctx.name);

        let areas = ctx
            .persistence
            .holding_areas(ctx.tenant_id, task.attempt())
            .await
            .unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue], "{}", ctx.name);

        let events = ctx
            .persistence
            .list_task_events(ctx.tenant_id, a.id, a.inserted_at)
            .await
            .unwrap();
        assert_eq!(
            events.last().map(|e| e.event_type),
            Some(TaskEventType::Replayed),
            "{}",
            ctx.name
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_reports_running_worker() {
    for ctx in TestContext::all().await {
        let queue = format!("replay-running-{}", ctx.tenant_id);
        let dag = ctx.create_dag().await;
        let a = ctx.create_dag_task(&dag, step(&queue, "a")).await;
        let worker = Uuid::new_v4();
        let assigned = ctx
            .coordinator
            .assign_tasks(ctx.tenant_id, &queue, worker, 1)
            .await
            .unwrap();
        assert_eq!(assigned.len(), 1, "{}", ctx.name);

        let replayed = ctx
            .coordinator
            .replay_tasks(
                ctx.tenant_id,
                &[TaskReplay {
                    task_id: a.id,
                    inserted_at: a.inserted_at,
                    input: None,
                    initial_state: InitialState::Queued,
                    initial_state_reason: None,
                    concurrency_keys: vec![],
                }],
            )
            .await
            .unwrap();

        assert_eq!(replayed.superseded.len(), 1, "{}", ctx.name);
        let old = &replayed.superseded[0];
        assert_eq!(old.attempt, a.attempt(), "{}", ctx.name);
        assert_eq!(old.worker_id, Some(worker), "{}", ctx.name);
        assert!(!old.is_current_retry, "{}", ctx.name);

        // The superseded worker's late completion publishes nothing.
        let late = ctx
            .coordinator
            .complete_tasks(
                ctx.tenant_id,
                &[TaskOutcome {
                    attempt: a.attempt(),
                    output: None,
                }],
            )
            .await
            .unwrap();
        assert!(late.released.iter().all(|r| !r.is_current_retry), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_creation_rolls_back_parent_release() {
    for ctx in TestContext::all().await {
        let queue = format!("partial-{}", ctx.tenant_id);
        let dag = ctx.create_dag().await;
        let a = ctx.create_dag_task(&dag, step(&queue, "a")).await;
        let (b_id, b_trigger) = after(&dag, &queue, "b", &[(&a, "a")]);
        let trigger = ctx
            .coordinator
            .create_dag_triggers(ctx.tenant_id, &[b_trigger])
            .await
            .unwrap()
            .remove(0);

        ctx.reject_task_inserts("b").await;
        let outcome = TaskOutcome {
            attempt: a.attempt(),
            output: Some(json!({"rows": 3})),
        };
        let result = ctx
            .coordinator
            .complete_tasks(ctx.tenant_id, std::slice::from_ref(&outcome))
            .await;
        ctx.allow_task_inserts().await;
        assert!(result.is_err(), "{}", ctx.name);

        let areas = ctx
            .persistence
            .holding_areas(ctx.tenant_id, a.attempt())
            .await
            .unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue], "{}", ctx.name);
        let events = ctx
            .persistence
            .list_task_events(ctx.tenant_id, a.id, a.inserted_at)
            .await
            .unwrap();
        let types: Vec<TaskEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![TaskEventType::Queued], "{}", ctx.name);
        let pending = ctx
            .persistence
            .get_match(ctx.tenant_id, trigger.id)
            .await
            .unwrap()
            .expect("trigger kept");
        assert!(!pending.is_satisfied, "{}", ctx.name);
        assert!(
            ctx.persistence
                .get_task_by_external_id(ctx.tenant_id, b_id)
                .await
                .unwrap()
                .is_none(),
            "{}",
            ctx.name
        );

        let report = ctx
            .coordinator
            .complete_tasks(ctx.tenant_id, &[outcome])
            .await
            .unwrap();
        assert_eq!(report.effects.created_tasks.len(), 1, "{}", ctx.name);
        let b = &report.effects.created_tasks[0];
        assert_eq!(b.external_id, b_id, "{}", ctx.name);
        assert_eq!(b.input, json!({"a": {"rows": 3}}), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_cancels_deep_chain() {
    const DEPTH: usize = 70;

    for ctx in TestContext::all().await {
        let queue = format!("deep-{}", ctx.tenant_id);
        let dag = ctx.create_dag().await;
        let root = ctx.create_dag_task(&dag, step(&queue, "s0")).await;

        // Later steps do not exist yet: reference each parent by id.
        let mut parent = root.clone();
        let mut ids = Vec::with_capacity(DEPTH);
        let mut triggers = Vec::with_capacity(DEPTH);
        for depth in 1..=DEPTH {
            let (id, trigger) = after(&dag, &queue, &format!("s{depth}"), &[(&parent, "parent")]);
            ids.push(id);
            triggers.push(trigger);
            parent = Task {
                external_id: id,
                ..root.clone()
            };
        }
        ctx.coordinator
            .create_dag_triggers(ctx.tenant_id, &triggers)
            .await
            .unwrap();

        let report = ctx
            .coordinator
            .fail_tasks(
                ctx.tenant_id,
                &[TaskFailure {
                    attempt: root.attempt(),
                    error: None,
                    retry: false,
                }],
            )
            .await
            .unwrap();
        assert_eq!(report.effects.created_tasks.len(), DEPTH, "{}", ctx.name);

        let last = ctx
            .persistence
            .get_task_by_external_id(ctx.tenant_id, ids[DEPTH - 1])
            .await
            .unwrap()
            .expect("deepest step created");
        assert_eq!(last.initial_state, InitialState::Cancelled, "{}", ctx.name);
        let events = ctx
            .persistence
            .list_task_events(ctx.tenant_id, last.id, last.inserted_at)
            .await
            .unwrap();
        let types: Vec<TaskEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![TaskEventType::Cancelled], "{}", ctx.name);
    }
}
