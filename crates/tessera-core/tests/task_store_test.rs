// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task store and concurrency tests across backends.

mod common;

use common::*;
use serde_json::json;
use tessera_core::CoreError;
use tessera_core::coordinator::{TaskFailure, TaskOutcome};
use tessera_core::persistence::{
    ConcurrencyDimension, ExpressionEval, ExpressionEvalKind, HoldingArea, InitialState, NewTask,
    NewTaskEvent, TaskAttempt, TaskEventType, TaskReplay,
};
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_batch_writes_nothing() {
    for ctx in TestContext::all().await {
        let step = step("atomic", "a");
        let good = NewTask::queued(Uuid::new_v4(), step.clone(), json!({}));
        let mut bad = NewTask::queued(Uuid::new_v4(), step, json!({}));
        bad.child_key = Some("orphan".to_string());

        let err = ctx
            .persistence
            .create_tasks(ctx.tenant_id, &[good.clone(), bad])
            .await
            .unwrap_err();
        assert!(
            matches!(err, CoreError::ValidationError { .. }),
            "{}: {err}",
            ctx.name
        );

        let found = ctx
            .persistence
            .get_task_by_external_id(ctx.tenant_id, good.external_id)
            .await
            .unwrap();
        assert!(found.is_none(), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_creation_picks_holding_state() {
    for ctx in TestContext::all().await {
        let plain = ctx.create_tasks(1, &step("hold", "plain")).await.remove(0);
        let limited = ctx
            .create_tasks(1, &limited_step("hold", 5, "k"))
            .await
            .remove(0);

        let areas = ctx
            .persistence
            .holding_areas(ctx.tenant_id, plain.attempt())
            .await
            .unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue], "{}", ctx.name);

        let areas = ctx
            .persistence
            .holding_areas(ctx.tenant_id, limited.attempt())
            .await
            .unwrap();
        assert!(areas.is_empty(), "{}", ctx.name);
        let slots = ctx
            .persistence
            .list_concurrency_slots(ctx.tenant_id, limited.id, limited.inserted_at)
            .await
            .unwrap();
        assert_eq!(slots.len(), 1, "{}", ctx.name);
        assert!(!slots[0].is_filled, "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_holding_areas_stay_exclusive_through_retry() {
    for ctx in TestContext::all().await {
        let mut s = step("exclusive", "a");
        s.retry_backoff_factor = Some(2.0);
        let task = ctx.create_tasks(1, &s).await.remove(0);
        ctx.coordinator
            .assign_tasks(ctx.tenant_id, "exclusive", Uuid::new_v4(), 1)
            .await
            .unwrap();

        let report = ctx
            .coordinator
            .fail_tasks(
                ctx.tenant_id,
                &[TaskFailure {
                    attempt: task.attempt(),
                    error: Some(json!({"message": "flaky"})),
                    retry: true,
                }],
            )
            .await
            .unwrap();
        let retried = &report.retried[0];
        assert_eq!(retried.app_retry_count, 1, "{}", ctx.name);

        for attempt in [task.attempt(), retried.attempt()] {
            let areas = ctx
                .persistence
                .holding_areas(ctx.tenant_id, attempt)
                .await
                .unwrap();
            assert!(areas.len() <= 1, "{}: {attempt:?} in {areas:?}", ctx.name);
        }

        let events = ctx
            .persistence
            .list_task_events(ctx.tenant_id, task.id, task.inserted_at)
            .await
            .unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.event_type == TaskEventType::RetryScheduled),
            "{}",
            ctx.name
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_resets_retry_counters() {
    for ctx in TestContext::all().await {
        let task = ctx.create_tasks(1, &step("replay", "a")).await.remove(0);
        ctx.coordinator
            .fail_tasks(
                ctx.tenant_id,
                &[TaskFailure {
                    attempt: task.attempt(),
                    error: None,
                    retry: true,
                }],
            )
            .await
            .unwrap();

        let replayed = ctx
            .coordinator
            .replay_tasks(
                ctx.tenant_id,
                &[TaskReplay {
                    task_id: task.id,
                    inserted_at: task.inserted_at,
                    input: None,
                    initial_state: InitialState::Queued,
                    initial_state_reason: None,
                    concurrency_keys: vec![],
                }],
            )
            .await
            .unwrap();
        assert_eq!(replayed.superseded.len(), 1, "{}", ctx.name);
        assert_eq!(replayed.superseded[0].attempt.retry_count, 1, "{}", ctx.name);
        assert_eq!(replayed.superseded[0].worker_id, None, "{}", ctx.name);
        let replayed = &replayed.tasks[0];

        assert_eq!(replayed.external_id, task.external_id, "{}", ctx.name);
        assert_eq!(replayed.retry_count, 2, "{}", ctx.name);
        assert_eq!(replayed.app_retry_count, 0, "{}", ctx.name);
        assert_eq!(replayed.internal_retry_count, 0, "{}", ctx.name);

        // The retry item of the superseded attempt is gone.
        let superseded = TaskAttempt {
            retry_count: 1,
            ..task.attempt()
        };
        let areas = ctx
            .persistence
            .holding_areas(ctx.tenant_id, superseded)
            .await
            .unwrap();
        assert!(areas.is_empty(), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keyed_events_are_deduplicated() {
    for ctx in TestContext::all().await {
        let task = ctx.create_tasks(1, &step("dedup", "a")).await.remove(0);
        let event = NewTaskEvent {
            task_id: task.id,
            task_inserted_at: task.inserted_at,
            retry_count: 0,
            event_type: TaskEventType::Completed,
            event_key: Some("0".to_string()),
            data: None,
            external_id: Some(task.external_id),
        };
        let written = ctx
            .persistence
            .insert_task_events(ctx.tenant_id, &[event.clone(), event.clone()])
            .await
            .unwrap();
        assert_eq!(written, 1, "{}", ctx.name);

        let unkeyed = NewTaskEvent {
            event_key: None,
            ..event
        };
        let written = ctx
            .persistence
            .insert_task_events(ctx.tenant_id, &[unkeyed.clone(), unkeyed])
            .await
            .unwrap();
        assert_eq!(written, 2, "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expression_evals_last_write_wins() {
    for ctx in TestContext::all().await {
        let task = ctx.create_tasks(1, &step("evals", "a")).await.remove(0);
        let eval = |value: i64| ExpressionEval {
            task_id: task.id,
            task_inserted_at: task.inserted_at,
            kind: ExpressionEvalKind::Priority,
            key: "priority".to_string(),
            value_str: None,
            value_int: Some(value),
        };
        ctx.persistence
            .upsert_expression_evals(&[eval(1)])
            .await
            .unwrap();
        ctx.persistence
            .upsert_expression_evals(&[eval(3)])
            .await
            .unwrap();

        let evals = ctx
            .persistence
            .list_expression_evals(ctx.tenant_id, task.id, task.inserted_at)
            .await
            .unwrap();
        assert_eq!(evals, vec![eval(3)], "{}", ctx.name);

        let foreign = ctx
            .persistence
            .list_expression_evals(Uuid::new_v4(), task.id, task.inserted_at)
            .await
            .unwrap();
        assert!(foreign.is_empty(), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workflow_strategy_admits_one_run_at_a_time() {
    for ctx in TestContext::all().await {
        let queue = format!("runs-{}", ctx.tenant_id);
        let mut s = step(&queue, "a");
        s.concurrency = vec![ConcurrencyDimension {
            parent_strategy_id: Some(100),
            strategy_id: 101,
            key: "account".to_string(),
        }];
        let created = ctx
            .coordinator
            .create_tasks(
                ctx.tenant_id,
                &[
                    NewTask::queued(Uuid::new_v4(), s.clone(), json!({})),
                    NewTask::queued(Uuid::new_v4(), s.clone(), json!({})),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            ctx.coordinator
                .fill_workflow_slots(ctx.tenant_id, 100, 1)
                .await
                .unwrap(),
            1,
            "{}",
            ctx.name
        );
        let queued = ctx
            .coordinator
            .fill_task_slots(ctx.tenant_id, 101, 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1, "{}", ctx.name);
        let (first, second) = if queued[0] == created[0].attempt() {
            (&created[0], &created[1])
        } else {
            (&created[1], &created[0])
        };
        assert_eq!(queued[0], first.attempt(), "{}", ctx.name);

        ctx.coordinator
            .complete_tasks(
                ctx.tenant_id,
                &[TaskOutcome {
                    attempt: first.attempt(),
                    output: None,
                }],
            )
            .await
            .unwrap();
        let aggregate = ctx
            .persistence
            .get_workflow_concurrency_slot(
                ctx.tenant_id,
                100,
                s.workflow_version_id,
                first.workflow_run_id,
            )
            .await
            .unwrap();
        assert!(aggregate.is_none(), "{}", ctx.name);

        let waiting = ctx
            .persistence
            .get_workflow_concurrency_slot(
                ctx.tenant_id,
                100,
                s.workflow_version_id,
                second.workflow_run_id,
            )
            .await
            .unwrap()
            .expect("aggregate of the waiting run");
        assert_eq!(waiting.child_strategy_ids, vec![101], "{}", ctx.name);
        let foreign = ctx
            .persistence
            .get_workflow_concurrency_slot(
                Uuid::new_v4(),
                100,
                s.workflow_version_id,
                second.workflow_run_id,
            )
            .await
            .unwrap();
        assert!(foreign.is_none(), "{}", ctx.name);

        assert_eq!(
            ctx.coordinator
                .fill_workflow_slots(ctx.tenant_id, 100, 1)
                .await
                .unwrap(),
            1,
            "{}",
            ctx.name
        );
        let queued = ctx
            .coordinator
            .fill_task_slots(ctx.tenant_id, 101, 10)
            .await
            .unwrap();
        assert_eq!(queued, vec![second.attempt()], "{}", ctx.name);
    }
}
