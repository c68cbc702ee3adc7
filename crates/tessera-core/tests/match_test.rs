// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Match engine tests: hint isolation, or-groups and single firing.

mod common;

use common::*;
use futures::future::join_all;
use serde_json::json;
use tessera_core::persistence::{
    ConditionAction, ConditionEventType, ConditionSatisfaction, HintedEventKey, Match, MatchTarget,
    NewEvent, NewMatch, NewMatchCondition, SignalTarget, Task,
};
use uuid::Uuid;

fn condition(key: &str, hint: Option<&str>, data_key: &str, group: Uuid) -> NewMatchCondition {
    NewMatchCondition {
        event_type: ConditionEventType::User,
        event_key: key.to_string(),
        event_resource_hint: hint.map(str::to_string),
        readable_data_key: data_key.to_string(),
        expression: None,
        or_group_id: group,
        action: ConditionAction::Create,
    }
}

async fn signal_match(ctx: &TestContext, task: &Task, conditions: Vec<NewMatchCondition>) -> Match {
    ctx.coordinator
        .create_signal_matches(
            ctx.tenant_id,
            &[NewMatch {
                target: MatchTarget::Signal(SignalTarget {
                    task_id: task.id,
                    task_inserted_at: task.inserted_at,
                    external_id: task.external_id,
                    signal_key: "wake".to_string(),
                }),
                existing_data: Some(json!({"seed": true})),
                conditions,
            }],
        )
        .await
        .expect("Failed to create signal match")
        .remove(0)
}

fn event(ctx: &TestContext, key: &str, scope: Option<&str>, n: i64) -> NewEvent {
    NewEvent {
        tenant_id: ctx.tenant_id,
        external_id: Uuid::new_v4(),
        seen_at: None,
        key: key.to_string(),
        payload: payload(n),
        additional_metadata: None,
        scope: scope.map(str::to_string),
        triggering_webhook_name: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hinted_and_unhinted_lookups_are_disjoint() {
    for ctx in TestContext::all().await {
        let task = ctx.create_tasks(1, &step("match", "wait")).await.remove(0);
        let hinted = signal_match(
            &ctx,
            &task,
            vec![condition("invoice.paid", Some("inv-1"), "paid", Uuid::new_v4())],
        )
        .await;
        let unhinted = signal_match(
            &ctx,
            &task,
            vec![condition("invoice.paid", None, "paid", Uuid::new_v4())],
        )
        .await;

        let found = ctx
            .persistence
            .list_match_conditions_with_hint(
                ctx.tenant_id,
                ConditionEventType::User,
                &[HintedEventKey {
                    event_key: "invoice.paid".to_string(),
                    resource_hint: "inv-1".to_string(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "{}", ctx.name);
        assert_eq!(found[0].match_id, hinted.id, "{}", ctx.name);

        let found = ctx
            .persistence
            .list_match_conditions_without_hint(
                ctx.tenant_id,
                ConditionEventType::User,
                &["invoice.paid".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "{}", ctx.name);
        assert_eq!(found[0].match_id, unhinted.id, "{}", ctx.name);

        // Internal conditions are a separate namespace.
        let found = ctx
            .persistence
            .list_match_conditions_without_hint(
                ctx.tenant_id,
                ConditionEventType::Internal,
                &["invoice.paid".to_string()],
            )
            .await
            .unwrap();
        assert!(found.is_empty(), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_match_waits_for_every_or_group() {
    for ctx in TestContext::all().await {
        let task = ctx.create_tasks(1, &step("groups", "wait")).await.remove(0);
        let shipping = Uuid::new_v4();
        let billing = Uuid::new_v4();
        let m = signal_match(
            &ctx,
            &task,
            vec![
                condition("order.shipped", None, "shipped", shipping),
                condition("order.picked_up", None, "shipped", shipping),
                condition("order.paid", None, "paid", billing),
            ],
        )
        .await;

        let report = ctx
            .coordinator
            .ingest_events(&[event(&ctx, "order.picked_up", None, 1)])
            .await
            .unwrap();
        assert!(report.effects.fired_matches.is_empty(), "{}", ctx.name);

        let report = ctx
            .coordinator
            .ingest_events(&[event(&ctx, "order.paid", None, 2)])
            .await
            .unwrap();
        assert_eq!(report.effects.fired_matches, vec![m.id], "{}", ctx.name);

        let fired = ctx
            .persistence
            .get_match(ctx.tenant_id, m.id)
            .await
            .unwrap()
            .expect("match exists");
        assert!(fired.is_satisfied, "{}", ctx.name);
        assert_eq!(
            fired.existing_data,
            Some(json!({"seed": true, "shipped": {"n": 1}, "paid": {"n": 2}})),
            "{}",
            ctx.name
        );

        // A late event for the other branch of the group changes nothing.
        let report = ctx
            .coordinator
            .ingest_events(&[event(&ctx, "order.shipped", None, 3)])
            .await
            .unwrap();
        assert!(report.effects.fired_matches.is_empty(), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_satisfaction_fires_once() {
    for ctx in TestContext::all().await {
        let task = ctx.create_tasks(1, &step("race", "wait")).await.remove(0);
        let m = signal_match(
            &ctx,
            &task,
            vec![condition("race.go", None, "go", Uuid::new_v4())],
        )
        .await;
        let conditions = ctx
            .persistence
            .list_match_conditions(ctx.tenant_id, m.id)
            .await
            .unwrap();
        let satisfaction = ConditionSatisfaction {
            match_id: m.id,
            condition_id: conditions[0].id,
            data: Some(payload(0)),
        };

        let results = join_all((0..8).map(|_| {
            let persistence = ctx.persistence.clone();
            let satisfaction = satisfaction.clone();
            let tenant_id = ctx.tenant_id;
            tokio::spawn(async move {
                persistence
                    .satisfy_match_conditions(tenant_id, &[satisfaction])
                    .await
            })
        }))
        .await;

        let fired: usize = results
            .into_iter()
            .map(|r| r.expect("task panicked").expect("satisfy failed").len())
            .sum();
        assert_eq!(fired, 1, "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_are_tenant_scoped() {
    for ctx in TestContext::all().await {
        let task = ctx.create_tasks(1, &step("tenants", "wait")).await.remove(0);
        signal_match(
            &ctx,
            &task,
            vec![condition("shared.key", None, "x", Uuid::new_v4())],
        )
        .await;

        let mut foreign = event(&ctx, "shared.key", None, 1);
        foreign.tenant_id = Uuid::new_v4();
        let report = ctx.coordinator.ingest_events(&[foreign]).await.unwrap();
        assert_eq!(report.events.len(), 1, "{}", ctx.name);
        assert!(report.effects.fired_matches.is_empty(), "{}", ctx.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bulk_events_keep_input_order() {
    for ctx in TestContext::all().await {
        let events: Vec<NewEvent> = (0..20)
            .map(|n| event(&ctx, "bulk.order", Some("scope"), n))
            .collect();
        let created = ctx
            .persistence
            .bulk_create_events(&events)
            .await
            .unwrap();
        let ids: Vec<Uuid> = created.iter().map(|e| e.external_id).collect();
        let expected: Vec<Uuid> = events.iter().map(|e| e.external_id).collect();
        assert_eq!(ids, expected, "{}", ctx.name);
    }
}
