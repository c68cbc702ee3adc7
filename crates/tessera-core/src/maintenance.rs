// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background maintenance worker.
//!
//! Each tick:
//! 1. Re-enqueues retry items whose backoff has elapsed
//! 2. Re-enqueues rate-limited items whose requeue time has passed
//! 3. Times out runtimes past their deadline (dependants see a failure)
//! 4. Purges tasks, events and matches older than the retention age, when
//!    retention is enabled

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::MaintenanceConfig;
use crate::coordinator::TaskCoordinator;
use crate::error::{CoreError, Result};

/// What one maintenance tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Retry items moved back to the queue.
    pub retries_promoted: usize,
    /// Rate-limited items moved back to the queue.
    pub rate_limited_promoted: usize,
    /// Current attempts timed out.
    pub timed_out: usize,
    /// Rows deleted by retention.
    pub purged: u64,
}

impl MaintenanceReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Background worker that promotes due holding-area items, times out
/// expired runtimes and applies retention.
pub struct MaintenanceWorker {
    coordinator: TaskCoordinator,
    config: MaintenanceConfig,
    shutdown: Arc<Notify>,
}

impl MaintenanceWorker {
    /// Create a new maintenance worker.
    pub fn new(coordinator: TaskCoordinator, config: MaintenanceConfig) -> Self {
        Self {
            coordinator,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the maintenance loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            retention_enabled = self.config.retention_enabled,
            "Maintenance worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Maintenance worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.is_empty() => {
                            debug!(
                                retries_promoted = report.retries_promoted,
                                rate_limited_promoted = report.rate_limited_promoted,
                                timed_out = report.timed_out,
                                purged = report.purged,
                                "Maintenance tick completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Maintenance tick failed"),
                    }
                }
            }
        }

        info!("Maintenance worker stopped");
    }

    /// Run one maintenance pass as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let persistence = self.coordinator.persistence();
        let limit = self.config.batch_size;

        let retries_promoted = persistence.promote_due_retries(now, limit).await?.len();
        let rate_limited_promoted = persistence
            .promote_due_rate_limited(now, limit)
            .await?
            .len();
        let timed_out = self.coordinator.time_out_expired(now, limit).await?;
        let purged = if self.config.retention_enabled {
            self.purge(now).await?
        } else {
            0
        };

        Ok(MaintenanceReport {
            retries_promoted,
            rate_limited_promoted,
            timed_out,
            purged,
        })
    }

    /// Purge rows older than the retention age in batches.
    async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        let max_age = chrono::Duration::from_std(self.config.retention_max_age).map_err(|e| {
            CoreError::ValidationError {
                field: "retention_max_age".to_string(),
                message: e.to_string(),
            }
        })?;
        let cutoff = now - max_age;

        let mut total_deleted = 0u64;
        loop {
            let deleted = self
                .coordinator
                .persistence()
                .purge_before(cutoff, self.config.batch_size)
                .await?;
            if deleted == 0 {
                break;
            }
            total_deleted += deleted;
            debug!(deleted, total_deleted, "Purged batch");
        }

        if total_deleted > 0 {
            info!(total_deleted, cutoff = %cutoff, "Retention purge completed");
        }
        Ok(total_deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TaskFailure;
    use crate::persistence::{
        ConditionAction, ConditionEventType, HoldingArea, MatchTarget, NewMatch,
        NewMatchCondition, NewTask, RateLimitedRequeue, SignalTarget, SqlitePersistence,
        StepConfig, StickyStrategy,
    };
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use uuid::Uuid;

    async fn test_coordinator() -> TaskCoordinator {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        TaskCoordinator::new(Arc::new(SqlitePersistence::new(pool)))
    }

    fn step(backoff_factor: Option<f64>) -> StepConfig {
        StepConfig {
            queue: "default".to_string(),
            action_id: "demo:step".to_string(),
            step_id: Uuid::new_v4(),
            step_readable_id: "step".to_string(),
            step_index: 0,
            workflow_id: Uuid::nil(),
            workflow_version_id: Uuid::nil(),
            display_name: "step".to_string(),
            schedule_timeout_secs: 300,
            step_timeout_secs: Some(60),
            sticky: StickyStrategy::None,
            retry_backoff_factor: backoff_factor,
            retry_max_backoff_secs: None,
            concurrency: vec![],
        }
    }

    fn config(retention_enabled: bool) -> MaintenanceConfig {
        MaintenanceConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 2,
            retention_enabled,
            retention_max_age: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_tick_promotes_due_retry() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let task = coordinator
            .create_tasks(
                tenant,
                &[NewTask::queued(Uuid::new_v4(), step(Some(2.0)), json!({}))],
            )
            .await
            .unwrap()
            .remove(0);
        coordinator
            .fail_tasks(
                tenant,
                &[TaskFailure {
                    attempt: task.attempt(),
                    error: None,
                    retry: true,
                }],
            )
            .await
            .unwrap();

        let worker = MaintenanceWorker::new(coordinator.clone(), config(false));
        let next = crate::persistence::TaskAttempt {
            retry_count: 1,
            ..task.attempt()
        };

        let report = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(report.retries_promoted, 0);

        let report = worker
            .tick(Utc::now() + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(report.retries_promoted, 1);
        let areas = coordinator
            .persistence()
            .holding_areas(tenant, next)
            .await
            .unwrap();
        assert_eq!(areas, vec![HoldingArea::Queue]);
    }

    #[tokio::test]
    async fn test_tick_promotes_rate_limited() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let task = coordinator
            .create_tasks(
                tenant,
                &[NewTask::queued(Uuid::new_v4(), step(None), json!({}))],
            )
            .await
            .unwrap()
            .remove(0);
        let requeue_after = Utc::now() + chrono::Duration::seconds(5);
        coordinator
            .rate_limit_tasks(
                tenant,
                &[RateLimitedRequeue {
                    attempt: task.attempt(),
                    requeue_after,
                }],
            )
            .await
            .unwrap();

        let worker = MaintenanceWorker::new(coordinator.clone(), config(false));
        let report = worker
            .tick(requeue_after + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.rate_limited_promoted, 1);
    }

    #[tokio::test]
    async fn test_retention_purges_in_batches() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let tasks: Vec<NewTask> = (0..5)
            .map(|_| NewTask::queued(Uuid::new_v4(), step(None), json!({})))
            .collect();
        let created = coordinator.create_tasks(tenant, &tasks).await.unwrap();

        let worker = MaintenanceWorker::new(coordinator.clone(), config(true));
        let report = worker
            .tick(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert!(report.purged >= 5);

        for task in created {
            let found = coordinator
                .persistence()
                .get_task(tenant, task.id, task.inserted_at)
                .await
                .unwrap();
            assert!(found.is_none());
        }
    }

    #[tokio::test]
    async fn test_retention_purges_waiting_matches() {
        let coordinator = test_coordinator().await;
        let tenant = Uuid::new_v4();
        let task = coordinator
            .create_tasks(
                tenant,
                &[NewTask::queued(Uuid::new_v4(), step(None), json!({}))],
            )
            .await
            .unwrap()
            .remove(0);
        let waiting = coordinator
            .create_signal_matches(
                tenant,
                &[NewMatch {
                    target: MatchTarget::Signal(SignalTarget {
                        task_id: task.id,
                        task_inserted_at: task.inserted_at,
                        external_id: task.external_id,
                        signal_key: "never".to_string(),
                    }),
                    existing_data: None,
                    conditions: vec![NewMatchCondition {
                        event_type: ConditionEventType::User,
                        event_key: "never.sent".to_string(),
                        event_resource_hint: None,
                        readable_data_key: "never".to_string(),
                        expression: None,
                        or_group_id: Uuid::new_v4(),
                        action: ConditionAction::Create,
                    }],
                }],
            )
            .await
            .unwrap()
            .remove(0);
        assert!(!waiting.is_satisfied);

        let worker = MaintenanceWorker::new(coordinator.clone(), config(true));
        worker
            .tick(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();

        let persistence = coordinator.persistence();
        assert!(persistence.get_match(tenant, waiting.id).await.unwrap().is_none());
        assert!(
            persistence
                .list_match_conditions(tenant, waiting.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let coordinator = test_coordinator().await;
        let worker = Arc::new(MaintenanceWorker::new(coordinator, config(false)));
        let shutdown = worker.shutdown_handle();

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
