// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tessera-core integration tests.
//!
//! Every test runs against a file-backed SQLite database and, when
//! `TEST_DATABASE_URL` is set, against PostgreSQL as well. Each test uses a
//! fresh tenant so runs against a shared database do not interfere.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use sqlx::{PgPool, SqlitePool};
use tempfile::TempDir;
use uuid::Uuid;

use tessera_core::TaskCoordinator;
use tessera_core::persistence::{
    ConcurrencyDimension, Dag, NewDag, NewTask, Persistence, PostgresPersistence,
    SqlitePersistence, StepConfig, StickyStrategy, Task, postgres,
};

/// One backend under test.
pub struct TestContext {
    pub name: &'static str,
    pub persistence: Arc<dyn Persistence>,
    pub coordinator: TaskCoordinator,
    pub tenant_id: Uuid,
    pool: TestPool,
    _dir: Option<TempDir>,
}

/// Raw pool behind a context, for fault injection.
enum TestPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl TestContext {
    /// SQLite context on a temporary database file.
    pub async fn sqlite() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = SqlitePersistence::from_path(dir.path().join("tessera.db"))
            .await
            .expect("Failed to open SQLite database");
        let pool = TestPool::Sqlite(persistence.pool().clone());
        Self::with_persistence("sqlite", Arc::new(persistence), pool, Some(dir))
    }

    /// PostgreSQL context from `TEST_DATABASE_URL`, if set.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = postgres::connect(&database_url, 10, Duration::from_secs(30))
            .await
            .ok()?;
        tessera_core::migrations::run_postgres(&pool).await.ok()?;
        Some(Self::with_persistence(
            "postgres",
            Arc::new(PostgresPersistence::new(pool.clone())),
            TestPool::Postgres(pool),
            None,
        ))
    }

    /// Every available backend.
    pub async fn all() -> Vec<Self> {
        let mut contexts = vec![Self::sqlite().await];
        if let Some(pg) = Self::postgres().await {
            contexts.push(pg);
        }
        contexts
    }

    fn with_persistence(
        name: &'static str,
        persistence: Arc<dyn Persistence>,
        pool: TestPool,
        dir: Option<TempDir>,
    ) -> Self {
        Self {
            name,
            coordinator: TaskCoordinator::new(persistence.clone()),
            persistence,
            tenant_id: Uuid::new_v4(),
            pool,
            _dir: dir,
        }
    }

    fn trigger_name(&self) -> String {
        format!("reject_{}", self.tenant_id.simple())
    }

    /// Make inserts of this tenant's tasks for `step_readable_id` fail until
    /// [`TestContext::allow_task_inserts`] is called.
    pub async fn reject_task_inserts(&self, step_readable_id: &str) {
        let name = self.trigger_name();
        match &self.pool {
            TestPool::Sqlite(pool) => {
                sqlx::query(&format!(
                    "CREATE TRIGGER {name} BEFORE INSERT ON tasks \
                     WHEN NEW.tenant_id = X'{tenant}' AND NEW.step_readable_id = '{step}' \
                     BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
                    tenant = self.tenant_id.simple(),
                    step = step_readable_id,
                ))
                .execute(pool)
                .await
                .expect("Failed to create trigger");
            }
            TestPool::Postgres(pool) => {
                sqlx::query(&format!(
                    "CREATE FUNCTION {name}() RETURNS trigger LANGUAGE plpgsql AS \
                     $$ BEGIN RAISE EXCEPTION 'injected failure'; END $$"
                ))
                .execute(pool)
                .await
                .expect("Failed to create trigger function");
                sqlx::query(&format!(
                    "CREATE TRIGGER {name} BEFORE INSERT ON tasks FOR EACH ROW \
                     WHEN (NEW.tenant_id = '{tenant}' AND NEW.step_readable_id = '{step}') \
                     EXECUTE FUNCTION {name}()",
                    tenant = self.tenant_id,
                    step = step_readable_id,
                ))
                .execute(pool)
                .await
                .expect("Failed to create trigger");
            }
        }
    }

    /// Drop the trigger installed by [`TestContext::reject_task_inserts`].
    pub async fn allow_task_inserts(&self) {
        let name = self.trigger_name();
        match &self.pool {
            TestPool::Sqlite(pool) => {
                sqlx::query(&format!("DROP TRIGGER IF EXISTS {name}"))
                    .execute(pool)
                    .await
                    .expect("Failed to drop trigger");
            }
            TestPool::Postgres(pool) => {
                sqlx::query(&format!("DROP TRIGGER IF EXISTS {name} ON tasks"))
                    .execute(pool)
                    .await
                    .expect("Failed to drop trigger");
                sqlx::query(&format!("DROP FUNCTION IF EXISTS {name}()"))
                    .execute(pool)
                    .await
                    .expect("Failed to drop trigger function");
            }
        }
    }

    /// Register a DAG run.
    pub async fn create_dag(&self) -> Dag {
        let run = Uuid::new_v4();
        self.coordinator
            .create_dags(
                self.tenant_id,
                &[NewDag {
                    external_id: run,
                    display_name: format!("run-{run}"),
                    workflow_id: Uuid::nil(),
                    workflow_version_id: Uuid::nil(),
                    parent_task_external_id: None,
                }],
            )
            .await
            .expect("Failed to create DAG")
            .remove(0)
    }

    /// Create one queued task in a DAG.
    pub async fn create_dag_task(&self, dag: &Dag, step: StepConfig) -> Task {
        let mut task = NewTask::queued(dag.external_id, step, json!({}));
        task.dag = Some(dag.as_ref());
        self.coordinator
            .create_tasks(self.tenant_id, &[task])
            .await
            .expect("Failed to create task")
            .remove(0)
    }

    /// Create queued standalone tasks.
    pub async fn create_tasks(&self, count: usize, step: &StepConfig) -> Vec<Task> {
        let tasks: Vec<NewTask> = (0..count)
            .map(|i| NewTask::queued(Uuid::new_v4(), step.clone(), json!({ "i": i })))
            .collect();
        self.coordinator
            .create_tasks(self.tenant_id, &tasks)
            .await
            .expect("Failed to create tasks")
    }
}

/// Step on `queue` with a one minute timeout.
pub fn step(queue: &str, readable_id: &str) -> StepConfig {
    StepConfig {
        queue: queue.to_string(),
        action_id: format!("test:{readable_id}"),
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

/// Step limited by one concurrency strategy keyed by `key`.
pub fn limited_step(queue: &str, strategy_id: i64, key: &str) -> StepConfig {
    StepConfig {
        concurrency: vec![ConcurrencyDimension {
            parent_strategy_id: None,
            strategy_id,
            key: key.to_string(),
        }],
        ..step(queue, "limited")
    }
}

/// Payload a user event carries in tests.
pub fn payload(n: i64) -> Value {
    json!({ "n": n })
}

/// Skip test if database URL is not set
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
