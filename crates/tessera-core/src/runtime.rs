// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tessera-core.
//!
//! [`CoreRuntime`] runs the maintenance worker inside an existing tokio
//! application and hands out the [`TaskCoordinator`] used to drive tasks.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_core::runtime::CoreRuntime;
//! use tessera_core::persistence::PostgresPersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     tessera_core::migrations::run_postgres(&pool).await?;
//!     let persistence = Arc::new(PostgresPersistence::new(pool));
//!
//!     let runtime = CoreRuntime::builder()
//!         .persistence(persistence)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let coordinator = runtime.coordinator();
//!     // ... create tasks, assign, complete ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::MaintenanceConfig;
use crate::coordinator::{ExpressionEvaluator, TaskCoordinator};
use crate::maintenance::MaintenanceWorker;
use crate::persistence::Persistence;

/// Builder for creating a [`CoreRuntime`].
#[derive(Default)]
pub struct CoreRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    maintenance: MaintenanceConfig,
}

impl std::fmt::Debug for CoreRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("evaluator", &self.evaluator.as_ref().map(|_| "..."))
            .field("maintenance", &self.maintenance)
            .finish()
    }
}

impl CoreRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the condition expression evaluator.
    ///
    /// Default: accept every payload.
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Set the maintenance worker configuration.
    pub fn maintenance(mut self, config: MaintenanceConfig) -> Self {
        self.maintenance = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<CoreRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        let mut coordinator = TaskCoordinator::new(persistence);
        if let Some(evaluator) = self.evaluator {
            coordinator = coordinator.with_evaluator(evaluator);
        }

        Ok(CoreRuntimeConfig {
            coordinator,
            maintenance: self.maintenance,
        })
    }
}

/// Configuration for a [`CoreRuntime`].
#[derive(Debug)]
pub struct CoreRuntimeConfig {
    coordinator: TaskCoordinator,
    maintenance: MaintenanceConfig,
}

impl CoreRuntimeConfig {
    /// Start the runtime, spawning the maintenance worker.
    pub async fn start(self) -> Result<CoreRuntime> {
        let worker = MaintenanceWorker::new(self.coordinator.clone(), self.maintenance);
        let shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move { worker.run().await });

        info!("CoreRuntime started");

        Ok(CoreRuntime {
            worker_handle,
            shutdown,
            coordinator: self.coordinator,
        })
    }
}

/// A running tessera-core instance embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoreRuntime {
    worker_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    coordinator: TaskCoordinator,
}

impl CoreRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CoreRuntimeBuilder {
        CoreRuntimeBuilder::new()
    }

    /// The coordinator that drives task lifecycles.
    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.coordinator
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.coordinator.persistence()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the maintenance worker and waits for its current tick to
    /// finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("CoreRuntime shutting down...");

        self.shutdown.notify_one();

        match self.worker_handle.await {
            Ok(()) => {
                info!("CoreRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("CoreRuntime maintenance task panicked: {}", e);
                Err(anyhow::anyhow!("maintenance task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }
}
