// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Core - Durable Task Orchestration
//!
//! This crate is the storage-and-coordination core of a durable workflow
//! engine. It persists tasks and their append-only event history, keeps every
//! attempt in exactly one holding area, enforces hierarchical concurrency
//! limits, releases attempts atomically, and resolves DAG dependencies and
//! signals through an event-matching engine. PostgreSQL and SQLite backends
//! implement the same [`persistence::Persistence`] contract.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              Scheduler / API layer (embedding application)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  TaskCoordinator                                 MaintenanceWorker       │
//! │  create / assign / complete / fail / cancel      promote retries,        │
//! │  event ingestion, match firing, DAG cascade      timeouts, retention     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Persistence: Task Store │ Holding Areas │ Concurrency Slots │ Release   │
//! │               Match Engine │ Bulk Event Ingestion                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                  │                                     │
//!                  ▼                                     ▼
//!          ┌──────────────┐                      ┌──────────────┐
//!          │  PostgreSQL  │                      │    SQLite    │
//!          └──────────────┘                      └──────────────┘
//! ```
//!
//! # Task Attempt Lifecycle
//!
//! ```text
//!   create ──► concurrency slots ──fill──► queue ──assign──► runtime
//!                                           ▲                  │
//!                    promote (maintenance)  │                  │ release
//!               ┌───────────────────────────┤                  ▼
//!               │                           │        complete / fail / cancel /
//!         retry queue ◄──── retry ──────────┼──────── time out
//!         rate-limited queue ◄── rate limit ┘
//! ```
//!
//! An attempt is `(task_id, inserted_at, retry_count)`. Releasing an attempt
//! whose retry count is no longer current removes its transient rows but
//! publishes nothing.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TESSERA_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `TESSERA_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `TESSERA_STATEMENT_TIMEOUT_MS` | No | `30000` | Statement / busy timeout |
//! | `TESSERA_MAINTENANCE_POLL_INTERVAL_MS` | No | `1000` | Maintenance tick interval |
//! | `TESSERA_MAINTENANCE_BATCH_SIZE` | No | `500` | Rows per sweep |
//! | `TESSERA_RETENTION_ENABLED` | No | `false` | Purge old rows |
//! | `TESSERA_RETENTION_MAX_AGE_DAYS` | No | `30` | Retention age |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`coordinator`]: Task lifecycle flows and the match cascade
//! - [`error`]: Error types with error codes
//! - [`maintenance`]: Background promotion, timeout and retention worker
//! - [`migrations`]: Embedded schema migrations
//! - [`persistence`]: Storage contract and its PostgreSQL/SQLite backends
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Task lifecycle coordination and match firing.
pub mod coordinator;

/// Error types for core operations.
pub mod error;

/// Background maintenance worker.
pub mod maintenance;

/// Embedded database migrations.
pub mod migrations;

/// Persistence contract and backends.
pub mod persistence;

/// Embeddable runtime.
pub mod runtime;

pub use coordinator::TaskCoordinator;
pub use error::CoreError;
pub use persistence::Persistence;
pub use runtime::CoreRuntime;
