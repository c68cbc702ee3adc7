// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Core - standalone maintenance daemon
//!
//! Runs migrations and the maintenance worker (retry and rate-limit
//! promotion, runtime timeouts, retention) against one database. Schedulers
//! embed the library and share the same database.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use tessera_core::config::Config;
use tessera_core::migrations;
use tessera_core::persistence::{
    Persistence, PostgresPersistence, SqlitePersistence, postgres, sqlite,
};
use tessera_core::runtime::CoreRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tessera_core=info")),
        )
        .init();

    info!("Starting Tessera Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        backend = if config.is_sqlite() { "sqlite" } else { "postgres" },
        max_connections = config.max_connections,
        poll_interval_ms = config.maintenance.poll_interval.as_millis() as u64,
        retention_enabled = config.maintenance.retention_enabled,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence: Arc<dyn Persistence> = if config.is_sqlite() {
        let pool = sqlite::connect(
            &config.database_url,
            config.max_connections,
            config.statement_timeout,
        )
        .await?;
        info!("Running database migrations...");
        migrations::run_sqlite(&pool).await?;
        Arc::new(SqlitePersistence::new(pool))
    } else {
        let pool = postgres::connect(
            &config.database_url,
            config.max_connections,
            config.statement_timeout,
        )
        .await?;
        info!("Running database migrations...");
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool))
    };
    info!("Migrations completed");

    if !persistence.health_check_db().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database health check passed");

    let runtime = CoreRuntime::builder()
        .persistence(persistence)
        .maintenance(config.maintenance)
        .build()?
        .start()
        .await?;

    info!("Tessera Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
