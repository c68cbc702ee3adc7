// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Tessera Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum pooled database connections
    pub max_connections: u32,
    /// Per-statement timeout (PostgreSQL `statement_timeout`)
    pub statement_timeout: Duration,
    /// Background maintenance settings
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TESSERA_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TESSERA_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `TESSERA_STATEMENT_TIMEOUT_MS`: statement timeout (default: 30000)
    /// - plus every variable read by [`MaintenanceConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TESSERA_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TESSERA_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("TESSERA_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TESSERA_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let statement_timeout_ms: u64 = std::env::var("TESSERA_STATEMENT_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TESSERA_STATEMENT_TIMEOUT_MS",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            database_url,
            max_connections,
            statement_timeout: Duration::from_millis(statement_timeout_ms),
            maintenance: MaintenanceConfig::from_env()?,
        })
    }

    /// Whether the URL points at a SQLite database.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// Configuration for the maintenance worker.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often a maintenance tick runs.
    pub poll_interval: Duration,
    /// Maximum rows handled per sweep and tick.
    pub batch_size: i64,
    /// Whether old tasks, events and matches are purged.
    pub retention_enabled: bool,
    /// Age after which rows are purged.
    pub retention_max_age: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 500,
            retention_enabled: false,
            retention_max_age: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl MaintenanceConfig {
    /// Load configuration from environment variables.
    ///
    /// - `TESSERA_MAINTENANCE_POLL_INTERVAL_MS` (default: 1000)
    /// - `TESSERA_MAINTENANCE_BATCH_SIZE` (default: 500)
    /// - `TESSERA_RETENTION_ENABLED`: "true" or "1" to enable (default: false)
    /// - `TESSERA_RETENTION_MAX_AGE_DAYS` (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let poll_interval_ms: u64 = std::env::var("TESSERA_MAINTENANCE_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or(ConfigError::Invalid(
                "TESSERA_MAINTENANCE_POLL_INTERVAL_MS",
                "must be a positive integer",
            ))?;

        let batch_size: i64 = std::env::var("TESSERA_MAINTENANCE_BATCH_SIZE")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TESSERA_MAINTENANCE_BATCH_SIZE",
                "must be a positive integer",
            ))?;

        let retention_enabled = std::env::var("TESSERA_RETENTION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_age_days: u64 = std::env::var("TESSERA_RETENTION_MAX_AGE_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TESSERA_RETENTION_MAX_AGE_DAYS",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            retention_enabled,
            retention_max_age: Duration::from_secs(max_age_days * 24 * 3600),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
