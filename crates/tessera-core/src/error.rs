// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tessera-core.
//!
//! Every persistence and coordinator operation returns [`CoreError`]. Lock
//! conflicts reported by the database are surfaced as
//! [`CoreError::LockContention`] so callers can retry the whole batch.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// PostgreSQL SQLSTATE codes treated as lock contention:
/// deadlock, serialization failure, lock not available, statement timeout.
const PG_CONTENTION_CODES: &[&str] = &["40P01", "40001", "55P03", "57014"];

/// SQLite primary result codes treated as lock contention: BUSY, LOCKED.
const SQLITE_CONTENTION_CODES: &[i32] = &[5, 6];

/// Core errors that can occur while coordinating tasks.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Task was not found in the database.
    TaskNotFound {
        /// The task that was not found.
        task_id: i64,
    },

    /// Match was not found in the database.
    MatchNotFound {
        /// The match that was not found.
        match_id: i64,
    },

    /// Input validation failed. Nothing was written.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The transaction lost a lock race (deadlock, serialization failure,
    /// lock timeout). Nothing was written; the batch may be retried.
    LockContention {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::MatchNotFound { .. } => "MATCH_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::LockContention { .. } => "LOCK_CONTENTION",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }

    /// Attach the operation name to a database or contention error.
    pub fn during(self, operation: &str) -> Self {
        match self {
            Self::DatabaseError { details, .. } => Self::DatabaseError {
                operation: operation.to_string(),
                details,
            },
            Self::LockContention { details, .. } => Self::LockContention {
                operation: operation.to_string(),
                details,
            },
            other => other,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { task_id } => write!(f, "Task '{}' not found", task_id),
            Self::MatchNotFound { match_id } => write!(f, "Match '{}' not found", match_id),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::LockContention { operation, details } => {
                write!(f, "Lock contention during '{}': {}", operation, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

fn is_contention_code(code: &str) -> bool {
    if PG_CONTENTION_CODES.contains(&code) {
        return true;
    }
    // SQLite reports extended result codes; the low byte is the primary code.
    code.parse::<i32>()
        .map(|extended| SQLITE_CONTENTION_CODES.contains(&(extended & 0xff)))
        .unwrap_or(false)
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        let contention = match &err {
            sqlx::Error::Database(db_err) => db_err.code().is_some_and(|c| is_contention_code(&c)),
            _ => false,
        };

        if contention {
            CoreError::LockContention {
                operation: "query".to_string(),
                details: err.to_string(),
            }
        } else {
            CoreError::DatabaseError {
                operation: "query".to_string(),
                details: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
