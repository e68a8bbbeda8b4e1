//! Error types for ckrebalance
//!
//! Every failure a run can hit is one of these variants. Errors coming from
//! the database driver or the SSH client are boxed as `source` so the full
//! chain survives up to `main`.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Boxed lower-level error kept as the `source` of a [`RebalanceError`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for ckrebalance operations
pub type Result<T> = std::result::Result<T, RebalanceError>;

/// Step of the detach/transfer/attach protocol that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationStep {
    /// Replica health check run before a replicated partition is detached
    PreCheck,
    Detach,
    Transfer,
    Attach,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStep::PreCheck => "pre-detach check",
            MigrationStep::Detach => "detach",
            MigrationStep::Transfer => "transfer",
            MigrationStep::Attach => "attach",
        };
        f.write_str(name)
    }
}

/// Unified error type for ckrebalance
#[derive(Error, Debug)]
pub enum RebalanceError {
    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Connectivity Errors =====
    #[error("Cannot connect to {host}")]
    Connectivity {
        host: String,
        #[source]
        source: BoxError,
    },

    // ===== Catalog Errors =====
    #[error("Query failed on {host}: {query}")]
    Query {
        host: String,
        query: String,
        #[source]
        source: BoxError,
    },

    // ===== Planning Errors =====
    #[error("Partition {partition} of {table} is present on several hosts: {hosts:?}")]
    Plan {
        table: String,
        partition: String,
        hosts: Vec<String>,
    },

    // ===== Migration Errors =====
    #[error("Failed to {step} partition {partition} of {table} on {host}")]
    MigrationStep {
        step: MigrationStep,
        table: String,
        partition: String,
        host: String,
        #[source]
        source: BoxError,
    },

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RebalanceError {
    /// Wrap a transport failure with the host it happened on
    pub fn connectivity(host: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RebalanceError::Connectivity {
            host: host.into(),
            source: source.into(),
        }
    }

    /// Wrap a catalog query failure with its host and statement
    pub fn query(
        host: impl Into<String>,
        query: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        RebalanceError::Query {
            host: host.into(),
            query: query.into(),
            source: source.into(),
        }
    }

    /// Whether the run can continue after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RebalanceError::Plan { .. })
    }
}
