//! Shared data structures and utilities for the query-exporter binary
//!
//! This crate contains the configuration schema, the scalar value model used
//! to map database rows to metric updates, and the error types shared across
//! the exporter's components.

pub mod config;
pub mod defaults;
pub mod model;
pub mod utils;

pub use config::Config;
pub use model::{MetricResult, QueryResults, Value};

/// Result type alias used throughout the shared crate and the exporter binary.
pub type Result<T> = anyhow::Result<T>;

/// Error kinds surfaced by the query-exporter engine.
///
/// Variants mirror the error-kind table in the design: each one maps to a
/// distinct recovery path and a distinct observable effect (a builtin metric
/// increment, a log line, or a startup abort).
#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to connect to database {database}: {source}")]
    Connect {
        database: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("query '{query}' on database '{database}' timed out after {timeout_secs}s")]
    Timeout {
        query: String,
        database: String,
        timeout_secs: u64,
    },

    #[error("query '{query}' on database '{database}' failed: {message}")]
    Query {
        query: String,
        database: String,
        message: String,
        fatal: bool,
    },

    #[error("invalid metric value for query '{query}': {message}")]
    InvalidValue { query: String, message: String },

    #[error("validation error: {0}")]
    Validation(String),
}

impl ExporterError {
    /// Whether this error, if a [`ExporterError::Query`], reflects a fatal
    /// static mismatch that should permanently remove the query from the
    /// database it targets.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExporterError::Query { fatal: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_error_fatal_flag_round_trips() {
        let err = ExporterError::Query {
            query: "q".into(),
            database: "db".into(),
            message: "boom".into(),
            fatal: true,
        };
        assert!(err.is_fatal());

        let err = ExporterError::Query {
            query: "q".into(),
            database: "db".into(),
            message: "boom".into(),
            fatal: false,
        };
        assert!(!err.is_fatal());
    }
}
