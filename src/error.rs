//! Error types for the chat relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport-level failures talking to the answering service.
///
/// A response with any HTTP status is *not* an error; these variants only
/// cover calls that never produced a readable response.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to build gateway client: {0}")]
    Client(String),

    #[error("{0}")]
    Request(String),

    #[error("timeout of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Failed to read gateway response body: {0}")]
    Body(String),
}

/// Failures that abort a single relay invocation.
///
/// Only store failures end up here; every answering-service outcome is
/// converted into a persisted record instead.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Dedup lookup failed: {0}")]
    Dedup(#[source] DatabaseError),

    #[error("Failed to persist answer: {0}")]
    Persist(#[source] DatabaseError),
}
