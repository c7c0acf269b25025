//! Error types for CRM intake.

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// Every variant is a storage fault from the pipeline's point of view and is
/// propagated to the caller without a local retry.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Malformed inbound event, rejected before any write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid timestamp for {field}: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },
}

/// The watched mailbox appears nowhere on the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("watched address {watched} is neither the sender nor a recipient")]
    WatchedAddressAbsent { watched: String },
}

/// Ingestion pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Classification failed: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Concurrent update to {entity} {id} could not be resolved")]
    ConcurrencyConflict { entity: &'static str, id: Uuid },

    #[error("Storage unavailable: {0}")]
    Storage(#[from] DatabaseError),
}
