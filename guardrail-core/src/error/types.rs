//! Core error types for Guardrail plumbing
//!
//! This module contains the `GuardrailError` enum used by the crate's own
//! infrastructure (configuration, local cache, remote store, alert dispatch)
//! and the associated `Result` aliases. Failures of the *wrapped* service are
//! never represented here; those are classified into
//! [`TypedError`](crate::taxonomy::TypedError).

use thiserror::Error;

/// Infrastructure error type for Guardrail operations
///
/// # Error Categories
///
/// - **Configuration Errors**: invalid or unreadable configuration
/// - **Storage Errors**: local durable cache failures (redb)
/// - **Remote Errors**: log store and alert endpoint failures
/// - **Serialization Errors**: JSON encode/decode failures
/// - **Internal Errors**: invariants violated inside the crate
#[derive(Error, Debug)]
pub enum GuardrailError {
    // Configuration Errors
    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    // Storage Errors
    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Remote Errors
    #[error("Remote store request '{operation}' failed: {details}")]
    RemoteStore { operation: String, details: String },

    #[error("Remote store rejected '{operation}' with status {status}: {body}")]
    RemoteStatus {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Alert dispatch via {channel} failed: {details}")]
    AlertDispatch { channel: String, details: String },

    // Serialization & IO Errors
    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    #[error("Invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    // Lookup Errors
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    // Internal Errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, GuardrailError>;
pub type GuardrailResult<T> = std::result::Result<T, GuardrailError>;
