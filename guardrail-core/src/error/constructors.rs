//! Constructor methods and conversions for GuardrailError

use super::types::GuardrailError;

impl GuardrailError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use guardrail_core::error::GuardrailError;
    ///
    /// let err = GuardrailError::configuration("breaker.failure_threshold", "must be at least 1");
    /// assert!(err.to_string().contains("breaker.failure_threshold"));
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        GuardrailError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a Storage error with a boxed source
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        GuardrailError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a Serialization error with a boxed source
    pub fn serialization<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        GuardrailError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a remote store transport error
    pub fn remote(operation: impl Into<String>, details: impl std::fmt::Display) -> Self {
        GuardrailError::RemoteStore {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Create an alert dispatch error
    pub fn alert(channel: impl Into<String>, details: impl std::fmt::Display) -> Self {
        GuardrailError::AlertDispatch {
            channel: channel.into(),
            details: details.to_string(),
        }
    }

    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        GuardrailError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        GuardrailError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GuardrailError::Internal {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for GuardrailError {
    fn from(err: std::io::Error) -> Self {
        GuardrailError::IoError(Box::new(err))
    }
}

impl From<serde_json::Error> for GuardrailError {
    fn from(err: serde_json::Error) -> Self {
        GuardrailError::serialization("json", err)
    }
}

impl From<redb::Error> for GuardrailError {
    fn from(err: redb::Error) -> Self {
        GuardrailError::storage("redb", err)
    }
}

impl From<redb::DatabaseError> for GuardrailError {
    fn from(err: redb::DatabaseError) -> Self {
        GuardrailError::storage("open database", err)
    }
}

impl From<redb::TransactionError> for GuardrailError {
    fn from(err: redb::TransactionError) -> Self {
        GuardrailError::storage("begin transaction", err)
    }
}

impl From<redb::TableError> for GuardrailError {
    fn from(err: redb::TableError) -> Self {
        GuardrailError::storage("open table", err)
    }
}

impl From<redb::StorageError> for GuardrailError {
    fn from(err: redb::StorageError) -> Self {
        GuardrailError::storage("table access", err)
    }
}

impl From<redb::CommitError> for GuardrailError {
    fn from(err: redb::CommitError) -> Self {
        GuardrailError::storage("commit", err)
    }
}

impl From<reqwest::Error> for GuardrailError {
    fn from(err: reqwest::Error) -> Self {
        let operation = err
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "request".to_string());
        GuardrailError::remote(operation, err)
    }
}

impl From<toml::de::Error> for GuardrailError {
    fn from(err: toml::de::Error) -> Self {
        GuardrailError::configuration("toml", err.to_string())
    }
}
