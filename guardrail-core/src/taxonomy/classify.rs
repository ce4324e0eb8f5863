//! Classification of raw upstream failures
//!
//! Every failure shape the wrapped service can produce is a variant of
//! [`UpstreamFailure`]. [`classify`] is a closed match over it; phrase
//! matching only refines variants whose structure does not already decide
//! the code.

use super::types::{ErrorCode, ErrorContext, TypedError};
use std::fmt;
use std::time::Duration;

/// Unique constraint violation
const UNIQUE_VIOLATION: &str = "23505";
/// Foreign key violation
const FOREIGN_KEY_VIOLATION: &str = "23503";
/// Insufficient privilege (row security and grants)
const INSUFFICIENT_PRIVILEGE: &str = "42501";
/// Statement timeout
const QUERY_CANCELED: &str = "57014";

const AUTH_TOKEN_PHRASES: &[&str] = &[
    "jwt expired",
    "invalid jwt",
    "jwt malformed",
    "invalid refresh token",
    "refresh token not found",
    "token expired",
    "invalid token",
    "auth session missing",
    "not authenticated",
    "invalid login credentials",
];

const PERMISSION_PHRASES: &[&str] = &[
    "permission denied",
    "row-level security",
    "row level security",
    "insufficient privilege",
    "not authorized",
    "forbidden",
];

const TIMEOUT_PHRASES: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const TRANSPORT_PHRASES: &[&str] = &[
    "failed to fetch",
    "network error",
    "networkerror",
    "network request failed",
    "connection refused",
    "connection reset",
    "connection closed",
    "econnrefused",
    "dns error",
    "host unreachable",
];

const RATE_LIMIT_PHRASES: &[&str] = &["rate limit", "too many requests"];

/// Every failure shape the wrapped service is able to produce
#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Session or token failure reported by the auth service
    Auth { message: String, status: Option<u16> },
    /// Error reported by the hosted relational store
    Store {
        code: Option<String>,
        message: String,
        details: Option<String>,
        hint: Option<String>,
    },
    /// Non-success HTTP response from a function endpoint
    Http {
        status: u16,
        message: String,
        body: Option<String>,
    },
    /// The request never produced a response
    Transport { message: String },
    /// A local deadline elapsed
    Timeout { operation: String, after: Duration },
    /// Input rejected before or by the service
    Validation { field: Option<String>, message: String },
    /// Failure of a named third-party integration behind a function endpoint
    Integration {
        integration: String,
        message: String,
        status: Option<u16>,
    },
    /// A spawned task panicked
    Panicked { message: String },
    /// The caller aborted the operation
    Cancelled { reason: String },
    /// Already classified further down the stack
    Classified(TypedError),
    /// Anything else
    Other { message: String, stack: Option<String> },
}

impl UpstreamFailure {
    pub fn store(code: impl Into<String>, message: impl Into<String>) -> Self {
        UpstreamFailure::Store {
            code: Some(code.into()),
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        UpstreamFailure::Http {
            status,
            message: message.into(),
            body: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        UpstreamFailure::Transport {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        UpstreamFailure::Other {
            message: message.into(),
            stack: None,
        }
    }

    /// The raw message carried by this failure
    pub fn message(&self) -> String {
        match self {
            UpstreamFailure::Auth { message, .. }
            | UpstreamFailure::Store { message, .. }
            | UpstreamFailure::Http { message, .. }
            | UpstreamFailure::Transport { message }
            | UpstreamFailure::Validation { message, .. }
            | UpstreamFailure::Integration { message, .. }
            | UpstreamFailure::Panicked { message }
            | UpstreamFailure::Other { message, .. } => message.clone(),
            UpstreamFailure::Timeout { operation, after } => {
                format!("{} timed out after {}ms", operation, after.as_millis())
            }
            UpstreamFailure::Cancelled { reason } => reason.clone(),
            UpstreamFailure::Classified(err) => err.message().to_string(),
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamFailure::Store { code: Some(code), message, .. } => {
                write!(f, "store error {}: {}", code, message)
            }
            UpstreamFailure::Http { status, message, .. } => {
                write!(f, "HTTP {}: {}", status, message)
            }
            UpstreamFailure::Integration { integration, message, .. } => {
                write!(f, "{}: {}", integration, message)
            }
            other => f.write_str(&other.message()),
        }
    }
}

impl std::error::Error for UpstreamFailure {}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Phrase rules shared by unstructured failures, in priority order
fn classify_phrase(message: &str) -> Option<ErrorCode> {
    if contains_any(message, AUTH_TOKEN_PHRASES) {
        Some(ErrorCode::Auth)
    } else if contains_any(message, PERMISSION_PHRASES) {
        Some(ErrorCode::Permission)
    } else if contains_any(message, TIMEOUT_PHRASES) {
        Some(ErrorCode::Timeout)
    } else if contains_any(message, RATE_LIMIT_PHRASES) {
        Some(ErrorCode::RateLimit)
    } else if contains_any(message, TRANSPORT_PHRASES) {
        Some(ErrorCode::Network)
    } else {
        None
    }
}

fn classify_status(status: u16) -> ErrorCode {
    match status {
        401 => ErrorCode::Auth,
        403 => ErrorCode::Permission,
        404 | 410 => ErrorCode::NotFound,
        408 | 504 => ErrorCode::Timeout,
        409 => ErrorCode::Database,
        400 | 422 => ErrorCode::Validation,
        429 => ErrorCode::RateLimit,
        500..=599 => ErrorCode::Network,
        _ => ErrorCode::Unknown,
    }
}

/// Classify a raw failure into the taxonomy.
///
/// `context`, when given, replaces the default (timestamp-only) context of the
/// resulting error. Already classified errors keep their code and metadata.
pub fn classify(failure: UpstreamFailure, context: Option<ErrorContext>) -> TypedError {
    let cause = failure.to_string();
    let classified = match failure {
        UpstreamFailure::Classified(err) => {
            return match context {
                Some(ctx) => {
                    let merged = err.context().clone().merged_with(&ctx);
                    err.with_context(merged)
                }
                None => err,
            };
        }
        UpstreamFailure::Auth { message, status } => {
            let err = TypedError::auth(message);
            match status {
                Some(s) => err.with_status(s),
                None => err,
            }
        }
        UpstreamFailure::Store {
            code,
            message,
            details,
            hint,
        } => classify_store(code.as_deref(), message, details, hint),
        UpstreamFailure::Http {
            status,
            message,
            body,
        } => {
            let code = match classify_status(status) {
                ErrorCode::Network | ErrorCode::Unknown => {
                    classify_phrase(&message).unwrap_or_else(|| classify_status(status))
                }
                code => code,
            };
            let err = TypedError::new(code, message).with_status(status);
            match body {
                Some(body) => err.with_cause(body),
                None => err,
            }
        }
        UpstreamFailure::Transport { message } => {
            if contains_any(&message, TIMEOUT_PHRASES) {
                TypedError::timeout(message)
            } else {
                TypedError::network(message)
            }
        }
        UpstreamFailure::Timeout { operation, after } => TypedError::timeout(format!(
            "{} timed out after {}ms",
            operation,
            after.as_millis()
        )),
        UpstreamFailure::Validation { field, message } => {
            let err = TypedError::validation(message);
            match field {
                Some(field) => {
                    let ctx = err.context().clone().with_data("field", field);
                    err.with_context(ctx)
                }
                None => err,
            }
        }
        UpstreamFailure::Integration {
            integration,
            message,
            status,
        } => {
            let err = match status {
                Some(429) => {
                    let base = TypedError::rate_limit(message.clone());
                    let ctx = base
                        .context()
                        .clone()
                        .with_data(super::types::INTEGRATION_KEY, integration.clone());
                    base.with_context(ctx)
                }
                _ => TypedError::integration(integration, message),
            };
            match status {
                Some(s) => err.with_status(s),
                None => err,
            }
        }
        UpstreamFailure::Panicked { message } => TypedError::internal(message),
        UpstreamFailure::Cancelled { reason } => TypedError::cancelled(reason),
        UpstreamFailure::Other { message, stack } => {
            let code = classify_phrase(&message).unwrap_or(ErrorCode::Unknown);
            let err = TypedError::new(code, message);
            match stack {
                Some(stack) => err.with_stack(stack),
                None => err,
            }
        }
    };

    let classified = classified.with_cause(cause);
    match context {
        Some(ctx) => {
            let merged = ctx.merged_with(classified.context());
            classified.with_context(merged)
        }
        None => classified,
    }
}

fn classify_store(
    code: Option<&str>,
    message: String,
    details: Option<String>,
    hint: Option<String>,
) -> TypedError {
    let err = if contains_any(&message, AUTH_TOKEN_PHRASES) {
        TypedError::auth(message)
    } else if code == Some(UNIQUE_VIOLATION) {
        TypedError::database(message)
            .with_user_message("A record with these details already exists.")
    } else if code == Some(FOREIGN_KEY_VIOLATION) {
        TypedError::database(message)
            .with_user_message("This record is linked to data that does not exist or is still in use.")
    } else if code == Some(INSUFFICIENT_PRIVILEGE) || contains_any(&message, PERMISSION_PHRASES) {
        TypedError::permission(message)
    } else if code == Some(QUERY_CANCELED) || contains_any(&message, TIMEOUT_PHRASES) {
        TypedError::timeout(message)
    } else if contains_any(&message, TRANSPORT_PHRASES) {
        TypedError::network(message)
    } else {
        TypedError::database(message)
    };

    let mut ctx = err.context().clone();
    if let Some(code) = code {
        ctx = ctx.with_data("store_code", code);
    }
    if let Some(details) = details {
        ctx = ctx.with_data("details", details);
    }
    if let Some(hint) = hint {
        ctx = ctx.with_data("hint", hint);
    }
    err.with_context(ctx)
}

impl From<TypedError> for UpstreamFailure {
    fn from(err: TypedError) -> Self {
        UpstreamFailure::Classified(err)
    }
}

impl From<reqwest::Error> for UpstreamFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamFailure::Timeout {
                operation: err
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "request".to_string()),
                after: Duration::ZERO,
            }
        } else if let Some(status) = err.status() {
            UpstreamFailure::http(status.as_u16(), err.to_string())
        } else if err.is_connect() || err.is_request() {
            UpstreamFailure::transport(err.to_string())
        } else {
            UpstreamFailure::other(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for UpstreamFailure {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            UpstreamFailure::Cancelled {
                reason: "task was cancelled".to_string(),
            }
        } else {
            UpstreamFailure::Panicked {
                message: format!("Task panicked: {}", err),
            }
        }
    }
}

impl From<std::io::Error> for UpstreamFailure {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => UpstreamFailure::Timeout {
                operation: "io".to_string(),
                after: Duration::ZERO,
            },
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => UpstreamFailure::transport(err.to_string()),
            ErrorKind::PermissionDenied => UpstreamFailure::other(format!("permission denied: {}", err)),
            _ => UpstreamFailure::other(err.to_string()),
        }
    }
}

impl From<String> for UpstreamFailure {
    fn from(message: String) -> Self {
        UpstreamFailure::other(message)
    }
}

impl From<&str> for UpstreamFailure {
    fn from(message: &str) -> Self {
        UpstreamFailure::other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::Severity;
    use rstest::rstest;

    #[rstest]
    #[case(UpstreamFailure::Auth { message: "JWT expired".into(), status: Some(401) }, ErrorCode::Auth)]
    #[case(UpstreamFailure::store("23505", "duplicate key value violates unique constraint"), ErrorCode::Database)]
    #[case(UpstreamFailure::store("23503", "insert violates foreign key constraint"), ErrorCode::Database)]
    #[case(UpstreamFailure::store("42501", "new row violates row-level security policy"), ErrorCode::Permission)]
    #[case(UpstreamFailure::store("57014", "canceling statement due to statement timeout"), ErrorCode::Timeout)]
    #[case(UpstreamFailure::store("PGRST000", "relation does not exist"), ErrorCode::Database)]
    #[case(UpstreamFailure::store("PGRST301", "JWT expired"), ErrorCode::Auth)]
    #[case(UpstreamFailure::transport("Failed to fetch"), ErrorCode::Network)]
    #[case(UpstreamFailure::http(429, "slow down"), ErrorCode::RateLimit)]
    #[case(UpstreamFailure::http(404, "no such row"), ErrorCode::NotFound)]
    #[case(UpstreamFailure::http(503, "upstream down"), ErrorCode::Network)]
    #[case(UpstreamFailure::other("request timed out"), ErrorCode::Timeout)]
    #[case(UpstreamFailure::other("permission denied for table invoices"), ErrorCode::Permission)]
    #[case(UpstreamFailure::other("something odd"), ErrorCode::Unknown)]
    #[case(UpstreamFailure::Panicked { message: "boom".into() }, ErrorCode::Internal)]
    fn test_classification_priority(#[case] failure: UpstreamFailure, #[case] expected: ErrorCode) {
        assert_eq!(classify(failure, None).code(), expected);
    }

    #[rstest]
    #[case(ErrorCode::Network, Severity::High, true, true)]
    #[case(ErrorCode::Timeout, Severity::Medium, true, true)]
    #[case(ErrorCode::Validation, Severity::Low, true, false)]
    #[case(ErrorCode::Permission, Severity::High, false, false)]
    #[case(ErrorCode::Auth, Severity::High, true, false)]
    #[case(ErrorCode::Internal, Severity::Critical, false, false)]
    fn test_policy_table(
        #[case] code: ErrorCode,
        #[case] severity: Severity,
        #[case] recoverable: bool,
        #[case] retryable: bool,
    ) {
        let err = TypedError::new(code, "x");
        assert_eq!(err.severity(), severity);
        assert_eq!(err.is_recoverable(), recoverable);
        assert_eq!(err.is_retryable(), retryable);
        assert!(!err.user_message().is_empty());
    }

    #[test]
    fn test_classified_passthrough_keeps_code() {
        let original = TypedError::validation("bad email");
        let again = classify(original.clone().into(), None);
        assert_eq!(again, original);
    }

    #[test]
    fn test_context_is_attached() {
        let ctx = ErrorContext::new().with_user("u-1").with_tenant("t-1");
        let err = classify(UpstreamFailure::transport("connection refused"), Some(ctx));
        assert_eq!(err.context().user_id.as_deref(), Some("u-1"));
        assert_eq!(err.context().tenant_id.as_deref(), Some("t-1"));
        assert!(err.original_cause().is_some());
    }

    #[test]
    fn test_store_details_recorded() {
        let failure = UpstreamFailure::Store {
            code: Some("23505".into()),
            message: "duplicate key".into(),
            details: Some("Key (email)=(a@b.c) already exists.".into()),
            hint: None,
        };
        let err = classify(failure, None);
        assert_eq!(err.context().additional_data["store_code"], "23505");
        assert!(err.user_message().contains("already exists"));
    }

    #[test]
    fn test_integration_resource_name() {
        let failure = UpstreamFailure::Integration {
            integration: "stripe".into(),
            message: "card processor unavailable".into(),
            status: Some(502),
        };
        let err = classify(failure, Some(ErrorContext::new().with_user("u")));
        assert_eq!(err.code(), ErrorCode::Integration);
        assert_eq!(err.resource_name(), "stripe");
        assert_eq!(err.context().user_id.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn test_join_error_panic_is_internal() {
        let handle = tokio::spawn(async {
            if true {
                panic!("worker exploded");
            }
        });
        let join_err = handle.await.unwrap_err();
        let err = classify(join_err.into(), None);
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.severity(), Severity::Critical);
    }
}
