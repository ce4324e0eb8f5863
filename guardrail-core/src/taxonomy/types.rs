//! Typed error hierarchy and its fixed policy table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Closed set of failure codes. Alerting policy and retry eligibility are
/// keyed on these, so new codes are a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimit,
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "PERMISSION_ERROR")]
    Permission,
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "NOT_FOUND_ERROR")]
    NotFound,
    #[serde(rename = "DATABASE_ERROR")]
    Database,
    #[serde(rename = "INTEGRATION_ERROR")]
    Integration,
    #[serde(rename = "SERVICE_UNAVAILABLE")]
    ServiceUnavailable,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::Network,
        ErrorCode::Timeout,
        ErrorCode::RateLimit,
        ErrorCode::Auth,
        ErrorCode::Permission,
        ErrorCode::Validation,
        ErrorCode::NotFound,
        ErrorCode::Database,
        ErrorCode::Integration,
        ErrorCode::ServiceUnavailable,
        ErrorCode::Cancelled,
        ErrorCode::Internal,
        ErrorCode::Unknown,
    ];

    /// Stable wire name, as stored in `error_logs.code`
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Network => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT_ERROR",
            ErrorCode::RateLimit => "RATE_LIMIT_ERROR",
            ErrorCode::Auth => "AUTH_ERROR",
            ErrorCode::Permission => "PERMISSION_ERROR",
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND_ERROR",
            ErrorCode::Database => "DATABASE_ERROR",
            ErrorCode::Integration => "INTEGRATION_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Internal => "INTERNAL_ERROR",
            ErrorCode::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Default metadata for this code
    pub fn policy(&self) -> ErrorPolicy {
        use Severity::*;
        use SuggestedAction::*;

        match self {
            ErrorCode::Network => ErrorPolicy {
                severity: High,
                recoverable: true,
                retryable: true,
                user_message: "Unable to reach the server. Please check your connection.",
                suggested_action: Some(CheckConnection),
            },
            ErrorCode::Timeout => ErrorPolicy {
                severity: Medium,
                recoverable: true,
                retryable: true,
                user_message: "The request took too long to complete.",
                suggested_action: Some(Retry),
            },
            ErrorCode::RateLimit => ErrorPolicy {
                severity: Medium,
                recoverable: true,
                retryable: true,
                user_message: "Too many requests. Please wait a moment.",
                suggested_action: Some(WaitAndRetry),
            },
            ErrorCode::Auth => ErrorPolicy {
                severity: High,
                recoverable: true,
                retryable: false,
                user_message: "Your session has expired. Please sign in again.",
                suggested_action: Some(SignIn),
            },
            ErrorCode::Permission => ErrorPolicy {
                severity: High,
                recoverable: false,
                retryable: false,
                user_message: "You do not have permission to perform this action.",
                suggested_action: Some(ContactAdministrator),
            },
            ErrorCode::Validation => ErrorPolicy {
                severity: Low,
                recoverable: true,
                retryable: false,
                user_message: "Some of the information provided is invalid.",
                suggested_action: Some(CorrectInput),
            },
            ErrorCode::NotFound => ErrorPolicy {
                severity: Low,
                recoverable: true,
                retryable: false,
                user_message: "The requested item could not be found.",
                suggested_action: Some(Refresh),
            },
            ErrorCode::Database => ErrorPolicy {
                severity: High,
                recoverable: true,
                retryable: false,
                user_message: "We could not save or load your data.",
                suggested_action: Some(Retry),
            },
            ErrorCode::Integration => ErrorPolicy {
                severity: Medium,
                recoverable: true,
                retryable: true,
                user_message: "An external service is not responding as expected.",
                suggested_action: Some(WaitAndRetry),
            },
            ErrorCode::ServiceUnavailable => ErrorPolicy {
                severity: High,
                recoverable: true,
                retryable: false,
                user_message: "This feature is temporarily unavailable.",
                suggested_action: Some(WaitAndRetry),
            },
            ErrorCode::Cancelled => ErrorPolicy {
                severity: Low,
                recoverable: true,
                retryable: false,
                user_message: "The request was cancelled.",
                suggested_action: None,
            },
            ErrorCode::Internal => ErrorPolicy {
                severity: Critical,
                recoverable: false,
                retryable: false,
                user_message: "Something went wrong on our side.",
                suggested_action: Some(ContactSupport),
            },
            ErrorCode::Unknown => ErrorPolicy {
                severity: Medium,
                recoverable: false,
                retryable: false,
                user_message: "An unexpected error occurred.",
                suggested_action: Some(ContactSupport),
            },
        }
    }

    /// HTTP status used when a failure carries none of its own
    pub fn nominal_status(&self) -> u16 {
        match self {
            ErrorCode::Auth => 401,
            ErrorCode::Permission => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Timeout => 408,
            ErrorCode::Validation => 422,
            ErrorCode::RateLimit => 429,
            ErrorCode::Cancelled => 499,
            ErrorCode::Network | ErrorCode::Integration => 502,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::Database | ErrorCode::Internal | ErrorCode::Unknown => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown error code: {}", s))
    }
}

/// Severity levels for prioritization and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric weight (1..=4) used in fingerprint scoring
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What the user can do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Retry,
    WaitAndRetry,
    CheckConnection,
    SignIn,
    ContactAdministrator,
    CorrectInput,
    Refresh,
    ContactSupport,
}

impl fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SuggestedAction::Retry => "Try again.",
            SuggestedAction::WaitAndRetry => "Wait a few moments, then try again.",
            SuggestedAction::CheckConnection => "Check your internet connection and try again.",
            SuggestedAction::SignIn => "Sign in again to continue.",
            SuggestedAction::ContactAdministrator => {
                "Ask your administrator for access to this feature."
            }
            SuggestedAction::CorrectInput => "Review the highlighted fields and correct them.",
            SuggestedAction::Refresh => "Refresh the page and try again.",
            SuggestedAction::ContactSupport => "Contact support if the problem persists.",
        };
        f.write_str(text)
    }
}

/// Default metadata attached to every error of a given code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub severity: Severity,
    pub recoverable: bool,
    pub retryable: bool,
    pub user_message: &'static str,
    pub suggested_action: Option<SuggestedAction>,
}

/// Where and for whom a failure happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_path: Option<String>,
    #[serde(default)]
    pub additional_data: Map<String, Value>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: None,
            tenant_id: None,
            origin_url: None,
            user_agent: None,
            component_path: None,
            additional_data: Map::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.origin_url = Some(url.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component_path = Some(component.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_data.insert(key.into(), value.into());
        self
    }

    /// Fill unset fields from `other`, keeping this context's timestamp.
    pub fn merged_with(mut self, other: &ErrorContext) -> Self {
        if self.user_id.is_none() {
            self.user_id = other.user_id.clone();
        }
        if self.tenant_id.is_none() {
            self.tenant_id = other.tenant_id.clone();
        }
        if self.origin_url.is_none() {
            self.origin_url = other.origin_url.clone();
        }
        if self.user_agent.is_none() {
            self.user_agent = other.user_agent.clone();
        }
        if self.component_path.is_none() {
            self.component_path = other.component_path.clone();
        }
        for (k, v) in &other.additional_data {
            self.additional_data
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
        self
    }
}

/// A classified failure
///
/// Constructed through [`TypedError::new`] (or the per-code shorthands), which
/// applies the code's [`ErrorPolicy`]. Fields are read through accessors; the
/// `with_*` methods consume and return a new value, so an error handed to a
/// caller never changes underneath it.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct TypedError {
    code: ErrorCode,
    message: String,
    user_message: String,
    severity: Severity,
    recoverable: bool,
    retryable: bool,
    context: ErrorContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    suggested_action: Option<SuggestedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

impl TypedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let policy = code.policy();
        Self {
            code,
            message: message.into(),
            user_message: policy.user_message.to_string(),
            severity: policy.severity,
            recoverable: policy.recoverable,
            retryable: policy.retryable,
            context: ErrorContext::new(),
            original_cause: None,
            suggested_action: policy.suggested_action,
            stack: None,
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimit, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Auth, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Permission, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Database, message)
    }

    /// Failure of a named third-party integration. The name is recorded in
    /// the context and becomes the circuit breaker resource name.
    pub fn integration(integration: impl Into<String>, message: impl Into<String>) -> Self {
        let integration = integration.into();
        let mut err = Self::new(ErrorCode::Integration, message);
        err.context
            .additional_data
            .insert(INTEGRATION_KEY.to_string(), Value::String(integration));
        err
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn original_cause(&self) -> Option<&str> {
        self.original_cause.as_deref()
    }

    pub fn suggested_action(&self) -> Option<SuggestedAction> {
        self.suggested_action
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// HTTP status of the failure, or the code's nominal status
    pub fn http_status(&self) -> u16 {
        self.status.unwrap_or_else(|| self.code.nominal_status())
    }

    /// Name of the integration this failure came from, if any
    pub fn integration_name(&self) -> Option<&str> {
        self.context
            .additional_data
            .get(INTEGRATION_KEY)
            .and_then(Value::as_str)
    }

    /// Circuit breaker resource for this failure: the integration name when
    /// present, otherwise the error code.
    pub fn resource_name(&self) -> String {
        self.integration_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.code.as_str().to_string())
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        let integration = self.context.additional_data.remove(INTEGRATION_KEY);
        self.context = context;
        if let Some(name) = integration {
            self.context
                .additional_data
                .entry(INTEGRATION_KEY.to_string())
                .or_insert(name);
        }
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.original_cause = Some(cause.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        self.user_message = user_message.into();
        self
    }

    pub fn with_suggested_action(mut self, action: SuggestedAction) -> Self {
        self.suggested_action = Some(action);
        self
    }
}

pub(crate) const INTEGRATION_KEY: &str = "integration";
