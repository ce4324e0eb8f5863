//! Error taxonomy
//!
//! The single source of truth for failure classification. Every component
//! classifies a raw failure through [`classify`] before acting on it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Guardrail Error Taxonomy                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Transient (retryable)   │  Caller-side        │  Fatal      │
//! │  ┌────────────────────┐  │  ┌───────────────┐  │  ┌────────┐ │
//! │  │ • Network          │  │  │ • Auth        │  │  │•Internal│ │
//! │  │ • Timeout          │  │  │ • Permission  │  │  │•Unknown │ │
//! │  │ • RateLimit        │  │  │ • Validation  │  │  └────────┘ │
//! │  │ • Integration      │  │  │ • NotFound    │  │             │
//! │  └────────────────────┘  │  │ • Cancelled   │  │             │
//! │  Store / guarded         │  └───────────────┘  │             │
//! │  • Database  • ServiceUnavailable              │             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each code fixes default severity, retryable and recoverable flags, the
//! user-facing message and a suggested action; see [`ErrorCode::policy`].

pub mod classify;
pub mod types;

pub use classify::{classify, UpstreamFailure};
pub use types::{ErrorCode, ErrorContext, ErrorPolicy, Severity, SuggestedAction, TypedError};
