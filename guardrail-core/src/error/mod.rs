//! Error handling for Guardrail
//!
//! Two error layers live in this crate:
//!
//! - [`TypedError`](crate::taxonomy::TypedError) is the classified failure of
//!   the wrapped remote service. It is what callers of the request client and
//!   recovery manager receive.
//! - [`GuardrailError`] covers the crate's own plumbing: configuration, the
//!   local durable cache, the remote log store and alert delivery.
//!
//! Telemetry paths never surface a `GuardrailError` to the caller of the
//! wrapped operation; they log it and carry on.

pub mod constructors;
pub mod types;

#[cfg(test)]
mod tests;

pub use types::{GuardrailError, GuardrailResult, Result};
