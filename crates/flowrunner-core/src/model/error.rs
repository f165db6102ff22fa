//! The error taxonomy nodes and the engine communicate through (§7).

use serde::{Deserialize, Serialize};

/// How a node error should be handled by the engine.
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient (network, 5xx, timeout): retried with backoff.
    Retryable,
    /// Deterministic failure (bad config, 4xx, logic error): fails the step.
    Permanent,
    /// Awaiting human action: suspends the step until resumed.
    UserInput,
    /// Run cancelled mid-step: skips without retry.
    Cancelled,
    /// Lease or run timeout: treated as `Retryable` for a lease timeout,
    /// `Permanent` for a run timeout.
    Timeout,
}

impl ErrorKind {
    /// Whether the Work Queue should requeue-with-backoff on this kind,
    /// assuming attempts remain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

/// `{kind, message, cause_chain, node_stack_trace}` — the shape persisted
/// in a step's `error_details` and surfaced at the run's terminal
/// `output_data` when the run fails.
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub cause_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_stack_trace: Option<String>,
}

impl ErrorDetails {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause_chain: Vec::new(),
            node_stack_trace: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause_chain.push(cause.into());
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.node_stack_trace = Some(trace.into());
        self
    }

    /// A node that panics is converted to a `Permanent` error carrying
    /// the panic payload as its stack trace (§4.C "the runtime converts
    /// panics to `Permanent` errors with stack trace in `error_details`").
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "node panicked".to_string()
        };
        Self::permanent(format!("node panicked: {message}"))
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorDetails {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_becomes_permanent() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let details = ErrorDetails::from_panic(payload.as_ref());
        assert_eq!(details.kind, ErrorKind::Permanent);
        assert!(details.message.contains("boom"));
    }
}
