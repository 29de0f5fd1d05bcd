use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::BackendRef;

/// Canonical, machine-readable error codes surfaced to clients.
///
/// The wire encoding is the snake_case code string; it is stable across
/// releases and independent of how deeply the underlying cause was wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolNotFound,
    NoBackends,
    BackendUnavailable,
    BackendOverrideInvalid,
    ValidationInput,
    ValidationOutput,
    ExecutionFailed,
    ChainStepFailed,
    Cancelled,
    Timeout,
    RateLimited,
    Unauthorized,
    Forbidden,
    StreamNotSupported,
    InvalidCursor,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::NoBackends => "no_backends",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::BackendOverrideInvalid => "backend_override_invalid",
            ErrorKind::ValidationInput => "validation_input",
            ErrorKind::ValidationOutput => "validation_output",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::ChainStepFailed => "chain_step_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::StreamNotSupported => "stream_not_supported",
            ErrorKind::InvalidCursor => "invalid_cursor",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the resilience layer may retry an error of this kind.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExecutionFailed
                | ErrorKind::BackendUnavailable
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
        )
    }
}

/// Structured tool-error payload returned inside `CallToolResult{is_error}`.
///
/// Clients inspect `code` and `retryable` programmatically; `message` is for
/// humans. `details` carries the `cause_*` trio for chain-step failures.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{}: {message}", .code.code())]
pub struct ErrorObject {
    pub code: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ErrorObject {
    pub fn new(code: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            tool_id: None,
            op: None,
            backend_kind: None,
            step_index: None,
            retryable: code.retryable(),
            details: None,
        }
    }

    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn with_backend(mut self, backend: &BackendRef) -> Self {
        self.backend_kind = Some(backend.kind().to_string());
        self
    }

    /// Wrap a failing chain step, preserving which step broke and why.
    ///
    /// The cause's code, op and backend kind are lifted into `details` so the
    /// client can tell which step, which op and which backend kind caused the
    /// break without parsing the message.
    pub fn chain_step_failed(step_index: usize, cause: &ErrorObject) -> Self {
        let mut details = Map::new();
        details.insert(
            "cause_code".to_string(),
            Value::String(cause.code.code().to_string()),
        );
        if let Some(op) = &cause.op {
            details.insert("cause_op".to_string(), Value::String(op.clone()));
        }
        if let Some(kind) = &cause.backend_kind {
            details.insert("cause_backend_kind".to_string(), Value::String(kind.clone()));
        }
        Self {
            code: ErrorKind::ChainStepFailed,
            message: format!("chain step {step_index} failed: {}", cause.message),
            tool_id: cause.tool_id.clone(),
            op: Some("run_chain".to_string()),
            backend_kind: cause.backend_kind.clone(),
            step_index: Some(step_index),
            retryable: ErrorKind::ChainStepFailed.retryable(),
            details: Some(details),
        }
    }

    /// Map a caught panic or inconsistent state. The raw detail is logged by
    /// the caller, never returned to the client.
    pub fn internal(op: &str) -> Self {
        ErrorObject::new(ErrorKind::Internal, "internal error").with_op(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_table() {
        let retryable = [
            ErrorKind::ExecutionFailed,
            ErrorKind::BackendUnavailable,
            ErrorKind::Timeout,
            ErrorKind::RateLimited,
        ];
        let fixed = [
            ErrorKind::ToolNotFound,
            ErrorKind::NoBackends,
            ErrorKind::BackendOverrideInvalid,
            ErrorKind::ValidationInput,
            ErrorKind::ValidationOutput,
            ErrorKind::ChainStepFailed,
            ErrorKind::Cancelled,
            ErrorKind::Unauthorized,
            ErrorKind::Forbidden,
            ErrorKind::StreamNotSupported,
            ErrorKind::InvalidCursor,
            ErrorKind::Internal,
        ];
        for kind in retryable {
            assert!(kind.retryable(), "{:?} should be retryable", kind);
        }
        for kind in fixed {
            assert!(!kind.retryable(), "{:?} should not be retryable", kind);
        }
    }

    #[test]
    fn test_retryable_survives_wrapping() {
        // The flag comes from the kind, not from wrapper depth.
        let cause = ErrorObject::new(ErrorKind::ExecutionFailed, "boom")
            .with_op("run")
            .with_backend(&BackendRef::Mcp { server_name: "exa".into() });
        let wrapped = ErrorObject::chain_step_failed(1, &cause);
        let rewrapped = ErrorObject::chain_step_failed(1, &wrapped);
        assert!(cause.retryable);
        assert!(!wrapped.retryable);
        assert!(!rewrapped.retryable);
        assert_eq!(wrapped.retryable, rewrapped.retryable);
    }

    #[test]
    fn test_chain_step_failed_carries_cause_trio() {
        let cause = ErrorObject::new(ErrorKind::ExecutionFailed, "backend said no")
            .with_tool("ns:t2")
            .with_op("run")
            .with_backend(&BackendRef::Mcp { server_name: "b".into() });
        let err = ErrorObject::chain_step_failed(1, &cause);

        assert_eq!(err.code, ErrorKind::ChainStepFailed);
        assert_eq!(err.step_index, Some(1));
        let details = err.details.as_ref().unwrap();
        assert_eq!(details["cause_code"], "execution_failed");
        assert_eq!(details["cause_op"], "run");
        assert_eq!(details["cause_backend_kind"], "mcp");
    }

    #[test]
    fn test_wire_encoding_skips_absent_fields() {
        let err = ErrorObject::new(ErrorKind::ToolNotFound, "no such tool");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["code"], "tool_not_found");
        assert_eq!(v["retryable"], false);
        assert!(v.get("tool_id").is_none());
        assert!(v.get("details").is_none());
    }
}
