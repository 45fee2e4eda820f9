use std::time::Duration;

use serde_json::{json, Value};

/// Errors produced below the MCP tool boundary.
///
/// Every tool converts these into a JSON error object via
/// [`ArmError::to_tool_json`]; none of them may escape a tool call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ArmError {
    /// Missing or invalid setup.  Fatal at startup, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The client-credentials exchange failed.
    #[error("authentication failed (HTTP {status}): {body}")]
    Auth { status: u16, body: Value },

    /// A synchronous request returned something other than 2xx/202, or never
    /// produced a response at all (`status == 0`).
    #[error("request failed (HTTP {status}): {body}")]
    Request { status: u16, body: Value },

    /// A single poll attempt failed to execute.  Reported, then retried.
    #[error("poll attempt failed: {0}")]
    PollTransient(String),

    /// The provider reported a terminal failure state.
    #[error("operation failed: {body}")]
    OperationFailed { body: Value },

    /// The deadline passed while the operation was still pending.  The
    /// operation may still complete on the provider side.
    #[error("operation timed out after {}s ({polls} polls, last state: {})",
        .elapsed.as_secs(), .last_state.as_deref().unwrap_or("none"))]
    OperationTimedOut {
        elapsed: Duration,
        polls: u32,
        last_state: Option<String>,
    },

    /// A prerequisite resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Tool arguments could not be used as given.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Mutating operations are switched off by configuration.
    #[error("{0} is disabled. Set AZ_RUN_DEPLOY=true to enable mutating operations.")]
    Disabled(String),
}

pub type ArmResult<T> = Result<T, ArmError>;

impl ArmError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ArmError::Configuration(_) => "configuration",
            ArmError::Auth { .. } => "auth",
            ArmError::Request { .. } => "request",
            ArmError::PollTransient(_) => "poll_transient",
            ArmError::OperationFailed { .. } => "operation_failed",
            ArmError::OperationTimedOut { .. } => "operation_timed_out",
            ArmError::NotFound(_) => "not_found",
            ArmError::InvalidInput(_) => "invalid_input",
            ArmError::Disabled(_) => "disabled",
        }
    }

    /// Provider error code (`error.code`) carried in a failure body, if any.
    pub fn provider_code(&self) -> Option<&str> {
        let body = match self {
            ArmError::Auth { body, .. }
            | ArmError::Request { body, .. }
            | ArmError::OperationFailed { body } => body,
            _ => return None,
        };
        body.pointer("/error/code").and_then(Value::as_str)
    }

    /// Render as the structured error object returned from tools.
    pub fn to_tool_json(&self) -> Value {
        let mut obj = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        match self {
            ArmError::Auth { status, body } | ArmError::Request { status, body } => {
                obj["status"] = json!(status);
                obj["details"] = body.clone();
            }
            ArmError::OperationFailed { body } => {
                obj["details"] = body.clone();
            }
            ArmError::OperationTimedOut {
                elapsed,
                polls,
                last_state,
            } => {
                obj["elapsed_secs"] = json!(elapsed.as_secs());
                obj["polls"] = json!(polls);
                obj["last_state"] = json!(last_state);
            }
            _ => {}
        }
        obj
    }
}

/// Decode a response body for diagnostics: JSON when possible, else the raw
/// text as a JSON string.
pub fn diagnostic_body(raw: &[u8]) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}
