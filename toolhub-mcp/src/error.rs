//! Shared error taxonomy for the router core.
//!
//! Every fallible operation in this crate returns (or wraps) a
//! [`RouterError`] variant. The HTTP layer in `toolhub-server` maps these to
//! status codes and JSON-RPC error objects; internals that aren't
//! request-scoped may still bubble up `anyhow::Error` and get converted at
//! the boundary.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no server declared with name \"{0}\"")]
    UnknownServer(String),

    #[error("circuit for \"{name}\" is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("server \"{0}\" is not running")]
    NotRunning(String),

    #[error("failed to launch \"{name}\": {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("bridge for \"{0}\" closed while the request was in flight")]
    BridgeClosed(String),

    #[error("request to \"{name}\" timed out after {elapsed:?}")]
    Timeout { name: String, elapsed: Duration },

    #[error("upstream tool server returned an error: {message}")]
    UpstreamError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Whether this failure should count against the target's circuit
    /// breaker. `UpstreamError` is deliberately excluded: a well-formed
    /// JSON-RPC error object means the channel itself is healthy.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            RouterError::LaunchFailed { .. }
                | RouterError::BridgeClosed(_)
                | RouterError::Timeout { .. }
        )
    }

    pub fn server_name(&self) -> Option<&str> {
        match self {
            RouterError::UnknownServer(name)
            | RouterError::NotRunning(name)
            | RouterError::BridgeClosed(name) => Some(name),
            RouterError::CircuitOpen { name, .. } | RouterError::LaunchFailed { name, .. } => {
                Some(name)
            }
            RouterError::Timeout { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_is_not_a_breaker_failure() {
        let err = RouterError::UpstreamError {
            code: -32000,
            message: "boom".into(),
            data: None,
        };
        assert!(!err.is_breaker_failure());
    }

    #[test]
    fn transport_failures_count_against_the_breaker() {
        assert!(RouterError::BridgeClosed("echo".into()).is_breaker_failure());
        assert!(RouterError::Timeout {
            name: "echo".into(),
            elapsed: Duration::from_millis(200)
        }
        .is_breaker_failure());
        assert!(RouterError::LaunchFailed {
            name: "echo".into(),
            reason: "exec failed".into()
        }
        .is_breaker_failure());
    }
}
