//! Maps [`RouterError`] onto HTTP status codes and the JSON-RPC error
//! envelope described in spec §6.1/§7. Kept separate from the core's error
//! taxonomy: the core stays HTTP-agnostic, this crate owns the edge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use toolhub_mcp::error::RouterError;

/// Router-specific JSON-RPC error code for a gated (circuit-open) call.
/// Distinct from the two codes the wire protocol itself defines.
pub const CIRCUIT_OPEN_CODE: i64 = -32050;
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Thin wrapper so `RouterError` (defined in `toolhub-mcp`, which has no
/// axum dependency) can implement `IntoResponse` here.
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, json!({ "error": message.into() }))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, json!({ "error": message.into() }))
    }

    /// Render as a JSON-RPC error response, carrying the original request
    /// id so the caller can correlate it.
    pub fn as_jsonrpc(status: StatusCode, id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        let mut error = json!({ "code": code, "message": message.into() });
        if let Some(data) = data {
            error["data"] = data;
        }
        Self::new(
            status,
            json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Maps a [`RouterError`] surfaced from the proxy path onto a JSON-RPC error
/// response carrying `id`. `UpstreamError` is forwarded as-is (§7: it is a
/// live, well-formed channel — not a router failure).
pub fn proxy_error_response(err: RouterError, id: Value) -> ApiError {
    match err {
        RouterError::UnknownServer(name) => {
            ApiError::not_found(format!("no server declared with name \"{name}\""))
        }
        RouterError::CircuitOpen { name, retry_after } => ApiError::as_jsonrpc(
            StatusCode::SERVICE_UNAVAILABLE,
            id,
            CIRCUIT_OPEN_CODE,
            format!("circuit for \"{name}\" is open"),
            Some(json!({ "retry_after": retry_after.as_secs_f64() })),
        ),
        RouterError::NotRunning(name) => ApiError::as_jsonrpc(
            StatusCode::SERVICE_UNAVAILABLE,
            id,
            INTERNAL_ERROR_CODE,
            format!("server \"{name}\" is not running"),
            None,
        ),
        RouterError::LaunchFailed { name, reason } => ApiError::as_jsonrpc(
            StatusCode::SERVICE_UNAVAILABLE,
            id,
            INTERNAL_ERROR_CODE,
            format!("failed to launch \"{name}\": {reason}"),
            None,
        ),
        RouterError::BridgeClosed(name) => ApiError::as_jsonrpc(
            StatusCode::SERVICE_UNAVAILABLE,
            id,
            INTERNAL_ERROR_CODE,
            format!("bridge for \"{name}\" closed"),
            None,
        ),
        RouterError::Timeout { name, elapsed } => ApiError::as_jsonrpc(
            StatusCode::GATEWAY_TIMEOUT,
            id,
            INTERNAL_ERROR_CODE,
            format!("request to \"{name}\" timed out after {elapsed:?}"),
            None,
        ),
        RouterError::UpstreamError { code, message, data } => {
            ApiError::as_jsonrpc(StatusCode::OK, id, code, message, data)
        }
        RouterError::InvalidInput(message) => ApiError::bad_request(message),
        RouterError::Internal(message) => ApiError::as_jsonrpc(
            StatusCode::INTERNAL_SERVER_ERROR,
            id,
            INTERNAL_ERROR_CODE,
            message,
            None,
        ),
    }
}

/// Maps a [`RouterError`] surfaced from an admin endpoint (start/stop/
/// restart/list) onto a plain JSON error body — these never speak
/// JSON-RPC, they're router-native REST.
pub fn admin_error_response(err: RouterError) -> ApiError {
    match err {
        RouterError::UnknownServer(name) => {
            ApiError::not_found(format!("no server declared with name \"{name}\""))
        }
        RouterError::LaunchFailed { name, reason } => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": format!("failed to launch \"{name}\": {reason}") }),
        ),
        RouterError::InvalidInput(message) => ApiError::bad_request(message),
        other => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": other.to_string() }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn upstream_error_is_forwarded_as_is_with_200() {
        let err = RouterError::UpstreamError {
            code: -32000,
            message: "tool exploded".to_string(),
            data: None,
        };
        let response = proxy_error_response(err, json!(1));
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["error"]["code"], json!(-32000));
    }

    #[test]
    fn circuit_open_carries_retry_after_in_seconds() {
        let err = RouterError::CircuitOpen {
            name: "echo".to_string(),
            retry_after: Duration::from_secs(12),
        };
        let response = proxy_error_response(err, json!(1));
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body["error"]["data"]["retry_after"], json!(12.0));
    }

    #[test]
    fn unknown_server_is_404() {
        let err = RouterError::UnknownServer("ghost".to_string());
        let response = admin_error_response(err);
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
