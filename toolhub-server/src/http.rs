//! HTTP surface (spec §6.1). Thin axum handlers: decode/encode only, all
//! behavior lives in [`crate::pipeline`] and [`crate::enhancement`].

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use toolhub_mcp::registry::{ProcessState, ServerDeclaration};

use crate::audit::audit_layer;
use crate::error::{admin_error_response, proxy_error_response, ApiError};
use crate::pipeline;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers))
        .route("/servers/{name}", get(get_server))
        .route("/servers/{name}/start", post(start_server))
        .route("/servers/{name}/stop", post(stop_server))
        .route("/servers/{name}/restart", post(restart_server))
        .route("/mcp/{name}/{*path}", post(proxy_call))
        .route("/ollama/enhance", post(enhance))
        .route("/circuit-breakers", get(circuit_breakers))
        .route("/circuit-breakers/{name}/reset", post(reset_circuit_breaker))
        .layer(middleware::from_fn(audit_layer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    servers: usize,
    running: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let servers = pipeline::list_servers(&state).await;
    let running = servers
        .iter()
        .filter(|(_, s)| s.status == toolhub_mcp::registry::ProcessStatus::Running)
        .count();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        servers: servers.len(),
        running,
    })
}

#[derive(Serialize)]
struct ServerView {
    #[serde(flatten)]
    declaration: ServerDeclaration,
    state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr_tail: Option<String>,
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerView>> {
    let servers = pipeline::list_servers(&state).await;
    let mut views = Vec::with_capacity(servers.len());
    for (declaration, process_state) in servers {
        views.push(ServerView { declaration, state: process_state, stderr_tail: None });
    }
    Json(views)
}

async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServerView>, ApiError> {
    let (declaration, process_state) = pipeline::get_server(&state, &name)
        .await
        .map_err(admin_error_response)?;
    let stderr_tail = pipeline::server_stderr_tail(&state, &name).await;
    Ok(Json(ServerView {
        declaration,
        state: process_state,
        stderr_tail,
    }))
}

#[derive(Serialize)]
struct AdminActionResponse {
    name: String,
    status: toolhub_mcp::registry::ProcessStatus,
}

async fn start_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AdminActionResponse>, ApiError> {
    let status = pipeline::start_server(&state, &name)
        .await
        .map_err(admin_error_response)?;
    Ok(Json(AdminActionResponse { name, status }))
}

async fn stop_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AdminActionResponse>, ApiError> {
    let status = pipeline::stop_server(&state, &name)
        .await
        .map_err(admin_error_response)?;
    Ok(Json(AdminActionResponse { name, status }))
}

async fn restart_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AdminActionResponse>, ApiError> {
    let status = pipeline::restart_server(&state, &name)
        .await
        .map_err(admin_error_response)?;
    Ok(Json(AdminActionResponse { name, status }))
}

/// `{name}/{*path}` — `path` documents which tool-server method the call is
/// aimed at for operators reading access logs; dispatch itself follows the
/// JSON-RPC envelope's own `method`/`id`/`params` fields in the body, per
/// spec §6.1.
async fn proxy_call(
    State(state): State<AppState>,
    Path((name, _path)): Path<(String, String)>,
    Json(envelope): Json<Value>,
) -> Response {
    let id = envelope.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = envelope.get("method").and_then(Value::as_str) else {
        return ApiError::bad_request("jsonrpc envelope is missing \"method\"").into_response();
    };
    let params = envelope.get("params").cloned().unwrap_or(json!({}));

    match pipeline::proxy(&state, &name, method, params).await {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response(),
        Err(err) => proxy_error_response(err, id).into_response(),
    }
}

#[derive(Deserialize)]
struct EnhanceRequest {
    prompt: String,
    #[serde(default)]
    bypass_cache: bool,
}

async fn enhance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EnhanceRequest>,
) -> Response {
    if request.prompt.trim().is_empty() {
        return ApiError::bad_request("prompt must not be empty").into_response();
    }
    let client_name = headers
        .get("x-client-name")
        .and_then(|v| v.to_str().ok());
    let result = pipeline::enhance(&state, &request.prompt, client_name, request.bypass_cache).await;
    (StatusCode::OK, Json(result)).into_response()
}

async fn circuit_breakers(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.breakers.snapshot().await;
    Json(json!(snapshot
        .into_iter()
        .map(|(name, metrics)| json!({ "name": name, "metrics": metrics, "failure_rate": metrics.failure_rate() }))
        .collect::<Vec<_>>()))
}

async fn reset_circuit_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .breakers
        .reset(&name)
        .await
        .map_err(admin_error_response)?;
    Ok(Json(json!({ "name": name, "reset": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnhancementConfig, EnhancementRule};
    use crate::enhancement::EnhancementService;
    use crate::llm_client::{LlmClient, LlmError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use toolhub_mcp::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use toolhub_mcp::cache::Cache;
    use toolhub_mcp::credential::InMemoryCredentialStore;
    use toolhub_mcp::process::ProcessManager;
    use toolhub_mcp::registry::{ServerDeclaration, ServerRegistry};
    use toolhub_mcp::supervisor::Supervisor;

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn generate(
            &self,
            _model_id: &str,
            _system_prompt: &str,
            prompt: &str,
            _temperature: f32,
            _max_tokens: u32,
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            Ok(format!("enhanced: {prompt}"))
        }
    }

    const ECHO_CHILD: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialized"'*) ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id" ;;
  esac
done
"#;

    fn test_router() -> Router {
        let declaration = ServerDeclaration {
            name: "echo".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), ECHO_CHILD.to_string()],
            env: HashMap::new(),
            auto_start: true,
            restart_on_failure: false,
            max_restarts: 0,
            health_check_interval: Duration::from_secs(5),
            description: "test echo server".to_string(),
        };
        let registry = ServerRegistry::load(vec![declaration]).unwrap();
        let supervisor = Supervisor::new(
            registry,
            ProcessManager::new(),
            Arc::new(InMemoryCredentialStore::new()),
        );
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let enhancement = Arc::new(EnhancementService::new(
            EnhancementConfig {
                default: EnhancementRule {
                    model_id: "m".to_string(),
                    system_prompt: String::new(),
                    temperature: 0.7,
                    max_tokens: 64,
                    enabled: true,
                },
                rules: HashMap::new(),
            },
            Cache::new(16),
            Arc::clone(&breakers),
            Arc::new(StubLlm),
            Duration::from_secs(1),
        ));
        build_router(AppState {
            supervisor,
            breakers,
            enhancement,
            bridge_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn health_reports_declared_servers() {
        let router = test_router();
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_server_is_404() {
        let router = test_router();
        let response = router
            .oneshot(Request::builder().uri("/servers/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proxy_call_round_trips_through_auto_started_server() {
        let router = test_router();
        let body = json!({"jsonrpc":"2.0","method":"tools/list","id":1}).to_string();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp/echo/tools/list")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn enhance_rejects_an_empty_prompt() {
        let router = test_router();
        let body = json!({"prompt": ""}).to_string();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ollama/enhance")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn circuit_breaker_reset_on_unknown_target_is_404() {
        let router = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/circuit-breakers/ghost/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
