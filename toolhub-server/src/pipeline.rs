//! Request pipeline (C9): the two end-to-end entry points, `proxy` and
//! `enhance`, composing the breaker gate, on-demand server start, and bridge
//! dispatch described in spec §4.9. Admin operations (`start`/`stop`/
//! `restart`/`list`) delegate straight to the supervisor and emit their own
//! `admin_action` audit event.

use serde_json::Value;
use toolhub_mcp::error::RouterError;
use toolhub_mcp::registry::{ProcessStatus, ServerDeclaration, ProcessState};

use crate::audit::AuditEvent;
use crate::enhancement::EnhanceResult;
use crate::state::AppState;

/// Proxy a single JSON-RPC call to `server_name`. Mirrors spec §4.9 step by
/// step: breaker gate, on-demand auto-start, bridge dispatch, breaker
/// record. Callers own translating the `Result` into an HTTP response —
/// this function stays transport-agnostic.
pub async fn proxy(
    state: &AppState,
    server_name: &str,
    method: &str,
    params: Value,
) -> Result<Value, RouterError> {
    let (declaration, process_state) = state.supervisor.registry().get(server_name).await?;

    state.breakers.check(server_name).await?;

    if process_state.status == ProcessStatus::Stopped && declaration.auto_start {
        state.supervisor.start_server(server_name).await?;
    }

    let bridge = state
        .supervisor
        .get_bridge(server_name)
        .await
        .ok_or_else(|| RouterError::NotRunning(server_name.to_string()))?;

    match bridge.send(method, params, state.bridge_timeout).await {
        Ok(result) => {
            state.breakers.record_success(server_name).await;
            state.supervisor.registry().touch_activity(server_name).await.ok();
            Ok(result)
        }
        Err(err) => {
            if err.is_breaker_failure() {
                state.breakers.record_failure(server_name).await;
            }
            Err(err)
        }
    }
}

/// The enhancement entry point (§4.7), delegated straight to the
/// `EnhancementService` — enhancement never fails the caller.
pub async fn enhance(state: &AppState, prompt: &str, client_id: Option<&str>, bypass_cache: bool) -> EnhanceResult {
    state.enhancement.enhance(prompt, client_id, bypass_cache).await
}

/// `name -> (declaration, process state)` for admin listing.
pub async fn list_servers(state: &AppState) -> Vec<(ServerDeclaration, ProcessState)> {
    state.supervisor.registry().list().await
}

pub async fn get_server(state: &AppState, name: &str) -> Result<(ServerDeclaration, ProcessState), RouterError> {
    state.supervisor.registry().get(name).await
}

/// Tail of `name`'s stderr ring buffer, decoded lossily for display.
pub async fn server_stderr_tail(state: &AppState, name: &str) -> Option<String> {
    let bytes = state.supervisor.stderr_tail(name).await?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn start_server(state: &AppState, name: &str) -> Result<ProcessStatus, RouterError> {
    let (_, before) = state.supervisor.registry().get(name).await?;
    if before.status == ProcessStatus::Running {
        return Err(RouterError::InvalidInput(format!("\"{name}\" is already running")));
    }
    let result = state.supervisor.start_server(name).await;
    let (_, after) = state.supervisor.registry().get(name).await?;
    emit_admin_event("start", name, before.status, after.status, result.is_ok());
    result.map(|_| after.status)
}

pub async fn stop_server(state: &AppState, name: &str) -> Result<ProcessStatus, RouterError> {
    let (_, before) = state.supervisor.registry().get(name).await?;
    if before.status == ProcessStatus::Stopped {
        return Err(RouterError::InvalidInput(format!("\"{name}\" is already stopped")));
    }
    let result = state.supervisor.stop_server(name).await;
    let (_, after) = state.supervisor.registry().get(name).await?;
    emit_admin_event("stop", name, before.status, after.status, result.is_ok());
    result.map(|_| after.status)
}

pub async fn restart_server(state: &AppState, name: &str) -> Result<ProcessStatus, RouterError> {
    let (_, before) = state.supervisor.registry().get(name).await?;
    let result = state.supervisor.restart_server(name).await;
    let (_, after) = state.supervisor.registry().get(name).await?;
    emit_admin_event("restart", name, before.status, after.status, result.is_ok());
    result.map(|_| after.status)
}

fn emit_admin_event(action: &str, name: &str, before: ProcessStatus, after: ProcessStatus, succeeded: bool) {
    AuditEvent {
        event: "admin_action",
        status: if succeeded { "success" } else { "failed" },
        detail: Some(format!("{action} \"{name}\": {before:?} -> {after:?}")),
    }
    .emit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnhancementConfig, EnhancementRule};
    use crate::llm_client::{LlmClient, LlmError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use toolhub_mcp::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use toolhub_mcp::cache::Cache;
    use toolhub_mcp::credential::InMemoryCredentialStore;
    use toolhub_mcp::process::ProcessManager;
    use toolhub_mcp::registry::ServerRegistry;
    use toolhub_mcp::supervisor::Supervisor;

    struct NeverLlm;

    #[async_trait]
    impl LlmClient for NeverLlm {
        async fn generate(
            &self,
            _model_id: &str,
            _system_prompt: &str,
            _prompt: &str,
            _temperature: f32,
            _max_tokens: u32,
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            Err(LlmError::ConnectionRefused)
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

    fn declaration(name: &str, auto_start: bool) -> ServerDeclaration {
        ServerDeclaration {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), ECHO_CHILD.to_string()],
            env: HashMap::new(),
            auto_start,
            restart_on_failure: false,
            max_restarts: 0,
            health_check_interval: Duration::from_secs(5),
            description: String::new(),
        }
    }

    fn test_state(declarations: Vec<ServerDeclaration>) -> AppState {
        let registry = ServerRegistry::load(declarations).unwrap();
        let supervisor = Supervisor::new(
            registry,
            ProcessManager::new(),
            Arc::new(InMemoryCredentialStore::new()),
        );
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        }));
        let enhancement = Arc::new(crate::enhancement::EnhancementService::new(
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
            Arc::new(NeverLlm),
            Duration::from_millis(50),
        ));
        AppState {
            supervisor,
            breakers,
            enhancement,
            bridge_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn proxy_unknown_server_is_an_error() {
        let state = test_state(vec![]);
        let err = proxy(&state, "ghost", "tools/list", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn proxy_auto_starts_a_stopped_server_and_dispatches() {
        let state = test_state(vec![declaration("echo", true)]);
        let result = proxy(&state, "echo", "tools/list", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn proxy_on_a_non_auto_start_stopped_server_is_not_running() {
        let state = test_state(vec![declaration("echo", false)]);
        let err = proxy(&state, "echo", "tools/list", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NotRunning(_)));
    }

    #[tokio::test]
    async fn start_stop_restart_round_trip() {
        let state = test_state(vec![declaration("echo", false)]);
        let status = start_server(&state, "echo").await.unwrap();
        assert_eq!(status, ProcessStatus::Running);

        assert!(start_server(&state, "echo").await.is_err());

        let status = stop_server(&state, "echo").await.unwrap();
        assert_eq!(status, ProcessStatus::Stopped);

        assert!(stop_server(&state, "echo").await.is_err());

        start_server(&state, "echo").await.unwrap();
        let status = restart_server(&state, "echo").await.unwrap();
        assert_eq!(status, ProcessStatus::Running);
    }
}
