//! Request-scoped audit context, propagated via a task-local so that
//! background work spawned from within a request inherits it without
//! explicit threading.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: AuditContext;
}

/// Immutable per-request record, created at ingress. Visible to all work
/// performed on behalf of that ingress via [`AuditContext::scope`].
#[derive(Debug, Clone, Serialize)]
pub struct AuditContext {
    pub request_id: Uuid,
    pub client_id: String,
    pub client_ip: String,
    pub session_id: Option<String>,
}

impl AuditContext {
    pub fn new(client_id: String, client_ip: String, session_id: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_id,
            client_ip,
            session_id,
        }
    }

    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT.scope(self, fut).await
    }

    /// Read the context from outside a request (e.g. the health loop) — `None`.
    pub fn try_current() -> Option<AuditContext> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }
}

/// `tokio::spawn` does not by itself carry a task-local across the task
/// boundary — it has to be re-entered in the new task. Background work
/// started from within a request should go through this instead of
/// `tokio::spawn` directly so it inherits the ingress context.
pub fn spawn_scoped<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    match AuditContext::try_current() {
        Some(ctx) => tokio::spawn(ctx.scope(fut)),
        None => tokio::spawn(fut),
    }
}

/// One `{event, status, ...}` audit record. `status = "failed"` is logged at
/// error level, per spec.
pub struct AuditEvent {
    pub event: &'static str,
    pub status: &'static str,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn emit(self) {
        let ctx = AuditContext::try_current();
        let request_id = ctx.as_ref().map(|c| c.request_id.to_string());
        let client_id = ctx.as_ref().map(|c| c.client_id.clone());
        let client_ip = ctx.as_ref().map(|c| c.client_ip.clone());
        let session_id = ctx.as_ref().and_then(|c| c.session_id.clone());

        if self.status == "failed" {
            tracing::error!(
                event = self.event,
                status = self.status,
                request_id,
                client_id,
                client_ip,
                session_id,
                detail = self.detail,
                "audit event"
            );
        } else {
            tracing::info!(
                event = self.event,
                status = self.status,
                request_id,
                client_id,
                client_ip,
                session_id,
                detail = self.detail,
                "audit event"
            );
        }
    }
}

fn header_str<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// axum middleware: builds the [`AuditContext`] from ingress headers, scopes
/// the rest of the handler chain to it, stamps `X-Request-ID` on the way out,
/// and emits one `http_request` audit event per call.
pub async fn audit_layer(req: Request, next: Next) -> Response {
    let client_id = header_str(&req, "x-client-id").unwrap_or("anonymous").to_string();
    let client_ip = header_str(&req, "x-forwarded-for")
        .map(|s| s.to_string())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());
    let session_id = header_str(&req, "x-session-id").map(|s| s.to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let ctx = AuditContext::new(client_id, client_ip, session_id);
    let request_id = ctx.request_id;

    let mut response = ctx.scope(next.run(req)).await;

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }

    let status = response.status().as_u16();
    AuditEvent {
        event: "http_request",
        status: if status >= 500 { "failed" } else { "success" },
        detail: Some(format!(
            "{method} {path} -> {status} in {:?}",
            started.elapsed()
        )),
    }
    .emit();

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_is_visible_inside_scope_and_absent_outside() {
        assert!(AuditContext::try_current().is_none());

        let ctx = AuditContext::new("alice".to_string(), "127.0.0.1".to_string(), None);
        let request_id = ctx.request_id;

        let observed = ctx
            .scope(async { AuditContext::try_current().map(|c| c.request_id) })
            .await;
        assert_eq!(observed, Some(request_id));

        assert!(AuditContext::try_current().is_none());
    }

    #[tokio::test]
    async fn spawn_scoped_carries_the_context_into_the_new_task() {
        let ctx = AuditContext::new("bob".to_string(), "10.0.0.1".to_string(), Some("s1".to_string()));
        let request_id = ctx.request_id;

        let observed = ctx
            .scope(async { spawn_scoped(async { AuditContext::try_current().map(|c| c.request_id) }).await })
            .await
            .unwrap();
        assert_eq!(observed, Some(request_id));
    }

    #[tokio::test]
    async fn spawn_scoped_outside_any_context_just_runs() {
        let observed = spawn_scoped(async { AuditContext::try_current().map(|c| c.request_id) })
            .await
            .unwrap();
        assert_eq!(observed, None);
    }
}
