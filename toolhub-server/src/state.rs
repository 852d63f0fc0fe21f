//! Shared application state handed to every axum handler.

use std::sync::Arc;
use std::time::Duration;

use toolhub_mcp::breaker::CircuitBreakerRegistry;
use toolhub_mcp::supervisor::Supervisor;

use crate::enhancement::EnhancementService;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub enhancement: Arc<EnhancementService>,
    pub bridge_timeout: Duration,
}
