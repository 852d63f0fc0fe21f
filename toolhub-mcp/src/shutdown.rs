//! Graceful shutdown coordinator for the supervisor and its managed servers.
//!
//! Cancels the health loop first, then closes every live bridge, then asks
//! the process manager to stop all children, all bounded by a deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::supervisor::Supervisor;

/// Shutdown signal types, broadcast to anything that subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Drives the one ordered teardown sequence for the whole router: cancel the
/// health loop, then `Supervisor::shutdown`, bounded by a deadline.
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    supervisor: Arc<Supervisor>,
    health_loop: RwLock<Option<JoinHandle<()>>>,
    graceful_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<Supervisor>, health_loop: JoinHandle<()>, graceful_timeout: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            supervisor,
            health_loop: RwLock::new(Some(health_loop)),
            graceful_timeout,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    pub async fn is_shutting_down(&self) -> bool {
        matches!(
            *self.state.read().await,
            ShutdownState::ShuttingDown | ShutdownState::Shutdown
        )
    }

    pub async fn is_shutdown(&self) -> bool {
        matches!(*self.state.read().await, ShutdownState::Shutdown)
    }

    /// Idempotent: a second call while shutdown is already in progress is a
    /// no-op.
    pub async fn initiate_shutdown(&self, timeout_duration: Duration) -> Result<()> {
        {
            let state = self.state.read().await;
            if *state != ShutdownState::Running {
                warn!("shutdown already initiated");
                return Ok(());
            }
        }
        {
            let mut state = self.state.write().await;
            *state = ShutdownState::ShuttingDown;
        }

        info!(timeout = ?timeout_duration, "initiating graceful shutdown");
        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);

        if let Some(handle) = self.health_loop.write().await.take() {
            handle.abort();
        }

        match timeout(timeout_duration, self.supervisor.shutdown()).await {
            Ok(()) => info!("graceful shutdown completed"),
            Err(_) => {
                warn!("graceful shutdown timed out, forcing");
                let _ = self.shutdown_tx.send(ShutdownSignal::Forced);
            }
        }

        {
            let mut state = self.state.write().await;
            *state = ShutdownState::Shutdown;
        }
        info!("shutdown complete");
        Ok(())
    }

    /// Spawn a task that waits for SIGTERM/SIGINT (or Ctrl+C off-unix) and
    /// drives `initiate_shutdown`.
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let coordinator = Arc::clone(self);

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let mut sigterm = signal(SignalKind::terminate())
                    .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {e}"))?;
                let mut sigint = signal(SignalKind::interrupt())
                    .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {e}"))?;

                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, initiating graceful shutdown");
                        coordinator.initiate_shutdown(coordinator.graceful_timeout).await?;
                    }
                    _ = sigint.recv() => {
                        info!("received SIGINT, initiating immediate shutdown");
                        coordinator.initiate_shutdown(Duration::from_secs(2)).await?;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                use tokio::signal::ctrl_c;

                ctrl_c()
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to install Ctrl+C handler: {e}"))?;

                info!("received Ctrl+C, initiating graceful shutdown");
                coordinator
                    .initiate_shutdown(coordinator.graceful_timeout)
                    .await?;
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::InMemoryCredentialStore;
    use crate::process::ProcessManager;
    use crate::registry::ServerDeclaration;
    use crate::registry::ServerRegistry;
    use std::collections::HashMap;

    const ECHO_CHILD: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialized"'*) ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id" ;;
  esac
done
"#;

    fn test_supervisor() -> Arc<Supervisor> {
        let declaration = ServerDeclaration {
            name: "echo".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), ECHO_CHILD.to_string()],
            env: HashMap::new(),
            auto_start: false,
            restart_on_failure: false,
            max_restarts: 0,
            health_check_interval: Duration::from_secs(1),
            description: String::new(),
        };
        let registry = ServerRegistry::load(vec![declaration]).unwrap();
        Supervisor::new(registry, ProcessManager::new(), Arc::new(InMemoryCredentialStore::new()))
    }

    #[tokio::test]
    async fn initial_state_is_running() {
        let supervisor = test_supervisor();
        let health_loop = tokio::spawn(std::future::pending::<()>());
        let coordinator = ShutdownCoordinator::new(supervisor, health_loop, Duration::from_secs(5));
        assert!(!coordinator.is_shutting_down().await);
        assert!(!coordinator.is_shutdown().await);
    }

    #[tokio::test]
    async fn shutdown_closes_bridges_and_stops_children() {
        let supervisor = test_supervisor();
        supervisor.start_server("echo").await.unwrap();
        assert!(supervisor.get_bridge("echo").await.is_some());

        let health_loop = tokio::spawn(std::future::pending::<()>());
        let coordinator = ShutdownCoordinator::new(Arc::clone(&supervisor), health_loop, Duration::from_secs(5));

        coordinator.initiate_shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(coordinator.is_shutdown().await);
        assert!(supervisor.get_bridge("echo").await.is_none());
    }

    #[tokio::test]
    async fn second_call_while_shutting_down_is_a_noop() {
        let supervisor = test_supervisor();
        let health_loop = tokio::spawn(std::future::pending::<()>());
        let coordinator = ShutdownCoordinator::new(supervisor, health_loop, Duration::from_secs(5));

        coordinator.initiate_shutdown(Duration::from_secs(5)).await.unwrap();
        coordinator.initiate_shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(coordinator.is_shutdown().await);
    }
}
