//! Orchestrator composing the server registry, process manager, and
//! bridges: auto-start, health loop, restart-with-backoff, bridge lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bridge::StdioBridge;
use crate::credential::{resolve_env, CredentialStore};
use crate::error::RouterError;
use crate::process::ProcessManager;
use crate::registry::{ProcessStatus, ServerRegistry};

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    registry: Arc<ServerRegistry>,
    process_manager: Arc<ProcessManager>,
    credentials: Arc<dyn CredentialStore>,
    bridges: RwLock<HashMap<String, Arc<StdioBridge>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    init_timeout: Duration,
    stop_grace: Duration,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        process_manager: Arc<ProcessManager>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Arc<Self> {
        Self::with_timeouts(registry, process_manager, credentials, DEFAULT_INIT_TIMEOUT, DEFAULT_STOP_GRACE)
    }

    pub fn with_timeouts(
        registry: Arc<ServerRegistry>,
        process_manager: Arc<ProcessManager>,
        credentials: Arc<dyn CredentialStore>,
        init_timeout: Duration,
        stop_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            process_manager,
            credentials,
            bridges: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            init_timeout,
            stop_grace,
        })
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Launch every `auto_start` declaration concurrently. Individual
    /// failures are logged and recorded; none abort the others.
    pub async fn start(self: &Arc<Self>) {
        let declarations = self.registry.auto_start_set().await;
        let mut tasks = tokio::task::JoinSet::new();
        for declaration in declarations {
            let supervisor = Arc::clone(self);
            tasks.spawn(async move {
                if let Err(err) = supervisor.start_server(&declaration.name).await {
                    warn!(name = %declaration.name, error = %err, "auto-start failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Idempotent: returns immediately if already `Running`.
    pub async fn start_server(&self, name: &str) -> Result<(), RouterError> {
        let lock = self.lock_for(name).await;
        let _permit = lock.lock().await;
        self.start_server_locked(name).await
    }

    async fn start_server_locked(&self, name: &str) -> Result<(), RouterError> {
        let (declaration, state) = self.registry.get(name).await?;
        if state.status == ProcessStatus::Running {
            return Ok(());
        }

        self.registry.set_status(name, ProcessStatus::Starting).await?;

        let env = match resolve_env(&declaration.env, self.credentials.as_ref()).await {
            Ok(env) => env,
            Err(reason) => {
                self.registry.set_last_error(name, reason.clone()).await.ok();
                self.registry.set_status(name, ProcessStatus::Failed).await.ok();
                return Err(RouterError::LaunchFailed { name: name.to_string(), reason });
            }
        };

        let pipes = match self
            .process_manager
            .start(name, &declaration.command, &declaration.args, env)
            .await
        {
            Ok(pipes) => pipes,
            Err(err) => {
                self.registry.set_last_error(name, err.to_string()).await.ok();
                self.registry.set_status(name, ProcessStatus::Failed).await.ok();
                return Err(err);
            }
        };
        self.registry
            .set_pid(name, self.process_manager.pid(name).await)
            .await?;

        let bridge = match StdioBridge::start(
            name,
            Box::new(pipes.stdin),
            Box::new(pipes.stdout),
            self.init_timeout,
        )
        .await
        {
            Ok(bridge) => bridge,
            Err(err) => {
                let _ = self.process_manager.stop(name, self.stop_grace).await;
                self.registry.set_last_error(name, err.to_string()).await.ok();
                self.registry.set_status(name, ProcessStatus::Failed).await.ok();
                return Err(RouterError::LaunchFailed {
                    name: name.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        self.bridges.write().await.insert(name.to_string(), bridge);
        self.registry.set_status(name, ProcessStatus::Running).await?;
        Ok(())
    }

    /// Idempotent: returns immediately if already `Stopped`.
    pub async fn stop_server(&self, name: &str) -> Result<(), RouterError> {
        let lock = self.lock_for(name).await;
        let _permit = lock.lock().await;
        self.stop_server_locked(name).await
    }

    async fn stop_server_locked(&self, name: &str) -> Result<(), RouterError> {
        let (_, state) = self.registry.get(name).await?;
        if state.status == ProcessStatus::Stopped {
            return Ok(());
        }

        self.registry.set_status(name, ProcessStatus::Stopping).await?;
        if let Some(bridge) = self.bridges.write().await.remove(name) {
            bridge.close().await;
        }
        self.process_manager.stop(name, self.stop_grace).await?;
        self.registry.set_status(name, ProcessStatus::Stopped).await?;
        Ok(())
    }

    /// `StopServer` then `StartServer`; resets `restart_count` for this
    /// episode.
    pub async fn restart_server(&self, name: &str) -> Result<(), RouterError> {
        let lock = self.lock_for(name).await;
        let _permit = lock.lock().await;
        self.stop_server_locked(name).await?;
        self.registry.reset_restart_count(name).await?;
        self.start_server_locked(name).await
    }

    /// Returns the bridge iff the declared status is `Running`.
    pub async fn get_bridge(&self, name: &str) -> Option<Arc<StdioBridge>> {
        let (_, state) = self.registry.get(name).await.ok()?;
        if state.status != ProcessStatus::Running {
            return None;
        }
        self.bridges.read().await.get(name).cloned()
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Most recent bounded tail of `name`'s stderr, for read-only diagnostics
    /// on the admin surface. `None` if the process has never been started.
    pub async fn stderr_tail(&self, name: &str) -> Option<Vec<u8>> {
        self.process_manager.stderr_tail(name).await
    }

    /// Spawn a ticker that walks every declared server once per `tick`,
    /// restarting crashed `restart_on_failure` servers up to their ceiling
    /// and marking the rest `Failed`. Cancel the returned handle before
    /// calling [`Supervisor::shutdown`].
    pub fn spawn_health_loop(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                supervisor.health_tick().await;
            }
        })
    }

    async fn health_tick(self: &Arc<Self>) {
        let entries = self.registry.list().await;
        for (declaration, state) in entries {
            if state.status != ProcessStatus::Running {
                continue;
            }
            if self.process_manager.is_alive(&declaration.name).await {
                continue;
            }

            let lock = self.lock_for(&declaration.name).await;
            let _permit = lock.lock().await;

            // re-check under the lock: a manual stop may have raced us
            let Ok((_, state)) = self.registry.get(&declaration.name).await else {
                continue;
            };
            if state.status != ProcessStatus::Running {
                continue;
            }

            if let Some(bridge) = self.bridges.write().await.remove(&declaration.name) {
                bridge.close().await;
            }
            let _ = self
                .process_manager
                .stop(&declaration.name, self.stop_grace)
                .await;

            if declaration.restart_on_failure {
                let Ok(count) = self.registry.increment_restart_count(&declaration.name).await else {
                    continue;
                };
                if count <= declaration.max_restarts {
                    let _ = self
                        .registry
                        .set_status(&declaration.name, ProcessStatus::Stopped)
                        .await;
                    if let Err(err) = self.start_server_locked(&declaration.name).await {
                        warn!(name = %declaration.name, error = %err, "restart attempt failed");
                    }
                    continue;
                }
            }
            let _ = self
                .registry
                .set_status(&declaration.name, ProcessStatus::Failed)
                .await;
        }
    }

    /// Close every live bridge, then stop every managed process with a
    /// deadline. Callers should cancel the health loop first.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.bridges.read().await.keys().cloned().collect();
        for name in names {
            if let Some(bridge) = self.bridges.write().await.remove(&name) {
                bridge.close().await;
            }
        }
        self.process_manager.stop_all(self.stop_grace).await;
    }
}
