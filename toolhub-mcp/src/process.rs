//! Spawns, monitors, and terminates child tool-server processes.
//!
//! The manager wires each child's stdin/stdout/stderr to pipes it owns.
//! stdin/stdout are handed off to the [`crate::bridge::StdioBridge`]
//! constructed over them — from that point on the bridge owns them
//! exclusively. The manager keeps stderr for itself: a bounded ring buffer
//! of the most recent diagnostic output, never interpreted, only collected.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

use crate::error::RouterError;

const STDERR_RING_BUFFER_CAPACITY: usize = 64 * 1024;

/// stdin/stdout handed off to whatever constructs a bridge on top of this
/// child. The process manager never reads or writes them again.
pub struct ChildPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

struct StderrRingBuffer {
    capacity: usize,
    buf: Mutex<Vec<u8>>,
}

impl StderrRingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Mutex::new(Vec::new()),
        }
    }

    async fn push(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().await;
        buf.extend_from_slice(bytes);
        if buf.len() > self.capacity {
            let overflow = buf.len() - self.capacity;
            buf.drain(0..overflow);
        }
    }

    async fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().await.clone()
    }
}

async fn collect_stderr(stderr: ChildStderr, buffer: Arc<StderrRingBuffer>) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => buffer.push(line.as_bytes()).await,
        }
    }
}

struct ManagedProcess {
    child: Child,
    stderr_buffer: Arc<StderrRingBuffer>,
    stderr_task: JoinHandle<()>,
}

/// Spawn/stop/kill of child processes. Keyed by server name; at most one
/// managed process per name at a time.
pub struct ProcessManager {
    processes: RwLock<HashMap<String, ManagedProcess>>,
}

impl ProcessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
        })
    }

    /// Launch `name`, returning the stdin/stdout pipes for a bridge to take
    /// ownership of. Replaces any previous entry for `name` without
    /// stopping it first — callers are expected to have called `stop`
    /// already if one existed.
    pub async fn start(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: HashMap<String, String>,
    ) -> Result<ChildPipes, RouterError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| RouterError::LaunchFailed {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

        let stdin = child.stdin.take().expect("stdin piped at spawn");
        let stdout = child.stdout.take().expect("stdout piped at spawn");
        let stderr = child.stderr.take().expect("stderr piped at spawn");

        let stderr_buffer = Arc::new(StderrRingBuffer::new(STDERR_RING_BUFFER_CAPACITY));
        let stderr_task = tokio::spawn(collect_stderr(stderr, Arc::clone(&stderr_buffer)));

        let mut processes = self.processes.write().await;
        processes.insert(
            name.to_string(),
            ManagedProcess {
                child,
                stderr_buffer,
                stderr_task,
            },
        );

        Ok(ChildPipes { stdin, stdout })
    }

    /// Non-blocking liveness check: `Ok(None)` from a `try_wait` means the
    /// child hasn't exited.
    pub async fn is_alive(&self, name: &str) -> bool {
        let mut processes = self.processes.write().await;
        match processes.get_mut(name) {
            Some(managed) => matches!(managed.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn pid(&self, name: &str) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(name).and_then(|managed| managed.child.id())
    }

    /// Most recent bounded tail of the child's stderr, for diagnostics.
    pub async fn stderr_tail(&self, name: &str) -> Option<Vec<u8>> {
        let processes = self.processes.read().await;
        match processes.get(name) {
            Some(managed) => Some(managed.stderr_buffer.snapshot().await),
            None => None,
        }
    }

    /// Request polite termination; force-kill if `grace` elapses first.
    /// Idempotent: stopping an unknown or already-stopped name is a no-op.
    pub async fn stop(&self, name: &str, grace: Duration) -> Result<(), RouterError> {
        let managed = {
            let mut processes = self.processes.write().await;
            processes.remove(name)
        };
        let Some(managed) = managed else {
            return Ok(());
        };
        Self::terminate(managed, grace).await
    }

    async fn terminate(mut managed: ManagedProcess, grace: Duration) -> Result<(), RouterError> {
        #[cfg(unix)]
        {
            if let Some(pid) = managed.child.id() {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = managed.child.start_kill();
        }

        if timeout(grace, managed.child.wait()).await.is_err() {
            warn!("child did not exit within grace period, force-killing");
            let _ = managed.child.start_kill();
            let _ = managed.child.wait().await;
        }

        managed.stderr_task.abort();
        Ok(())
    }

    /// Stop every currently managed process concurrently, each with its own
    /// grace deadline. Never blocks indefinitely on any single entry.
    pub async fn stop_all(self: &Arc<Self>, grace: Duration) {
        let names: Vec<String> = {
            let processes = self.processes.read().await;
            processes.keys().cloned().collect()
        };

        let mut tasks = tokio::task::JoinSet::new();
        for name in names {
            let manager = Arc::clone(self);
            tasks.spawn(async move {
                let _ = manager.stop(&name, grace).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
