//! Process supervision, stdio JSON-RPC bridging, and circuit breaking for a
//! fleet of MCP tool servers.
//!
//! A [`registry::ServerRegistry`] holds what's declared; a
//! [`process::ProcessManager`] owns the OS processes; a
//! [`bridge::StdioBridge`] speaks newline-delimited JSON-RPC over each
//! child's stdin/stdout; [`supervisor::Supervisor`] composes the three into
//! start/stop/restart and a health loop. [`breaker::CircuitBreakerRegistry`]
//! and [`cache::Cache`] are consulted by the request pipeline built on top of
//! this crate, not by the supervisor itself.

pub mod breaker;
pub mod bridge;
pub mod cache;
pub mod credential;
pub mod error;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod shutdown;
pub mod supervisor;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState};
pub use bridge::StdioBridge;
pub use cache::{Cache, CacheStats};
pub use credential::{CredentialStore, InMemoryCredentialStore};
pub use error::RouterError;
pub use process::{ChildPipes, ProcessManager};
pub use registry::{EnvValue, ProcessState, ProcessStatus, ServerDeclaration, ServerRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal, ShutdownState};
pub use supervisor::Supervisor;
