//! Entry point: loads config, wires the core up, serves HTTP, and drives
//! graceful shutdown on SIGTERM/SIGINT.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use toolhub_mcp::breaker::CircuitBreakerRegistry;
use toolhub_mcp::cache::Cache;
use toolhub_mcp::credential::InMemoryCredentialStore;
use toolhub_mcp::process::ProcessManager;
use toolhub_mcp::registry::ServerRegistry;
use toolhub_mcp::runtime::RuntimeConfig;
use toolhub_mcp::shutdown::ShutdownCoordinator;
use toolhub_mcp::supervisor::Supervisor;

use toolhub_server::config::RouterConfig;
use toolhub_server::enhancement::EnhancementService;
use toolhub_server::http::build_router;
use toolhub_server::llm_client::OllamaClient;
use toolhub_server::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "toolhub-server", about = "Local request router for a fleet of MCP tool servers")]
struct Cli {
    /// Path to the router's YAML config file.
    #[arg(short, long, default_value = "toolhub.yaml")]
    config: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let runtime = RuntimeConfig::default_for_mcp().build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RouterConfig::load(&cli.config)?;

    let registry = ServerRegistry::load(config.servers.clone())?;
    let process_manager = ProcessManager::new();
    // No external keychain/vault integration is wired up yet — credential
    // refs in the config resolve against an empty store and fail at launch.
    let credentials = Arc::new(InMemoryCredentialStore::new());

    let supervisor = Supervisor::with_timeouts(
        registry,
        process_manager,
        credentials,
        Duration::from_secs(config.init_timeout_secs),
        Duration::from_secs(5),
    );

    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone().into()));
    let cache = Cache::new(config.cache_size);
    let llm: Arc<dyn toolhub_server::llm_client::LlmClient> =
        Arc::new(OllamaClient::new(config.ollama_base_url.clone()));
    let enhancement = Arc::new(EnhancementService::new(
        config.enhancement.clone(),
        cache,
        Arc::clone(&breakers),
        llm,
        Duration::from_secs(config.llm_timeout_secs),
    ));

    let app_state = AppState {
        supervisor: Arc::clone(&supervisor),
        breakers,
        enhancement,
        bridge_timeout: Duration::from_secs(config.bridge_timeout_secs),
    };

    supervisor.start().await;
    let health_loop = supervisor.spawn_health_loop(Duration::from_secs(config.health_tick_secs));
    let shutdown = ShutdownCoordinator::new(Arc::clone(&supervisor), health_loop, Duration::from_secs(30));
    shutdown.listen_for_signals();

    let router = build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(bind_addr = %config.bind_addr, "toolhub listening");

    let mut shutdown_rx = shutdown.subscribe();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    Ok(())
}
