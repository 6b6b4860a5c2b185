use spectra_orchestrator::{
    agent::Orchestrator,
    api::{start_server, ApiState},
    config::AppConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    info!("SPECTRA investigation orchestrator - API server");
    info!("Port: {}", config.port);
    info!("MCP server: {}", config.mcp_server_url);

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    let state = ApiState::new(orchestrator);

    // Drop conversations nobody has touched for a while.
    let sessions = Arc::clone(&state.sessions);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            sessions.evict_idle().await;
        }
    });

    info!("Orchestrator initialized, starting API server");

    start_server(state, config.port).await?;

    Ok(())
}
