mod bridge; // Function-calling view for chat loops
mod composer; // Kit name -> gateway
mod config; // Environment and servers file
mod error; // Error types and HTTP mapping
mod gateway; // Per-kit MCP server
mod handlers; // HTTP endpoints
mod kit; // Kit selectors
mod mcp; // Downstream MCP client side
mod registry; // Connections plus enable flags

use reqwest::Client as HttpClient;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::composer::Composer;
use crate::config::{Config, ServersFile};
use crate::handlers::AppState;
use crate::registry::{register_all, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_composer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    info!("Starting MCP composer");

    let servers_file = ServersFile::load(&config.servers_config_path)?;
    let kits = servers_file
        .kits()
        .map_err(|e| anyhow::anyhow!("Invalid kit configuration: {}", e))?;

    let registry = Arc::new(Registry::new(config.connection_options(), HttpClient::new()));
    register_all(&registry, servers_file.servers()).await;

    // Kit binding errors are fatal
    let composer = Arc::new(
        Composer::build(Arc::clone(&registry), kits)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind kits: {}", e))?,
    );
    for gateway in composer.gateways() {
        info!(
            "Kit '{}' available at {}{}",
            gateway.name(),
            config.proxy_url,
            gateway.sse_path()
        );
    }

    let state = AppState::new(config.clone(), Arc::clone(&composer));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = handlers::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&composer)))
        .await?;

    composer.shutdown(config.shutdown_grace).await;
    info!("Shut down");
    Ok(())
}

/// Resolves on Ctrl-C after ending every gateway session, since open event
/// streams would otherwise hold the graceful shutdown forever.
async fn shutdown_signal(composer: Arc<Composer>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    composer.close_sessions().await;
}
