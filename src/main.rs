use std::net::SocketAddr;

use anyhow::Context;

use mpesa_mcp::config::AppConfig;
use mpesa_mcp::routes::build_router;
use mpesa_mcp::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("🔧 Credential source: {}", config.credential_source.as_str());
    tracing::info!("🌐 Environment: {}", config.mpesa_environment);
    tracing::debug!("Config: {}", config.get_config_info());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;

    let app_state = AppState::new(config).context("Failed to initialize M-Pesa service")?;
    let app = build_router(app_state);

    start_server(app, addr).await
}

async fn start_server(app: axum::Router, addr: SocketAddr) -> anyhow::Result<()> {
    tracing::info!("🚀 M-Pesa MCP server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Application shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
