use std::time::Duration;

use mcp_console::config::Settings;
use mcp_console::{api, AppServices};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env();
    let bind_addr = settings.bind_addr.clone();

    let services = AppServices::build(settings)?;
    let maintenance = services.spawn_maintenance(MAINTENANCE_INTERVAL);

    let app = api::router(services.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    log::info!("mcp-console listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    services.shutdown().await;
    log::info!("mcp-console stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to listen for shutdown signal: {}", e);
    }
}
