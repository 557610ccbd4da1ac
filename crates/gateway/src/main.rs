//! Gateway control plane binary

use gateway::{Config, GatewayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Settings come first; tracing is not initialized yet.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    let level = config.logging.level.as_deref().unwrap_or("info");
    common::logging::init_with_level(level, config.logging.is_json());

    tracing::info!(
        proxy_config = %config.proxy.config_path,
        "Gateway starting"
    );

    let server = GatewayServer::new(config)?;
    server.run().await?;

    Ok(())
}
