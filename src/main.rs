use anyhow::Result;
use glyphcast::config::{EncryptionPolicy, NullKeyResolver, PaletteSelector, ServerConfig};
use std::net::Ipv4Addr;
use std::sync::Arc;

fn config_from_env() -> ServerConfig {
    let port: u16 = std::env::var("GLYPHCAST_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(7474);
    let max_clients: usize = std::env::var("GLYPHCAST_MAX_CLIENTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);
    let encryption_policy = match std::env::var("GLYPHCAST_ENCRYPTION").as_deref() {
        Ok("off") => EncryptionPolicy::Off,
        Ok("required") => EncryptionPolicy::Required,
        _ => EncryptionPolicy::OptIn,
    };

    ServerConfig {
        bind_v4: (Ipv4Addr::UNSPECIFIED, port),
        bind_v6: None,
        palette: PaletteSelector::Standard,
        custom_palette: None,
        log_destination: None,
        encryption_policy,
        key_material: None,
        allowed_client_keys: None,
        max_clients,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env();
    tracing::info!(bind_v4 = ?config.bind_v4, max_clients = config.max_clients, "starting glyphcast server");

    glyphcast::run(config, Arc::new(NullKeyResolver)).await?;
    Ok(())
}
