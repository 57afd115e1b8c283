//! Server core: wire framing, the handshake/crypto stack, per-connection
//! session state, the N-to-1 audio mixer, the ASCII renderer, and the
//! `tokio` accept loop that drives a live deployment.
//!
//! Everything under this crate root is transport-agnostic except
//! [`server`], which owns the `TcpListener` and per-connection tasks.

pub mod buffers;
pub mod config;
pub mod crypto;
pub mod error;
pub mod mixer;
pub mod packet;
pub mod render;
pub mod server;
pub mod session;

use std::sync::Arc;

/// Runs the server until the process is killed. Binds `config.bind_v4`
/// (and `config.bind_v6`, if set), accepting connections and driving
/// sessions to completion.
pub async fn run(config: config::ServerConfig, resolver: Arc<dyn config::KeyResolver + Send + Sync>) -> error::Result<()> {
    server::run(config, resolver).await
}
