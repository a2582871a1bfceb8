//! Tapline server: accepts tap connections and sequences every tap into one
//! shared log.
//!
//! Usage: `tapline-server [BIND_ADDR]`. The address falls back to
//! `TAPLINE_BIND`, then to the built-in default. Log output is controlled by
//! `RUST_LOG`.

use log::{error, info};
use tapline_bus::server::{ServerConfig, TapServer};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TAPLINE_BIND").ok())
        .filter(|addr| !addr.trim().is_empty())
    {
        config.bind_addr = addr;
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    info!("Starting tapline server on {}...", config.bind_addr);

    let server = TapServer::new(config);
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
