//! groupline-server: standalone group chat server.
//!
//! Usage: `groupline-server [config.toml]`. Without a config file every
//! setting keeps its default; `GROUPLINE_BIND_ADDR` overrides the bind address.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use groupline_chat::{ChatServer, InMemoryDirectory, InMemoryMessageStore, ServerConfig, StaticTokenIssuer};

/// Lifetime of tokens issued at runtime. Dev tokens from the config never expire.
const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

fn load_config() -> Result<ServerConfig, groupline_chat::ConfigError> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from {path}");
            ServerConfig::from_file(path)?
        }
        None => ServerConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    info!("Starting groupline server...");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let issuer = Arc::new(StaticTokenIssuer::with_permanent_tokens(TOKEN_TTL, &config.dev_tokens));
    let directory = Arc::new(InMemoryDirectory::from_rosters(&config.dev_groups));
    let store = Arc::new(InMemoryMessageStore::new());
    info!(
        "Seeded {} dev token(s) and {} group(s)",
        config.dev_tokens.len(),
        config.dev_groups.len()
    );

    let server = ChatServer::new(config, issuer, directory, store);
    if let Err(e) = server.start().await {
        log::error!("{e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
    }
    server.stop().await;

    let stats = server.stats().await;
    info!(
        "Served {} connection(s), {} frame(s), {} deliveries",
        stats.total_connections, stats.total_frames, stats.deliveries
    );
    ExitCode::SUCCESS
}
