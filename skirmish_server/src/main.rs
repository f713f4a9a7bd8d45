//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p skirmish_server -- [--config server.json] [--addr 127.0.0.1:40000] [--tick-hz 64]
//!
//! The server listens for client connections, answers remote channel calls,
//! and pushes resource and target updates.
//!
//! Console commands:
//!   status                          - Show server status
//!   targets                         - List targetable entities and their holders
//!   spawn [n]                       - Spawn targetable dummies
//!   despawn <entity>                - Remove an entity, releasing locks on it
//!   give <client> <resource> <delta> - Adjust a player's resources
//!   quit                            - Shutdown server

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use skirmish_server::GameServer;
use skirmish_shared::{channel::ChannelRegistry, config::EngineConfig};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => EngineConfig::load(&PathBuf::from(&args[i + 1]))?,
        _ => EngineConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            "--targets" if i + 1 < args.len() => {
                cfg.target_count = args[i + 1].parse().context("parse --targets")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, targets = cfg.target_count, "Starting server");

    let registry = Arc::new(ChannelRegistry::standard().context("build channel registry")?);
    let mut server = GameServer::new(cfg, registry)
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    skirmish_shared::console::spawn_stdin_reader(console_tx);

    println!("Server ready. Type 'status' for info, 'targets' to list targets, 'quit' to exit.");
    println!();

    server.run().await
}
