//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p skirmish_client -- [--config client.json] [--addr 127.0.0.1:40000] [--name Player]
//!
//! The client connects, pulls its resources, then applies server pushes
//! while reading console commands.
//!
//! Console commands:
//!   status          - Show client status
//!   jump / land     - Drive the jump counter
//!   lock <entity>   - Try to lock a target
//!   clear           - Release the current target
//!   fetch           - Re-fetch resources from the server
//!   quit            - Exit client

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use skirmish_client::GameClient;
use skirmish_shared::{channel::ChannelRegistry, config::EngineConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

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
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let registry = Arc::new(ChannelRegistry::standard().context("build channel registry")?);
    let mut client = GameClient::connect(&cfg, registry).await.context("connect")?;

    // Pull once so the view starts from the server's state, not a guess.
    if let Err(e) = client.fetch_resources().await {
        warn!(error = %e, "Initial resource fetch failed");
    }

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    skirmish_shared::console::spawn_stdin_reader(console_tx);

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = cfg.tick_interval();

    loop {
        // Process console commands.
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => {
                    println!("Error: {}", e);
                }
            }
        }

        client.poll_events();

        if !client.is_connected() {
            println!("Disconnected from server.");
            break;
        }

        tokio::time::sleep(tick_interval).await;
    }

    Ok(())
}
