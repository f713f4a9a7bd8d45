//! Helpers shared by the integration tests: a server running in the
//! background on an ephemeral port, and clients connected to it.

use std::{sync::Arc, time::Duration};

use skirmish_client::GameClient;
use skirmish_server::server::bind_ephemeral;
use skirmish_shared::{channel::ChannelRegistry, config::EngineConfig, ecs::EntityId};
use tokio::{sync::mpsc, task::JoinHandle};

/// Loop rate for test servers; high so round trips stay short.
pub const TEST_TICK_HZ: u32 = 200;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A server running `GameServer::run` in a background task.
pub struct TestServer {
    pub cfg: EngineConfig,
    /// Targetable entities spawned at startup.
    pub targets: Vec<EntityId>,
    console: mpsc::Sender<String>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    pub async fn spawn() -> anyhow::Result<Self> {
        init_tracing();
        let (mut server, cfg) = bind_ephemeral(TEST_TICK_HZ).await?;
        let targets = server.targets();
        let (console, rx) = mpsc::channel(16);
        server.set_console_input(rx);
        let handle = tokio::spawn(async move { server.run().await });
        Ok(Self {
            cfg,
            targets,
            console,
            handle: Some(handle),
        })
    }

    /// Queues an operator console command.
    pub async fn console(&self, line: &str) -> anyhow::Result<()> {
        self.console.send(line.to_string()).await?;
        Ok(())
    }

    pub async fn connect(&self, name: &str) -> anyhow::Result<GameClient> {
        let cfg = EngineConfig {
            player_name: name.to_string(),
            ..self.cfg.clone()
        };
        let registry = Arc::new(ChannelRegistry::standard()?);
        GameClient::connect(&cfg, registry).await
    }

    /// Sends `quit` and waits for the loop to exit.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.console("quit").await?;
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(2), handle).await???;
        }
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Gives the server loop a few ticks to process cross-connection traffic.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
