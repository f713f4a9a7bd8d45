//! Server implementation.
//!
//! An authoritative, single-owner loop. Per-connection tasks do all socket
//! I/O: a handshake task reads `Hello` and forwards the validated connection,
//! a reader task decodes frames into the inbox, and a writer task drains a
//! bounded queue of outgoing messages. Everything that touches game state
//! (world, target locks, resource ledger) runs inside [`GameServer::step`],
//! one message at a time, and never waits on a peer. This is what serializes
//! racing lock requests.
//!
//! Each step:
//! - applies queued console commands,
//! - accepts at most one new connection and hands it to a handshake task,
//! - drains the inbox, answering requests and queueing pushes,
//! - flushes queued pushes to their sessions in order.

use anyhow::Context;
use rand::Rng;
use skirmish_shared::{
    channel::{encode_payload, ChannelRegistry, RemoteFault},
    config::EngineConfig,
    ecs::{EntityId, Position, Targetable, World},
    net::{
        decode_from_bytes, ClientId, NetMsg, ReliableConn, ReliableListener, ReliableReader,
        ReliableWriter, Reply, PROTOCOL_VERSION,
    },
    protocol::{RemoteCall, ServerEvent},
};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    ledger::ResourceLedger,
    targeting::{TargetLocks, Transition},
};

/// Messages a session may have waiting for its socket. A peer that stops
/// reading is dropped once this fills.
pub const OUTBOUND_QUEUE: usize = 256;

/// Upper bound for a single `spawn` console command.
pub const MAX_SPAWN_PER_COMMAND: u32 = 64;

/// Connected client session.
struct Session {
    name: String,
    peer: SocketAddr,
    player_entity: EntityId,
    outbound: mpsc::Sender<NetMsg>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Traffic forwarded from connection tasks to the server loop.
enum Inbound {
    /// A connection whose `Hello` passed protocol and registry checks.
    Joined {
        conn: ReliableConn,
        peer: SocketAddr,
        player_name: String,
    },
    Message {
        client: ClientId,
        msg: NetMsg,
    },
    Closed {
        client: ClientId,
        reason: String,
    },
}

/// Game server.
pub struct GameServer {
    pub cfg: EngineConfig,
    registry: Arc<ChannelRegistry>,
    world: World,
    locks: TargetLocks,
    ledger: ResourceLedger,
    sessions: BTreeMap<ClientId, Session>,

    tcp: ReliableListener,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    /// Pushes produced while handling a message, flushed after it.
    outbox: Vec<(ClientId, ServerEvent)>,

    tick: u64,
    shutdown: bool,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Binds the listener and spawns the configured targets.
    pub async fn new(cfg: EngineConfig, registry: Arc<ChannelRegistry>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let mut server = Self {
            ledger: ResourceLedger::new(cfg.starting_resources.clone()),
            cfg,
            registry,
            world: World::default(),
            locks: TargetLocks::new(),
            sessions: BTreeMap::new(),
            tcp,
            inbox_tx,
            inbox_rx,
            outbox: Vec::new(),
            tick: 0,
            shutdown: false,
            console_rx: None,
        };

        for i in 0..server.cfg.target_count {
            server.spawn_target(&format!("dummy_{i}"));
        }
        Ok(server)
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    /// Targetable entities in id order.
    pub fn targets(&self) -> Vec<EntityId> {
        self.world.iter::<Targetable>().map(|(id, _)| id).collect()
    }

    /// Where an entity stands, if it has a position.
    pub fn position(&self, entity: EntityId) -> Option<Position> {
        self.world.get::<Position>(entity).copied()
    }

    /// Spawns a targetable entity at a random spot.
    pub fn spawn_target(&mut self, label: &str) -> EntityId {
        let mut rng = rand::thread_rng();
        let id = self.world.spawn();
        self.world.insert(
            id,
            Position {
                x: rng.gen_range(-50.0..50.0),
                y: 0.0,
                z: rng.gen_range(-50.0..50.0),
            },
        );
        self.world.insert(id, Targetable { label: label.to_string() });
        debug!(entity = %id, label, "Spawned target");
        id
    }

    /// Despawns an entity, releasing any lock on it.
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        if !self.world.despawn(entity) {
            return false;
        }
        if let Some(t) = self.locks.release_entity(entity) {
            self.queue_transition(t);
        }
        true
    }

    /// Adjusts a session's resources and queues `RESOURCES_UPDATED`.
    pub fn grant(&mut self, client: ClientId, resource: &str, delta: i64) -> bool {
        match self.ledger.grant(client, resource, delta) {
            Some(snap) => {
                info!(client_id = ?client, resource, delta, revision = snap.revision, "Resources changed");
                self.outbox.push((client, ServerEvent::ResourcesUpdated(snap)));
                true
            }
            None => false,
        }
    }

    fn queue_transition(&mut self, t: Transition) {
        debug!(client_id = ?t.client, from = ?t.from, to = ?t.to, "Target transition");
        self.outbox
            .push((t.client, ServerEvent::TargetUpdated(t.to.target())));
    }

    /// Accepts a pending connection, if any, and starts its handshake task.
    /// Returns whether a connection was accepted.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => {
                debug!(%peer, "Connection accepted");
                tokio::spawn(handshake(
                    conn,
                    peer,
                    Arc::clone(&self.registry),
                    self.cfg.request_timeout(),
                    self.inbox_tx.clone(),
                ));
                Ok(true)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false), // Timeout
        }
    }

    /// Turns a handshaken connection into a session.
    fn handle_joined(&mut self, conn: ReliableConn, peer: SocketAddr, player_name: String) {
        let id = ClientId::new_unique();
        let player_entity = self.world.spawn();
        self.world.insert(player_entity, Position::default());
        self.world.insert(
            player_entity,
            Targetable {
                label: player_name.clone(),
            },
        );
        self.ledger.open(id);

        let (reader, writer) = conn.into_split();
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(id, writer, queue, self.inbox_tx.clone()));
        let reader = tokio::spawn(read_loop(id, reader, self.inbox_tx.clone()));
        self.sessions.insert(
            id,
            Session {
                name: player_name,
                peer,
                player_entity,
                outbound,
                reader,
                writer,
            },
        );

        if !self.send_to(
            id,
            NetMsg::Welcome {
                client_id: id,
                player_entity,
            },
        ) {
            self.remove_session(id, "welcome not queued");
            return;
        }
        info!(client_id = ?id, %peer, entity = %player_entity, "Client connected");
    }

    /// Runs until a `quit` console command.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let tick_interval = self.cfg.tick_interval();
        let mut next_tick = Instant::now();
        while !self.shutdown {
            self.step().await?;
            next_tick += tick_interval;
            tokio::time::sleep_until(next_tick).await;
        }
        Ok(())
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one loop iteration.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands();

        if let Err(e) = self.try_accept(Duration::from_millis(1)).await {
            warn!(error = %format!("{e:#}"), "Accept failed");
        }

        while let Ok(inbound) = self.inbox_rx.try_recv() {
            self.handle_inbound(inbound);
        }

        self.tick += 1;
        Ok(())
    }

    fn process_console_commands(&mut self) {
        let Some(rx) = self.console_rx.as_mut() else {
            return;
        };
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }

        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
    }

    /// Executes a console command and flushes any pushes it caused.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Vec::new();
        };

        let out = match cmd {
            "status" => {
                let mut out = vec![
                    format!("Tick: {}", self.tick),
                    format!("Entities: {}", self.world.len()),
                    format!("Clients: {}", self.sessions.len()),
                ];
                for (id, s) in &self.sessions {
                    out.push(format!(
                        "  {:?}: name={} peer={} entity={} target={:?}",
                        id,
                        s.name,
                        s.peer,
                        s.player_entity,
                        self.locks.state(*id)
                    ));
                }
                out
            }
            "targets" => self
                .world
                .iter::<Targetable>()
                .map(|(id, t)| {
                    let at = match self.position(id) {
                        Some(p) => format!("({:.1}, {:.1}, {:.1})", p.x, p.y, p.z),
                        None => "(nowhere)".to_string(),
                    };
                    match self.locks.holder(id) {
                        Some(c) => format!("{id} {} at {at} locked by {:?}", t.label, c),
                        None => format!("{id} {} at {at} free", t.label),
                    }
                })
                .collect(),
            "spawn" => {
                let count = match tokens.get(1) {
                    None => Some(1),
                    Some(s) => s.parse::<u32>().ok().filter(|n| (1..=MAX_SPAWN_PER_COMMAND).contains(n)),
                };
                match count {
                    Some(n) => (0..n)
                        .map(|_| {
                            let label = format!("dummy_{}", self.world.len());
                            format!("Spawned {}", self.spawn_target(&label))
                        })
                        .collect(),
                    None => vec![format!("Usage: spawn [n], 1 <= n <= {MAX_SPAWN_PER_COMMAND}")],
                }
            }
            "despawn" => match tokens.get(1).and_then(|s| s.trim_start_matches('#').parse().ok()) {
                Some(raw) if self.despawn(EntityId(raw)) => vec![format!("Despawned #{raw}")],
                Some(raw) => vec![format!("No entity #{raw}")],
                None => vec!["Usage: despawn <entity>".to_string()],
            },
            "give" => {
                let parsed = match (tokens.get(1), tokens.get(2), tokens.get(3)) {
                    (Some(c), Some(r), Some(d)) => match (c.parse::<u32>(), d.parse::<i64>()) {
                        (Ok(c), Ok(d)) => Some((ClientId(c), *r, d)),
                        _ => None,
                    },
                    _ => None,
                };
                match parsed {
                    Some((client, resource, delta)) if self.grant(client, resource, delta) => {
                        vec![format!("Gave {delta} {resource} to {client:?}")]
                    }
                    Some((client, ..)) => vec![format!("No session {client:?}")],
                    None => vec!["Usage: give <client> <resource> <delta>".to_string()],
                }
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.shutdown = true;
                vec!["Shutting down".to_string()]
            }
            other => vec![format!("Unknown command: {other}")],
        };

        self.flush_outbox();
        out
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Joined {
                conn,
                peer,
                player_name,
            } => self.handle_joined(conn, peer, player_name),
            Inbound::Message { client, msg } if !self.sessions.contains_key(&client) => {
                debug!(client_id = ?client, ?msg, "Dropping message from closed session");
            }
            Inbound::Message {
                client,
                msg: NetMsg::Request { id, channel, payload },
            } => {
                let reply = self.dispatch(client, &channel, payload);
                if !self.send_to(client, NetMsg::Response { id, reply }) {
                    self.remove_session(client, "send failed");
                }
            }
            Inbound::Message {
                client,
                msg: NetMsg::Disconnect { reason },
            } => {
                self.remove_session(client, &reason);
            }
            Inbound::Message { client, msg } => {
                debug!(client_id = ?client, ?msg, "Unexpected message");
            }
            Inbound::Closed { client, reason } => {
                self.remove_session(client, &reason);
            }
        }
        self.flush_outbox();
    }

    /// Validates an incoming call at the registry boundary and runs it.
    fn dispatch(&mut self, client: ClientId, channel: &str, payload: Value) -> Reply {
        let result = RemoteCall::decode(&self.registry, channel, payload)
            .and_then(|call| self.handle_call(client, call));
        match result {
            Ok(value) => Reply::Ok(value),
            Err(fault) => {
                warn!(client_id = ?client, channel, %fault, "Rejected call");
                Reply::Fault(fault)
            }
        }
    }

    fn handle_call(&mut self, client: ClientId, call: RemoteCall) -> Result<Value, RemoteFault> {
        let channel = call.channel();
        match call {
            RemoteCall::FetchResources => {
                let snap = self
                    .ledger
                    .snapshot(client)
                    .ok_or_else(|| RemoteFault::Internal("no resource account".to_string()))?;
                encode_payload(channel, snap)
            }
            RemoteCall::TryLockTarget(entity) => {
                let own = self.sessions.get(&client).map(|s| s.player_entity);
                let granted = match self.locks.try_lock(&self.world, client, own, entity) {
                    Ok(Some(t)) => {
                        self.queue_transition(t);
                        true
                    }
                    Ok(None) => true,
                    Err(rejection) => {
                        debug!(client_id = ?client, %entity, %rejection, "Lock refused");
                        false
                    }
                };
                encode_payload(channel, &granted)
            }
            RemoteCall::ClearTarget => {
                let released = match self.locks.clear(client) {
                    Some(t) => {
                        self.queue_transition(t);
                        true
                    }
                    None => false,
                };
                encode_payload(channel, &released)
            }
        }
    }

    /// Queues pushes in order. Sessions whose queue is full or closed are
    /// dropped, which may queue further pushes for other sessions.
    fn flush_outbox(&mut self) {
        while !self.outbox.is_empty() {
            let mut failed = Vec::new();
            for (client, event) in std::mem::take(&mut self.outbox) {
                match event.encode() {
                    Ok((channel, payload)) => {
                        let msg = NetMsg::Event {
                            channel: channel.to_string(),
                            payload,
                        };
                        if !self.send_to(client, msg) {
                            failed.push(client);
                        }
                    }
                    Err(fault) => warn!(client_id = ?client, %fault, "Dropping unencodable event"),
                }
            }
            for client in failed {
                self.remove_session(client, "send failed");
            }
        }
    }

    /// Hands a message to the session's writer task without waiting.
    /// Returns false if the session exists but cannot take it.
    fn send_to(&mut self, client: ClientId, msg: NetMsg) -> bool {
        let Some(session) = self.sessions.get(&client) else {
            return true;
        };
        match session.outbound.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(client_id = ?client, capacity = OUTBOUND_QUEUE, "Outbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Drops a session and everything it owned. Pushes caused by the removal
    /// are queued; callers flush.
    fn remove_session(&mut self, client: ClientId, reason: &str) {
        let Some(session) = self.sessions.remove(&client) else {
            return;
        };
        session.reader.abort();
        session.writer.abort();
        self.locks.clear(client);
        self.ledger.close(client);

        // Anyone targeting the departing player loses the lock.
        self.despawn(session.player_entity);
        info!(client_id = ?client, reason, "Client disconnected");
    }
}

/// Reads and checks `Hello`, then forwards the connection to the loop.
async fn handshake(
    mut conn: ReliableConn,
    peer: SocketAddr,
    registry: Arc<ChannelRegistry>,
    timeout: Duration,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    match check_hello(&mut conn, &registry, timeout).await {
        Ok(player_name) => {
            let _ = inbox.send(Inbound::Joined {
                conn,
                peer,
                player_name,
            });
        }
        Err(e) => warn!(%peer, error = %format!("{e:#}"), "Rejected connection"),
    }
}

async fn check_hello(
    conn: &mut ReliableConn,
    registry: &ChannelRegistry,
    timeout: Duration,
) -> anyhow::Result<String> {
    let hello = tokio::time::timeout(timeout, conn.recv())
        .await
        .context("handshake timed out")??;

    let (player_name, channels) = match hello {
        NetMsg::Hello {
            protocol,
            player_name,
            channels,
        } if protocol == PROTOCOL_VERSION => (player_name, channels),
        NetMsg::Hello { protocol, .. } => {
            let reason = format!("protocol {protocol} unsupported, expected {PROTOCOL_VERSION}");
            let _ = conn.send(&NetMsg::Disconnect { reason: reason.clone() }).await;
            anyhow::bail!(reason);
        }
        other => anyhow::bail!("unexpected handshake msg: {other:?}"),
    };

    if !registry.agrees_with(&channels) {
        let reason = "channel registry mismatch".to_string();
        let _ = conn.send(&NetMsg::Disconnect { reason: reason.clone() }).await;
        anyhow::bail!(reason);
    }
    Ok(player_name)
}

async fn read_loop(client: ClientId, mut reader: ReliableReader, inbox: mpsc::UnboundedSender<Inbound>) {
    loop {
        let frame = match reader.recv_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                let _ = inbox.send(Inbound::Closed {
                    client,
                    reason: format!("{e:#}"),
                });
                return;
            }
        };
        match decode_from_bytes(&frame) {
            Ok(msg) => {
                if inbox.send(Inbound::Message { client, msg }).is_err() {
                    return;
                }
            }
            Err(e) => warn!(client_id = ?client, error = %format!("{e:#}"), "Dropping malformed frame"),
        }
    }
}

async fn write_loop(
    client: ClientId,
    mut writer: ReliableWriter,
    mut queue: mpsc::Receiver<NetMsg>,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(msg) = queue.recv().await {
        if let Err(e) = writer.send(&msg).await {
            warn!(client_id = ?client, error = %format!("{e:#}"), "Send failed");
            let _ = inbox.send(Inbound::Closed {
                client,
                reason: "send failed".to_string(),
            });
            return;
        }
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, EngineConfig)> {
    let cfg = EngineConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };
    let registry = Arc::new(ChannelRegistry::standard()?);
    let mut server = GameServer::new(cfg, registry).await?;
    let addr = server.local_addr()?;
    server.cfg.server_addr = addr.to_string();
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skirmish_shared::net::RequestId;

    fn lock_request(target: EntityId) -> NetMsg {
        NetMsg::Request {
            id: RequestId(1),
            channel: "TryLockTarget".to_string(),
            payload: serde_json::to_value(target).unwrap(),
        }
    }

    #[tokio::test]
    async fn requests_from_closed_sessions_do_not_lock() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(64).await?;
        let target = server.targets()[0];

        // A frame still queued after its session was torn down.
        let gone = ClientId(u32::MAX);
        assert!(server
            .inbox_tx
            .send(Inbound::Message {
                client: gone,
                msg: lock_request(target),
            })
            .is_ok());
        server.step().await?;

        assert_eq!(server.locks.holder(target), None);
        assert!(server.locks.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn bad_spawn_counts_print_usage() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(64).await?;
        let before = server.targets().len();

        for line in ["spawn abc", "spawn 0", "spawn 4000000000"] {
            let out = server.exec_console(line);
            assert_eq!(out.len(), 1, "{line}");
            assert!(out[0].starts_with("Usage: spawn"), "{line}: {out:?}");
        }
        assert_eq!(server.targets().len(), before);

        let out = server.exec_console(&format!("spawn {MAX_SPAWN_PER_COMMAND}"));
        assert_eq!(out.len(), MAX_SPAWN_PER_COMMAND as usize);
        Ok(())
    }

    #[tokio::test]
    async fn targets_listing_shows_positions() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(64).await?;
        let id = server.spawn_target("crate");
        let p = server.position(id).unwrap();
        assert!((-50.0..50.0).contains(&p.x) && (-50.0..50.0).contains(&p.z));

        let out = server.exec_console("targets");
        let line = out.iter().find(|l| l.contains(" crate ")).unwrap();
        assert!(line.contains(&format!("({:.1}, {:.1}, {:.1})", p.x, p.y, p.z)));
        assert!(line.ends_with("free"));
        Ok(())
    }
}
