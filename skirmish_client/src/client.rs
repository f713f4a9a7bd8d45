//! Client implementation.
//!
//! The client maintains:
//! - One reliable stream to the server, split into a writer (requests) and a
//!   background reader task (responses and pushes)
//! - A table of pending calls, each resolved through a oneshot
//! - A queue of decoded pushes, applied to the [`ClientView`] by `poll_events`
//! - Local movement state (jump counter)
//!
//! Calls are typed by [`RemoteFunction`] markers. A call that is never
//! answered ends in [`RemoteError::Timeout`] after `request_timeout_ms`, so a
//! lost reply can never be mistaken for a `false`. Dropping a call future
//! abandons it; a late reply is discarded.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::Context;
use skirmish_shared::{
    channel::{encode_payload, ChannelRegistry, RemoteError, RemoteFault, RemoteFunction},
    config::EngineConfig,
    ecs::EntityId,
    net::{
        decode_from_bytes, ClientId, NetMsg, ReliableConn, ReliableReader, ReliableWriter, Reply,
        RequestId, PROTOCOL_VERSION,
    },
    protocol::ServerEvent,
    resources::{FetchResources, ResourceSnapshot},
    targeting::{ClearTarget, TryLockTarget},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    movement::{InputState, Movement},
    view::ClientView,
};

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected { reason: String },
}

/// Retry schedule for idempotent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

type PendingTable = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>>;

fn lock<M>(m: &Mutex<M>) -> MutexGuard<'_, M> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending entry when its call future finishes or is dropped.
struct PendingGuard {
    pending: PendingTable,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

/// What the reader task hands to the client.
#[derive(Debug)]
enum Incoming {
    Event(ServerEvent),
    Closed(String),
}

/// High-level game client.
pub struct GameClient {
    pub client_id: ClientId,
    pub player_entity: EntityId,
    pub state: ClientState,
    pub view: ClientView,
    pub movement: Movement,

    registry: Arc<ChannelRegistry>,
    writer: tokio::sync::Mutex<ReliableWriter>,
    pending: PendingTable,
    next_request: AtomicU64,
    closed: Arc<AtomicBool>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    reader: JoinHandle<()>,

    request_timeout: Duration,
    fetch_retry: RetryPolicy,
}

impl GameClient {
    /// Connects to a server and performs the handshake.
    pub async fn connect(cfg: &EngineConfig, registry: Arc<ChannelRegistry>) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, "Connecting to server");
        let mut conn = ReliableConn::connect(server_addr).await?;

        conn.send(&NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
            player_name: cfg.player_name.clone(),
            channels: registry.definitions().to_vec(),
        })
        .await?;

        let welcome = tokio::time::timeout(cfg.request_timeout(), conn.recv())
            .await
            .context("handshake timed out")??;
        let (client_id, player_entity) = match welcome {
            NetMsg::Welcome {
                client_id,
                player_entity,
            } => (client_id, player_entity),
            NetMsg::Disconnect { reason } => anyhow::bail!("server refused connection: {reason}"),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        info!(client_id = ?client_id, entity = %player_entity, "Connected to server");

        let (reader, writer) = conn.into_split();
        let pending: PendingTable = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&registry),
            Arc::clone(&pending),
            incoming_tx,
            Arc::clone(&closed),
        ));

        Ok(Self {
            client_id,
            player_entity,
            state: ClientState::Connected,
            view: ClientView::new(),
            movement: Movement::new(cfg.max_air_jumps),
            registry,
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_request: AtomicU64::new(1),
            closed,
            incoming,
            reader,
            request_timeout: cfg.request_timeout(),
            fetch_retry: RetryPolicy {
                attempts: cfg.fetch_retry_attempts.max(1),
                ..RetryPolicy::default()
            },
        })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected && !self.closed.load(Ordering::Acquire)
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Issues a typed call and waits for its reply.
    pub async fn call<F: RemoteFunction>(&self, input: F::Input) -> Result<F::Output, RemoteError> {
        self.registry.check_function::<F>()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::Disconnected);
        }

        let payload = encode_payload(F::NAME, &input).map_err(shape_error)?;
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        self.writer
            .lock()
            .await
            .send(&NetMsg::Request {
                id,
                channel: F::NAME.to_string(),
                payload,
            })
            .await
            .map_err(|e| RemoteError::Transport(format!("{e:#}")))?;

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(RemoteError::Disconnected),
            Err(_) => {
                warn!(channel = F::NAME, request = id.0, "Request timed out");
                return Err(RemoteError::Timeout {
                    channel: F::NAME.to_string(),
                    after: self.request_timeout,
                });
            }
        };

        match reply {
            Reply::Ok(value) => serde_json::from_value(value).map_err(|e| RemoteError::ShapeMismatch {
                channel: F::NAME.to_string(),
                detail: e.to_string(),
            }),
            Reply::Fault(fault) => Err(RemoteError::Fault(fault)),
        }
    }

    /// Like [`call`](Self::call), retrying transient failures with backoff.
    /// Only for calls that are safe to repeat.
    pub async fn call_with_retry<F>(
        &self,
        input: F::Input,
        policy: RetryPolicy,
    ) -> Result<F::Output, RemoteError>
    where
        F: RemoteFunction,
        F::Input: Clone,
    {
        let mut attempt = 1;
        loop {
            match self.call::<F>(input.clone()).await {
                Err(e) if e.is_transient() && attempt < policy.attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(channel = F::NAME, attempt, error = %e, ?delay, "Retrying call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Pulls the authoritative resource snapshot into the view.
    pub async fn fetch_resources(&self) -> Result<ResourceSnapshot, RemoteError> {
        let snap = self
            .call_with_retry::<FetchResources>((), self.fetch_retry)
            .await?;
        self.view.apply_resources(snap.clone());
        Ok(snap)
    }

    /// Requests a lock, showing it locally until the server answers.
    ///
    /// The optimistic target is reverted on refusal or failure. A later
    /// `TargetUpdated` push overrides whatever is shown.
    pub async fn lock_target(&self, entity: EntityId) -> Result<bool, RemoteError> {
        let previous = self.view.target.get();
        self.view.target.set(Some(entity));
        match self.call::<TryLockTarget>(entity).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.view.target.set(previous);
                Ok(false)
            }
            Err(e) => {
                self.view.target.set(previous);
                Err(e)
            }
        }
    }

    /// Releases the current lock. Returns whether one was held.
    pub async fn clear_target(&self) -> Result<bool, RemoteError> {
        let released = self.call::<ClearTarget>(()).await?;
        if released {
            self.view.target.set(None);
        }
        Ok(released)
    }

    /// Applies every queued push. Returns how many events were applied.
    pub fn poll_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(incoming) = self.incoming.try_recv() {
            if self.apply_incoming(incoming).is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Waits up to `timeout` for the next push, applies it and returns it.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<ServerEvent> {
        loop {
            let incoming = tokio::time::timeout(timeout, self.incoming.recv())
                .await
                .ok()
                .flatten()?;
            if let Some(event) = self.apply_incoming(incoming) {
                return Some(event);
            }
            if !self.is_connected() {
                return None;
            }
        }
    }

    fn apply_incoming(&mut self, incoming: Incoming) -> Option<ServerEvent> {
        match incoming {
            Incoming::Event(event) => {
                match &event {
                    ServerEvent::ResourcesUpdated(snap) => {
                        if !self.view.apply_resources(snap.clone()) {
                            debug!(revision = snap.revision, "Ignoring stale resource push");
                        }
                    }
                    ServerEvent::TargetUpdated(target) => {
                        self.view.target.set(*target);
                    }
                }
                Some(event)
            }
            Incoming::Closed(reason) => {
                info!(reason = %reason, "Disconnected from server");
                self.state = ClientState::Disconnected { reason };
                None
            }
        }
    }

    /// Tells the server we are leaving and stops the reader.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        if self.is_connected() {
            self.writer
                .lock()
                .await
                .send(&NetMsg::Disconnect {
                    reason: reason.to_string(),
                })
                .await?;
        }
        self.reader.abort();
        self.closed.store(true, Ordering::Release);
        lock(&self.pending).clear();
        self.state = ClientState::Disconnected {
            reason: reason.to_string(),
        };
        Ok(())
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        let out = match cmd {
            "status" => {
                let mut out = vec![
                    format!("State: {:?}", self.state),
                    format!("Client ID: {:?}", self.client_id),
                    format!("Entity: {}", self.player_entity),
                    format!("Target: {:?}", self.view.target.get()),
                    format!("Jumps: {}", self.movement.jumps().count()),
                ];
                if let Some(snap) = self.view.resources.get() {
                    out.push(format!("Resources (rev {}):", snap.revision));
                    for (name, amount) in &snap.amounts {
                        out.push(format!("  {name}: {amount}"));
                    }
                }
                out
            }
            "jump" => {
                let jumped = self.movement.apply(InputState { jump: true });
                self.movement.apply(InputState::default());
                if jumped {
                    vec![format!("Jump {}", self.movement.jumps().count())]
                } else {
                    vec!["No jumps left".to_string()]
                }
            }
            "land" => {
                self.movement.land();
                vec!["Landed".to_string()]
            }
            "lock" => match tokens.get(1).and_then(|s| s.trim_start_matches('#').parse().ok()) {
                Some(raw) => match self.lock_target(EntityId(raw)).await {
                    Ok(true) => vec![format!("Locked #{raw}")],
                    Ok(false) => vec![format!("Lock on #{raw} refused")],
                    Err(e) => vec![format!("Lock failed: {e}")],
                },
                None => vec!["Usage: lock <entity>".to_string()],
            },
            "clear" => match self.clear_target().await {
                Ok(true) => vec!["Target cleared".to_string()],
                Ok(false) => vec!["No target".to_string()],
                Err(e) => vec![format!("Clear failed: {e}")],
            },
            "fetch" => match self.fetch_resources().await {
                Ok(snap) => vec![format!("Fetched resources rev {}", snap.revision)],
                Err(e) => vec![format!("Fetch failed: {e}")],
            },
            "disconnect" | "quit" | "exit" => {
                self.disconnect("client quit").await?;
                vec!["Disconnected".to_string()]
            }
            other => vec![format!("Unknown command: {other}")],
        };
        Ok(out)
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn shape_error(fault: RemoteFault) -> RemoteError {
    match fault {
        RemoteFault::ShapeMismatch { channel, detail } => RemoteError::ShapeMismatch { channel, detail },
        other => RemoteError::Fault(other),
    }
}

async fn read_loop(
    mut reader: ReliableReader,
    registry: Arc<ChannelRegistry>,
    pending: PendingTable,
    incoming: mpsc::UnboundedSender<Incoming>,
    closed: Arc<AtomicBool>,
) {
    let reason = loop {
        let frame = match reader.recv_frame().await {
            Ok(frame) => frame,
            Err(e) => break format!("{e:#}"),
        };
        let msg = match decode_from_bytes(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Dropping malformed frame");
                continue;
            }
        };
        match msg {
            NetMsg::Response { id, reply } => {
                let waiter = lock(&pending).remove(&id);
                let delivered = match waiter {
                    Some(tx) => tx.send(reply).is_ok(),
                    None => false,
                };
                if !delivered {
                    debug!(request = id.0, "Discarding reply to abandoned request");
                }
            }
            NetMsg::Event { channel, payload } => {
                match ServerEvent::decode(&registry, &channel, payload) {
                    Ok(event) => {
                        if incoming.send(Incoming::Event(event)).is_err() {
                            break "client dropped".to_string();
                        }
                    }
                    Err(fault) => warn!(channel = %channel, %fault, "Dropping push"),
                }
            }
            NetMsg::Disconnect { reason } => break reason,
            other => debug!(?other, "Unhandled message"),
        }
    };

    closed.store(true, Ordering::Release);
    // Dropping the senders resolves every waiting call as disconnected.
    lock(&pending).clear();
    let _ = incoming.send(Incoming::Closed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
    }
}
