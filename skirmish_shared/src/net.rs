//! Networking primitives.
//!
//! Goals:
//! - One reliable, ordered stream (TCP) per client; events on it arrive in
//!   send order.
//! - Length-prefixed JSON frames so the envelope stays explicit and
//!   versionable.
//! - Channel payloads travel as untyped JSON inside the envelope and are
//!   typed at the registry boundary (see `channel`).

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::{
    channel::{ChannelDef, RemoteFault},
    ecs::EntityId,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-connection request correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Outcome of a request as sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok(Value),
    Fault(RemoteFault),
}

/// High-level message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
        player_name: String,
        /// The client's channel declarations; must equal the server's.
        channels: Vec<ChannelDef>,
    },
    Welcome {
        client_id: ClientId,
        player_entity: EntityId,
    },

    // ─── Remote channels ───
    /// Client -> server call on a named channel.
    Request {
        id: RequestId,
        channel: String,
        payload: Value,
    },
    /// Server -> client answer to a `Request` with the same id.
    Response {
        id: RequestId,
        reply: Reply,
    },
    /// Server -> client push on a named channel.
    Event {
        channel: String,
        payload: Value,
    },

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &NetMsg) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_LEN,
        "frame too large: {} bytes",
        payload.len()
    );
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame too large: {len} bytes");
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(payload)
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        let payload = read_frame(&mut self.stream).await?;
        decode_from_bytes(&payload)
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { read }, ReliableWriter { write })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    read: OwnedReadHalf,
}

impl ReliableReader {
    /// Reads one raw frame. Errors only on I/O failure or an oversized frame.
    pub async fn recv_frame(&mut self) -> anyhow::Result<Vec<u8>> {
        read_frame(&mut self.read).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    write: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.write, msg).await
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;

    #[test]
    fn hello_carries_channel_declarations() {
        let reg = ChannelRegistry::standard().unwrap();
        let msg = NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
            player_name: "Player".into(),
            channels: reg.definitions().to_vec(),
        };
        let back = decode_from_bytes(&encode_to_bytes(&msg).unwrap()).unwrap();
        match back {
            NetMsg::Hello { channels, .. } => assert!(reg.agrees_with(&channels)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_preserve_order_over_a_socket() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let sender = tokio::spawn(async move {
            let mut conn = ReliableConn::connect(addr).await?;
            for i in 0..5 {
                conn.send(&NetMsg::Event {
                    channel: "TargetUpdated".into(),
                    payload: Value::from(i),
                })
                .await?;
            }
            Ok::<_, anyhow::Error>(())
        });

        let (conn, _) = listener.accept().await?;
        let (mut reader, _writer) = conn.into_split();
        for i in 0..5 {
            let msg = decode_from_bytes(&reader.recv_frame().await?)?;
            assert_eq!(
                msg,
                NetMsg::Event {
                    channel: "TargetUpdated".into(),
                    payload: Value::from(i),
                }
            );
        }
        sender.await??;
        Ok(())
    }
}
