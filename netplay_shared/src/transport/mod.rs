//! Transport adapters.
//!
//! Three interchangeable backends implement `Transport`:
//! - `StreamTransport`: TCP with length-prefixed framing; background tasks
//!   feed a shared inbox drained by the tick.
//! - `SessionUdpTransport`: connection-oriented UDP with explicit
//!   connect/accept, ordered reliable and unreliable channels.
//! - `LiteUdpTransport`: lightweight UDP with ack bitfields piggybacked on
//!   every datagram.
//!
//! The UDP backends pump their socket synchronously inside `poll_incoming`
//! using non-blocking reads, so the tick never waits on I/O.

mod admission;
pub mod framing;
pub mod lite_udp;
pub mod sequence;
pub mod session_udp;
pub mod stream;

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{config::NetConfig, error::NetError, packet::Packet};

pub use admission::{Admission, Rejection};
pub use lite_udp::LiteUdpTransport;
pub use session_udp::SessionUdpTransport;
pub use stream::StreamTransport;

/// Transport-level connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Stream,
    SessionUdp,
    LiteUdp,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Stream,
        TransportKind::SessionUdp,
        TransportKind::LiteUdp,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stream" | "tcp" => Some(TransportKind::Stream),
            "session_udp" | "session" => Some(TransportKind::SessionUdp),
            "lite_udp" | "lite" => Some(TransportKind::LiteUdp),
            _ => None,
        }
    }
}

/// A framed packet and the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub conn: ConnectionId,
    pub packet: Packet,
}

/// Connection state changes reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Server: a remote was admitted. Peer: the connection to the server is up.
    Connected { conn: ConnectionId, remote: SocketAddr },
    Disconnected { conn: ConnectionId, reason: String },
    /// Server: a remote was refused by the admission policy.
    Rejected { remote: SocketAddr, reason: Rejection },
    /// Peer: the connection attempt failed or was refused.
    ConnectFailed { reason: String },
}

/// Common contract of every backend.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Opens the server side on `port` (0 for ephemeral). Returns the bound address.
    async fn listen(&mut self, port: u16, admission: Arc<Admission>) -> anyhow::Result<SocketAddr>;

    /// Opens the client side towards `host:port`. Completion is reported as a
    /// `Connected` or `ConnectFailed` event.
    async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()>;

    /// Drains fully framed packets. Never blocks.
    fn poll_incoming(&mut self) -> Vec<Incoming>;

    /// Drains connection state changes. Never blocks.
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Sends an encoded packet. Backends without a reliability concept ignore `reliable`.
    fn send(&mut self, conn: ConnectionId, bytes: Bytes, reliable: bool) -> Result<(), NetError>;

    /// Closes one connection. Returns whether a live connection was closed.
    fn close(&mut self, conn: ConnectionId) -> bool;

    /// Stops background work and closes every connection.
    fn shutdown(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Builds the backend selected in `cfg`.
pub fn create(cfg: &NetConfig) -> Box<dyn Transport> {
    match cfg.transport {
        TransportKind::Stream => Box::new(StreamTransport::new(cfg.inbox_capacity, cfg.overflow)),
        TransportKind::SessionUdp => Box::new(SessionUdpTransport::new()),
        TransportKind::LiteUdp => Box::new(LiteUdpTransport::new()),
    }
}

/// Resolves `host:port` to the first socket address.
pub(crate) async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    use anyhow::Context;

    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))
}

/// Wildcard bind address in the same family as `remote`, ephemeral port.
pub(crate) fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    let ip = match remote {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
