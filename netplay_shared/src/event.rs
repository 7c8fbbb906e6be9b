//! Session notifications.
//!
//! Hosts and peers push typed events into an `EventBus`; the game drains them
//! once per frame.
//! - Host: session created/destroyed, players joining and leaving, kicks.
//! - Peer: connected, validated, roster replay, disconnected.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    net::SocketAddr,
};

use crate::{
    roster::{ConnectionRecord, SessionInfo},
    transport::ConnectionId,
};

/// Typed event bus.
#[derive(Default)]
pub struct EventBus {
    queues: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    /// Pushes an event into the queue.
    pub fn push<E: 'static + Send + Sync>(&mut self, e: E) {
        let q = self
            .queues
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        if let Some(q) = q.downcast_mut::<Vec<E>>() {
            q.push(e);
        }
    }

    /// Drains all queued events of a type.
    pub fn drain<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.queues
            .remove(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast::<Vec<E>>().ok())
            .map(|boxed| *boxed)
            .unwrap_or_default()
    }
}

/// Why a server-side connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Kicked,
    Disconnected,
}

/// Notifications raised by a session host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    SessionCreated { name: String, local_addr: SocketAddr },
    SessionDestroyed,
    /// Transport accepted a connection; it is now pending validation.
    ConnectionPending { conn: ConnectionId, remote: SocketAddr },
    /// Transport refused a connection (full or banned).
    ConnectionRejected { remote: SocketAddr, reason: String },
    PlayerConnected(ConnectionRecord),
    PlayerDisconnected { player: ConnectionRecord, reason: CloseReason },
    /// A pending connection was dropped before validating.
    PendingClosed { conn: ConnectionId, reason: CloseReason },
    PlayerRenamed(ConnectionRecord),
    StringReceived { from: u32, text: String },
}

/// Notifications raised by a session peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Transport connected; validation sent.
    Connected,
    /// Server acknowledged validation.
    Validated { you: ConnectionRecord, session: SessionInfo },
    PlayerConnected(ConnectionRecord),
    PlayerDisconnected(ConnectionRecord),
    SessionUpdated(SessionInfo),
    StringReceived(String),
    LatencyMeasured(u64),
    ConnectFailed(String),
    Disconnected { reason: String },
}
