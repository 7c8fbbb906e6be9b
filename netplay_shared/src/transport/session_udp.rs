//! Connection-oriented UDP backend.
//!
//! Handshake: the client sends CONNECT (protocol id + random salt) until the
//! server answers ACCEPT or REJECT. Once connected both sides exchange:
//! - UNRELIABLE datagrams, delivered as they arrive,
//! - RELIABLE datagrams with a `u32` sequence, acknowledged by ACK datagrams,
//!   resent on a timer and delivered in order through a reorder buffer,
//! - KEEPALIVE when nothing else was sent recently,
//! - DISCONNECT on a graceful close.
//!
//! The socket is pumped synchronously inside `poll_incoming`/`poll_events`
//! with `try_recv_from`; there are no background tasks.

use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::{net::UdpSocket, time::Instant};
use tracing::{debug, info, trace, warn};

use super::{Admission, ConnectionId, Incoming, Rejection, Transport, TransportEvent, TransportKind};
use crate::{archive::Archive, error::NetError, packet::Packet};

/// Identifies this protocol in CONNECT datagrams.
pub const PROTOCOL_ID: u32 = 0x4e50_5355;
/// Largest datagram sent or accepted. Packets are never fragmented.
pub const MAX_DATAGRAM_SIZE: usize = 32 * 1024;

const HEADER_LEN: usize = 1 + 4;
const RECV_BUFFER: usize = 64 * 1024;
const CONNECT_RESEND: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const RESEND_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RESENDS: u32 = 100;
/// Out-of-order reliable datagrams held while waiting for a gap to fill.
const REORDER_LIMIT: usize = 1024;

mod kind {
    pub const CONNECT: u8 = 1;
    pub const ACCEPT: u8 = 2;
    pub const REJECT: u8 = 3;
    pub const DISCONNECT: u8 = 4;
    pub const UNRELIABLE: u8 = 5;
    pub const RELIABLE: u8 = 6;
    pub const ACK: u8 = 7;
    pub const KEEPALIVE: u8 = 8;
}

fn reject_code(reason: Rejection) -> u8 {
    match reason {
        Rejection::Full => 1,
        Rejection::Banned => 2,
    }
}

fn reject_text(code: u8) -> &'static str {
    match code {
        1 => "server is full",
        2 => "address is banned",
        _ => "protocol mismatch",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting { started: Instant },
    Connected,
}

struct Unacked {
    datagram: Bytes,
    last_sent: Instant,
    resends: u32,
}

struct Link {
    remote: SocketAddr,
    salt: u64,
    state: LinkState,
    next_send_seq: u32,
    next_recv_seq: u32,
    reorder: BTreeMap<u32, Bytes>,
    unacked: BTreeMap<u32, Unacked>,
    last_heard: Instant,
    last_sent: Instant,
}

impl Link {
    fn new(remote: SocketAddr, salt: u64, state: LinkState) -> Self {
        let now = Instant::now();
        Self {
            remote,
            salt,
            state,
            next_send_seq: 0,
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
            unacked: BTreeMap::new(),
            last_heard: now,
            last_sent: now,
        }
    }
}

fn control(kind: u8, fields: impl FnOnce(&mut Archive)) -> Bytes {
    let mut ar = Archive::with_capacity(16);
    ar.write(&kind);
    fields(&mut ar);
    ar.into_bytes()
}

/// Best-effort send. A full socket buffer is not an error: reliable
/// datagrams are resent and unreliable ones may be lost anyway.
fn send_raw(socket: &UdpSocket, to: SocketAddr, datagram: &[u8]) {
    match socket.try_send_to(datagram, to) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            trace!(%to, "UDP send would block");
        }
        Err(e) => debug!(%to, error = %e, "UDP send failed"),
    }
}

/// Connection-oriented UDP backend.
pub struct SessionUdpTransport {
    socket: Option<UdpSocket>,
    admission: Option<Arc<Admission>>,
    links: HashMap<ConnectionId, Link>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_id: u64,
    inbox: Vec<Incoming>,
    events: Vec<TransportEvent>,
    recv_buf: Vec<u8>,
}

impl SessionUdpTransport {
    pub fn new() -> Self {
        Self {
            socket: None,
            admission: None,
            links: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
            inbox: Vec::new(),
            events: Vec::new(),
            recv_buf: vec![0u8; RECV_BUFFER],
        }
    }

    /// Number of links, including ones still handshaking.
    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    fn alloc_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn drop_link(&mut self, conn: ConnectionId) -> Option<Link> {
        let link = self.links.remove(&conn)?;
        self.by_addr.remove(&link.remote);
        Some(link)
    }

    /// Reads every pending datagram, then services timers.
    fn pump(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        let mut buf = std::mem::take(&mut self.recv_buf);
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((n, from)) => self.handle_datagram(&socket, from, &buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms.
                    debug!(error = %e, "UDP recv error");
                    break;
                }
            }
        }
        self.recv_buf = buf;
        self.service(&socket, Instant::now());
        self.socket = Some(socket);
    }

    fn handle_datagram(&mut self, socket: &UdpSocket, from: SocketAddr, datagram: &[u8]) {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            warn!(%from, size = datagram.len(), "Dropping oversized datagram");
            return;
        }
        let mut ar = Archive::from_slice(datagram);
        let Ok(tag) = ar.read::<u8>() else {
            return;
        };
        if tag == kind::CONNECT {
            self.handle_connect(socket, from, &mut ar);
            return;
        }
        let Some(&conn) = self.by_addr.get(&from) else {
            trace!(%from, tag, "Datagram from unknown remote");
            return;
        };
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        link.last_heard = Instant::now();

        match tag {
            kind::ACCEPT => {
                let salt = ar.read::<u64>().unwrap_or_default();
                if salt == link.salt && matches!(link.state, LinkState::Connecting { .. }) {
                    link.state = LinkState::Connected;
                    info!(%conn, remote = %from, "UDP session established");
                    self.events.push(TransportEvent::Connected { conn, remote: from });
                }
            }
            kind::REJECT => {
                let code = ar.read::<u8>().unwrap_or_default();
                if matches!(link.state, LinkState::Connecting { .. }) {
                    self.drop_link(conn);
                    let reason = reject_text(code).to_string();
                    info!(%conn, %reason, "UDP session refused");
                    self.events.push(TransportEvent::ConnectFailed { reason });
                }
            }
            kind::DISCONNECT => {
                self.drop_link(conn);
                debug!(%conn, "UDP session closed by remote");
                self.events.push(TransportEvent::Disconnected {
                    conn,
                    reason: "connection closed by remote".to_string(),
                });
            }
            kind::KEEPALIVE => {}
            kind::ACK => {
                if let Ok(seq) = ar.read::<u32>() {
                    link.unacked.remove(&seq);
                }
            }
            kind::UNRELIABLE => {
                if link.state == LinkState::Connected {
                    let payload = Bytes::copy_from_slice(ar.unread());
                    deliver(&mut self.inbox, conn, &payload);
                }
            }
            kind::RELIABLE => {
                // Unacked until ACCEPT arrives, so the sender will retry.
                if link.state != LinkState::Connected {
                    return;
                }
                let Ok(seq) = ar.read::<u32>() else {
                    return;
                };
                // Ack even duplicates: the earlier ack may have been lost.
                let ack = control(kind::ACK, |ar| {
                    ar.write(&seq);
                });
                send_raw(socket, from, &ack);
                link.last_sent = Instant::now();

                if seq < link.next_recv_seq {
                    return;
                }
                if link.reorder.len() >= REORDER_LIMIT && !link.reorder.contains_key(&seq) {
                    warn!(%conn, seq, "Reorder buffer full, dropping datagram");
                    return;
                }
                link.reorder
                    .entry(seq)
                    .or_insert_with(|| Bytes::copy_from_slice(ar.unread()));
                while let Some(payload) = link.reorder.remove(&link.next_recv_seq) {
                    link.next_recv_seq = link.next_recv_seq.wrapping_add(1);
                    deliver(&mut self.inbox, conn, &payload);
                }
            }
            other => trace!(%conn, tag = other, "Unknown datagram kind"),
        }
    }

    fn handle_connect(&mut self, socket: &UdpSocket, from: SocketAddr, ar: &mut Archive) {
        let Some(admission) = self.admission.clone() else {
            return;
        };
        let (Ok(protocol), Ok(salt)) = (ar.read::<u32>(), ar.read::<u64>()) else {
            return;
        };
        if protocol != PROTOCOL_ID {
            warn!(%from, protocol, "CONNECT with foreign protocol id");
            send_raw(socket, from, &control(kind::REJECT, |ar| {
                ar.write(&0u8);
            }));
            return;
        }

        if let Some(&existing) = self.by_addr.get(&from) {
            let same = self.links.get(&existing).map(|l| l.salt) == Some(salt);
            if same {
                // Our ACCEPT was lost; answer again.
                send_raw(socket, from, &control(kind::ACCEPT, |ar| {
                    ar.write(&salt);
                }));
                return;
            }
            // The remote restarted with a new session.
            self.drop_link(existing);
            self.events.push(TransportEvent::Disconnected {
                conn: existing,
                reason: "superseded by a new session".to_string(),
            });
        }

        match admission.try_admit(from.ip()) {
            Ok(()) => {
                let conn = self.alloc_id();
                self.links
                    .insert(conn, Link::new(from, salt, LinkState::Connected));
                self.by_addr.insert(from, conn);
                send_raw(socket, from, &control(kind::ACCEPT, |ar| {
                    ar.write(&salt);
                }));
                info!(%conn, remote = %from, "UDP session accepted");
                self.events.push(TransportEvent::Connected { conn, remote: from });
            }
            Err(reason) => {
                info!(remote = %from, %reason, "UDP session rejected");
                send_raw(socket, from, &control(kind::REJECT, |ar| {
                    ar.write(&reject_code(reason));
                }));
                self.events.push(TransportEvent::Rejected { remote: from, reason });
            }
        }
    }

    /// Resends, keepalives and timeouts.
    fn service(&mut self, socket: &UdpSocket, now: Instant) {
        let mut dead = Vec::new();
        for (&conn, link) in self.links.iter_mut() {
            match link.state {
                LinkState::Connecting { started } => {
                    if now.duration_since(started) > CONNECT_TIMEOUT {
                        dead.push((conn, None));
                        continue;
                    }
                    if now.duration_since(link.last_sent) >= CONNECT_RESEND {
                        let salt = link.salt;
                        send_raw(socket, link.remote, &control(kind::CONNECT, |ar| {
                            ar.write(&PROTOCOL_ID).write(&salt);
                        }));
                        link.last_sent = now;
                    }
                }
                LinkState::Connected => {
                    if now.duration_since(link.last_heard) > CONNECTION_TIMEOUT {
                        dead.push((conn, Some("connection timed out")));
                        continue;
                    }
                    let mut exhausted = false;
                    for pending in link.unacked.values_mut() {
                        if now.duration_since(pending.last_sent) < RESEND_INTERVAL {
                            continue;
                        }
                        if pending.resends >= MAX_RESENDS {
                            exhausted = true;
                            break;
                        }
                        send_raw(socket, link.remote, &pending.datagram);
                        pending.last_sent = now;
                        pending.resends += 1;
                        link.last_sent = now;
                    }
                    if exhausted {
                        dead.push((conn, Some("reliable delivery failed")));
                        continue;
                    }
                    if now.duration_since(link.last_sent) >= KEEPALIVE_INTERVAL {
                        send_raw(socket, link.remote, &control(kind::KEEPALIVE, |_| {}));
                        link.last_sent = now;
                    }
                }
            }
        }

        for (conn, reason) in dead {
            self.drop_link(conn);
            match reason {
                Some(reason) => {
                    warn!(%conn, reason, "UDP session lost");
                    self.events.push(TransportEvent::Disconnected {
                        conn,
                        reason: reason.to_string(),
                    });
                }
                None => {
                    warn!(%conn, "UDP connect timed out");
                    self.events.push(TransportEvent::ConnectFailed {
                        reason: "connect timed out".to_string(),
                    });
                }
            }
        }
    }
}

impl Default for SessionUdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(inbox: &mut Vec<Incoming>, conn: ConnectionId, payload: &[u8]) {
    match Packet::decode(payload) {
        Ok(packet) => inbox.push(Incoming { conn, packet }),
        Err(e) => warn!(%conn, error = %e, "Dropping malformed packet"),
    }
}

#[async_trait]
impl Transport for SessionUdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SessionUdp
    }

    async fn listen(&mut self, port: u16, admission: Arc<Admission>) -> anyhow::Result<SocketAddr> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(bind).await.context("udp bind")?;
        let local = socket.local_addr().context("udp local_addr")?;
        self.socket = Some(socket);
        self.admission = Some(admission);
        Ok(local)
    }

    async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        let remote = super::resolve(host, port).await?;
        let socket = UdpSocket::bind(super::unspecified_for(remote))
            .await
            .context("udp bind")?;

        let salt: u64 = rand::random();
        let conn = self.alloc_id();
        let connect = control(kind::CONNECT, |ar| {
            ar.write(&PROTOCOL_ID).write(&salt);
        });
        socket
            .send_to(&connect, remote)
            .await
            .context("udp send connect")?;
        self.links.insert(
            conn,
            Link::new(remote, salt, LinkState::Connecting { started: Instant::now() }),
        );
        self.by_addr.insert(remote, conn);
        self.socket = Some(socket);
        debug!(%conn, %remote, "UDP connect sent");
        Ok(())
    }

    fn poll_incoming(&mut self) -> Vec<Incoming> {
        self.pump();
        std::mem::take(&mut self.inbox)
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.pump();
        std::mem::take(&mut self.events)
    }

    fn send(&mut self, conn: ConnectionId, bytes: Bytes, reliable: bool) -> Result<(), NetError> {
        let socket = self.socket.as_ref().ok_or(NetError::NotOpen)?;
        if bytes.len() + HEADER_LEN > MAX_DATAGRAM_SIZE {
            return Err(NetError::FrameTooLarge {
                size: bytes.len() + HEADER_LEN,
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        let link = self
            .links
            .get_mut(&conn)
            .ok_or(NetError::UnknownConnection(conn.0))?;
        if link.state != LinkState::Connected {
            return Err(NetError::NotOpen);
        }

        let now = Instant::now();
        let datagram = if reliable {
            let seq = link.next_send_seq;
            link.next_send_seq = link.next_send_seq.wrapping_add(1);
            let mut ar = Archive::with_capacity(bytes.len() + HEADER_LEN);
            ar.write(&kind::RELIABLE).write(&seq);
            ar.append(&bytes);
            let datagram = ar.into_bytes();
            link.unacked.insert(
                seq,
                Unacked {
                    datagram: datagram.clone(),
                    last_sent: now,
                    resends: 0,
                },
            );
            datagram
        } else {
            let mut ar = Archive::with_capacity(bytes.len() + 1);
            ar.write(&kind::UNRELIABLE);
            ar.append(&bytes);
            ar.into_bytes()
        };
        send_raw(socket, link.remote, &datagram);
        link.last_sent = now;
        Ok(())
    }

    fn close(&mut self, conn: ConnectionId) -> bool {
        let Some(link) = self.drop_link(conn) else {
            return false;
        };
        if let Some(socket) = &self.socket {
            send_raw(socket, link.remote, &control(kind::DISCONNECT, |_| {}));
        }
        debug!(%conn, remote = %link.remote, "UDP session closed locally");
        true
    }

    fn shutdown(&mut self) {
        let links: Vec<Link> = self.links.drain().map(|(_, l)| l).collect();
        if let Some(socket) = &self.socket {
            let bye = control(kind::DISCONNECT, |_| {});
            for link in &links {
                send_raw(socket, link.remote, &bye);
            }
        }
        self.by_addr.clear();
        self.inbox.clear();
        self.events.clear();
        self.socket = None;
        self.admission = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Drop for SessionUdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pump_until<F>(server: &mut SessionUdpTransport, client: &mut SessionUdpTransport, mut f: F) -> bool
    where
        F: FnMut(&mut SessionUdpTransport, &mut SessionUdpTransport) -> bool,
    {
        for _ in 0..400 {
            if f(server, client) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    async fn connected_pair() -> anyhow::Result<(SessionUdpTransport, SessionUdpTransport, ConnectionId, ConnectionId)> {
        let mut server = SessionUdpTransport::new();
        let addr = server.listen(0, Arc::new(Admission::new(4))).await?;
        let mut client = SessionUdpTransport::new();
        client.connect("127.0.0.1", addr.port()).await?;

        let mut server_conn = None;
        let mut client_conn = None;
        let ok = pump_until(&mut server, &mut client, |s, c| {
            for ev in s.poll_events() {
                if let TransportEvent::Connected { conn, .. } = ev {
                    server_conn = Some(conn);
                }
            }
            for ev in c.poll_events() {
                if let TransportEvent::Connected { conn, .. } = ev {
                    client_conn = Some(conn);
                }
            }
            server_conn.is_some() && client_conn.is_some()
        })
        .await;
        anyhow::ensure!(ok, "handshake did not complete");
        Ok((server, client, server_conn.unwrap_or(ConnectionId(0)), client_conn.unwrap_or(ConnectionId(0))))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handshake_and_ordered_reliable_delivery() -> anyhow::Result<()> {
        let (mut server, mut client, server_conn, client_conn) = connected_pair().await?;

        for i in 0..20 {
            client.send(client_conn, Packet::text(&format!("msg {i}")).encode(), true)?;
        }
        let mut got = Vec::new();
        assert!(
            pump_until(&mut server, &mut client, |s, c| {
                got.extend(s.poll_incoming());
                c.poll_incoming();
                got.len() == 20
            })
            .await
        );
        for (i, incoming) in got.iter().enumerate() {
            assert_eq!(incoming.conn, server_conn);
            assert_eq!(incoming.packet.text_payload(), format!("msg {i}"));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_close_is_reported() -> anyhow::Result<()> {
        let (mut server, mut client, server_conn, client_conn) = connected_pair().await?;
        assert!(client.close(client_conn));
        assert!(!client.close(client_conn));

        let mut closed = None;
        assert!(
            pump_until(&mut server, &mut client, |s, _| {
                for ev in s.poll_events() {
                    if let TransportEvent::Disconnected { conn, .. } = ev {
                        closed = Some(conn);
                    }
                }
                closed.is_some()
            })
            .await
        );
        assert_eq!(closed, Some(server_conn));
        assert_eq!(server.connection_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_server_refuses_connect() -> anyhow::Result<()> {
        let mut server = SessionUdpTransport::new();
        let addr = server.listen(0, Arc::new(Admission::new(0))).await?;
        let mut client = SessionUdpTransport::new();
        client.connect("127.0.0.1", addr.port()).await?;

        let mut rejected = false;
        let mut failed = None;
        assert!(
            pump_until(&mut server, &mut client, |s, c| {
                rejected |= s
                    .poll_events()
                    .iter()
                    .any(|e| matches!(e, TransportEvent::Rejected { reason: Rejection::Full, .. }));
                for ev in c.poll_events() {
                    if let TransportEvent::ConnectFailed { reason } = ev {
                        failed = Some(reason);
                    }
                }
                rejected && failed.is_some()
            })
            .await
        );
        assert_eq!(failed.as_deref(), Some("server is full"));
        Ok(())
    }

    #[test]
    fn sending_before_open_fails() {
        let mut t = SessionUdpTransport::new();
        assert_eq!(t.send(ConnectionId(1), Bytes::new(), true), Err(NetError::NotOpen));
        assert!(t.poll_incoming().is_empty());
    }
}
