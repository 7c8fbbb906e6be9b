//! Lightweight UDP backend.
//!
//! Every datagram starts with the same header:
//!
//! ```text
//! [tag u8][seq u16][ack u16][ack_bits u32]
//! ```
//!
//! `seq` numbers the datagram; `ack`/`ack_bits` acknowledge the newest 33
//! datagrams received from the other side. DATA datagrams follow the header
//! with a flags byte, a `msg_id: u16` when reliable, then the payload.
//! Reliable messages stay queued and are resent in fresh datagrams until one
//! of the datagrams carrying them is acknowledged. Receivers drop duplicate
//! message ids. Delivery order is not guaranteed.
//!
//! HELLO opens a link (and is echoed as the accept), BYE closes or refuses it.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use tokio::{net::UdpSocket, time::Instant};
use tracing::{debug, info, trace, warn};

use super::{
    sequence::{acked_sequences, AckWindow},
    Admission, ConnectionId, Incoming, Rejection, Transport, TransportEvent, TransportKind,
};
use crate::{archive::Archive, error::NetError, packet::Packet};

pub const PROTOCOL_ID: u32 = 0x4e50_4c55;
/// Largest datagram sent or accepted. Packets are never fragmented.
pub const MAX_DATAGRAM_SIZE: usize = 32 * 1024;

const HEADER_LEN: usize = 1 + 2 + 2 + 4;
const DATA_OVERHEAD: usize = HEADER_LEN + 1 + 2;
const RECV_BUFFER: usize = 64 * 1024;
const HELLO_RESEND: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const RESEND_INTERVAL: Duration = Duration::from_millis(150);
/// Datagram-to-message mappings kept for ack resolution.
const SENT_LOG_LIMIT: usize = 1024;
/// Received message ids remembered for dedupe.
const SEEN_LIMIT: usize = 4096;

mod tag {
    pub const HELLO: u8 = 1;
    pub const DATA: u8 = 2;
    pub const BYE: u8 = 3;
}

mod bye {
    pub const CLOSED: u8 = 0;
    pub const FULL: u8 = 1;
    pub const BANNED: u8 = 2;
    pub const PROTOCOL: u8 = 3;
}

bitflags! {
    /// Per-datagram payload flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataFlags: u8 {
        const RELIABLE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting { started: Instant },
    Connected,
}

struct PendingMessage {
    payload: Bytes,
    last_sent: Instant,
}

struct Link {
    remote: SocketAddr,
    state: LinkState,
    local_seq: u16,
    received: AckWindow,
    ack_due: bool,
    next_msg_id: u16,
    pending: BTreeMap<u16, PendingMessage>,
    /// datagram seq -> reliable message id it carried
    sent_log: HashMap<u16, u16>,
    sent_order: VecDeque<u16>,
    seen: HashSet<u16>,
    seen_order: VecDeque<u16>,
    last_heard: Instant,
    last_sent: Instant,
}

impl Link {
    fn new(remote: SocketAddr, state: LinkState) -> Self {
        let now = Instant::now();
        Self {
            remote,
            state,
            local_seq: 0,
            received: AckWindow::default(),
            ack_due: false,
            next_msg_id: 0,
            pending: BTreeMap::new(),
            sent_log: HashMap::new(),
            sent_order: VecDeque::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            last_heard: now,
            last_sent: now,
        }
    }

    /// Writes the common header and advances the local sequence.
    fn header(&mut self, ar: &mut Archive, tag: u8) -> u16 {
        let seq = self.local_seq;
        self.local_seq = self.local_seq.wrapping_add(1);
        let (ack, ack_bits) = self.received.header();
        ar.write(&tag).write(&seq).write(&ack).write(&ack_bits);
        self.ack_due = false;
        seq
    }

    fn control(&mut self, tag: u8, fields: impl FnOnce(&mut Archive)) -> Bytes {
        let mut ar = Archive::with_capacity(HEADER_LEN + 4);
        self.header(&mut ar, tag);
        fields(&mut ar);
        ar.into_bytes()
    }

    fn data(&mut self, msg_id: Option<u16>, payload: &[u8]) -> Bytes {
        let mut ar = Archive::with_capacity(DATA_OVERHEAD + payload.len());
        let seq = self.header(&mut ar, tag::DATA);
        match msg_id {
            Some(id) => {
                ar.write(&DataFlags::RELIABLE.bits()).write(&id);
                self.log_sent(seq, id);
            }
            None => {
                ar.write(&DataFlags::empty().bits());
            }
        }
        ar.append(payload);
        ar.into_bytes()
    }

    fn log_sent(&mut self, seq: u16, msg_id: u16) {
        self.sent_log.insert(seq, msg_id);
        self.sent_order.push_back(seq);
        while self.sent_order.len() > SENT_LOG_LIMIT {
            if let Some(old) = self.sent_order.pop_front() {
                self.sent_log.remove(&old);
            }
        }
    }

    /// Applies an incoming `(ack, ack_bits)` to the reliable queue.
    fn apply_acks(&mut self, ack: u16, ack_bits: u32) {
        for seq in acked_sequences(ack, ack_bits) {
            if let Some(msg_id) = self.sent_log.remove(&seq) {
                self.pending.remove(&msg_id);
            }
        }
    }

    /// Records a reliable message id. Returns `false` for duplicates.
    fn first_sight(&mut self, msg_id: u16) -> bool {
        if !self.seen.insert(msg_id) {
            return false;
        }
        self.seen_order.push_back(msg_id);
        while self.seen_order.len() > SEEN_LIMIT {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

fn send_raw(socket: &UdpSocket, to: SocketAddr, datagram: &[u8]) {
    match socket.try_send_to(datagram, to) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            trace!(%to, "UDP send would block");
        }
        Err(e) => debug!(%to, error = %e, "UDP send failed"),
    }
}

fn read_header(ar: &mut Archive) -> Result<(u8, u16, u16, u32), NetError> {
    Ok((ar.read()?, ar.read()?, ar.read()?, ar.read()?))
}

/// Header-only datagram for remotes without a link.
fn stateless(tag: u8, reason: u8) -> Bytes {
    let mut ar = Archive::with_capacity(HEADER_LEN + 1);
    ar.write(&tag)
        .write(&0u16)
        .write(&0u16)
        .write(&0u32)
        .write(&reason);
    ar.into_bytes()
}

fn bye_text(code: u8) -> &'static str {
    match code {
        bye::FULL => "server is full",
        bye::BANNED => "address is banned",
        bye::PROTOCOL => "protocol mismatch",
        _ => "connection closed by remote",
    }
}

/// Lightweight UDP backend.
pub struct LiteUdpTransport {
    socket: Option<UdpSocket>,
    admission: Option<Arc<Admission>>,
    links: HashMap<ConnectionId, Link>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_id: u64,
    inbox: Vec<Incoming>,
    events: Vec<TransportEvent>,
    recv_buf: Vec<u8>,
}

impl LiteUdpTransport {
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

    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    /// Reliable messages not yet acknowledged on `conn`.
    pub fn pending_reliable(&self, conn: ConnectionId) -> usize {
        self.links.get(&conn).map_or(0, |l| l.pending.len())
    }

    fn drop_link(&mut self, conn: ConnectionId) -> Option<Link> {
        let link = self.links.remove(&conn)?;
        self.by_addr.remove(&link.remote);
        Some(link)
    }

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
        let Ok((kind, seq, ack, ack_bits)) = read_header(&mut ar) else {
            trace!(%from, "Dropping short datagram");
            return;
        };

        let Some(&conn) = self.by_addr.get(&from) else {
            if kind == tag::HELLO {
                self.handle_hello(socket, from, &mut ar);
            }
            return;
        };
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        link.last_heard = Instant::now();

        match kind {
            tag::HELLO => match link.state {
                LinkState::Connecting { .. } => {
                    link.state = LinkState::Connected;
                    link.received.record(seq);
                    link.apply_acks(ack, ack_bits);
                    info!(%conn, remote = %from, "Lite UDP link established");
                    self.events.push(TransportEvent::Connected { conn, remote: from });
                }
                LinkState::Connected if self.admission.is_some() => {
                    // Our reply was lost; echo again.
                    let reply = link.control(tag::HELLO, |ar| {
                        ar.write(&PROTOCOL_ID);
                    });
                    send_raw(socket, from, &reply);
                    link.last_sent = Instant::now();
                }
                LinkState::Connected => {}
            },
            tag::BYE => {
                let code = ar.read::<u8>().unwrap_or(bye::CLOSED);
                let connecting = matches!(link.state, LinkState::Connecting { .. });
                self.drop_link(conn);
                if connecting {
                    let reason = bye_text(code).to_string();
                    info!(%conn, %reason, "Lite UDP link refused");
                    self.events.push(TransportEvent::ConnectFailed { reason });
                } else {
                    debug!(%conn, "Lite UDP link closed by remote");
                    self.events.push(TransportEvent::Disconnected {
                        conn,
                        reason: bye_text(code).to_string(),
                    });
                }
            }
            tag::DATA => {
                if link.state != LinkState::Connected {
                    return;
                }
                link.apply_acks(ack, ack_bits);
                if !link.received.record(seq) {
                    return;
                }
                let Ok(flags) = ar.read::<u8>() else {
                    return;
                };
                let flags = DataFlags::from_bits_truncate(flags);
                if flags.contains(DataFlags::RELIABLE) {
                    link.ack_due = true;
                    let Ok(msg_id) = ar.read::<u16>() else {
                        return;
                    };
                    if !link.first_sight(msg_id) {
                        return;
                    }
                }
                let payload = ar.unread();
                if payload.is_empty() {
                    return;
                }
                match Packet::decode(payload) {
                    Ok(packet) => self.inbox.push(Incoming { conn, packet }),
                    Err(e) => warn!(%conn, error = %e, "Dropping malformed packet"),
                }
            }
            other => trace!(%conn, tag = other, "Unknown datagram tag"),
        }
    }

    fn handle_hello(&mut self, socket: &UdpSocket, from: SocketAddr, ar: &mut Archive) {
        let Some(admission) = self.admission.clone() else {
            return;
        };
        if ar.read::<u32>().ok() != Some(PROTOCOL_ID) {
            warn!(%from, "HELLO with foreign protocol id");
            send_raw(socket, from, &stateless(tag::BYE, bye::PROTOCOL));
            return;
        }
        match admission.try_admit(from.ip()) {
            Ok(()) => {
                let conn = ConnectionId(self.next_id);
                self.next_id += 1;
                let mut link = Link::new(from, LinkState::Connected);
                let reply = link.control(tag::HELLO, |ar| {
                    ar.write(&PROTOCOL_ID);
                });
                send_raw(socket, from, &reply);
                self.links.insert(conn, link);
                self.by_addr.insert(from, conn);
                info!(%conn, remote = %from, "Lite UDP link accepted");
                self.events.push(TransportEvent::Connected { conn, remote: from });
            }
            Err(reason) => {
                info!(remote = %from, %reason, "Lite UDP link rejected");
                let code = match reason {
                    Rejection::Full => bye::FULL,
                    Rejection::Banned => bye::BANNED,
                };
                send_raw(socket, from, &stateless(tag::BYE, code));
                self.events.push(TransportEvent::Rejected { remote: from, reason });
            }
        }
    }

    fn service(&mut self, socket: &UdpSocket, now: Instant) {
        let mut dead = Vec::new();
        for (&conn, link) in self.links.iter_mut() {
            match link.state {
                LinkState::Connecting { started } => {
                    if now.duration_since(started) > CONNECT_TIMEOUT {
                        dead.push((conn, None));
                        continue;
                    }
                    if now.duration_since(link.last_sent) >= HELLO_RESEND {
                        let hello = link.control(tag::HELLO, |ar| {
                            ar.write(&PROTOCOL_ID);
                        });
                        send_raw(socket, link.remote, &hello);
                        link.last_sent = now;
                    }
                }
                LinkState::Connected => {
                    if now.duration_since(link.last_heard) > CONNECTION_TIMEOUT {
                        dead.push((conn, Some("connection timed out")));
                        continue;
                    }
                    let due: Vec<(u16, Bytes)> = link
                        .pending
                        .iter()
                        .filter(|(_, m)| now.duration_since(m.last_sent) >= RESEND_INTERVAL)
                        .map(|(id, m)| (*id, m.payload.clone()))
                        .collect();
                    for (id, payload) in due {
                        let datagram = link.data(Some(id), &payload);
                        send_raw(socket, link.remote, &datagram);
                        if let Some(m) = link.pending.get_mut(&id) {
                            m.last_sent = now;
                        }
                        link.last_sent = now;
                    }
                    if link.ack_due || now.duration_since(link.last_sent) >= KEEPALIVE_INTERVAL {
                        let datagram = link.data(None, &[]);
                        send_raw(socket, link.remote, &datagram);
                        link.last_sent = now;
                    }
                }
            }
        }

        for (conn, reason) in dead {
            self.drop_link(conn);
            match reason {
                Some(reason) => {
                    warn!(%conn, reason, "Lite UDP link lost");
                    self.events.push(TransportEvent::Disconnected {
                        conn,
                        reason: reason.to_string(),
                    });
                }
                None => {
                    warn!(%conn, "Lite UDP connect timed out");
                    self.events.push(TransportEvent::ConnectFailed {
                        reason: "connect timed out".to_string(),
                    });
                }
            }
        }
    }
}

impl Default for LiteUdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LiteUdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LiteUdp
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

        let conn = ConnectionId(self.next_id);
        self.next_id += 1;
        let mut link = Link::new(remote, LinkState::Connecting { started: Instant::now() });
        let hello = link.control(tag::HELLO, |ar| {
            ar.write(&PROTOCOL_ID);
        });
        socket
            .send_to(&hello, remote)
            .await
            .context("udp send hello")?;
        self.links.insert(conn, link);
        self.by_addr.insert(remote, conn);
        self.socket = Some(socket);
        debug!(%conn, %remote, "Lite UDP hello sent");
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
        if bytes.len() + DATA_OVERHEAD > MAX_DATAGRAM_SIZE {
            return Err(NetError::FrameTooLarge {
                size: bytes.len() + DATA_OVERHEAD,
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
        let msg_id = reliable.then(|| {
            let id = link.next_msg_id;
            link.next_msg_id = link.next_msg_id.wrapping_add(1);
            link.pending.insert(
                id,
                PendingMessage {
                    payload: bytes.clone(),
                    last_sent: now,
                },
            );
            id
        });
        let datagram = link.data(msg_id, &bytes);
        send_raw(socket, link.remote, &datagram);
        link.last_sent = now;
        Ok(())
    }

    fn close(&mut self, conn: ConnectionId) -> bool {
        let Some(mut link) = self.drop_link(conn) else {
            return false;
        };
        if let Some(socket) = &self.socket {
            let bye = link.control(tag::BYE, |ar| {
                ar.write(&bye::CLOSED);
            });
            send_raw(socket, link.remote, &bye);
        }
        debug!(%conn, remote = %link.remote, "Lite UDP link closed locally");
        true
    }

    fn shutdown(&mut self) {
        let links: Vec<Link> = self.links.drain().map(|(_, l)| l).collect();
        if let Some(socket) = &self.socket {
            for mut link in links {
                let bye = link.control(tag::BYE, |ar| {
                    ar.write(&bye::CLOSED);
                });
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

impl Drop for LiteUdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
