//! Stream-socket backend (TCP).
//!
//! Layout per session:
//! - server: one accept task; per connection one reader task and one writer task,
//! - client: one reader and one writer task for the server connection.
//!
//! Readers decode length-prefixed frames and push packets and events into a
//! mutex-guarded inbox that the tick drains. Writers drain a bounded channel
//! so `send` never waits on the socket. The reliability flag is ignored: TCP
//! is always reliable.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    framing::{encode_frame, FrameDecoder},
    Admission, ConnectionId, Incoming, Transport, TransportEvent, TransportKind,
};
use crate::{
    error::NetError,
    packet::Packet,
    queue::{BoundedQueue, OverflowPolicy},
};

/// Frames queued per connection before `send` starts refusing.
const WRITE_QUEUE_DEPTH: usize = 1024;
const READ_CHUNK: usize = 16 * 1024;

/// State shared with background tasks.
struct Inbox {
    packets: BoundedQueue<Incoming>,
    events: Vec<TransportEvent>,
}

struct ConnTasks {
    tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    remote: SocketAddr,
}

struct Shared {
    inbox: Mutex<Inbox>,
    conns: Mutex<HashMap<ConnectionId, ConnTasks>>,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnTasks>> {
        self.conns.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push_event(&self, event: TransportEvent) {
        self.inbox().events.push(event);
    }

    fn push_packet(&self, incoming: Incoming) {
        let mut inbox = self.inbox();
        if !inbox.packets.push(incoming) {
            warn!(dropped = inbox.packets.dropped(), "Stream inbox overflow");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// TCP backend.
pub struct StreamTransport {
    shared: Arc<Shared>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl StreamTransport {
    pub fn new(inbox_capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                inbox: Mutex::new(Inbox {
                    packets: BoundedQueue::new(inbox_capacity, overflow),
                    events: Vec::new(),
                }),
                conns: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
            accept_task: None,
            local_addr: None,
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.conns().len()
    }
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self::new(4096, OverflowPolicy::DropOldest)
    }
}

/// Splits a stream into reader/writer tasks and registers it.
fn attach(shared: &Arc<Shared>, stream: TcpStream, remote: SocketAddr) -> ConnectionId {
    let conn = ConnectionId(shared.next_id.fetch_add(1, Ordering::Relaxed));
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);

    // Connected must precede the first packet, and the map entry must exist
    // before the reader can observe EOF and try to remove it.
    shared.push_event(TransportEvent::Connected { conn, remote });
    tokio::spawn(write_loop(write, rx, conn));
    let mut conns = shared.conns();
    let reader = tokio::spawn(read_loop(shared.clone(), read, conn));
    conns.insert(conn, ConnTasks { tx, reader, remote });
    conn
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, conn: ConnectionId) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write.write_all(&frame).await {
            debug!(%conn, error = %e, "Stream write failed");
            break;
        }
    }
    // Channel closed: flush what was queued, then half-close.
    let _ = write.shutdown().await;
}

async fn read_loop(shared: Arc<Shared>, mut read: OwnedReadHalf, conn: ConnectionId) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let reason = loop {
        if !shared.is_running() {
            break "transport stopped".to_string();
        }
        let n = match read.read(&mut chunk).await {
            Ok(0) => break "connection closed by remote".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read error: {e}"),
        };
        decoder.append(&chunk[..n]);
        let mut fatal = None;
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => match Packet::decode(&frame) {
                    Ok(packet) => shared.push_packet(Incoming { conn, packet }),
                    Err(e) => warn!(%conn, error = %e, "Dropping malformed packet"),
                },
                Ok(None) => break,
                Err(e) => {
                    fatal = Some(format!("framing error: {e}"));
                    break;
                }
            }
        }
        if let Some(reason) = fatal {
            break reason;
        }
    };

    // A connection closed locally is already gone from the map; only report
    // remote-side or error closes.
    let removed = shared.conns().remove(&conn);
    if removed.is_some() {
        debug!(%conn, %reason, "Stream connection ended");
        shared.push_event(TransportEvent::Disconnected { conn, reason });
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, admission: Arc<Admission>) {
    while shared.is_running() {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        match admission.try_admit(remote.ip()) {
            Ok(()) => {
                let conn = attach(&shared, stream, remote);
                info!(%conn, %remote, "Stream connection accepted");
            }
            Err(reason) => {
                info!(%remote, %reason, "Stream connection rejected");
                drop(stream);
                shared.push_event(TransportEvent::Rejected { remote, reason });
            }
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn listen(&mut self, port: u16, admission: Arc<Admission>) -> anyhow::Result<SocketAddr> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(bind).await.context("tcp bind")?;
        let local = listener.local_addr().context("tcp local_addr")?;
        self.shared.running.store(true, Ordering::Release);
        self.accept_task = Some(tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            admission,
        )));
        self.local_addr = Some(local);
        Ok(local)
    }

    async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        let remote = super::resolve(host, port).await?;
        let stream = TcpStream::connect(remote).await.context("tcp connect")?;
        self.local_addr = stream.local_addr().ok();
        self.shared.running.store(true, Ordering::Release);
        attach(&self.shared, stream, remote);
        Ok(())
    }

    fn poll_incoming(&mut self) -> Vec<Incoming> {
        self.shared.inbox().packets.drain()
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        std::mem::take(&mut self.shared.inbox().events)
    }

    fn send(&mut self, conn: ConnectionId, bytes: Bytes, _reliable: bool) -> Result<(), NetError> {
        let frame = encode_frame(&bytes)?;
        let conns = self.shared.conns();
        let tasks = conns
            .get(&conn)
            .ok_or(NetError::UnknownConnection(conn.0))?;
        tasks.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetError::QueueFull(WRITE_QUEUE_DEPTH),
            mpsc::error::TrySendError::Closed(_) => NetError::UnknownConnection(conn.0),
        })
    }

    fn close(&mut self, conn: ConnectionId) -> bool {
        match self.shared.conns().remove(&conn) {
            Some(tasks) => {
                // Dropping the sender lets the writer flush and half-close.
                tasks.reader.abort();
                debug!(%conn, remote = %tasks.remote, "Stream connection closed locally");
                true
            }
            None => false,
        }
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let drained: Vec<ConnTasks> = self.shared.conns().drain().map(|(_, t)| t).collect();
        for tasks in drained {
            tasks.reader.abort();
        }
        let mut inbox = self.shared.inbox();
        inbox.packets.clear();
        inbox.events.clear();
        self.local_addr = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
