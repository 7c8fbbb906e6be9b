//! Helpers shared by the integration tests.
//!
//! - `test_config` builds a config for one backend with the ping probe
//!   pushed far out, so roster snapshots stay byte-identical
//! - `pump_until` ticks a host and its peers until a condition holds
//! - `CountingTransport` wraps any backend and counts what it is asked to send
//! - `CompactingGame` renumbers player addresses on removal

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use netplay_client::SessionPeer;
use netplay_server::SessionHost;
use netplay_shared::{
    config::NetConfig,
    error::NetError,
    game::{GameInstance, SharedGame},
    transport::{self, Admission, ConnectionId, Incoming, Transport, TransportEvent, TransportKind},
};

pub const TICK: f32 = 1.0 / 64.0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

pub fn test_config(kind: TransportKind) -> NetConfig {
    NetConfig {
        transport: kind,
        ping_interval_ticks: u32::MAX,
        ..NetConfig::default()
    }
}

/// Config for a named peer.
pub fn peer_config(kind: TransportKind, name: &str) -> NetConfig {
    NetConfig {
        player_name: name.to_string(),
        ..test_config(kind)
    }
}

/// Ticks `host` and every peer until `done` holds. Gives up after ~5 s.
pub async fn pump_until<F>(host: &mut SessionHost, peers: &mut [SessionPeer], mut done: F) -> bool
where
    F: FnMut(&SessionHost, &[SessionPeer]) -> bool,
{
    for _ in 0..2500 {
        host.tick(TICK);
        for peer in peers.iter_mut() {
            peer.tick(TICK);
        }
        if done(host, peers) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    false
}

/// Ticks for a fixed number of rounds.
pub async fn pump_for(host: &mut SessionHost, peers: &mut [SessionPeer], rounds: usize) {
    for _ in 0..rounds {
        host.tick(TICK);
        for peer in peers.iter_mut() {
            peer.tick(TICK);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Host on an ephemeral port over `kind`.
pub async fn start_host(
    kind: TransportKind,
    game: SharedGame,
    max_players: usize,
) -> anyhow::Result<(SessionHost, u16)> {
    let mut host = SessionHost::new(test_config(kind));
    let addr = host
        .create_session("Integration", game, "Arena", 0, max_players)
        .await?;
    Ok((host, addr.port()))
}

/// Connects a new peer and waits until it is validated.
pub async fn join(
    host: &mut SessionHost,
    peers: &mut Vec<SessionPeer>,
    kind: TransportKind,
    port: u16,
    name: &str,
) -> anyhow::Result<u32> {
    let mut peer = SessionPeer::new(peer_config(kind, name));
    peer.connect(netplay_shared::game::LocalGame::shared("MainMenu"), "127.0.0.1", port)
        .await?;
    peers.push(peer);
    let slot = peers.len() - 1;
    let ok = pump_until(host, peers, |_, p| p[slot].is_validated()).await;
    anyhow::ensure!(ok, "{name} did not validate over {kind:?}");
    peers[slot]
        .local_record()
        .map(|r| r.player_index)
        .ok_or_else(|| anyhow::anyhow!("{name} has no record"))
}

/// Counters observed through a `CountingTransport`.
#[derive(Debug, Clone, Default)]
pub struct SendCounter {
    sends: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

impl SendCounter {
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Backend wrapper that counts every `send` before forwarding it.
pub struct CountingTransport {
    inner: Box<dyn Transport>,
    counter: SendCounter,
}

impl CountingTransport {
    pub fn wrap(inner: Box<dyn Transport>) -> (Self, SendCounter) {
        let counter = SendCounter::default();
        (
            Self {
                inner,
                counter: counter.clone(),
            },
            counter,
        )
    }

    /// Counting wrapper around the backend `cfg` selects.
    pub fn for_config(cfg: &NetConfig) -> (Box<dyn Transport>, SendCounter) {
        let (wrapped, counter) = Self::wrap(transport::create(cfg));
        (Box::new(wrapped), counter)
    }
}

#[async_trait]
impl Transport for CountingTransport {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    async fn listen(&mut self, port: u16, admission: Arc<Admission>) -> anyhow::Result<SocketAddr> {
        self.inner.listen(port, admission).await
    }

    async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        self.inner.connect(host, port).await
    }

    fn poll_incoming(&mut self) -> Vec<Incoming> {
        self.inner.poll_incoming()
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.inner.poll_events()
    }

    fn send(&mut self, conn: ConnectionId, bytes: Bytes, reliable: bool) -> Result<(), NetError> {
        self.counter.sends.fetch_add(1, Ordering::SeqCst);
        self.counter.bytes.fetch_add(bytes.len(), Ordering::SeqCst);
        self.inner.send(conn, bytes, reliable)
    }

    fn close(&mut self, conn: ConnectionId) -> bool {
        self.inner.close(conn)
    }

    fn shutdown(&mut self) {
        self.inner.shutdown()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Game whose player addresses are `Pawn_<rank>`, rank being the player's
/// position among live players. Removing a player renumbers everyone after it.
#[derive(Debug, Default)]
pub struct CompactingGame {
    level: String,
    players: BTreeMap<u32, String>,
}

impl CompactingGame {
    pub fn shared() -> SharedGame {
        Arc::new(Mutex::new(Self::default()))
    }
}

impl GameInstance for CompactingGame {
    fn reset_players(&mut self) {
        self.players.clear();
    }

    fn open_level(&mut self, level: &str) {
        self.level = level.to_string();
    }

    fn open_default_level(&mut self) {
        self.level = "MainMenu".to_string();
    }

    fn level_name(&self) -> String {
        self.level.clone()
    }

    fn add_player(&mut self, player_index: u32, name: &str) -> String {
        self.players.insert(player_index, name.to_string());
        self.player_address(player_index).unwrap_or_default()
    }

    fn remove_player(&mut self, player_index: u32) {
        self.players.remove(&player_index);
    }

    fn player_address(&self, player_index: u32) -> Option<String> {
        self.players
            .keys()
            .position(|i| *i == player_index)
            .map(|rank| format!("Pawn_{rank}"))
    }
}
