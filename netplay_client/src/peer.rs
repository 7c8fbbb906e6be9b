//! Session peer.
//!
//! The peer maintains:
//! - One transport connection to a host
//! - The validation gate: nothing but the `Validation` packet leaves before
//!   the host's welcome arrives
//! - A mirror of the host's roster. Roster messages carry the host's
//!   revision; anything older than what was applied is dropped, since the
//!   lightweight UDP lane does not keep reliable messages in order
//! - A periodic latency probe
//! - Its own RPC registry for `ClientOnly` and `ServerAndClient` calls

use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Context};
use bytes::Bytes;
use netplay_shared::{
    config::NetConfig,
    control::{self, Ping, PlayerEvent, SetName, Shutdown, ValidationRequest, Welcome},
    error::NetError,
    event::{EventBus, PeerEvent},
    game::{lock_game, SharedGame},
    packet::{now_millis, Packet, PacketKind},
    queue::BoundedQueue,
    roster::{ConnectionRecord, SessionInfo},
    rpc::{encode_args, RpcContext, RpcEntry, RpcKey, RpcRegistry, Value},
    transport::{self, ConnectionId, Incoming, Transport, TransportEvent},
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Peer-side handler for a non-reserved direct call from the host.
pub type DirectHandler = Box<dyn Fn(&Packet) + Send + Sync>;
pub type StringHandler = Box<dyn FnMut(&str) + Send>;

/// Peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Transport up, validation sent, waiting for the welcome.
    Connected,
    Validated,
}

/// Roster messages held back while waiting for the welcome.
const EARLY_ROSTER_LIMIT: usize = 64;

struct Outgoing {
    bytes: Bytes,
    reliable: bool,
}

/// Session peer.
pub struct SessionPeer {
    cfg: NetConfig,
    transport: Box<dyn Transport>,
    registry: RpcRegistry,
    game: Option<SharedGame>,
    state: PeerState,
    conn: Option<ConnectionId>,
    endpoint: Option<(String, u16)>,
    me: Option<ConnectionRecord>,
    session: SessionInfo,
    /// Highest revision applied from any roster message.
    roster_revision: u64,
    /// Revision of the last full snapshot applied.
    snapshot_revision: u64,
    early: Vec<Packet>,
    outbox: BoundedQueue<Outgoing>,
    events: EventBus,
    direct_handlers: HashMap<String, DirectHandler>,
    string_handler: Option<StringHandler>,
    also_hosting: bool,
    ticks_since_ping: u32,
    latency: Option<u64>,
    gated: u64,
}

impl SessionPeer {
    pub fn new(cfg: NetConfig) -> Self {
        let transport = transport::create(&cfg);
        Self::with_transport(cfg, transport)
    }

    pub fn with_transport(cfg: NetConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            registry: RpcRegistry::new(cfg.registry_capacity),
            outbox: BoundedQueue::new(cfg.outbox_capacity, cfg.overflow),
            cfg,
            transport,
            game: None,
            state: PeerState::Disconnected,
            conn: None,
            endpoint: None,
            me: None,
            session: SessionInfo::default(),
            roster_revision: 0,
            snapshot_revision: 0,
            early: Vec::new(),
            events: EventBus::default(),
            direct_handlers: HashMap::new(),
            string_handler: None,
            also_hosting: false,
            ticks_since_ping: 0,
            latency: None,
            gated: 0,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != PeerState::Disconnected
    }

    pub fn is_validated(&self) -> bool {
        self.state == PeerState::Validated
    }

    /// Latest roster snapshot received from the host.
    pub fn session_info(&self) -> &SessionInfo {
        &self.session
    }

    /// This peer's own record, once validated.
    pub fn local_record(&self) -> Option<&ConnectionRecord> {
        self.me.as_ref()
    }

    /// Last measured round trip in milliseconds.
    pub fn latency(&self) -> Option<u64> {
        self.latency
    }

    /// Outbound calls refused because validation had not completed.
    pub fn gated_calls(&self) -> u64 {
        self.gated
    }

    pub fn drain_events(&mut self) -> Vec<PeerEvent> {
        self.events.drain::<PeerEvent>()
    }

    pub fn registry(&self) -> &RpcRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RpcRegistry {
        &mut self.registry
    }

    pub fn register_rpc(
        &mut self,
        address: &str,
        class_name: &str,
        entry: RpcEntry,
    ) -> Result<Option<Arc<RpcEntry>>, NetError> {
        self.registry.register(address, class_name, entry)
    }

    pub fn register_direct_handler<F>(&mut self, function_name: &str, handler: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.direct_handlers
            .insert(function_name.to_string(), Box::new(handler));
    }

    pub fn set_string_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.string_handler = Some(Box::new(handler));
    }

    /// Marks that a host lives in the same process and shares the game
    /// instance, so the peer must not spawn or replay players itself.
    pub fn set_also_hosting(&mut self, also_hosting: bool) {
        self.also_hosting = also_hosting;
    }

    /// Starts connecting to `host:port`. Completion arrives through `tick`.
    pub async fn connect(&mut self, game: SharedGame, host: &str, port: u16) -> anyhow::Result<()> {
        if self.state != PeerState::Disconnected {
            bail!("already connected to a session");
        }
        if !self.also_hosting {
            lock_game(&game).reset_players();
        }

        info!(%host, port, transport = ?self.transport.kind(), "Connecting to host");
        self.transport
            .connect(host, port)
            .await
            .with_context(|| format!("connect to {host}:{port}"))?;

        self.game = Some(game);
        self.endpoint = Some((host.to_string(), port));
        self.state = PeerState::Connecting;
        self.ticks_since_ping = 0;
        self.latency = None;
        Ok(())
    }

    /// Reconnects to the endpoint of the last `connect`.
    pub async fn reconnect(&mut self) -> anyhow::Result<()> {
        let (Some((host, port)), Some(game)) = (self.endpoint.clone(), self.game.clone()) else {
            bail!("no previous session to reconnect to");
        };
        if self.state != PeerState::Disconnected {
            self.disconnect()?;
        }
        self.connect(game, &host, port).await
    }

    /// Leaves the session and returns the game to its default level.
    pub fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.state == PeerState::Disconnected {
            bail!("not connected to a session");
        }
        self.flush();
        if let Some(conn) = self.conn {
            self.transport.close(conn);
        }
        self.teardown("disconnected");
        Ok(())
    }

    fn teardown(&mut self, reason: &str) {
        info!(%reason, player = ?self.me.as_ref().map(|r| r.player_index), "Left session");
        self.transport.shutdown();
        self.outbox.clear();
        self.session = SessionInfo::default();
        self.roster_revision = 0;
        self.snapshot_revision = 0;
        self.early.clear();
        self.me = None;
        self.conn = None;
        self.state = PeerState::Disconnected;
        if !self.also_hosting {
            if let Some(game) = &self.game {
                let mut g = lock_game(game);
                g.reset_players();
                g.open_default_level();
            }
        }
        self.events.push(PeerEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// One peer step. Never blocks.
    pub fn tick(&mut self, _dt: f32) {
        if self.state == PeerState::Disconnected {
            return;
        }

        let incoming = self.transport.poll_incoming();
        let mut lost = None;
        for event in self.transport.poll_events() {
            match event {
                TransportEvent::Connected { conn, remote } => self.on_connected(conn, remote),
                TransportEvent::ConnectFailed { reason } => {
                    warn!(%reason, "Connect failed");
                    self.transport.shutdown();
                    self.state = PeerState::Disconnected;
                    self.events.push(PeerEvent::ConnectFailed(reason));
                    return;
                }
                // Packets that arrived with the drop are still dispatched first.
                TransportEvent::Disconnected { reason, .. } => lost = Some(reason),
                TransportEvent::Rejected { remote, reason } => {
                    debug!(%remote, %reason, "Ignoring rejection on a client transport");
                }
            }
        }

        for Incoming { packet, .. } in incoming {
            if self.state == PeerState::Disconnected {
                return;
            }
            self.dispatch(packet);
        }
        if let Some(reason) = lost {
            if self.state != PeerState::Disconnected {
                self.teardown(&reason);
            }
            return;
        }

        if self.state == PeerState::Validated {
            self.ticks_since_ping += 1;
            if self.ticks_since_ping >= self.cfg.ping_interval_ticks.max(1) {
                self.ticks_since_ping = 0;
                self.send_ping();
            }
        }
        self.flush();
    }

    fn on_connected(&mut self, conn: ConnectionId, remote: std::net::SocketAddr) {
        info!(%conn, %remote, "Connected, sending validation");
        self.conn = Some(conn);
        self.state = PeerState::Connected;
        let request = ValidationRequest {
            credential: self.cfg.validation_token.as_bytes().to_vec(),
            player_name: self.cfg.player_name.clone(),
        };
        match serde_json::to_vec(&request) {
            Ok(data) => {
                let packet = Packet::validation(Bytes::from(data));
                if let Err(e) = self.transport.send(conn, packet.encode(), true) {
                    warn!(%conn, error = %e, "Validation not sent");
                }
            }
            Err(e) => warn!(error = %e, "Validation request not encoded"),
        }
        self.events.push(PeerEvent::Connected);
    }

    fn dispatch(&mut self, packet: Packet) {
        match packet.kind {
            PacketKind::DirectCall if control::is_reserved(&packet.function_name) => {
                self.dispatch_control(&packet)
            }
            _ if self.state != PeerState::Validated => {
                debug!(kind = ?packet.kind, "Packet before welcome dropped");
            }
            PacketKind::Rpc => self.dispatch_rpc(&packet),
            PacketKind::DirectCall => match self.direct_handlers.get(&packet.function_name) {
                Some(handler) => handler(&packet),
                None => warn!(call = %packet.function_name, "No direct handler registered"),
            },
            PacketKind::String => {
                let text = packet.text_payload();
                if let Some(handler) = self.string_handler.as_mut() {
                    handler(&text);
                }
                self.events.push(PeerEvent::StringReceived(text));
            }
            PacketKind::Validation => debug!("Validation packet from host ignored"),
        }
    }

    fn dispatch_rpc(&mut self, packet: &Packet) {
        let Some(entry) = self.registry.lookup_packet(packet) else {
            warn!(rpc = %RpcKey::of(packet), "Unknown rpc dropped");
            return;
        };
        if !entry.kind.runs_on_client() {
            warn!(rpc = %RpcKey::of(packet), "Server-only rpc sent to peer dropped");
            return;
        }
        if !entry.has_callback() {
            debug!(rpc = %RpcKey::of(packet), "Declared rpc has no peer callback");
            return;
        }
        let ctx = RpcContext {
            sender: None,
            timestamp: packet.timestamp,
        };
        if let Err(e) = self.registry.invoke(&entry, packet, &ctx) {
            warn!(rpc = %RpcKey::of(packet), error = %e, "Rpc invoke failed");
        }
    }

    fn dispatch_control(&mut self, packet: &Packet) {
        if self.state != PeerState::Validated {
            match packet.function_name.as_str() {
                control::WELCOME | control::SHUTDOWN => {}
                control::SESSION_INFO | control::PLAYER_JOINED | control::PLAYER_LEFT => {
                    if self.early.len() < EARLY_ROSTER_LIMIT {
                        self.early.push(packet.clone());
                    } else {
                        debug!(call = %packet.function_name, "Early roster message dropped");
                    }
                    return;
                }
                other => {
                    debug!(call = other, state = ?self.state, "Control message before welcome dropped");
                    return;
                }
            }
        }
        let result = match packet.function_name.as_str() {
            control::WELCOME => control::from_packet(packet).map(|w: Welcome| self.on_welcome(w)),
            control::SESSION_INFO => {
                control::from_packet(packet).map(|s: SessionInfo| self.on_session_info(s))
            }
            control::PLAYER_JOINED => {
                control::from_packet(packet).map(|e: PlayerEvent| self.on_player_joined(e))
            }
            control::PLAYER_LEFT => {
                control::from_packet(packet).map(|e: PlayerEvent| self.on_player_left(e))
            }
            control::PONG => control::from_packet(packet).map(|p: Ping| self.on_pong(p)),
            control::SHUTDOWN => control::from_packet(packet).map(|s: Shutdown| {
                info!(reason = %s.reason, "Host closed the connection");
                self.teardown(&s.reason);
            }),
            other => {
                debug!(call = other, "Reserved call not handled by peer");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(call = %packet.function_name, error = %e, "Malformed control message");
        }
    }

    fn on_welcome(&mut self, welcome: Welcome) {
        if self.state != PeerState::Connected {
            debug!(state = ?self.state, "Unexpected welcome ignored");
            return;
        }
        let Welcome { you, session } = welcome;
        info!(
            player = you.player_index,
            name = %you.player_name,
            session = %session.server_name,
            level = %session.level_name,
            "Validated by host"
        );
        if !self.also_hosting {
            if let Some(game) = &self.game {
                let mut g = lock_game(game);
                g.open_level(&session.level_name);
                g.add_player(you.player_index, &you.player_name);
                for other in session.players.iter().filter(|p| p.player_index != you.player_index) {
                    g.add_player(other.player_index, &other.player_name);
                }
            }
        }

        self.state = PeerState::Validated;
        self.me = Some(you.clone());
        self.roster_revision = session.revision;
        self.snapshot_revision = session.revision;
        self.session = session.clone();
        self.events.push(PeerEvent::Validated {
            you: you.clone(),
            session: session.clone(),
        });
        if !self.also_hosting {
            for other in session.players.into_iter().filter(|p| p.player_index != you.player_index) {
                self.events.push(PeerEvent::PlayerConnected(other));
            }
        }

        for packet in std::mem::take(&mut self.early) {
            self.dispatch_control(&packet);
        }
    }

    /// Applies a full snapshot, adding and removing players so the game
    /// matches it.
    fn on_session_info(&mut self, session: SessionInfo) {
        if session.revision <= self.snapshot_revision || session.revision < self.roster_revision {
            debug!(
                revision = session.revision,
                applied = self.roster_revision,
                "Stale session info ignored"
            );
            return;
        }
        let left: Vec<ConnectionRecord> = self
            .session
            .players
            .iter()
            .filter(|p| session.by_index(p.player_index).is_none())
            .cloned()
            .collect();
        let joined: Vec<ConnectionRecord> = session
            .players
            .iter()
            .filter(|p| self.session.by_index(p.player_index).is_none())
            .cloned()
            .collect();
        for player in left {
            self.player_removed(player);
        }
        for player in joined {
            self.player_added(player);
        }

        if let Some(me) = &self.me {
            if let Some(updated) = session.by_index(me.player_index) {
                self.me = Some(updated.clone());
            }
        }
        self.roster_revision = session.revision;
        self.snapshot_revision = session.revision;
        self.session = session.clone();
        self.events.push(PeerEvent::SessionUpdated(session));
    }

    fn on_player_joined(&mut self, event: PlayerEvent) {
        if event.revision <= self.roster_revision {
            debug!(player = event.player.player_index, revision = event.revision, "Stale join ignored");
            return;
        }
        self.roster_revision = event.revision;
        let player = event.player;
        debug!(player = player.player_index, name = %player.player_name, "Player joined");
        if self.session.remove_by_index(player.player_index).is_none() {
            self.player_added(player.clone());
        }
        self.session.insert(player);
        self.session.revision = event.revision;
    }

    fn on_player_left(&mut self, event: PlayerEvent) {
        if event.revision <= self.roster_revision {
            debug!(player = event.player.player_index, revision = event.revision, "Stale leave ignored");
            return;
        }
        self.roster_revision = event.revision;
        debug!(player = event.player.player_index, name = %event.player.player_name, "Player left");
        if let Some(player) = self.session.remove_by_index(event.player.player_index) {
            self.player_removed(player);
        }
        self.session.revision = event.revision;
    }

    fn player_added(&mut self, player: ConnectionRecord) {
        if !self.also_hosting {
            if let Some(game) = &self.game {
                lock_game(game).add_player(player.player_index, &player.player_name);
            }
        }
        self.events.push(PeerEvent::PlayerConnected(player));
    }

    fn player_removed(&mut self, player: ConnectionRecord) {
        if !self.also_hosting {
            if let Some(game) = &self.game {
                lock_game(game).remove_player(player.player_index);
            }
        }
        self.events.push(PeerEvent::PlayerDisconnected(player));
    }

    fn on_pong(&mut self, pong: Ping) {
        let rtt = now_millis().saturating_sub(pong.sent_at);
        self.latency = Some(rtt);
        if let Some(me) = self.me.as_mut() {
            me.ping = rtt;
        }
        debug!(rtt_ms = rtt, "Latency measured");
        self.events.push(PeerEvent::LatencyMeasured(rtt));
    }

    fn send_ping(&mut self) {
        let ping = Ping {
            sent_at: now_millis(),
            last_rtt: self.latency.unwrap_or(0),
        };
        self.queue_control(control::PING, &ping, false);
    }

    /// Sends a ping on the next flush regardless of the interval.
    pub fn probe_latency(&mut self) -> bool {
        if !self.pass_gate("latency probe") {
            return false;
        }
        self.ticks_since_ping = 0;
        self.send_ping();
        true
    }

    /// Validation gate for outbound traffic. Refused calls are not queued.
    fn pass_gate(&mut self, what: &str) -> bool {
        if self.state == PeerState::Validated {
            return true;
        }
        self.gated += 1;
        warn!(what, state = ?self.state, "Not validated, outbound call dropped");
        false
    }

    /// Calls a registered RPC from the peer side.
    ///
    /// `ClientOnly` runs here only. `ServerOnly` and `ServerAndClient` go to
    /// the host, which runs them and relays `ServerAndClient` to the others.
    pub fn call_rpc(
        &mut self,
        address: &str,
        class_name: &str,
        function_name: &str,
        args: &[Value],
    ) -> bool {
        if !self.pass_gate(function_name) {
            return false;
        }
        let key = RpcKey::new(address, class_name, function_name);
        let Some(entry) = self.registry.lookup(address, class_name, function_name) else {
            warn!(rpc = %key, "Unknown rpc, call dropped");
            return false;
        };
        if let Err(e) = entry.check_args(args) {
            warn!(rpc = %key, error = %e, "Rpc arguments rejected");
            return false;
        }
        let packet = Packet::rpc(address, class_name, function_name, encode_args(args));
        if entry.kind.runs_on_server() {
            self.queue(packet.encode(), entry.reliable);
        } else if entry.has_callback() {
            let ctx = RpcContext {
                sender: self.me.as_ref().map(|r| r.player_index),
                timestamp: packet.timestamp,
            };
            if let Err(e) = self.registry.invoke(&entry, &packet, &ctx) {
                warn!(rpc = %key, error = %e, "Rpc invoke failed");
            }
        }
        true
    }

    /// Sends a direct call to the host.
    pub fn direct_call(&mut self, function_name: &str, data: Bytes) -> bool {
        if !self.pass_gate(function_name) {
            return false;
        }
        if control::is_reserved(function_name) {
            warn!(call = function_name, "Reserved call name refused");
            return false;
        }
        self.queue(Packet::direct(function_name, data).encode(), true);
        true
    }

    pub fn send_string(&mut self, text: &str) -> bool {
        if !self.pass_gate("string") {
            return false;
        }
        self.queue(Packet::text(text).encode(), true);
        true
    }

    /// Asks the host to rename this peer's player. Before validation the
    /// name is only stored for the next connect.
    pub fn set_player_name(&mut self, name: &str) -> bool {
        self.cfg.player_name = name.to_string();
        if !self.pass_gate("set name") {
            return false;
        }
        self.queue_control(
            control::SET_NAME,
            &SetName {
                name: name.to_string(),
            },
            true,
        );
        true
    }

    fn queue(&mut self, bytes: Bytes, reliable: bool) {
        if !self.outbox.push(Outgoing { bytes, reliable }) {
            warn!(dropped = self.outbox.dropped(), "Peer outbox overflow");
        }
    }

    fn queue_control<T: Serialize>(&mut self, function_name: &str, payload: &T, reliable: bool) {
        match control::to_packet(function_name, payload) {
            Ok(packet) => self.queue(packet.encode(), reliable),
            Err(e) => warn!(call = function_name, error = %e, "Control message not encoded"),
        }
    }

    fn flush(&mut self) {
        let Some(conn) = self.conn else {
            return;
        };
        for out in self.outbox.drain() {
            if let Err(e) = self.transport.send(conn, out.bytes, out.reliable) {
                debug!(%conn, error = %e, "Send failed");
            }
        }
    }

    /// Console commands for the standalone binary.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.first() else {
            return Vec::new();
        };
        match *command {
            "status" => {
                let mut out = vec![format!(
                    "State: {:?} transport={:?} latency={}",
                    self.state,
                    self.transport.kind(),
                    self.latency
                        .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"))
                )];
                if let Some(me) = &self.me {
                    out.push(format!("You: [{}] {}", me.player_index, me.player_name));
                }
                out.push(format!(
                    "Session: {} level={} players={}/{}",
                    self.session.server_name,
                    self.session.level_name,
                    self.session.connected_player_count,
                    self.session.max_players
                ));
                for p in &self.session.players {
                    out.push(format!("  [{}] {} ping={}ms", p.player_index, p.player_name, p.ping));
                }
                out
            }
            "say" => {
                let text = line.trim_start().trim_start_matches("say").trim();
                if text.is_empty() {
                    vec!["Usage: say <text>".to_string()]
                } else if self.send_string(text) {
                    Vec::new()
                } else {
                    vec!["Not validated yet".to_string()]
                }
            }
            "name" => match tokens.get(1) {
                Some(name) if self.set_player_name(name) => vec![format!("Renaming to {name}")],
                Some(name) => vec![format!("Name set to {name} for the next connect")],
                None => vec!["Usage: name <new>".to_string()],
            },
            other => vec![format!("Unknown command: {other}")],
        }
    }
}

impl Drop for SessionPeer {
    fn drop(&mut self) {
        if self.state != PeerState::Disconnected {
            if let Some(conn) = self.conn {
                self.transport.close(conn);
            }
            self.transport.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use netplay_shared::{
        game::LocalGame,
        rpc::{DispatchKind, ParamKind},
        transport::{Admission, TransportKind},
    };
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    #[derive(Default)]
    struct Script {
        incoming: Vec<Incoming>,
        events: Vec<TransportEvent>,
        sent: Vec<Packet>,
        shutdowns: u32,
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport(Arc<Mutex<Script>>);

    const HOST: ConnectionId = ConnectionId(1);

    impl ScriptedTransport {
        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.0.lock().unwrap()
        }

        fn accept(&self) {
            self.script().events.push(TransportEvent::Connected {
                conn: HOST,
                remote: "127.0.0.1:27020".parse().unwrap(),
            });
        }

        fn deliver(&self, packet: Packet) {
            self.script().incoming.push(Incoming { conn: HOST, packet });
        }

        fn sent(&self) -> Vec<Packet> {
            self.script().sent.clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Stream
        }

        async fn listen(&mut self, _port: u16, _admission: Arc<Admission>) -> anyhow::Result<SocketAddr> {
            bail!("peer transport does not listen")
        }

        async fn connect(&mut self, _host: &str, _port: u16) -> anyhow::Result<()> {
            Ok(())
        }

        fn poll_incoming(&mut self) -> Vec<Incoming> {
            std::mem::take(&mut self.script().incoming)
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            std::mem::take(&mut self.script().events)
        }

        fn send(&mut self, _conn: ConnectionId, bytes: Bytes, _reliable: bool) -> Result<(), NetError> {
            let packet = Packet::decode(&bytes)?;
            self.script().sent.push(packet);
            Ok(())
        }

        fn close(&mut self, _conn: ConnectionId) -> bool {
            true
        }

        fn shutdown(&mut self) {
            self.script().shutdowns += 1;
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn record(index: u32, name: &str) -> ConnectionRecord {
        ConnectionRecord {
            handle: (index > 0).then_some(ConnectionId(u64::from(index))),
            network_address: format!("Player_{index}"),
            player_index: index,
            player_name: name.to_string(),
            validated: true,
            ping: 0,
        }
    }

    fn welcome(you: u32) -> Packet {
        let mut session = SessionInfo::new("Test", "Arena", 4);
        session.insert(record(0, "host"));
        session.insert(record(3, "other"));
        session.insert(record(you, "me"));
        control::to_packet(
            control::WELCOME,
            &Welcome {
                you: record(you, "me"),
                session,
            },
        )
        .unwrap()
    }

    fn snapshot(players: &[u32], revision: u64) -> Packet {
        let mut session = SessionInfo::new("Test", "Arena", 8);
        for &index in players {
            session.insert(record(index, if index == 2 { "me" } else { "other" }));
        }
        session.revision = revision;
        control::to_packet(control::SESSION_INFO, &session).unwrap()
    }

    fn roster_event(function_name: &str, index: u32, revision: u64) -> Packet {
        control::to_packet(
            function_name,
            &PlayerEvent {
                player: record(index, "late"),
                revision,
            },
        )
        .unwrap()
    }

    fn connected_indices(events: &[PeerEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::PlayerConnected(p) => Some(p.player_index),
                _ => None,
            })
            .collect()
    }

    async fn connected() -> (SessionPeer, ScriptedTransport, SharedGame) {
        let wire = ScriptedTransport::default();
        let mut peer = SessionPeer::with_transport(NetConfig::default(), Box::new(wire.clone()));
        let game = LocalGame::shared("MainMenu");
        peer.connect(game.clone(), "127.0.0.1", 27020).await.unwrap();
        wire.accept();
        peer.tick(0.016);
        (peer, wire, game)
    }

    #[tokio::test]
    async fn validation_is_the_first_packet_sent() {
        let (peer, wire, _game) = connected().await;
        assert_eq!(peer.state(), PeerState::Connected);
        let sent = wire.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::Validation);
        let req: ValidationRequest = serde_json::from_slice(&sent[0].data).unwrap();
        assert_eq!(req.credential, b"netplay-v1".to_vec());
    }

    #[tokio::test]
    async fn outbound_calls_before_welcome_write_nothing() {
        let (mut peer, wire, _game) = connected().await;
        peer.register_rpc("Door_1", "Door", RpcEntry::declare("Open", DispatchKind::ServerOnly, vec![]))
            .unwrap();
        assert!(!peer.send_string("hello"));
        assert!(!peer.direct_call("Emote", Bytes::new()));
        assert!(!peer.call_rpc("Door_1", "Door", "Open", &[]));
        assert!(!peer.set_player_name("late"));
        peer.tick(0.016);
        assert_eq!(wire.sent().len(), 1);
        assert_eq!(peer.gated_calls(), 4);
    }

    #[tokio::test]
    async fn welcome_validates_and_replays_existing_players() {
        let (mut peer, wire, game) = connected().await;
        wire.deliver(welcome(2));
        peer.tick(0.016);

        assert!(peer.is_validated());
        assert_eq!(peer.local_record().map(|r| r.player_index), Some(2));
        assert_eq!(peer.session_info().players.len(), 3);
        let replayed: Vec<u32> = peer
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                PeerEvent::PlayerConnected(p) => Some(p.player_index),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec![0, 3]);
        assert_eq!(lock_game(&game).level_name(), "Arena");
        assert_eq!(lock_game(&game).player_address(2).as_deref(), Some("Player_2"));

        assert!(peer.send_string("hi"));
        peer.tick(0.016);
        assert_eq!(wire.sent().last().map(|p| p.text_payload()), Some("hi".to_string()));
    }

    #[tokio::test]
    async fn reordered_roster_messages_leave_no_ghost_player() {
        let (mut peer, wire, game) = connected().await;
        wire.deliver(welcome(2));
        peer.tick(0.016);
        let base = peer.session_info().revision;
        peer.drain_events();

        // Player 5 joined at base+1 and left at base+2; the wire swapped them.
        wire.deliver(roster_event(control::PLAYER_LEFT, 5, base + 2));
        wire.deliver(snapshot(&[0, 2, 3], base + 2));
        wire.deliver(roster_event(control::PLAYER_JOINED, 5, base + 1));
        wire.deliver(snapshot(&[0, 2, 3, 5], base + 1));
        peer.tick(0.016);

        let indices: Vec<u32> = peer.session_info().players.iter().map(|p| p.player_index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert_eq!(peer.session_info().revision, base + 2);
        assert_eq!(lock_game(&game).player_address(5), None);
        assert!(connected_indices(&peer.drain_events()).is_empty());
    }

    #[tokio::test]
    async fn newer_snapshot_adds_and_removes_players_in_the_game() {
        let (mut peer, wire, game) = connected().await;
        wire.deliver(welcome(2));
        peer.tick(0.016);
        let base = peer.session_info().revision;
        peer.drain_events();

        wire.deliver(snapshot(&[0, 2, 4], base + 2));
        peer.tick(0.016);

        assert_eq!(lock_game(&game).player_address(3), None);
        assert_eq!(lock_game(&game).player_address(4).as_deref(), Some("Player_4"));
        let events = peer.drain_events();
        assert_eq!(connected_indices(&events), vec![4]);
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::PlayerDisconnected(p) if p.player_index == 3)));
    }

    #[tokio::test]
    async fn roster_messages_before_welcome_wait_for_it() {
        let (mut peer, wire, game) = connected().await;
        // Broadcast after the welcome was queued, but delivered ahead of it.
        wire.deliver(snapshot(&[0, 2, 3, 4], 4));
        wire.deliver(roster_event(control::PLAYER_JOINED, 4, 4));
        peer.tick(0.016);

        assert_eq!(peer.state(), PeerState::Connected);
        assert!(peer.session_info().players.is_empty());
        assert_eq!(lock_game(&game).player_address(4), None);

        wire.deliver(welcome(2));
        peer.tick(0.016);
        assert!(peer.is_validated());
        let indices: Vec<u32> = peer.session_info().players.iter().map(|p| p.player_index).collect();
        assert_eq!(indices, vec![0, 2, 3, 4]);
        assert_eq!(lock_game(&game).player_address(4).as_deref(), Some("Player_4"));
        assert_eq!(connected_indices(&peer.drain_events()), vec![0, 3, 4]);
    }

    #[tokio::test]
    async fn stale_snapshot_before_welcome_is_discarded() {
        let (mut peer, wire, game) = connected().await;
        wire.deliver(snapshot(&[0, 2], 1));
        wire.deliver(welcome(2));
        peer.tick(0.016);

        assert!(peer.is_validated());
        assert_eq!(peer.session_info().players.len(), 3);
        assert_eq!(lock_game(&game).player_address(3).as_deref(), Some("Player_3"));
    }

    #[tokio::test]
    async fn co_hosted_peer_does_not_replay_or_touch_the_game() {
        let wire = ScriptedTransport::default();
        let mut peer = SessionPeer::with_transport(NetConfig::default(), Box::new(wire.clone()));
        peer.set_also_hosting(true);
        let game = LocalGame::shared("MainMenu");
        peer.connect(game.clone(), "127.0.0.1", 27020).await.unwrap();
        wire.accept();
        wire.deliver(welcome(2));
        peer.tick(0.016);

        assert!(peer.is_validated());
        assert!(peer
            .drain_events()
            .iter()
            .all(|e| !matches!(e, PeerEvent::PlayerConnected(_))));
        assert_eq!(lock_game(&game).player_address(2), None);
    }

    #[tokio::test]
    async fn pong_records_latency() {
        let (mut peer, wire, _game) = connected().await;
        wire.deliver(welcome(1));
        peer.tick(0.016);
        assert!(peer.probe_latency());
        peer.tick(0.016);
        let ping = wire
            .sent()
            .into_iter()
            .find(|p| p.function_name == control::PING)
            .unwrap();
        wire.deliver(Packet::direct(control::PONG, ping.data.clone()));
        peer.tick(0.016);
        assert!(peer.latency().is_some());
        assert!(peer
            .drain_events()
            .iter()
            .any(|e| matches!(e, PeerEvent::LatencyMeasured(_))));
    }

    #[tokio::test]
    async fn client_rpcs_from_host_run_and_server_only_do_not() {
        let (mut peer, wire, _game) = connected().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        peer.register_rpc(
            "Door_1",
            "Door",
            RpcEntry::new("Slam", DispatchKind::ServerAndClient, vec![ParamKind::Int], move |_, args| {
                assert_eq!(args, &[Value::Int(3)]);
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let g = hits.clone();
        peer.register_rpc(
            "Door_1",
            "Door",
            RpcEntry::new("Audit", DispatchKind::ServerOnly, vec![], move |_, _| {
                g.fetch_add(100, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let slam = Packet::rpc("Door_1", "Door", "Slam", encode_args(&[Value::Int(3)]));

        // Before the welcome the call is ignored.
        wire.deliver(slam.clone());
        peer.tick(0.016);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        wire.deliver(welcome(1));
        wire.deliver(slam);
        wire.deliver(Packet::rpc("Door_1", "Door", "Audit", Bytes::new()));
        peer.tick(0.016);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_notice_tears_down_with_reason() {
        let (mut peer, wire, game) = connected().await;
        wire.deliver(welcome(1));
        peer.tick(0.016);
        wire.deliver(
            control::to_packet(control::SHUTDOWN, &Shutdown { reason: "kicked".into() }).unwrap(),
        );
        peer.tick(0.016);

        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(peer.drain_events().contains(&PeerEvent::Disconnected {
            reason: "kicked".to_string()
        }));
        assert_eq!(lock_game(&game).level_name(), "MainMenu");
        assert!(peer.disconnect().is_err());
        assert_eq!(wire.script().shutdowns, 1);
    }

    #[tokio::test]
    async fn connect_twice_is_an_error_and_reconnect_reuses_endpoint() {
        let (mut peer, _wire, game) = connected().await;
        assert!(peer.connect(game, "127.0.0.1", 27020).await.is_err());
        peer.disconnect().unwrap();
        peer.reconnect().await.unwrap();
        assert_eq!(peer.state(), PeerState::Connecting);
    }

    #[tokio::test]
    async fn connect_failure_returns_to_disconnected() {
        let wire = ScriptedTransport::default();
        let mut peer = SessionPeer::with_transport(NetConfig::default(), Box::new(wire.clone()));
        peer.connect(LocalGame::shared("MainMenu"), "127.0.0.1", 1).await.unwrap();
        wire.script().events.push(TransportEvent::ConnectFailed {
            reason: "server is full".to_string(),
        });
        peer.tick(0.016);
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert_eq!(
            peer.drain_events(),
            vec![PeerEvent::ConnectFailed("server is full".to_string())]
        );
    }
}
