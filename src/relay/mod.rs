//! Per-peer relay
//!
//! A [`PeerRelay`] ties one remote player to a local UDP socket the game
//! talks to, and bridges that socket to a P2P data channel negotiated through
//! a [`NegotiationSession`].
//!
//! # State Machine
//!
//! ```text
//! new → checking → connected/completed
//!  ↑                     ↓
//!  └──── (recreate) ── failed
//!
//! close() → disconnected (terminal)
//! ```
//!
//! On `failed`, and whenever the watchdog finds the relay stuck for longer
//! than the connection timeout, the session is torn down and recreated. The
//! relay itself (remote id, login, role, relay-server list) survives every
//! reconnect; only the session underneath is replaced.

pub mod mock;
pub mod registry;
pub mod session;

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::Token;

use crate::PlayerId;
use session::{
    CandidatePair, ConnectionState, EventSender, IceServer, NegotiationSession, SessionEvent,
    SessionEventKind, SessionFactory, SignalingMessage,
};

pub use registry::RelayRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Default connection-attempt timeout and watchdog period
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum UDP datagram the game can send
const MAX_DATAGRAM_SIZE: usize = 65535;

// ============================================================================
// Configuration
// ============================================================================

/// Settings shared by every relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Host the game runs on; relay sockets bind here too
    pub game_host: IpAddr,
    /// UDP port the game lobby listens on for relayed traffic
    pub lobby_port: u16,
    /// Connection-attempt timeout, also the watchdog period
    pub connect_timeout: Duration,
    /// States the watchdog treats as stuck
    pub stuck_states: Vec<ConnectionState>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            game_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            lobby_port: 7238,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stuck_states: vec![ConnectionState::New, ConnectionState::Failed],
        }
    }
}

/// Everything a relay needs from its owner besides its own identity
#[derive(Clone)]
pub struct RelayContext {
    pub config: RelayConfig,
    pub factory: Rc<dyn SessionFactory>,
    pub events: EventSender,
}

/// Stable identity of a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub remote_id: PlayerId,
    pub remote_login: String,
    /// Whether this side creates the data channel and the offer
    pub is_offerer: bool,
}

/// Something the relay's owner has to forward to the control plane
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Signaling payload for the remote peer
    Signaling(serde_json::Value),
    StateChanged(ConnectionState),
    DataChannelOpen,
}

// ============================================================================
// Peer Relay
// ============================================================================

pub struct PeerRelay {
    identity: PeerIdentity,
    ice_servers: Vec<IceServer>,
    ctx: RelayContext,
    token: Token,

    session: Option<Box<dyn NegotiationSession>>,
    /// Bumped every time the session is recreated
    generation: u64,
    offer_received: bool,
    state: ConnectionState,
    data_channel_open: bool,

    socket: Option<UdpSocket>,
    local_port: Option<u16>,

    created_at: Instant,
    last_attempt: Instant,
    next_watchdog: Instant,
    connect_latency: Option<Duration>,
    candidates: Option<CandidatePair>,
    closed: bool,
}

impl PeerRelay {
    /// Create the relay and its first session. The local UDP socket is bound
    /// separately by [`bind_local_endpoint`](Self::bind_local_endpoint).
    pub fn new(
        identity: PeerIdentity,
        ice_servers: Vec<IceServer>,
        ctx: RelayContext,
        token: Token,
        now: Instant,
    ) -> Self {
        let next_watchdog = now + ctx.config.connect_timeout;
        let mut relay = Self {
            identity,
            ice_servers,
            ctx,
            token,
            session: None,
            generation: 0,
            offer_received: false,
            state: ConnectionState::New,
            data_channel_open: false,
            socket: None,
            local_port: None,
            created_at: now,
            last_attempt: now,
            next_watchdog,
            connect_latency: None,
            candidates: None,
            closed: false,
        };

        if relay.ice_servers.is_empty() {
            log::error!("{}: no ICE servers configured, peer is likely unreachable", relay);
        }
        log::debug!("{}: ICE servers: {:?}", relay, relay.ice_servers);

        relay.start_session(now);
        log::info!("{}: successfully created", relay);
        relay
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn remote_id(&self) -> PlayerId {
        self.identity.remote_id
    }

    pub fn remote_login(&self) -> &str {
        &self.identity.remote_login
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn is_data_channel_open(&self) -> bool {
        self.data_channel_open
    }

    pub fn connect_latency(&self) -> Option<Duration> {
        self.connect_latency
    }

    pub fn candidates(&self) -> Option<&CandidatePair> {
        self.candidates.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next watchdog firing, `None` once closed
    pub fn next_deadline(&self) -> Option<Instant> {
        (!self.closed).then_some(self.next_watchdog)
    }

    // ------------------------------------------------------------------------
    // Local endpoint
    // ------------------------------------------------------------------------

    /// Bind the local UDP socket on an ephemeral localhost port
    pub fn bind_local_endpoint(&mut self) -> io::Result<u16> {
        if let Some(port) = self.local_port {
            return Ok(port);
        }
        let socket = UdpSocket::bind(SocketAddr::new(self.ctx.config.game_host, 0))?;
        let port = socket.local_addr()?.port();
        log::info!("{}: listening on port {}", self, port);
        self.socket = Some(socket);
        self.local_port = Some(port);
        Ok(port)
    }

    /// Socket for event loop registration
    pub fn local_socket_mut(&mut self) -> Option<&mut UdpSocket> {
        self.socket.as_mut()
    }

    /// Forward every datagram waiting on the local socket to the data channel
    pub fn process_local_socket(&mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };

            let len = match socket.recv_from(&mut buf) {
                Ok((len, _from)) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::info!("{}: error in local socket: {}", self, e);
                    return;
                }
            };

            match self.session.as_mut() {
                Some(session) if self.data_channel_open => {
                    if let Err(e) = session.send(&buf[..len]) {
                        log::debug!("{}: data channel send failed: {}", self, e);
                    }
                }
                _ => log::trace!("{}: data channel closed, dropping {} bytes", self, len),
            }
        }
    }

    fn send_to_game(&self, data: &[u8]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let lobby = SocketAddr::new(self.ctx.config.game_host, self.ctx.config.lobby_port);
        if let Err(e) = socket.send_to(data, lobby) {
            log::error!("{}: error sending to local socket: {}", self, e);
        }
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    /// Apply a signaling payload received from the remote peer
    pub fn add_signaling_message(&mut self, msg: &serde_json::Value) {
        log::debug!("{}: received ICE msg: {}", self, msg);

        let kind = msg.get("type").and_then(serde_json::Value::as_str);
        if !matches!(kind, Some("offer" | "answer" | "candidate")) {
            log::error!("{}: unknown ICE message type: {}", self, msg);
            return;
        }

        let parsed = match serde_json::from_value::<SignalingMessage>(msg.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("{}: malformed ICE message {}: {}", self, msg, e);
                return;
            }
        };

        if matches!(parsed, SignalingMessage::Offer { .. }) {
            self.offer_received = true;
        }

        let Some(session) = self.session.as_mut() else {
            log::error!("{}: no session to apply {} to", self, parsed.kind());
            return;
        };

        let result = match &parsed {
            SignalingMessage::Offer { sdp } => session.apply_offer(sdp),
            SignalingMessage::Answer { sdp } => session.apply_answer(sdp),
            SignalingMessage::Candidate { candidate } => session.add_candidate(candidate),
        };

        if let Err(e) = result {
            log::error!("{}: failed to apply {}: {}", self, parsed.kind(), e);
        }
    }

    // ------------------------------------------------------------------------
    // Session events
    // ------------------------------------------------------------------------

    /// Apply one event from the session; returns what the owner must forward
    pub fn handle_session_event(&mut self, event: SessionEvent, now: Instant) -> Vec<RelayEvent> {
        if self.closed {
            return Vec::new();
        }
        if event.generation != self.generation {
            log::trace!(
                "{}: ignoring event from stale session {} (current {})",
                self,
                event.generation,
                self.generation
            );
            return Vec::new();
        }

        let mut out = Vec::new();

        match event.kind {
            SessionEventKind::LocalDescription(desc) => {
                log::info!("{}: sending {}", self, desc.kind());
                out.push(RelayEvent::Signaling(desc.to_json()));
            }
            SessionEventKind::LocalCandidate(candidate) => {
                log::debug!("{}: local candidate {}", self, candidate);
                let msg = SignalingMessage::Candidate { candidate };
                out.push(RelayEvent::Signaling(msg.to_json()));
            }
            SessionEventKind::StateChanged(state) => {
                self.on_state_changed(state, now, &mut out);
            }
            SessionEventKind::DataChannelOpen => {
                log::info!("{}: data channel open", self);
                self.data_channel_open = true;
                out.push(RelayEvent::DataChannelOpen);
            }
            SessionEventKind::DataChannelClosed => {
                log::info!("{}: data channel close", self);
                self.data_channel_open = false;
            }
            SessionEventKind::Data(data) => {
                self.send_to_game(&data);
            }
            SessionEventKind::Stats(Ok(pair)) => {
                log::info!(
                    "{}: active pair {} ({}) <-> {} ({})",
                    self,
                    pair.local_addr,
                    pair.local_type,
                    pair.remote_addr,
                    pair.remote_type
                );
                self.candidates = Some(pair);
            }
            SessionEventKind::Stats(Err(e)) => {
                log::error!("{}: failed to read transport statistics: {}", self, e);
            }
            SessionEventKind::Error(e) => {
                log::error!("{}: error: {}", self, e);
            }
        }

        out
    }

    fn on_state_changed(&mut self, state: ConnectionState, now: Instant, out: &mut Vec<RelayEvent>) {
        log::debug!("{}: iceConnectionState changed to {}", self, state);
        self.state = state;
        out.push(RelayEvent::StateChanged(state));

        if state.is_connected() {
            if self.connect_latency.is_none() {
                let latency = now.saturating_duration_since(self.created_at);
                log::info!(
                    "{}: connection established after {:.3}s",
                    self,
                    latency.as_secs_f64()
                );
                self.connect_latency = Some(latency);
            }
            if let Some(session) = self.session.as_mut() {
                session.request_stats();
            }
        } else if state == ConnectionState::Failed {
            log::warn!("{}: connection failed, reconnecting", self);
            self.reconnect(now);
            out.push(RelayEvent::StateChanged(self.state));
        }
    }

    // ------------------------------------------------------------------------
    // Watchdog and reconnect
    // ------------------------------------------------------------------------

    /// Run the watchdog if its period has elapsed
    pub fn on_watchdog(&mut self, now: Instant) -> Vec<RelayEvent> {
        if self.closed || now < self.next_watchdog {
            return Vec::new();
        }

        let timeout = self.ctx.config.connect_timeout;
        self.next_watchdog = now + timeout;

        let stuck = self.ctx.config.stuck_states.contains(&self.state);
        let elapsed = now.saturating_duration_since(self.last_attempt);
        let may_restart = self.identity.is_offerer || self.offer_received;

        if !(stuck && elapsed > timeout && may_restart) {
            return Vec::new();
        }

        log::warn!(
            "{}: stuck in {} for {:.1}s, reconnecting",
            self,
            self.state,
            elapsed.as_secs_f64()
        );
        let before = self.state;
        self.reconnect(now);

        if self.state != before {
            vec![RelayEvent::StateChanged(self.state)]
        } else {
            Vec::new()
        }
    }

    /// Tear down the current session and start a fresh one
    fn reconnect(&mut self, now: Instant) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.data_channel_open = false;
        self.state = ConnectionState::New;
        self.start_session(now);
    }

    fn start_session(&mut self, now: Instant) {
        self.generation += 1;
        self.last_attempt = now;

        let sink = self.ctx.events.sink(self.identity.remote_id, self.generation);
        let mut session = match self.ctx.factory.create(sink, &self.ice_servers) {
            Ok(session) => session,
            Err(e) => {
                log::error!("{}: {}", self, e);
                return;
            }
        };

        if self.identity.is_offerer {
            log::info!("{}: create offer", self);
            let result = session
                .create_data_channel()
                .and_then(|_| session.create_offer());
            if let Err(e) = result {
                log::error!("{}: failed to start offer: {}", self, e);
            }
        }

        self.session = Some(session);
    }

    /// Release the socket and the session. Terminal and idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.socket = None;
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.data_channel_open = false;
        self.state = ConnectionState::Disconnected;
        log::info!("{}: closed", self);
    }
}

impl fmt::Display for PeerRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Relay for {}({})",
            self.identity.remote_login, self.identity.remote_id
        )
    }
}

impl Drop for PeerRelay {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockSessionFactory;
    use super::session::{event_channel, SessionEvent};
    use super::*;
    use serde_json::json;
    use std::sync::mpsc::Receiver;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Harness {
        factory: Rc<MockSessionFactory>,
        rx: Receiver<SessionEvent>,
        relay: PeerRelay,
        start: Instant,
    }

    impl Harness {
        fn new(is_offerer: bool) -> Self {
            let factory = Rc::new(MockSessionFactory::new());
            let (events, rx) = event_channel(None);
            let ctx = RelayContext {
                config: RelayConfig {
                    game_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    lobby_port: 0,
                    connect_timeout: TIMEOUT,
                    stuck_states: vec![ConnectionState::New, ConnectionState::Failed],
                },
                factory: factory.clone(),
                events,
            };
            let start = Instant::now();
            let identity = PeerIdentity {
                remote_id: 42,
                remote_login: "peer".to_string(),
                is_offerer,
            };
            let servers = vec![IceServer {
                urls: vec!["stun:stun.example.org".into()],
                username: None,
                credential: None,
            }];
            let relay = PeerRelay::new(identity, servers, ctx, Token(100), start);
            Self { factory, rx, relay, start }
        }

        /// Emit on the newest session and deliver everything queued
        fn emit(&mut self, kind: SessionEventKind, at: Instant) -> Vec<RelayEvent> {
            self.factory.latest_sink().unwrap().emit(kind);
            self.deliver(at)
        }

        fn deliver(&mut self, at: Instant) -> Vec<RelayEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                out.extend(self.relay.handle_session_event(event, at));
            }
            out
        }
    }

    #[test]
    fn test_offerer_creates_channel_and_offer() {
        let mut h = Harness::new(true);

        assert_eq!(h.factory.session_count(), 1);
        let calls = h.factory.calls(0);
        assert_eq!(calls.data_channels, 1);
        assert_eq!(calls.offers, 1);
        drop(calls);

        let out = h.deliver(h.start);
        assert_eq!(
            out,
            vec![RelayEvent::Signaling(json!({"type": "offer", "sdp": "mock-offer-1"}))]
        );
    }

    #[test]
    fn test_answerer_waits_for_offer() {
        let mut h = Harness::new(false);
        assert_eq!(h.factory.calls(0).offers, 0);
        assert!(h.deliver(h.start).is_empty());

        h.relay
            .add_signaling_message(&json!({"type": "offer", "sdp": "remote-offer"}));
        assert_eq!(h.factory.calls(0).remote_offers, vec!["remote-offer".to_string()]);

        let out = h.deliver(h.start);
        assert_eq!(
            out,
            vec![RelayEvent::Signaling(json!({"type": "answer", "sdp": "mock-answer-1"}))]
        );
    }

    #[test]
    fn test_answer_and_candidate_are_fed_to_session() {
        let mut h = Harness::new(true);
        h.relay
            .add_signaling_message(&json!({"type": "answer", "sdp": "remote-answer"}));
        h.relay
            .add_signaling_message(&json!({"type": "candidate", "candidate": {"candidate": "c1"}}));

        let calls = h.factory.calls(0);
        assert_eq!(calls.remote_answers, vec!["remote-answer".to_string()]);
        assert_eq!(calls.candidates, vec![json!({"candidate": "c1"})]);
    }

    #[test]
    fn test_unknown_signaling_type_changes_nothing() {
        let mut h = Harness::new(false);
        h.relay.add_signaling_message(&json!({"type": "bye"}));
        h.relay.add_signaling_message(&json!({"sdp": "no type"}));

        let calls = h.factory.calls(0);
        assert!(calls.remote_offers.is_empty());
        assert!(calls.remote_answers.is_empty());
        assert!(calls.candidates.is_empty());
        drop(calls);
        assert_eq!(h.relay.state(), ConnectionState::New);

        // Without a received offer the answerer watchdog never restarts
        let out = h.relay.on_watchdog(h.start + TIMEOUT * 3);
        assert!(out.is_empty());
        assert_eq!(h.factory.session_count(), 1);
    }

    #[test]
    fn test_local_candidate_forwarded() {
        let mut h = Harness::new(false);
        let out = h.emit(SessionEventKind::LocalCandidate(json!({"candidate": "c2"})), h.start);
        assert_eq!(
            out,
            vec![RelayEvent::Signaling(json!({"type": "candidate", "candidate": {"candidate": "c2"}}))]
        );
    }

    #[test]
    fn test_connected_records_latency_and_stats() {
        let mut h = Harness::new(true);
        h.deliver(h.start);

        let at = h.start + Duration::from_millis(1500);
        let out = h.emit(SessionEventKind::StateChanged(ConnectionState::Connected), at);

        assert_eq!(out, vec![RelayEvent::StateChanged(ConnectionState::Connected)]);
        assert_eq!(h.relay.connect_latency(), Some(Duration::from_millis(1500)));
        assert_eq!(h.factory.calls(0).stats_requests, 1);

        let pair = CandidatePair {
            local_addr: "10.0.0.1:5000".into(),
            local_type: "host".into(),
            remote_addr: "203.0.113.9:6000".into(),
            remote_type: "srflx".into(),
        };
        h.emit(SessionEventKind::Stats(Ok(pair.clone())), at);
        assert_eq!(h.relay.candidates(), Some(&pair));

        // Stats failures are logged only
        h.emit(SessionEventKind::Stats(Err("no stats".into())), at);
        assert_eq!(h.relay.candidates(), Some(&pair));

        // Latency is captured once
        h.emit(
            SessionEventKind::StateChanged(ConnectionState::Completed),
            at + Duration::from_secs(5),
        );
        assert_eq!(h.relay.connect_latency(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_failed_recreates_session_keeping_identity() {
        let mut h = Harness::new(true);
        h.deliver(h.start);
        let identity = h.relay.identity().clone();

        let at = h.start + Duration::from_secs(2);
        let out = h.emit(SessionEventKind::StateChanged(ConnectionState::Failed), at);

        // The fresh session's offer is queued behind the failure and goes out
        assert_eq!(
            out,
            vec![
                RelayEvent::StateChanged(ConnectionState::Failed),
                RelayEvent::StateChanged(ConnectionState::New),
                RelayEvent::Signaling(json!({"type": "offer", "sdp": "mock-offer-2"})),
            ]
        );
        assert_eq!(h.factory.session_count(), 2);
        assert!(h.factory.calls(0).closed);
        assert_eq!(h.factory.calls(1).offers, 1);
        assert_eq!(h.relay.generation(), 2);
        assert_eq!(h.relay.identity(), &identity);
        assert_eq!(h.factory.ice_servers(1), h.relay.ice_servers().to_vec());
    }

    #[test]
    fn test_stale_session_events_ignored() {
        let mut h = Harness::new(true);
        h.deliver(h.start);
        let old_sink = h.factory.latest_sink().unwrap();

        h.emit(SessionEventKind::StateChanged(ConnectionState::Failed), h.start);
        h.deliver(h.start);

        old_sink.emit(SessionEventKind::DataChannelOpen);
        old_sink.emit(SessionEventKind::StateChanged(ConnectionState::Connected));
        assert!(h.deliver(h.start).is_empty());
        assert!(!h.relay.is_data_channel_open());
        assert_eq!(h.relay.state(), ConnectionState::New);
    }

    #[test]
    fn test_watchdog_restarts_stuck_offerer() {
        let mut h = Harness::new(true);
        h.deliver(h.start);

        // Not yet due
        assert!(h.relay.on_watchdog(h.start + TIMEOUT / 2).is_empty());
        assert_eq!(h.factory.session_count(), 1);

        // Due and stuck in `new` for longer than the timeout
        h.relay.on_watchdog(h.start + TIMEOUT + Duration::from_millis(1));
        assert_eq!(h.factory.session_count(), 2);
        assert!(h.factory.calls(0).closed);
    }

    #[test]
    fn test_watchdog_ignores_checking_by_default() {
        let mut h = Harness::new(true);
        h.emit(SessionEventKind::StateChanged(ConnectionState::Checking), h.start);

        h.relay.on_watchdog(h.start + TIMEOUT * 2);
        assert_eq!(h.factory.session_count(), 1);
    }

    #[test]
    fn test_watchdog_answerer_after_offer() {
        let mut h = Harness::new(false);
        h.relay
            .add_signaling_message(&json!({"type": "offer", "sdp": "remote-offer"}));
        h.deliver(h.start);

        h.relay.on_watchdog(h.start + TIMEOUT + Duration::from_millis(1));
        assert_eq!(h.factory.session_count(), 2);
        // Answerer does not create an offer of its own
        assert_eq!(h.factory.calls(1).offers, 0);
        assert_eq!(h.factory.calls(1).data_channels, 0);
    }

    #[test]
    fn test_reconnect_converges() {
        let mut h = Harness::new(true);
        let mut now = h.start;
        h.deliver(now);

        // Explicit failures
        for _ in 0..3 {
            now += Duration::from_secs(1);
            h.emit(SessionEventKind::StateChanged(ConnectionState::Checking), now);
            h.emit(SessionEventKind::StateChanged(ConnectionState::Failed), now);
        }
        assert_eq!(h.factory.session_count(), 4);

        // Silent wedges caught by the watchdog
        for _ in 0..2 {
            now += TIMEOUT + Duration::from_millis(1);
            h.relay.on_watchdog(now);
        }
        assert_eq!(h.factory.session_count(), 6);

        // The backend finally succeeds
        now += Duration::from_secs(1);
        h.emit(SessionEventKind::StateChanged(ConnectionState::Connected), now);
        h.emit(SessionEventKind::DataChannelOpen, now);
        assert_eq!(h.relay.state(), ConnectionState::Connected);
        assert!(h.relay.is_data_channel_open());

        for _ in 0..5 {
            now += TIMEOUT + Duration::from_millis(1);
            h.relay.on_watchdog(now);
        }
        assert_eq!(h.relay.state(), ConnectionState::Connected);
        assert_eq!(h.factory.session_count(), 6);
    }

    #[test]
    fn test_create_failure_is_retried_by_watchdog() {
        let mut h = Harness::new(true);
        h.factory.set_fail_create(true);
        h.emit(SessionEventKind::StateChanged(ConnectionState::Failed), h.start);
        assert_eq!(h.factory.session_count(), 1);
        assert_eq!(h.relay.state(), ConnectionState::New);

        h.factory.set_fail_create(false);
        h.relay.on_watchdog(h.start + TIMEOUT + Duration::from_millis(1));
        assert_eq!(h.factory.session_count(), 2);
    }

    #[test]
    fn test_bridges_udp_and_data_channel() {
        let game = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        game.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut h = Harness::new(true);
        h.relay.ctx.config.lobby_port = game.local_addr().unwrap().port();
        let port = h.relay.bind_local_endpoint().unwrap();
        assert_eq!(h.relay.local_port(), Some(port));
        assert_eq!(h.relay.bind_local_endpoint().unwrap(), port);

        // Dropped while the channel is closed
        game.send_to(b"early", ("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        h.relay.process_local_socket();
        assert!(h.factory.calls(0).sent.is_empty());

        h.emit(SessionEventKind::DataChannelOpen, h.start);

        game.send_to(b"game->peer", ("127.0.0.1", port)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.factory.calls(0).sent.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            h.relay.process_local_socket();
        }
        assert_eq!(h.factory.calls(0).sent, vec![b"game->peer".to_vec()]);

        h.emit(SessionEventKind::Data(b"peer->game".to_vec()), h.start);
        let mut buf = [0u8; 64];
        let (len, from) = game.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"peer->game");
        assert_eq!(from.port(), port);

        h.emit(SessionEventKind::DataChannelClosed, h.start);
        assert!(!h.relay.is_data_channel_open());
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let mut h = Harness::new(true);
        h.relay.bind_local_endpoint().unwrap();

        h.relay.close();
        h.relay.close();

        assert!(h.relay.is_closed());
        assert_eq!(h.relay.state(), ConnectionState::Disconnected);
        assert!(h.relay.local_socket_mut().is_none());
        assert!(h.factory.calls(0).closed);
        assert_eq!(h.relay.next_deadline(), None);

        assert!(h.relay.on_watchdog(h.start + TIMEOUT * 10).is_empty());
        assert!(h
            .emit(SessionEventKind::StateChanged(ConnectionState::Failed), h.start)
            .is_empty());
        assert_eq!(h.factory.session_count(), 1);
    }
}
