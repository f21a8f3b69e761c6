//! Integration tests for the adapter
//!
//! Drives a GPGNet server and an `IceAdapter` on a mio loop the same way the
//! binary does, with the game played by a plain TCP/UDP client on loopback
//! and the negotiation backend replaced by the recording mock.

use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll};
use serde_json::json;

use ice_adapter::gpgnet::{decode_messages, GpgNetEvent, GpgNetMessage, GpgNetServer};
use ice_adapter::relay::mock::MockSessionFactory;
use ice_adapter::relay::session::{ConnectionState, SessionEventKind};
use ice_adapter::rpc::{Command, Notification};
use ice_adapter::{
    IceAdapter, Options, GPGNET_CLIENT_TOKEN, GPGNET_LISTENER_TOKEN, RELAY_TOKEN_START,
};

/// Adapter plus GPGNet server on one poll, stepped by hand
struct Harness {
    poll: Poll,
    events: Events,
    gpgnet: GpgNetServer,
    adapter: IceAdapter,
    factory: Rc<MockSessionFactory>,
    notifications: Vec<Notification>,
}

impl Harness {
    fn new(lobby_port: u16) -> Self {
        let poll = Poll::new().unwrap();
        let mut gpgnet = GpgNetServer::bind(0).unwrap();
        gpgnet
            .register(poll.registry(), GPGNET_LISTENER_TOKEN, GPGNET_CLIENT_TOKEN)
            .unwrap();

        let mut options = Options::new(1000, "local");
        options.lobby_port = lobby_port;
        options.gpgnet_port = gpgnet.local_port();
        options.connect_timeout = Duration::from_millis(200);

        let factory = Rc::new(MockSessionFactory::new());
        let mut adapter = IceAdapter::new(options, factory.clone(), None, RELAY_TOKEN_START);
        adapter.set_ice_servers(Vec::new());

        Self {
            poll,
            events: Events::with_capacity(64),
            gpgnet,
            adapter,
            factory,
            notifications: Vec::new(),
        }
    }

    fn connect_game(&mut self) -> TcpStream {
        let game = TcpStream::connect(self.gpgnet.local_addr().unwrap()).unwrap();
        game.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        self.step_until(|h| h.adapter.is_game_connected());
        game
    }

    /// One loop iteration
    fn step(&mut self) {
        self.poll
            .poll(&mut self.events, Some(Duration::from_millis(20)))
            .unwrap();

        let mut gpg_events = Vec::new();
        let mut relay_tokens = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                GPGNET_LISTENER_TOKEN => {
                    gpg_events.extend(self.gpgnet.accept(self.poll.registry()))
                }
                GPGNET_CLIENT_TOKEN => gpg_events.extend(self.gpgnet.ready(
                    self.poll.registry(),
                    event.is_readable(),
                    event.is_writable(),
                )),
                token => relay_tokens.push(token),
            }
        }

        for event in gpg_events {
            match event {
                GpgNetEvent::Connected => self.adapter.on_game_connected(),
                GpgNetEvent::Disconnected => self.adapter.on_game_disconnected(),
                GpgNetEvent::Message(msg) => self.adapter.on_game_message(msg),
            }
        }
        for token in relay_tokens {
            self.adapter.process_relay_socket(token);
        }

        let now = Instant::now();
        self.adapter.process_session_events(now);
        self.adapter.tick(now);
        self.register_new_relays();

        for msg in self.adapter.take_game_messages() {
            self.gpgnet.send(&msg);
        }
        self.notifications.extend(self.adapter.take_notifications());
    }

    fn step_until<F: FnMut(&mut Harness) -> bool>(&mut self, mut done: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(self) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            self.step();
        }
    }

    fn register_new_relays(&mut self) {
        for remote_id in self.adapter.bind_pending_endpoints() {
            let relay = self.adapter.relay_mut(remote_id).unwrap();
            let token = relay.token();
            let socket = relay.local_socket_mut().unwrap();
            self.poll
                .registry()
                .register(socket, token, Interest::READABLE)
                .unwrap();
        }
    }

    fn dispatch(&mut self, command: Command) -> serde_json::Value {
        let result = self.adapter.dispatch(command, Instant::now());
        self.step();
        result
    }
}

/// Send a message from the game side
fn game_send(game: &mut TcpStream, msg: &GpgNetMessage) {
    game.write_all(&msg.encode()).unwrap();
}

/// Read exactly `count` messages on the game side
fn game_recv(h: &mut Harness, game: &mut TcpStream, count: usize) -> Vec<GpgNetMessage> {
    let mut received = Vec::new();
    let mut buffer: Vec<u8> = Vec::new();
    game.set_nonblocking(true).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < count {
        assert!(Instant::now() < deadline, "game received {:?}", received);
        h.step();

        let mut chunk = [0u8; 4096];
        match game.read(&mut chunk) {
            Ok(0) => panic!("adapter closed the game connection"),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("game read failed: {}", e),
        }

        let rest = decode_messages(&buffer, |m| received.push(m)).unwrap().to_vec();
        buffer = rest;
    }

    game.set_nonblocking(false).unwrap();
    received
}

/// Nothing more arrives on the game side within a few loop iterations
fn assert_game_silent(h: &mut Harness, game: &mut TcpStream) {
    game.set_nonblocking(true).unwrap();
    for _ in 0..5 {
        h.step();
    }
    let mut chunk = [0u8; 64];
    let result = game.read(&mut chunk);
    game.set_nonblocking(false).unwrap();
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        other => panic!("unexpected game traffic: {:?}", other),
    }
}

fn game_state(state: &str) -> GpgNetMessage {
    GpgNetMessage::new("GameState", vec![state.into()])
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_idle_triggers_create_lobby() {
    let mut h = Harness::new(7238);
    let mut game = h.connect_game();

    game_send(&mut game, &game_state("Idle"));
    let received = game_recv(&mut h, &mut game, 1);

    assert_eq!(
        received,
        vec![GpgNetMessage::new(
            "CreateLobby",
            vec![0.into(), 7238.into(), "local".into(), 1000.into(), 1.into()]
        )]
    );
    assert_game_silent(&mut h, &mut game);

    assert!(h.notifications.contains(&Notification::ConnectionStateChanged(
        "Connected".into()
    )));
    assert!(h.notifications.contains(&Notification::GpgNetMessageReceived {
        header: "GameState".into(),
        chunks: vec!["Idle".into()],
    }));
}

#[test]
fn test_join_game_waits_for_port_and_lobby() {
    let mut h = Harness::new(7238);
    let mut game = h.connect_game();

    // Queue the task before the relay has a socket
    h.adapter.join_game("Rhiza".into(), 5432, Instant::now());
    assert!(h.adapter.take_game_messages().is_empty());
    assert_eq!(h.adapter.relays().get(5432).unwrap().local_port(), None);

    // Socket binds on the next iteration, but the game is not in the lobby
    h.step();
    let port = h.adapter.relays().get(5432).unwrap().local_port().unwrap();
    assert_game_silent(&mut h, &mut game);

    game_send(&mut game, &game_state("Lobby"));
    let received = game_recv(&mut h, &mut game, 1);
    assert_eq!(
        received,
        vec![GpgNetMessage::new(
            "JoinGame",
            vec![format!("127.0.0.1:{}", port).into(), "Rhiza".into(), 5432.into()]
        )]
    );
    assert_game_silent(&mut h, &mut game);
}

#[test]
fn test_tasks_execute_in_order() {
    let mut h = Harness::new(7238);
    let mut game = h.connect_game();

    h.dispatch(Command::HostGame { map: "map12345.map".into() });
    h.dispatch(Command::DisconnectFromPeer { remote_id: 3 });
    assert_game_silent(&mut h, &mut game);

    game_send(&mut game, &game_state("Lobby"));
    let received = game_recv(&mut h, &mut game, 2);
    assert_eq!(
        received,
        vec![
            GpgNetMessage::new("HostGame", vec!["map12345.map".into()]),
            GpgNetMessage::new("DisconnectFromPeer", vec![3.into()]),
        ]
    );
}

#[test]
fn test_send_to_gpgnet_passthrough() {
    let mut h = Harness::new(7238);
    let mut game = h.connect_game();

    h.dispatch(Command::SendToGpgNet {
        header: "Chat".into(),
        chunks: vec!["hello".into(), 42.into()],
    });
    let received = game_recv(&mut h, &mut game, 1);
    assert_eq!(
        received,
        vec![GpgNetMessage::new("Chat", vec!["hello".into(), 42.into()])]
    );
}

#[test]
fn test_game_disconnect_resets_state() {
    let mut h = Harness::new(7238);
    let mut game = h.connect_game();
    game_send(&mut game, &game_state("Lobby"));
    h.step_until(|h| h.adapter.game_state() == "Lobby");

    drop(game);
    h.step_until(|h| !h.adapter.is_game_connected());
    assert_eq!(h.adapter.game_state(), "None");
    assert!(h.notifications.contains(&Notification::ConnectionStateChanged(
        "Disconnected".into()
    )));
}

#[test]
fn test_relay_bridges_game_traffic() {
    let lobby = UdpSocket::bind("127.0.0.1:0").unwrap();
    lobby.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut h = Harness::new(lobby.local_addr().unwrap().port());

    h.dispatch(Command::ConnectToPeer {
        remote_login: "peer".into(),
        remote_id: 7,
        offer: true,
    });
    let port = h.adapter.relays().get(7).unwrap().local_port().unwrap();

    // Offer is forwarded to the control plane
    assert!(h.notifications.contains(&Notification::IceMsg {
        local_id: 1000,
        remote_id: 7,
        msg: json!({"type": "offer", "sdp": "mock-offer-1"}),
    }));

    let sink = h.factory.latest_sink().unwrap();
    sink.emit(SessionEventKind::StateChanged(ConnectionState::Connected));
    sink.emit(SessionEventKind::DataChannelOpen);
    h.step_until(|h| h.adapter.relays().get(7).unwrap().is_data_channel_open());

    // game -> data channel
    lobby.send_to(b"to-peer", ("127.0.0.1", port)).unwrap();
    h.step_until(|h| !h.factory.calls(0).sent.is_empty());
    assert_eq!(h.factory.calls(0).sent, vec![b"to-peer".to_vec()]);

    // data channel -> game lobby port
    sink.emit(SessionEventKind::Data(b"from-peer".to_vec()));
    h.step();
    let mut buf = [0u8; 64];
    let (len, from) = lobby.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"from-peer");
    assert_eq!(from.port(), port);

    let status = h.dispatch(Command::Status);
    assert_eq!(status["relays"][0]["ice_agent"]["state"], json!("connected"));
    assert_eq!(status["relays"][0]["ice_agent"]["datachannel_open"], json!(true));
    assert!(status["relays"][0]["ice_agent"]["time_to_connected"].as_f64().unwrap() >= 0.0);
}

#[test]
fn test_stuck_relay_reconnects_until_connected() {
    let mut h = Harness::new(7238);
    h.dispatch(Command::ConnectToPeer {
        remote_login: "peer".into(),
        remote_id: 7,
        offer: true,
    });

    // Backend never reports progress: the watchdog keeps recreating sessions
    h.step_until(|h| h.factory.session_count() >= 3);
    let remote_id = h.adapter.relays().get(7).unwrap().remote_id();
    assert_eq!(remote_id, 7);

    // The newest session succeeds and the relay stays connected
    let sink = h.factory.latest_sink().unwrap();
    sink.emit(SessionEventKind::StateChanged(ConnectionState::Connected));
    h.step_until(|h| h.adapter.relays().get(7).unwrap().state() == ConnectionState::Connected);
    let sessions = h.factory.session_count();

    let until = Instant::now() + Duration::from_millis(600);
    while Instant::now() < until {
        h.step();
    }
    assert_eq!(h.adapter.relays().get(7).unwrap().state(), ConnectionState::Connected);
    assert_eq!(h.factory.session_count(), sessions);
}

#[test]
fn test_disconnect_from_peer_closes_relay() {
    let mut h = Harness::new(7238);
    h.dispatch(Command::ConnectToPeer {
        remote_login: "peer".into(),
        remote_id: 7,
        offer: false,
    });
    assert!(h.adapter.relays().contains(7));

    h.dispatch(Command::DisconnectFromPeer { remote_id: 7 });
    assert!(!h.adapter.relays().contains(7));
    assert!(h.factory.calls(0).closed);

    // Signaling for the removed relay is ignored
    h.dispatch(Command::IceMsg {
        remote_id: 7,
        msg: json!({"type": "offer", "sdp": "late"}),
    });
    assert!(h.factory.calls(0).remote_offers.is_empty());
}
