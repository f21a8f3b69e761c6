//! Adapter orchestration
//!
//! [`IceAdapter`] owns the game state reported over GPGNet, the queue of
//! game tasks and every peer relay. It does no socket I/O of its own: the
//! event loop feeds it GPGNet events, control-plane commands, session events
//! and timer ticks, and collects the GPGNet messages and notifications it
//! produced through [`take_game_messages`](IceAdapter::take_game_messages)
//! and [`take_notifications`](IceAdapter::take_notifications).
//!
//! # Task Queue
//!
//! Tasks are executed strictly in order. The head task runs only once the
//! game can accept it; until then every task behind it waits too.
//!
//! | Task                | Runs when                                         |
//! |---------------------|---------------------------------------------------|
//! | `HostGame`          | game state is `Lobby`                             |
//! | `JoinGame`          | game state is `Lobby` and the relay port is bound |
//! | `ConnectToPeer`     | same as `JoinGame`                                |
//! | `DisconnectFromPeer`| always                                            |
//!
//! Nothing runs while the game is not connected.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;

use mio::Token;
use serde_json::Value;

use crate::gpgnet::{Chunk, GpgNetMessage};
use crate::options::Options;
use crate::relay::session::{
    event_channel, IceServer, SessionEvent, SessionFactory, Wake,
};
use crate::relay::{PeerIdentity, PeerRelay, RelayContext, RelayEvent, RelayRegistry};
use crate::rpc::{Command, Notification};
use crate::status::{GpgNetStatus, OptionsStatus, RelayStatus, Status};
use crate::task::Task;
use crate::PlayerId;

/// Game state before the game reports one
pub const GAME_STATE_NONE: &str = "None";
const GAME_STATE_IDLE: &str = "Idle";
const GAME_STATE_LOBBY: &str = "Lobby";

/// First field of `CreateLobby`
const CREATE_LOBBY_VERSION: i32 = 0;
/// Last field of `CreateLobby`, opaque to the adapter
const CREATE_LOBBY_FLAG: i32 = 1;

pub struct IceAdapter {
    options: Options,

    game_connected: bool,
    game_state: String,
    task_string: String,
    gpgnet_local_port: u16,
    tasks: VecDeque<Task>,

    relays: RelayRegistry,
    ice_servers: Option<Vec<IceServer>>,
    relay_ctx: RelayContext,
    session_events: Receiver<SessionEvent>,
    /// Relays still waiting for a local UDP socket
    unbound: Vec<PlayerId>,

    game_outbox: Vec<GpgNetMessage>,
    notifications: Vec<Notification>,
    quit_requested: bool,
}

impl IceAdapter {
    /// `waker` is signalled whenever a session queues an event from another
    /// thread. Relay sockets get tokens from `first_relay_token` upward.
    pub fn new(
        options: Options,
        factory: Rc<dyn SessionFactory>,
        waker: Option<Arc<dyn Wake>>,
        first_relay_token: Token,
    ) -> Self {
        let (events, session_events) = event_channel(waker);
        let relay_ctx = RelayContext {
            config: options.relay_config(),
            factory,
            events,
        };
        let gpgnet_local_port = options.gpgnet_port;

        Self {
            options,
            game_connected: false,
            game_state: GAME_STATE_NONE.to_string(),
            task_string: "Idle".to_string(),
            gpgnet_local_port,
            tasks: VecDeque::new(),
            relays: RelayRegistry::new(first_relay_token),
            ice_servers: None,
            relay_ctx,
            session_events,
            unbound: Vec::new(),
            game_outbox: Vec::new(),
            notifications: Vec::new(),
            quit_requested: false,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn game_state(&self) -> &str {
        &self.game_state
    }

    pub fn is_game_connected(&self) -> bool {
        self.game_connected
    }

    pub fn task_string(&self) -> &str {
        &self.task_string
    }

    pub fn queued_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn relays(&self) -> &RelayRegistry {
        &self.relays
    }

    pub fn relay_mut(&mut self, remote_id: PlayerId) -> Option<&mut PeerRelay> {
        self.relays.get_mut(remote_id)
    }

    pub fn is_quit_requested(&self) -> bool {
        self.quit_requested
    }

    /// Port the GPGNet server actually bound, for `status`
    pub fn set_gpgnet_local_port(&mut self, port: u16) {
        self.gpgnet_local_port = port;
    }

    /// Messages for the game produced since the last call
    pub fn take_game_messages(&mut self) -> Vec<GpgNetMessage> {
        std::mem::take(&mut self.game_outbox)
    }

    /// Control-plane notifications produced since the last call
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    // ------------------------------------------------------------------------
    // GPGNet side
    // ------------------------------------------------------------------------

    pub fn on_game_connected(&mut self) {
        log::info!("Game connected");
        self.game_connected = true;
        self.notify(Notification::ConnectionStateChanged("Connected".into()));
        self.try_execute_tasks();
    }

    /// The game process is gone: its queued tasks and unsent messages go
    /// with it. Relays stay until the control plane removes them.
    pub fn on_game_disconnected(&mut self) {
        log::info!("Game disconnected, dropping {} queued task(s)", self.tasks.len());
        self.game_connected = false;
        self.game_state = GAME_STATE_NONE.to_string();
        self.task_string = "Idle".to_string();
        self.tasks.clear();
        self.game_outbox.clear();
        self.notify(Notification::ConnectionStateChanged("Disconnected".into()));
    }

    pub fn on_game_message(&mut self, msg: GpgNetMessage) {
        if msg.header == "GameState" {
            self.game_state = match msg.chunks.first() {
                Some(Chunk::Str(s)) => s.clone(),
                Some(Chunk::Int(v)) => v.to_string(),
                None => {
                    log::error!("GameState message without payload");
                    String::new()
                }
            };
            log::info!("Game state changed to {}", self.game_state);

            if self.game_state == GAME_STATE_IDLE {
                let lobby = GpgNetMessage::new(
                    "CreateLobby",
                    vec![
                        Chunk::Int(CREATE_LOBBY_VERSION),
                        Chunk::Int(i32::from(self.options.lobby_port)),
                        Chunk::from(self.options.login.as_str()),
                        Chunk::Int(self.options.id),
                        Chunk::Int(CREATE_LOBBY_FLAG),
                    ],
                );
                self.send_to_game(lobby);
            }

            self.try_execute_tasks();
        }

        self.notify(Notification::GpgNetMessageReceived {
            header: msg.header,
            chunks: msg.chunks,
        });
    }

    fn send_to_game(&mut self, msg: GpgNetMessage) {
        self.game_outbox.push(msg);
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    // ------------------------------------------------------------------------
    // Task queue
    // ------------------------------------------------------------------------

    fn queue_task(&mut self, task: Task) {
        log::debug!("Queueing task {}", task);
        self.tasks.push_back(task);
        self.try_execute_tasks();
    }

    /// Run queued tasks from the head until one is not yet admissible
    fn try_execute_tasks(&mut self) {
        if !self.game_connected {
            return;
        }

        while let Some(task) = self.tasks.front() {
            let Some(msg) = self.admit(task) else {
                return;
            };
            log::info!("Executing task {}", task);
            self.tasks.pop_front();
            self.send_to_game(msg);
        }
    }

    /// Message for `task` if it can run now
    fn admit(&self, task: &Task) -> Option<GpgNetMessage> {
        let in_lobby = self.game_state == GAME_STATE_LOBBY;

        match task {
            Task::HostGame { map } => {
                in_lobby.then(|| GpgNetMessage::new("HostGame", vec![Chunk::from(map.as_str())]))
            }
            Task::JoinGame {
                remote_login,
                remote_id,
            }
            | Task::ConnectToPeer {
                remote_login,
                remote_id,
            } => {
                if !in_lobby {
                    return None;
                }
                let Some(relay) = self.relays.get(*remote_id) else {
                    log::error!("{}: no relay for player {}", task, remote_id);
                    return None;
                };
                let Some(port) = relay.local_port() else {
                    log::debug!("{}: local UDP socket not bound yet", task);
                    return None;
                };
                Some(task.peer_message(remote_login, *remote_id, port))
            }
            Task::DisconnectFromPeer { remote_id } => Some(GpgNetMessage::new(
                "DisconnectFromPeer",
                vec![Chunk::Int(*remote_id)],
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Control-plane commands
    // ------------------------------------------------------------------------

    /// Execute a command; the value is the RPC result
    pub fn dispatch(&mut self, command: Command, now: Instant) -> Value {
        match command {
            Command::Quit => {
                log::info!("Quit requested");
                self.quit_requested = true;
            }
            Command::HostGame { map } => self.host_game(map),
            Command::JoinGame {
                remote_login,
                remote_id,
            } => self.join_game(remote_login, remote_id, now),
            Command::ConnectToPeer {
                remote_login,
                remote_id,
                offer,
            } => self.connect_to_peer(remote_login, remote_id, offer, now),
            Command::DisconnectFromPeer { remote_id } => self.disconnect_from_peer(remote_id),
            Command::IceMsg { remote_id, msg } => self.ice_msg(remote_id, &msg),
            Command::SendToGpgNet { header, chunks } => self.send_to_gpgnet(header, chunks),
            Command::SetIceServers(servers) => self.set_ice_servers(servers),
            Command::Status => {
                return serde_json::to_value(self.status()).unwrap_or(Value::Null);
            }
        }
        Value::Null
    }

    pub fn host_game(&mut self, map: String) {
        self.task_string = format!("Hosting map {}.", map);
        self.queue_task(Task::HostGame { map });
    }

    pub fn join_game(&mut self, remote_login: String, remote_id: PlayerId, now: Instant) {
        self.task_string = format!("Joining game from player {}.", remote_login);
        self.create_relay(remote_id, remote_login.clone(), false, now);
        self.queue_task(Task::JoinGame {
            remote_login,
            remote_id,
        });
    }

    pub fn connect_to_peer(
        &mut self,
        remote_login: String,
        remote_id: PlayerId,
        offer: bool,
        now: Instant,
    ) {
        self.create_relay(remote_id, remote_login.clone(), offer, now);
        self.queue_task(Task::ConnectToPeer {
            remote_login,
            remote_id,
        });
    }

    pub fn disconnect_from_peer(&mut self, remote_id: PlayerId) {
        self.queue_task(Task::DisconnectFromPeer { remote_id });
        if self.relays.remove(remote_id).is_none() {
            log::debug!("disconnectFromPeer: no relay for player {}", remote_id);
        }
        self.unbound.retain(|id| *id != remote_id);
    }

    pub fn ice_msg(&mut self, remote_id: PlayerId, msg: &Value) {
        match self.relays.get_mut(remote_id) {
            Some(relay) => relay.add_signaling_message(msg),
            None => log::error!("iceMsg: no relay for player {}", remote_id),
        }
    }

    /// Send an arbitrary message to the game, bypassing the task queue
    pub fn send_to_gpgnet(&mut self, header: String, chunks: Vec<Chunk>) {
        self.send_to_game(GpgNetMessage::new(header, chunks));
    }

    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        log::info!("ICE servers set: {} entries", servers.len());
        self.ice_servers = Some(servers);
    }

    pub fn status(&self) -> Status {
        Status {
            version: env!("CARGO_PKG_VERSION").to_string(),
            options: OptionsStatus {
                player_id: self.options.id,
                player_login: self.options.login.clone(),
                rpc_port: self.options.rpc_port,
                gpgnet_port: self.options.gpgnet_port,
                lobby_port: self.options.lobby_port,
                log_file: self
                    .options
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            },
            gpgnet: GpgNetStatus {
                local_port: self.gpgnet_local_port,
                connected: self.game_connected,
                game_state: self.game_state.clone(),
                task_string: self.task_string.clone(),
            },
            relays: self.relays.iter().map(RelayStatus::from).collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Relays
    // ------------------------------------------------------------------------

    fn create_relay(
        &mut self,
        remote_id: PlayerId,
        remote_login: String,
        is_offerer: bool,
        now: Instant,
    ) {
        let ice_servers = match &self.ice_servers {
            Some(servers) => servers.clone(),
            None => {
                log::error!("setIceServers was never called, relay for {} will likely fail", remote_id);
                Vec::new()
            }
        };

        let identity = PeerIdentity {
            remote_id,
            remote_login,
            is_offerer,
        };
        let token = self.relays.allocate_token();
        let relay = PeerRelay::new(identity, ice_servers, self.relay_ctx.clone(), token, now);
        self.relays.insert(relay);

        if !self.unbound.contains(&remote_id) {
            self.unbound.push(remote_id);
        }
    }

    /// Bind local UDP sockets of newly created relays. Returns the ids of the
    /// relays whose socket must be registered with the event loop. Relays that
    /// fail to bind stay pending and are retried on the next call.
    pub fn bind_pending_endpoints(&mut self) -> Vec<PlayerId> {
        let mut bound = Vec::new();

        for remote_id in std::mem::take(&mut self.unbound) {
            let Some(relay) = self.relays.get_mut(remote_id) else {
                continue;
            };
            match relay.bind_local_endpoint() {
                Ok(_) => bound.push(remote_id),
                Err(e) => {
                    log::error!("{}: failed to bind local UDP socket: {}", relay, e);
                    self.unbound.push(remote_id);
                }
            }
        }

        if !bound.is_empty() {
            self.try_execute_tasks();
        }
        bound
    }

    /// Forward datagrams waiting on the relay socket behind `token`
    pub fn process_relay_socket(&mut self, token: Token) -> bool {
        match self.relays.find_by_token(token) {
            Some(relay) => {
                relay.process_local_socket();
                true
            }
            None => false,
        }
    }

    /// Apply every queued session event
    pub fn process_session_events(&mut self, now: Instant) {
        while let Ok(event) = self.session_events.try_recv() {
            let remote_id = event.remote_id;
            let Some(relay) = self.relays.get_mut(remote_id) else {
                log::trace!("Dropping session event for removed relay {}", remote_id);
                continue;
            };
            let events = relay.handle_session_event(event, now);
            self.forward_relay_events(remote_id, events);
        }
    }

    /// Run relay watchdogs that are due
    pub fn tick(&mut self, now: Instant) {
        let mut fired = Vec::new();
        for relay in self.relays.iter_mut() {
            let events = relay.on_watchdog(now);
            if !events.is_empty() {
                fired.push((relay.remote_id(), events));
            }
        }
        for (remote_id, events) in fired {
            self.forward_relay_events(remote_id, events);
        }
    }

    /// Earliest pending relay deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.relays.next_deadline()
    }

    fn forward_relay_events(&mut self, remote_id: PlayerId, events: Vec<RelayEvent>) {
        let local_id = self.options.id;
        for event in events {
            let notification = match event {
                RelayEvent::Signaling(msg) => Notification::IceMsg {
                    local_id,
                    remote_id,
                    msg,
                },
                RelayEvent::StateChanged(state) => Notification::IceConnectionStateChanged {
                    local_id,
                    remote_id,
                    state,
                },
                RelayEvent::DataChannelOpen => Notification::DatachannelOpen {
                    local_id,
                    remote_id,
                },
            };
            self.notify(notification);
        }
    }

    /// Close every relay and drop queued tasks
    pub fn shutdown(&mut self) {
        log::info!("Shutting down, closing {} relays", self.relays.len());
        self.relays.close_all();
        self.unbound.clear();
        self.tasks.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
