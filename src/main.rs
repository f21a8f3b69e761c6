//! GPGNet ICE Adapter
//!
//! Runs the adapter on a single mio event loop:
//! - GPGNet server for the game (one client)
//! - JSON-RPC server for the launcher
//! - one UDP socket per peer relay
//! - a waker the WebRTC runtime uses to hand session events to the loop

use std::fs::File;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Waker};

use ice_adapter::gpgnet::{GpgNetEvent, GpgNetServer};
use ice_adapter::relay::session::Wake;
use ice_adapter::rpc::server::Incoming;
use ice_adapter::rpc::{error_response, response, Command, RpcServer};
use ice_adapter::webrtc_session::WebRtcSessionFactory;
use ice_adapter::{
    IceAdapter, Options, GPGNET_CLIENT_TOKEN, GPGNET_LISTENER_TOKEN, RELAY_TOKEN_START,
    RPC_CLIENT_TOKEN_START, RPC_LISTENER_TOKEN, WAKER_TOKEN,
};

/// Upper bound on a single poll so quit/signal flags are seen promptly
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", ice_adapter::options::USAGE);
        return Ok(());
    }

    let options = match Options::from_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}\n{}", e, ice_adapter::options::USAGE);
            return Err(e.into());
        }
    };

    init_logging(&options)?;

    log::info!("GPGNet ICE Adapter {} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("  Player:  {} ({})", options.login, options.id);
    log::info!("  RPC:     {}", options.rpc_port);
    log::info!("  GPGNet:  {}", options.gpgnet_port);
    log::info!("  Lobby:   {}", options.lobby_port);
    log::info!("  Timeout: {:?}", options.connect_timeout);

    let mut app = App::new(options)?;
    app.run()
}

/// `--log-level` is the default filter, `RUST_LOG` overrides it
fn init_logging(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(options.log_level.as_str()),
    );

    if let Some(path) = &options.log_file {
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }

    builder.init();
    Ok(())
}

/// Log writer that copies everything to stderr and a file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

// ============================================================================
// Application
// ============================================================================

struct App {
    poll: Poll,
    gpgnet: GpgNetServer,
    rpc: RpcServer,
    adapter: IceAdapter,
    /// Set by SIGINT/SIGTERM
    terminate: Arc<AtomicBool>,
}

impl App {
    fn new(options: Options) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;
        let waker: Arc<dyn Wake> = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut gpgnet = GpgNetServer::bind(options.gpgnet_port)?;
        gpgnet.register(poll.registry(), GPGNET_LISTENER_TOKEN, GPGNET_CLIENT_TOKEN)?;

        let mut rpc = RpcServer::bind(options.rpc_port)?;
        rpc.register(poll.registry(), RPC_LISTENER_TOKEN, RPC_CLIENT_TOKEN_START)?;

        let terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&terminate))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&terminate))?;

        let factory = Rc::new(WebRtcSessionFactory::new()?);
        let mut adapter = IceAdapter::new(options, factory, Some(waker), RELAY_TOKEN_START);
        adapter.set_gpgnet_local_port(gpgnet.local_port());

        Ok(Self {
            poll,
            gpgnet,
            rpc,
            adapter,
            terminate,
        })
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        loop {
            if self.terminate.load(Ordering::Relaxed) {
                log::info!("Signal received, shutting down");
                break;
            }
            if self.adapter.is_quit_requested() {
                break;
            }

            // Wake up for the earliest relay watchdog
            let timeout = self
                .adapter
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()).min(MAX_POLL_TIMEOUT))
                .or(Some(MAX_POLL_TIMEOUT));

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    GPGNET_LISTENER_TOKEN => {
                        let gpg_events = self.gpgnet.accept(self.poll.registry());
                        self.handle_gpgnet_events(gpg_events);
                    }
                    GPGNET_CLIENT_TOKEN => {
                        let gpg_events = self.gpgnet.ready(
                            self.poll.registry(),
                            event.is_readable(),
                            event.is_writable(),
                        );
                        self.handle_gpgnet_events(gpg_events);
                    }
                    RPC_LISTENER_TOKEN => self.rpc.accept(self.poll.registry()),
                    WAKER_TOKEN => {}
                    token if self.rpc.owns(token) => {
                        let requests = self.rpc.ready(
                            self.poll.registry(),
                            token,
                            event.is_readable(),
                            event.is_writable(),
                        );
                        for incoming in requests {
                            self.handle_request(incoming);
                        }
                    }
                    token => {
                        if !self.adapter.process_relay_socket(token) {
                            log::trace!("Event for unknown token {:?}", token);
                        }
                    }
                }
                self.pump();
            }

            let now = Instant::now();
            self.adapter.process_session_events(now);
            self.adapter.tick(now);
            self.register_new_relays();
            self.pump();
        }

        self.adapter.shutdown();
        self.pump();
        self.rpc.close_all(self.poll.registry());
        log::info!("Shut down");
        Ok(())
    }

    fn handle_gpgnet_events(&mut self, events: Vec<GpgNetEvent>) {
        for event in events {
            match event {
                GpgNetEvent::Connected => self.adapter.on_game_connected(),
                GpgNetEvent::Disconnected => self.adapter.on_game_disconnected(),
                GpgNetEvent::Message(msg) => self.adapter.on_game_message(msg),
            }
        }
    }

    fn handle_request(&mut self, incoming: Incoming) {
        let Incoming { client, request } = incoming;

        match Command::parse(&request.method, &request.params) {
            Ok(command) => {
                let result = self.adapter.dispatch(command, Instant::now());
                if let Some(id) = &request.id {
                    self.rpc.send_to(client, &response(id, result));
                }
            }
            Err(e) => {
                log::error!("JSONRPC request {} rejected: {}", request.method, e);
                if request.id.is_some() {
                    self.rpc.send_to(client, &error_response(request.id.as_ref(), &e));
                }
            }
        }

        // Relays created by this request get their socket right away
        self.register_new_relays();
    }

    /// Bind and register the local sockets of newly created relays
    fn register_new_relays(&mut self) {
        for remote_id in self.adapter.bind_pending_endpoints() {
            let Some(relay) = self.adapter.relay_mut(remote_id) else {
                continue;
            };
            let token = relay.token();
            let Some(socket) = relay.local_socket_mut() else {
                continue;
            };
            if let Err(e) = self.poll.registry().register(socket, token, Interest::READABLE) {
                log::error!("Failed to register relay socket for {}: {}", remote_id, e);
            }
        }
    }

    /// Deliver everything the adapter produced
    fn pump(&mut self) {
        for msg in self.adapter.take_game_messages() {
            self.gpgnet.send(&msg);
        }
        for notification in self.adapter.take_notifications() {
            self.rpc.broadcast(&notification);
        }
    }
}
