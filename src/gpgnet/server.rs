//! GPGNet TCP server
//!
//! Listens for the local game process and keeps exactly one client: a new
//! connection silently replaces the previous one. Incoming bytes are
//! accumulated and run through the message codec; outgoing messages are
//! buffered and flushed whenever the socket accepts more data.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};

use super::message::{decode_messages, GpgNetMessage};

/// Read buffer size for the game socket
const READ_BUF_SIZE: usize = 65536;

/// Something the server observed on its socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpgNetEvent {
    Connected,
    Disconnected,
    Message(GpgNetMessage),
}

/// The connected game process
struct GameClient {
    stream: TcpStream,
    peer: SocketAddr,
    outgoing: Vec<u8>,
}

/// Single-client GPGNet server
pub struct GpgNetServer {
    listener: TcpListener,
    client: Option<GameClient>,
    /// Bytes received but not yet decoded into a complete message
    buffer: Vec<u8>,
    client_token: Token,
}

impl GpgNetServer {
    /// Bind on localhost. Port 0 lets the OS pick.
    pub fn bind(port: u16) -> io::Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)?;
        log::info!("GPGNet server listening on port {}", listener.local_addr()?.port());

        Ok(Self {
            listener,
            client: None,
            buffer: Vec::new(),
            client_token: Token(0),
        })
    }

    /// Register the listener; accepted clients get `client_token`
    pub fn register(
        &mut self,
        registry: &Registry,
        listener_token: Token,
        client_token: Token,
    ) -> io::Result<()> {
        self.client_token = client_token;
        registry.register(&mut self.listener, listener_token, Interest::READABLE)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Accept pending connections. The newest one becomes the client.
    pub fn accept(&mut self, registry: &Registry) -> Vec<GpgNetEvent> {
        let mut events = Vec::new();

        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("GPGNet accept error: {}", e);
                    break;
                }
            };

            if let Some(mut old) = self.client.take() {
                log::info!("GPGNet client {} replaced by {}", old.peer, peer);
                let _ = registry.deregister(&mut old.stream);
            }

            if let Err(e) = registry.register(
                &mut stream,
                self.client_token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                log::error!("Failed to register GPGNet client {}: {}", peer, e);
                continue;
            }

            log::info!("GPGNet client connected from {}", peer);
            self.buffer.clear();
            self.client = Some(GameClient {
                stream,
                peer,
                outgoing: Vec::new(),
            });
            events.push(GpgNetEvent::Connected);
        }

        events
    }

    /// Handle a readiness event on the client socket
    pub fn ready(&mut self, registry: &Registry, readable: bool, writable: bool) -> Vec<GpgNetEvent> {
        let mut events = Vec::new();

        if writable {
            if let Err(e) = self.flush() {
                log::error!("GPGNet client socket error: {}", e);
                self.disconnect(registry, &mut events);
                return events;
            }
        }

        if readable {
            self.read_available(registry, &mut events);
        }

        events
    }

    /// Queue a message for the game. A no-op while no client is connected.
    pub fn send(&mut self, msg: &GpgNetMessage) {
        let Some(client) = self.client.as_mut() else {
            log::trace!("GPGNet send without client, dropping {}", msg);
            return;
        };

        log::debug!("GPGNet send: {}", msg);
        client.outgoing.extend_from_slice(&msg.encode());

        if let Err(e) = self.flush() {
            // The read side will observe the broken connection and disconnect
            log::error!("GPGNet client socket error: {}", e);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };

        while !client.outgoing.is_empty() {
            match client.stream.write(&client.outgoing) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    client.outgoing.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn read_available(&mut self, registry: &Registry, events: &mut Vec<GpgNetEvent>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let Some(client) = self.client.as_mut() else {
                return;
            };

            match client.stream.read(&mut buf) {
                Ok(0) => {
                    self.disconnect(registry, events);
                    return;
                }
                Ok(n) => {
                    log::trace!("GPGNet received {} bytes", n);
                    self.buffer.extend_from_slice(&buf[..n]);
                    self.decode_buffer(events);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("GPGNet client socket error: {}", e);
                    self.disconnect(registry, events);
                    return;
                }
            }
        }
    }

    fn decode_buffer(&mut self, events: &mut Vec<GpgNetEvent>) {
        let result = decode_messages(&self.buffer, |msg| {
            log::debug!("GPGNet received: {}", msg);
            events.push(GpgNetEvent::Message(msg));
        })
        .map(|rest| rest.len());

        match result {
            Ok(remaining) => {
                let consumed = self.buffer.len() - remaining;
                self.buffer.drain(..consumed);
            }
            Err(e) => {
                log::error!(
                    "Malformed GPGNet data ({}), discarding {} buffered bytes",
                    e,
                    self.buffer.len()
                );
                self.buffer.clear();
            }
        }
    }

    fn disconnect(&mut self, registry: &Registry, events: &mut Vec<GpgNetEvent>) {
        if let Some(mut client) = self.client.take() {
            log::info!("GPGNet client {} disconnected", client.peer);
            let _ = registry.deregister(&mut client.stream);
            self.buffer.clear();
            events.push(GpgNetEvent::Disconnected);
        }
    }
}
