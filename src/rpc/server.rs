//! JSON-RPC TCP server
//!
//! Accepts any number of local clients. Each client's byte stream is parsed
//! as a sequence of JSON values (concatenated or newline separated); a value
//! split across reads waits for the rest. Responses and notifications are
//! written newline terminated.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use serde_json::Value;

use super::{error_response, Notification, Request, RpcError};

const READ_BUF_SIZE: usize = 16384;

/// A parsed request and the client it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub client: Token,
    pub request: Request,
}

struct RpcClient {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: Vec<u8>,
    outgoing: Vec<u8>,
}

pub struct RpcServer {
    listener: TcpListener,
    clients: HashMap<Token, RpcClient>,
    next_client_token: usize,
}

impl RpcServer {
    /// Bind on localhost. Port 0 lets the OS pick.
    pub fn bind(port: u16) -> io::Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)?;
        log::info!("JSONRPC server listening on port {}", listener.local_addr()?.port());

        Ok(Self {
            listener,
            clients: HashMap::new(),
            next_client_token: 0,
        })
    }

    /// Register the listener; clients get tokens from `first_client_token` up
    pub fn register(
        &mut self,
        registry: &Registry,
        listener_token: Token,
        first_client_token: Token,
    ) -> io::Result<()> {
        self.next_client_token = first_client_token.0;
        registry.register(&mut self.listener, listener_token, Interest::READABLE)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Whether `token` belongs to one of this server's clients
    pub fn owns(&self, token: Token) -> bool {
        self.clients.contains_key(&token)
    }

    pub fn accept(&mut self, registry: &Registry) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::error!("JSONRPC accept error: {}", e);
                    return;
                }
            };

            let token = Token(self.next_client_token);
            self.next_client_token += 1;

            if let Err(e) = registry.register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                log::error!("Failed to register JSONRPC client {}: {}", peer, e);
                continue;
            }

            log::info!("JSONRPC client connected from {} ({:?})", peer, token);
            self.clients.insert(
                token,
                RpcClient {
                    stream,
                    peer,
                    inbound: Vec::new(),
                    outgoing: Vec::new(),
                },
            );
        }
    }

    /// Handle a readiness event on a client socket and return the complete
    /// requests it delivered. Unparseable input is answered here.
    pub fn ready(
        &mut self,
        registry: &Registry,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> Vec<Incoming> {
        let mut requests = Vec::new();

        if writable {
            if let Err(e) = self.flush(token) {
                log::info!("JSONRPC client {:?} write error: {}", token, e);
                self.disconnect(registry, token);
                return requests;
            }
        }

        if readable {
            match self.read_available(token) {
                Ok(open) => {
                    self.parse_inbound(token, &mut requests);
                    if !open {
                        self.disconnect(registry, token);
                    }
                }
                Err(e) => {
                    log::info!("JSONRPC client {:?} read error: {}", token, e);
                    self.disconnect(registry, token);
                }
            }
        }

        requests
    }

    /// Queue a JSON value for one client
    pub fn send_to(&mut self, token: Token, value: &Value) {
        let Some(client) = self.clients.get_mut(&token) else {
            log::debug!("JSONRPC client {:?} gone, dropping reply", token);
            return;
        };
        log::debug!("Sending to JSONRPC client {}: {}", client.peer, value);
        client.outgoing.extend_from_slice(value.to_string().as_bytes());
        client.outgoing.push(b'\n');

        if let Err(e) = self.flush(token) {
            log::info!("JSONRPC client {:?} write error: {}", token, e);
        }
    }

    /// Send a notification to every connected client
    pub fn broadcast(&mut self, notification: &Notification) {
        if self.clients.is_empty() {
            log::trace!("No JSONRPC client, dropping {}", notification.method());
            return;
        }

        let value = notification.to_json();
        log::debug!("Sending notification to clients: {}", value);
        let tokens: Vec<Token> = self.clients.keys().copied().collect();
        for token in tokens {
            if let Some(client) = self.clients.get_mut(&token) {
                client.outgoing.extend_from_slice(value.to_string().as_bytes());
                client.outgoing.push(b'\n');
            }
            if let Err(e) = self.flush(token) {
                log::info!("JSONRPC client {:?} write error: {}", token, e);
            }
        }
    }

    /// Drop every client
    pub fn close_all(&mut self, registry: &Registry) {
        let tokens: Vec<Token> = self.clients.keys().copied().collect();
        for token in tokens {
            let _ = self.flush(token);
            self.disconnect(registry, token);
        }
    }

    fn flush(&mut self, token: Token) -> io::Result<()> {
        let Some(client) = self.clients.get_mut(&token) else {
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

    /// Read until the socket would block; `Ok(false)` on orderly close
    fn read_available(&mut self, token: Token) -> io::Result<bool> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(false);
        };
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            match client.stream.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => client.inbound.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn parse_inbound(&mut self, token: Token, requests: &mut Vec<Incoming>) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let (values, consumed, error) = parse_values(&client.inbound);
        client.inbound.drain(..consumed);

        for value in values {
            log::debug!("Received from JSONRPC client {}: {}", client.peer, value);
            let id = value.get("id").cloned();
            match Request::from_value(value) {
                Ok(request) => requests.push(Incoming { client: token, request }),
                Err(e) => {
                    log::error!("Invalid JSONRPC request: {}", e);
                    let reply = error_response(id.as_ref(), &e);
                    client.outgoing.extend_from_slice(reply.to_string().as_bytes());
                    client.outgoing.push(b'\n');
                }
            }
        }

        if let Some(e) = error {
            log::error!("JSONRPC parse error, discarding {} bytes: {}", client.inbound.len(), e);
            client.inbound.clear();
            let reply = error_response(None, &e);
            client.outgoing.extend_from_slice(reply.to_string().as_bytes());
            client.outgoing.push(b'\n');
        }

        if let Err(e) = self.flush(token) {
            log::info!("JSONRPC client {:?} write error: {}", token, e);
        }
    }

    fn disconnect(&mut self, registry: &Registry, token: Token) {
        if let Some(mut client) = self.clients.remove(&token) {
            log::info!("JSONRPC client {} disconnected", client.peer);
            let _ = registry.deregister(&mut client.stream);
        }
    }
}

/// Parse every complete JSON value at the front of `buf`. Returns the values,
/// the number of bytes they occupy, and a syntax error if one was hit.
fn parse_values(buf: &[u8]) -> (Vec<Value>, usize, Option<RpcError>) {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    let mut values = Vec::new();
    let mut error = None;

    loop {
        match stream.next() {
            Some(Ok(value)) => values.push(value),
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => {
                error = Some(RpcError::Parse(e.to_string()));
                break;
            }
            None => break,
        }
    }

    (values, stream.byte_offset(), error)
}
