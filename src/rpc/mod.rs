//! JSON-RPC control plane
//!
//! The client that drives the adapter (usually the game launcher) talks
//! JSON-RPC 2.0 over a local TCP connection. Requests carry positional
//! parameters and map onto [`Command`]s; the adapter reports back through
//! [`Notification`]s written to every connected client.

pub mod server;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::gpgnet::Chunk;
use crate::relay::session::{ConnectionState, IceServer};
use crate::PlayerId;

pub use server::RpcServer;

pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },
}

impl RpcError {
    /// JSON-RPC 2.0 error code
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse(_) => -32700,
            RpcError::InvalidRequest(_) => -32600,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::InvalidParams { .. } => -32602,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A request or notification from the client
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent for notifications, which get no response
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        serde_json::from_value(value).map_err(|e| RpcError::InvalidRequest(e.to_string()))
    }
}

/// Control-plane command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Quit,
    HostGame {
        map: String,
    },
    JoinGame {
        remote_login: String,
        remote_id: PlayerId,
    },
    ConnectToPeer {
        remote_login: String,
        remote_id: PlayerId,
        offer: bool,
    },
    DisconnectFromPeer {
        remote_id: PlayerId,
    },
    IceMsg {
        remote_id: PlayerId,
        msg: Value,
    },
    SendToGpgNet {
        header: String,
        chunks: Vec<Chunk>,
    },
    SetIceServers(Vec<IceServer>),
    Status,
}

impl Command {
    /// Map a method name and its positional params onto a command
    pub fn parse(method: &str, params: &Value) -> Result<Self, RpcError> {
        let args = Params::new(method, params)?;

        let command = match method {
            "quit" => Command::Quit,
            "hostGame" => Command::HostGame { map: args.get(0)? },
            "joinGame" => Command::JoinGame {
                remote_login: args.get(0)?,
                remote_id: args.get(1)?,
            },
            "connectToPeer" => Command::ConnectToPeer {
                remote_login: args.get(0)?,
                remote_id: args.get(1)?,
                offer: args.get(2)?,
            },
            "disconnectFromPeer" => Command::DisconnectFromPeer {
                remote_id: args.get(0)?,
            },
            "iceMsg" => Command::IceMsg {
                remote_id: args.get(0)?,
                msg: args.get(1)?,
            },
            "sendToGpgNet" => Command::SendToGpgNet {
                header: args.get(0)?,
                chunks: args.get(1)?,
            },
            "setIceServers" => Command::SetIceServers(args.get(0)?),
            "status" => Command::Status,
            other => return Err(RpcError::MethodNotFound(other.to_string())),
        };

        Ok(command)
    }
}

/// Positional params of one request
struct Params<'a> {
    method: &'a str,
    values: &'a [Value],
}

impl<'a> Params<'a> {
    fn new(method: &'a str, params: &'a Value) -> Result<Self, RpcError> {
        let values = match params {
            Value::Array(values) => values.as_slice(),
            Value::Null => &[],
            _ => {
                return Err(RpcError::InvalidParams {
                    method: method.to_string(),
                    reason: "params must be an array".into(),
                })
            }
        };
        Ok(Self { method, values })
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, index: usize) -> Result<T, RpcError> {
        let value = self.values.get(index).ok_or_else(|| RpcError::InvalidParams {
            method: self.method.to_string(),
            reason: format!("missing parameter {}", index),
        })?;

        T::deserialize(value).map_err(|e| RpcError::InvalidParams {
            method: self.method.to_string(),
            reason: format!("parameter {}: {}", index, e),
        })
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Successful response body
pub fn response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Error response body; `id` is null when the request could not be read
pub fn error_response(id: Option<&Value>, error: &RpcError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {
            "code": error.code(),
            "message": error.to_string(),
        },
    })
}

// ============================================================================
// Notifications
// ============================================================================

/// Event pushed to the control plane
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// GPGNet client connected or disconnected
    ConnectionStateChanged(String),
    GpgNetMessageReceived {
        header: String,
        chunks: Vec<Chunk>,
    },
    IceMsg {
        local_id: PlayerId,
        remote_id: PlayerId,
        msg: Value,
    },
    IceConnectionStateChanged {
        local_id: PlayerId,
        remote_id: PlayerId,
        state: ConnectionState,
    },
    DatachannelOpen {
        local_id: PlayerId,
        remote_id: PlayerId,
    },
}

impl Notification {
    pub fn method(&self) -> &'static str {
        match self {
            Notification::ConnectionStateChanged(_) => "onConnectionStateChanged",
            Notification::GpgNetMessageReceived { .. } => "onGpgNetMessageReceived",
            Notification::IceMsg { .. } => "onIceMsg",
            Notification::IceConnectionStateChanged { .. } => "onIceConnectionStateChanged",
            Notification::DatachannelOpen { .. } => "onDatachannelOpen",
        }
    }

    /// Positional params
    pub fn params(&self) -> Value {
        match self {
            Notification::ConnectionStateChanged(state) => json!([state]),
            Notification::GpgNetMessageReceived { header, chunks } => json!([header, chunks]),
            Notification::IceMsg {
                local_id,
                remote_id,
                msg,
            } => json!([local_id, remote_id, msg]),
            Notification::IceConnectionStateChanged {
                local_id,
                remote_id,
                state,
            } => json!([local_id, remote_id, state]),
            Notification::DatachannelOpen {
                local_id,
                remote_id,
            } => json!([local_id, remote_id]),
        }
    }

    /// Full JSON-RPC notification object
    pub fn to_json(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": self.method(),
            "params": self.params(),
        })
    }
}
