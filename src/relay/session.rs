//! Negotiation session interface
//!
//! The ICE/DTLS/SCTP engine is an external capability. A relay drives it
//! through [`NegotiationSession`] and learns about asynchronous results
//! (offer/answer ready, state changes, data) through [`SessionEvent`]s that
//! the session posts to an [`EventSink`]. Events are drained by the adapter
//! loop and handed to the owning relay, so all relay state changes happen on
//! the loop thread.
//!
//! Every session is created for one relay *generation*. When a relay tears
//! its session down and creates a new one the generation is bumped, and any
//! late events from the old session are ignored.

use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::PlayerId;

// ============================================================================
// Connection State
// ============================================================================

/// ICE connection state of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
}

impl ConnectionState {
    /// Whether the data path is established
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(ConnectionState::New),
            "checking" => Ok(ConnectionState::Checking),
            "connected" => Ok(ConnectionState::Connected),
            "completed" => Ok(ConnectionState::Completed),
            "failed" => Ok(ConnectionState::Failed),
            "disconnected" => Ok(ConnectionState::Disconnected),
            other => Err(format!("unknown connection state '{}'", other)),
        }
    }
}

// ============================================================================
// Relay Servers
// ============================================================================

/// A STUN/TURN server entry as passed in by `setIceServers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// One URL or a list of URLs
    #[serde(alias = "url", deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

// ============================================================================
// Signaling Messages
// ============================================================================

/// Offer/answer/candidate payloads exchanged with the remote peer through the
/// control plane. The JSON form is `{"type": "offer", "sdp": ...}` etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: serde_json::Value },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Address and type of the local and remote candidate of the active pair
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidatePair {
    pub local_addr: String,
    pub local_type: String,
    pub remote_addr: String,
    pub remote_type: String,
}

// ============================================================================
// Session Events
// ============================================================================

/// Asynchronous result reported by a negotiation session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// Local offer or answer is ready and applied; forward it to the peer
    LocalDescription(SignalingMessage),
    /// Newly gathered local candidate (JSON candidate init object)
    LocalCandidate(serde_json::Value),
    StateChanged(ConnectionState),
    DataChannelOpen,
    DataChannelClosed,
    /// Message received on the data channel
    Data(Vec<u8>),
    /// Transport statistics for the active candidate pair
    Stats(Result<CandidatePair, String>),
    /// An asynchronous operation failed
    Error(String),
}

/// A session event addressed to one relay generation
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub remote_id: PlayerId,
    pub generation: u64,
    pub kind: SessionEventKind,
}

/// Wakes the event loop after an event was queued from another thread
pub trait Wake: Send + Sync {
    fn wake(&self);
}

impl Wake for mio::Waker {
    fn wake(&self) {
        if let Err(e) = mio::Waker::wake(self) {
            log::debug!("Failed to wake event loop: {}", e);
        }
    }
}

/// Shared producer side of the session event queue
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<SessionEvent>,
    waker: Option<Arc<dyn Wake>>,
}

impl EventSender {
    /// Sink for the session of `remote_id` at `generation`
    pub fn sink(&self, remote_id: PlayerId, generation: u64) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            waker: self.waker.clone(),
            remote_id,
            generation,
        }
    }
}

/// Create the session event queue
pub fn event_channel(waker: Option<Arc<dyn Wake>>) -> (EventSender, Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx, waker }, rx)
}

/// Handle a session uses to report its events
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<SessionEvent>,
    waker: Option<Arc<dyn Wake>>,
    remote_id: PlayerId,
    generation: u64,
}

impl EventSink {
    pub fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            remote_id: self.remote_id,
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            // Adapter is gone
            return;
        }
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("remote_id", &self.remote_id)
            .field("generation", &self.generation)
            .finish()
    }
}

// ============================================================================
// Session Traits
// ============================================================================

/// Errors reported synchronously by a negotiation backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to create session: {0}")]
    Create(String),

    #[error("session operation failed: {0}")]
    Operation(String),

    #[error("data channel is not open")]
    ChannelClosed,
}

/// One negotiation attempt with a remote peer
///
/// Operations that complete asynchronously report through the session's
/// [`EventSink`]; an `Err` return means the operation could not even start.
pub trait NegotiationSession {
    /// Create the application data channel (offerer side)
    fn create_data_channel(&mut self) -> Result<(), SessionError>;

    /// Generate an offer. Reported as `LocalDescription(Offer)`.
    fn create_offer(&mut self) -> Result<(), SessionError>;

    /// Apply a remote offer and generate an answer. Reported as
    /// `LocalDescription(Answer)`.
    fn apply_offer(&mut self, sdp: &str) -> Result<(), SessionError>;

    /// Apply a remote answer
    fn apply_answer(&mut self, sdp: &str) -> Result<(), SessionError>;

    /// Add a remote candidate
    fn add_candidate(&mut self, candidate: &serde_json::Value) -> Result<(), SessionError>;

    /// Send one message on the data channel, fire-and-forget
    fn send(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Query transport statistics. Reported as `Stats`.
    fn request_stats(&mut self);

    /// Close the data channel and the session. Idempotent.
    fn close(&mut self);
}

/// Creates negotiation sessions bound to a relay-server list
pub trait SessionFactory {
    fn create(
        &self,
        sink: EventSink,
        ice_servers: &[IceServer],
    ) -> Result<Box<dyn NegotiationSession>, SessionError>;
}
