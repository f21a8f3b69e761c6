//! GPGNet ICE Adapter
//!
//! Bridges the game's GPGNet control protocol to per-peer P2P data channels:
//! - GPGNet message codec and the local control server the game connects to
//! - Task queue that gates commands for the game on its reported state
//! - Peer relays that negotiate a data channel per remote player, bridge it
//!   to a local UDP socket and restart stuck negotiations
//! - JSON-RPC control plane for the launcher driving the adapter

use mio::Token;

// ============================================================================
// Modules
// ============================================================================

pub mod adapter;
pub mod gpgnet;
pub mod options;
pub mod relay;
pub mod rpc;
pub mod status;
pub mod task;

/// WebRTC negotiation backend
#[cfg(feature = "webrtc")]
pub mod webrtc_session;

pub use adapter::IceAdapter;
pub use options::Options;

/// Player ids as used on GPGNet and the control plane
pub type PlayerId = i32;

// ============================================================================
// Event Loop Tokens
// ============================================================================

pub const GPGNET_LISTENER_TOKEN: Token = Token(0);
pub const GPGNET_CLIENT_TOKEN: Token = Token(1);
pub const RPC_LISTENER_TOKEN: Token = Token(2);
pub const WAKER_TOKEN: Token = Token(3);

/// JSON-RPC clients are numbered from here
pub const RPC_CLIENT_TOKEN_START: Token = Token(16);

/// Relay UDP sockets are numbered from here
pub const RELAY_TOKEN_START: Token = Token(1 << 20);
