//! GPGNet control protocol: message codec and the single-client TCP server
//! the game connects to.

pub mod message;
pub mod server;

pub use message::{decode_frame, decode_messages, Chunk, DecodeError, Frame, GpgNetMessage};
pub use server::{GpgNetEvent, GpgNetServer};
