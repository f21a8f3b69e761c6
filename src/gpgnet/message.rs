//! GPGNet message codec
//!
//! Encodes and decodes the game's legacy control-protocol frames. The codec is
//! pure: it never touches a socket.
//!
//! # Wire Format
//!
//! All integers are 32-bit little-endian. Strings use one byte per character
//! (Latin-1), so their length prefix is both a character and a byte count.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────────────────────────┐
//! │ header len   │ header bytes │ chunk count  │ chunks...               │
//! │ (i32)        │ (len bytes)  │ (i32)        │                         │
//! └──────────────┴──────────────┴──────────────┴─────────────────────────┘
//!
//! chunk := [tag u8 = 0][value i32]
//!        | [tag u8 = 1][len i32][len bytes]
//! ```
//!
//! # Streaming
//!
//! [`decode_messages`] parses as many complete messages as a buffer holds and
//! returns the unconsumed suffix. The caller appends newly received bytes to
//! that suffix and decodes again.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Chunk type tag for a 32-bit integer
pub const CHUNK_TYPE_INT: u8 = 0;

/// Chunk type tag for a Latin-1 string
pub const CHUNK_TYPE_STRING: u8 = 1;

/// Size of every length prefix and integer value on the wire
const INT_LEN: usize = 4;

/// Replacement byte for characters outside Latin-1
const NON_LATIN1_REPLACEMENT: u8 = b'?';

/// Maximum encoded message size (1 MB). Also bounds every declared length.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

// ============================================================================
// Message Types
// ============================================================================

/// A single payload value of a GPGNet message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Chunk {
    Int(i32),
    Str(String),
}

impl Chunk {
    fn encoded_len(&self) -> usize {
        1 + match self {
            Chunk::Int(_) => INT_LEN,
            Chunk::Str(s) => INT_LEN + s.chars().count(),
        }
    }
}

impl From<i32> for Chunk {
    fn from(v: i32) -> Self {
        Chunk::Int(v)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Str(s.to_string())
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Str(s)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Int(v) => write!(f, "{}", v),
            Chunk::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// A GPGNet control-protocol message: a header name plus ordered chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpgNetMessage {
    pub header: String,
    pub chunks: Vec<Chunk>,
}

impl GpgNetMessage {
    pub fn new(header: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        Self {
            header: header.into(),
            chunks,
        }
    }

    /// Exact number of bytes [`encode`](Self::encode) will produce
    pub fn byte_count(&self) -> usize {
        INT_LEN
            + self.header.chars().count()
            + INT_LEN
            + self.chunks.iter().map(Chunk::encoded_len).sum::<usize>()
    }

    /// Encode into the GPGNet wire format
    pub fn encode(&self) -> Vec<u8> {
        let expected = self.byte_count();
        let mut buf = Vec::with_capacity(expected);

        write_string(&mut buf, &self.header);
        write_i32(&mut buf, self.chunks.len() as i32);

        for chunk in &self.chunks {
            match chunk {
                Chunk::Int(v) => {
                    buf.push(CHUNK_TYPE_INT);
                    write_i32(&mut buf, *v);
                }
                Chunk::Str(s) => {
                    buf.push(CHUNK_TYPE_STRING);
                    write_string(&mut buf, s);
                }
            }
        }

        debug_assert_eq!(buf.len(), expected, "encoded length must match byte_count");
        buf
    }
}

impl fmt::Display for GpgNetMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.header)?;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", chunk)?;
        }
        write!(f, "]")
    }
}

fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Length prefix followed by one byte per character
fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_i32(buf, s.chars().count() as i32);
    buf.extend(s.chars().map(|c| {
        let code = u32::from(c);
        if code <= 0xFF {
            code as u8
        } else {
            NON_LATIN1_REPLACEMENT
        }
    }));
}

// ============================================================================
// Decoding
// ============================================================================

/// Result of decoding the first message of a buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A full message and the bytes that follow it
    Complete(GpgNetMessage, &'a [u8]),
    /// Not enough bytes yet; carries the untouched input
    Incomplete(&'a [u8]),
}

/// Input that can never become a valid message, no matter how many bytes follow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("negative {field} length: {value}")]
    NegativeLength { field: &'static str, value: i32 },

    #[error("unknown chunk type tag {0}")]
    UnknownChunkType(u8),

    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// Read cursor over a borrowed buffer. Every read reports a shortfall as `None`.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_i32(&mut self) -> Option<i32> {
        let bytes = self.buf.get(self.pos..self.pos + INT_LEN)?;
        self.pos += INT_LEN;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_len(&mut self, field: &'static str) -> Result<Option<usize>, DecodeError> {
        match self.read_i32() {
            None => Ok(None),
            Some(value) if value < 0 => Err(DecodeError::NegativeLength { field, value }),
            Some(value) if value as usize > MAX_MESSAGE_SIZE => {
                Err(DecodeError::TooLarge(value as usize))
            }
            Some(value) => Ok(Some(value as usize)),
        }
    }

    /// Take up to `n` bytes; fewer are returned when the buffer ends first
    fn take_up_to(&mut self, n: usize) -> &'a [u8] {
        let end = self.pos.saturating_add(n).min(self.buf.len());
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        bytes
    }

    /// Read a length-prefixed string. The read length is checked against the
    /// declared length explicitly, since a buffer may end inside the payload.
    fn read_string(&mut self, field: &'static str) -> Result<Option<String>, DecodeError> {
        let Some(declared) = self.read_len(field)? else {
            return Ok(None);
        };
        let bytes = self.take_up_to(declared);
        if bytes.len() != declared {
            return Ok(None);
        }
        Ok(Some(bytes.iter().map(|&b| char::from(b)).collect()))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Parse one message from the cursor. `Ok(None)` means more bytes are needed.
fn parse_message(cursor: &mut Cursor<'_>) -> Result<Option<GpgNetMessage>, DecodeError> {
    let Some(header) = cursor.read_string("header")? else {
        return Ok(None);
    };
    let Some(chunk_count) = cursor.read_len("chunk count")? else {
        return Ok(None);
    };

    // Each chunk takes at least five bytes; never trust the declared count for
    // the allocation.
    let mut chunks = Vec::with_capacity(chunk_count.min(cursor.remaining() / 5));

    for _ in 0..chunk_count {
        if cursor.pos > MAX_MESSAGE_SIZE {
            return Err(DecodeError::TooLarge(cursor.pos));
        }
        let Some(tag) = cursor.read_u8() else {
            return Ok(None);
        };
        match tag {
            CHUNK_TYPE_INT => {
                let Some(v) = cursor.read_i32() else {
                    return Ok(None);
                };
                chunks.push(Chunk::Int(v));
            }
            CHUNK_TYPE_STRING => {
                let Some(s) = cursor.read_string("string chunk")? else {
                    return Ok(None);
                };
                chunks.push(Chunk::Str(s));
            }
            other => return Err(DecodeError::UnknownChunkType(other)),
        }
    }

    Ok(Some(GpgNetMessage { header, chunks }))
}

/// Decode the first message of `buf`
pub fn decode_frame(buf: &[u8]) -> Result<Frame<'_>, DecodeError> {
    let mut cursor = Cursor::new(buf);
    match parse_message(&mut cursor)? {
        Some(msg) => Ok(Frame::Complete(msg, &buf[cursor.pos..])),
        None => Ok(Frame::Incomplete(buf)),
    }
}

/// Decode every complete message in `buf`, handing each to `sink` in order
///
/// Returns the unconsumed suffix, starting exactly at the first incomplete
/// message. On error, messages before the malformed one have already been
/// delivered.
pub fn decode_messages<F>(buf: &[u8], mut sink: F) -> Result<&[u8], DecodeError>
where
    F: FnMut(GpgNetMessage),
{
    let mut rest = buf;
    loop {
        match decode_frame(rest)? {
            Frame::Complete(msg, remainder) => {
                sink(msg);
                rest = remainder;
            }
            Frame::Incomplete(pending) => return Ok(pending),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
