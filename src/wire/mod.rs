//! The peer wire protocol: message framing, the handshake, and the
//! packed-bitfield representation of piece ownership.
//!
//! Every message except the handshake and keep-alive is framed as
//! `<length:4><id:1><payload>`, all integers big-endian. [`FrameParser`]
//! is a pull-based framer: push bytes in as they arrive, pull whole
//! messages out; a message that straddles two reads is simply not
//! available yet; the next push completes it.

use bytes::{Buf, BytesMut};
use thiserror::Error;

pub mod bitfield;
pub mod handshake;

pub use bitfield::Bitfield;
pub use handshake::Handshake;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("peer protocol violation: {0}")]
    Protocol(String),

    #[error("handshake timed out")]
    HandshakeTimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single peer-protocol message (excluding the handshake, which has its
/// own framing and lives in [`handshake`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    /// An unrecognized message id, accepted and skipped, never fatal.
    Unknown { id: u8, payload: Vec<u8> },
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

/// Encodes a message into its on-wire frame (or, for `KeepAlive`, the bare
/// zero-length frame).
pub fn encode(message: &Message) -> Vec<u8> {
    match message {
        Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
        Message::Choke => frame(ID_CHOKE, &[]),
        Message::Unchoke => frame(ID_UNCHOKE, &[]),
        Message::Interested => frame(ID_INTERESTED, &[]),
        Message::NotInterested => frame(ID_NOT_INTERESTED, &[]),
        Message::Have { piece_index } => frame(ID_HAVE, &piece_index.to_be_bytes()),
        Message::Bitfield(bf) => frame(ID_BITFIELD, bf.as_bytes()),
        Message::Request { index, begin, length } => {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(&length.to_be_bytes());
            frame(ID_REQUEST, &payload)
        }
        Message::Piece { index, begin, block } => {
            let mut payload = Vec::with_capacity(8 + block.len());
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(block);
            frame(ID_PIECE, &payload)
        }
        Message::Cancel { index, begin, length } => {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(&length.to_be_bytes());
            frame(ID_CANCEL, &payload)
        }
        Message::Port(port) => frame(ID_PORT, &port.to_be_bytes()),
        Message::Unknown { id, payload } => frame(*id, payload),
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut out = Vec::with_capacity(4 + payload.len() + 1);
    out.extend_from_slice(&length.to_be_bytes());
    out.push(id);
    out.extend_from_slice(payload);
    out
}

fn decode_payload(id: u8, payload: &[u8]) -> Result<Message, WireError> {
    fn u32_at(payload: &[u8], offset: usize, what: &str) -> Result<u32, WireError> {
        payload
            .get(offset..offset + 4)
            .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
            .ok_or_else(|| WireError::Protocol(format!("truncated {what} field")))
    }

    Ok(match id {
        ID_CHOKE => Message::Choke,
        ID_UNCHOKE => Message::Unchoke,
        ID_INTERESTED => Message::Interested,
        ID_NOT_INTERESTED => Message::NotInterested,
        ID_HAVE => Message::Have {
            piece_index: u32_at(payload, 0, "have.piece_index")?,
        },
        ID_BITFIELD => Message::Bitfield(Bitfield::from_bytes(payload.to_vec())),
        ID_REQUEST => Message::Request {
            index: u32_at(payload, 0, "request.index")?,
            begin: u32_at(payload, 4, "request.begin")?,
            length: u32_at(payload, 8, "request.length")?,
        },
        ID_PIECE => {
            if payload.len() < 8 {
                return Err(WireError::Protocol("truncated piece message".to_string()));
            }
            Message::Piece {
                index: u32_at(payload, 0, "piece.index")?,
                begin: u32_at(payload, 4, "piece.begin")?,
                block: payload[8..].to_vec(),
            }
        }
        ID_CANCEL => Message::Cancel {
            index: u32_at(payload, 0, "cancel.index")?,
            begin: u32_at(payload, 4, "cancel.begin")?,
            length: u32_at(payload, 8, "cancel.length")?,
        },
        ID_PORT => {
            let bytes = payload
                .get(0..2)
                .ok_or_else(|| WireError::Protocol("truncated port message".to_string()))?;
            Message::Port(u16::from_be_bytes(bytes.try_into().unwrap()))
        }
        other => Message::Unknown {
            id: other,
            payload: payload.to_vec(),
        },
    })
}

/// Incrementally parses peer-protocol messages out of a growing byte
/// stream. Bytes arrive via [`FrameParser::push`]; complete messages come
/// out of [`FrameParser::next_message`]. Partial frames remain buffered
/// across calls, so splitting a stream of N frames at any byte boundary
/// and feeding the halves in separately yields the same N messages as
/// feeding the whole stream at once.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self { buffer: BytesMut::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pulls the next complete message out of the buffer, if one is fully
    /// present. Returns `Ok(None)` when more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, WireError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
        if length == 0 {
            self.buffer.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if self.buffer.len() < 4 + length {
            return Ok(None);
        }
        let id = self.buffer[4];
        let payload = self.buffer[5..4 + length].to_vec();
        self.buffer.advance(4 + length);
        decode_payload(id, &payload).map(Some)
    }

    /// Drains every currently-complete message from the buffer.
    pub fn drain_messages(&mut self) -> Result<Vec<Message>, WireError> {
        let mut out = Vec::new();
        while let Some(message) = self.next_message()? {
            out.push(message);
        }
        Ok(out)
    }
}
