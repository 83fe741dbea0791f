use async_trait::async_trait;

use crate::error::ShipError;

/// A single message carried by the transport: either a text frame or a raw
/// byte frame. Text received where bytes are expected is transcoded as UTF-8
/// before any comparison against tag bytes or JSON payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Normalizes this frame to its raw bytes, transcoding text as UTF-8.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Frame::Text(s) => s.into_bytes(),
            Frame::Binary(b) => b,
        }
    }
}

/// WebSocket close code used after a handshake abort, mirroring the "normal
/// closure" code defined by RFC 6455.
pub const CLOSE_NORMAL: u16 = 1000;

/// Abstract bidirectional message stream carrying the frames a SHIP
/// connection layers speak over. Single-owner, single-reader/single-writer:
/// concurrent `recv` calls on the same transport are forbidden by contract.
///
/// TLS setup, certificate loading, and the concrete WebSocket library are
/// external collaborators and deliberately not part of this trait — callers
/// hand the core an already-connected transport.
#[async_trait]
pub trait Transport: Send {
    /// Receives the next frame. An empty frame is a protocol violation the
    /// caller must treat as an abort, not a special case of this method.
    async fn recv(&mut self) -> Result<Frame, ShipError>;

    /// Sends a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), ShipError>;

    /// Closes the transport with a close code and human-readable reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ShipError>;
}
