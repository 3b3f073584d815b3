//! Per-peer BitTorrent protocol: handshake, wire message codec, and the
//! worker state machine that drives one TCP connection through the piece
//! pipeline described in the engine's design.
pub mod handshake;
pub mod message;
pub mod worker;

pub use handshake::Handshake;
pub use message::Message;
pub use worker::PeerWorker;

use thiserror::Error;

/// Errors scoped to a single peer connection. None of these propagate past
/// the worker: a failing peer goes back to the fallback queue and the
/// worker exits, per the engine's error-handling policy.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dial timed out")]
    DialTimeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("piece hash mismatch for index {0}")]
    HashMismatch(usize),

    #[error("peer closed the connection")]
    Closed,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
