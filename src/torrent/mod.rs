//! Torrent metainfo parsing and error handling.
//!
//! This module provides types and error handling for working with `.torrent`
//! files: parsing, validation, and the info-hash computation that binds a
//! parsed metainfo to its swarm.
use thiserror::Error;

pub mod file;
pub mod info_hash;

pub use file::{FileDict, InfoDict, TorrentFile};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid pieces hash length")]
    InvalidPiecesHashLength,
}

/// Result type for torrent operations.
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
