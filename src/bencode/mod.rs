//! Bencode value model and error taxonomy.
//!
//! Bencode is the encoding BitTorrent uses for `.torrent` metainfo files and
//! for tracker responses. This module defines the value type shared by the
//! [`decoder`] and [`encoder`] submodules.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded Bencode value.
///
/// Dictionary keys are kept as raw bytes (not `String`) because metainfo
/// fields are not guaranteed to be valid UTF-8, and a `BTreeMap` gives us
/// sorted key order for free, which the encoder relies on for canonical
/// output.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Errors produced while decoding or encoding Bencode data.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("pieces blob length {0} is not a multiple of 20")]
    InvalidPiecesLength(usize),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
