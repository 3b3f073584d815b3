//! Wire message codec (§4.B): the length-prefixed framing BitTorrent peers
//! use after the handshake.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::{PeerError, PeerResult};

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;

/// A post-handshake peer message. `KeepAlive` is the zero-length frame; it
/// carries no type byte on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Serializes this message into its wire form: a 4-byte big-endian
    /// length prefix followed by the type byte (if any) and payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let type_id = match self {
            Message::KeepAlive => {
                return 0u32.to_be_bytes().to_vec();
            }
            Message::Choke => CHOKE,
            Message::Unchoke => UNCHOKE,
            Message::Interested => INTERESTED,
            Message::NotInterested => NOT_INTERESTED,
            Message::Have(index) => {
                payload.write_u32::<BigEndian>(*index).unwrap();
                HAVE
            }
            Message::Bitfield(bits) => {
                payload.extend_from_slice(bits);
                BITFIELD
            }
            Message::Request { index, begin, length } => {
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.write_u32::<BigEndian>(*length).unwrap();
                REQUEST
            }
            Message::Piece { index, begin, block } => {
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.extend_from_slice(block);
                PIECE
            }
            Message::Cancel { index, begin, length } => {
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.write_u32::<BigEndian>(*length).unwrap();
                CANCEL
            }
        };

        let mut frame = Vec::with_capacity(5 + payload.len());
        frame
            .write_u32::<BigEndian>(payload.len() as u32 + 1)
            .unwrap();
        frame.push(type_id);
        frame.extend_from_slice(&payload);
        frame
    }

    fn decode_payload(type_id: u8, payload: Vec<u8>) -> PeerResult<Message> {
        let mut cursor = Cursor::new(&payload);
        match type_id {
            CHOKE => Ok(Message::Choke),
            UNCHOKE => Ok(Message::Unchoke),
            INTERESTED => Ok(Message::Interested),
            NOT_INTERESTED => Ok(Message::NotInterested),
            HAVE => {
                let index = cursor
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("short Have payload".to_string()))?;
                Ok(Message::Have(index))
            }
            BITFIELD => Ok(Message::Bitfield(payload)),
            REQUEST | CANCEL => {
                if payload.len() < 12 {
                    return Err(PeerError::ProtocolViolation(
                        "short Request/Cancel payload".to_string(),
                    ));
                }
                let index = cursor.read_u32::<BigEndian>().unwrap();
                let begin = cursor.read_u32::<BigEndian>().unwrap();
                let length = cursor.read_u32::<BigEndian>().unwrap();
                Ok(if type_id == REQUEST {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                })
            }
            PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::ProtocolViolation(
                        "short Piece payload".to_string(),
                    ));
                }
                let index = cursor.read_u32::<BigEndian>().unwrap();
                let begin = cursor.read_u32::<BigEndian>().unwrap();
                let block = payload[8..].to_vec();
                Ok(Message::Piece { index, begin, block })
            }
            other => Err(PeerError::ProtocolViolation(format!(
                "unknown message type id {other}"
            ))),
        }
    }

    /// Reads one framed message from `reader`.
    pub async fn read_from<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> PeerResult<Message> {
        let length = reader.read_u32().await.map_err(PeerError::Io)?;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        let mut buf = vec![0u8; length as usize];
        reader.read_exact(&mut buf).await.map_err(PeerError::Io)?;
        let type_id = buf[0];
        let payload = buf.split_off(1);
        Message::decode_payload(type_id, payload)
    }

    /// Writes this message's wire form to `writer`.
    pub async fn write_to<W: tokio::io::AsyncWriteExt + Unpin>(&self, writer: &mut W) -> PeerResult<()> {
        writer
            .write_all(&self.encode())
            .await
            .map_err(PeerError::Io)
    }
}
