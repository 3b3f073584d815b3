//! BitTorrent peer handshake (§4.B): the fixed 68-byte frame exchanged
//! before any length-prefixed messages.
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{PeerError, PeerResult};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// A parsed handshake frame, ours or a peer's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serializes into the 68-byte wire form:
    /// `pstrlen(1) | pstr(19) | reserved(8) | info_hash(20) | peer_id(20)`.
    pub fn encode(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        // buf[20..28] reserved, already zeroed.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    fn decode(buf: &[u8; 68]) -> PeerResult<Self> {
        if buf[0] != 19 {
            return Err(PeerError::Handshake(format!("invalid pstrlen: {}", buf[0])));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(PeerError::Handshake("invalid protocol string".to_string()));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Reads a 68-byte handshake frame from `stream`.
    pub async fn read<R: AsyncReadExt + Unpin>(stream: &mut R) -> PeerResult<Self> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;
        Self::decode(&buf)
    }

    /// Writes this handshake's wire form to `stream`.
    pub async fn write<W: AsyncWriteExt + Unpin>(&self, stream: &mut W) -> PeerResult<()> {
        stream.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Checks that `info_hash` matches and, if the tracker gave us a
    /// peer-id for this peer, that it matches too (§4.B).
    pub fn validate(&self, expected_info_hash: [u8; 20], expected_peer_id: Option<&[u8]>) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::Handshake("info hash mismatch".to_string()));
        }
        if let Some(expected) = expected_peer_id {
            if !expected.is_empty() && expected != self.peer_id {
                return Err(PeerError::Handshake("peer id mismatch".to_string()));
            }
        }
        Ok(())
    }

    /// Performs the full client-initiated handshake over `stream`: write
    /// ours, then read and validate the peer's.
    pub async fn perform<S: AsyncReadExt + AsyncWriteExt + Unpin>(
        stream: &mut S,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        expected_peer_id: Option<&[u8]>,
    ) -> PeerResult<Handshake> {
        Handshake::new(info_hash, our_peer_id).write(stream).await?;
        let theirs = Handshake::read(stream).await?;
        theirs.validate(info_hash, expected_peer_id)?;
        Ok(theirs)
    }
}
