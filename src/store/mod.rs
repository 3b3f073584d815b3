//! Piece store (§4.D): sparse writes into the destination file and a
//! durable bitfield sidecar, the single point through which verified
//! pieces become on-disk state.
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Number of bytes needed to hold `num_pieces` bits, one per piece,
/// packed big-endian within each byte (bit 7 = piece 0).
pub fn bitfield_byte_len(num_pieces: usize) -> usize {
    num_pieces.div_ceil(8)
}

pub fn is_set(bitfield: &[u8], index: usize) -> bool {
    let byte = index / 8;
    let bit = 7 - (index % 8);
    byte < bitfield.len() && (bitfield[byte] >> bit) & 1 == 1
}

pub fn set(bitfield: &mut [u8], index: usize) {
    let byte = index / 8;
    let bit = 7 - (index % 8);
    if byte < bitfield.len() {
        bitfield[byte] |= 1 << bit;
    }
}

/// Owns the destination data file and its bitfield sidecar. The engine
/// runs exactly one `PieceStore` on a dedicated task that is the sole
/// consumer of the save queue (single writer).
#[derive(Debug)]
pub struct PieceStore {
    data_file: File,
    bitfield_file: File,
    bitfield: Vec<u8>,
    piece_length: i64,
    num_pieces: usize,
    saved_count: usize,
}

impl PieceStore {
    /// Opens or creates `dest_path` (truncated to `total_length` if new)
    /// and the bitfield sidecar at `bitfield_path`. If `dest_path` did not
    /// already exist, any stale bitfield at `bitfield_path` is discarded
    /// (resuming requires both the data file and its bitfield).
    #[instrument(skip(dest_path, bitfield_path), fields(dest = %dest_path.as_ref().display()))]
    pub async fn open(
        dest_path: impl AsRef<Path>,
        bitfield_path: impl AsRef<Path>,
        total_length: i64,
        piece_length: i64,
        num_pieces: usize,
    ) -> StoreResult<Self> {
        let dest_path = dest_path.as_ref();
        let bitfield_path = bitfield_path.as_ref();

        let dest_existed = fs::metadata(dest_path).await.is_ok();
        if !dest_existed {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            if fs::metadata(bitfield_path).await.is_ok() {
                fs::remove_file(bitfield_path).await?;
            }
        }
        if let Some(parent) = bitfield_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dest_path)
            .await?;
        if !dest_existed {
            data_file.set_len(total_length.max(0) as u64).await?;
        }

        let byte_len = bitfield_byte_len(num_pieces);
        let mut bitfield_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(bitfield_path)
            .await?;
        let existing_len = bitfield_file.metadata().await?.len() as usize;
        let bitfield = if existing_len == byte_len {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; byte_len];
            bitfield_file.seek(SeekFrom::Start(0)).await?;
            bitfield_file.read_exact(&mut buf).await?;
            buf
        } else {
            let buf = vec![0u8; byte_len];
            bitfield_file.set_len(byte_len as u64).await?;
            bitfield_file.seek(SeekFrom::Start(0)).await?;
            bitfield_file.write_all(&buf).await?;
            bitfield_file.flush().await?;
            buf
        };

        let saved_count = (0..num_pieces).filter(|&i| is_set(&bitfield, i)).count();

        Ok(Self {
            data_file,
            bitfield_file,
            bitfield,
            piece_length,
            num_pieces,
            saved_count,
        })
    }

    /// A snapshot of the durable bitfield, taken once before any worker
    /// starts (§5: dispatcher reads it once, workers observe a snapshot).
    pub fn bitfield_snapshot(&self) -> Vec<u8> {
        self.bitfield.clone()
    }

    pub fn saved_count(&self) -> usize {
        self.saved_count
    }

    pub fn is_complete(&self) -> bool {
        self.saved_count >= self.num_pieces
    }

    /// Writes `bytes` at the piece's aligned offset, then rewrites the
    /// whole bitfield at offset 0. Not atomic: a crash between the two
    /// writes leaves a piece on disk whose bit is unset, which is safe —
    /// the engine re-downloads and re-verifies it on next start.
    #[instrument(skip(self, bytes), fields(index = index))]
    pub async fn save(&mut self, index: usize, bytes: &[u8]) -> StoreResult<()> {
        let offset = index as i64 * self.piece_length;
        self.data_file.seek(SeekFrom::Start(offset as u64)).await?;
        self.data_file.write_all(bytes).await?;
        self.data_file.flush().await?;

        let already_set = is_set(&self.bitfield, index);
        set(&mut self.bitfield, index);
        self.bitfield_file.seek(SeekFrom::Start(0)).await?;
        self.bitfield_file.write_all(&self.bitfield).await?;
        self.bitfield_file.flush().await?;

        if !already_set {
            self.saved_count += 1;
        }
        Ok(())
    }
}

/// Computes the bitfield sidecar path for a torrent named `name` under
/// `bitfield_dir`, per §4.H (`<bitfield_dir>/<name>.bitfield`).
pub fn bitfield_path(bitfield_dir: impl AsRef<Path>, name: &str) -> PathBuf {
    bitfield_dir.as_ref().join(format!("{name}.bitfield"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bitfield_byte_len_rounds_up() {
        assert_eq!(bitfield_byte_len(1), 1);
        assert_eq!(bitfield_byte_len(8), 1);
        assert_eq!(bitfield_byte_len(9), 2);
        assert_eq!(bitfield_byte_len(0), 0);
    }

    #[test]
    fn set_and_is_set_use_msb_first_order() {
        let mut bf = vec![0u8; 1];
        set(&mut bf, 0);
        assert_eq!(bf[0], 0b1000_0000);
        set(&mut bf, 7);
        assert_eq!(bf[0], 0b1000_0001);
        assert!(is_set(&bf, 0));
        assert!(!is_set(&bf, 1));
    }

    #[tokio::test]
    async fn fresh_store_starts_with_zero_bitfield_and_zero_saved() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let bf = dir.path().join("data.bitfield");
        let store = PieceStore::open(&dest, &bf, 16389, 16384, 2).await.unwrap();
        assert_eq!(store.saved_count(), 0);
        assert!(!store.is_complete());
        assert_eq!(store.bitfield_snapshot(), vec![0u8]);
    }

    #[tokio::test]
    async fn save_sets_bit_and_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let bf = dir.path().join("data.bitfield");
        {
            let mut store = PieceStore::open(&dest, &bf, 16389, 16384, 2).await.unwrap();
            store.save(0, &vec![7u8; 16384]).await.unwrap();
            assert_eq!(store.saved_count(), 1);
        }
        let store = PieceStore::open(&dest, &bf, 16389, 16384, 2).await.unwrap();
        assert_eq!(store.saved_count(), 1);
        assert!(is_set(&store.bitfield_snapshot(), 0));
        assert!(!is_set(&store.bitfield_snapshot(), 1));
    }

    #[tokio::test]
    async fn stale_bitfield_is_discarded_when_data_file_absent() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let bf = dir.path().join("data.bitfield");
        fs::write(&bf, vec![0xFFu8]).await.unwrap();
        let store = PieceStore::open(&dest, &bf, 16389, 16384, 2).await.unwrap();
        assert_eq!(store.saved_count(), 0);
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let bf = dir.path().join("data.bitfield");
        let mut store = PieceStore::open(&dest, &bf, 16389, 16384, 2).await.unwrap();
        store.save(0, &vec![7u8; 16384]).await.unwrap();
        store.save(0, &vec![7u8; 16384]).await.unwrap();
        assert_eq!(store.saved_count(), 1);
    }
}
