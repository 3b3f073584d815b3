//! Info-hash computation.
//!
//! The info-hash is the SHA-1 of the *exact bytes* that made up the `info`
//! dictionary in the source `.torrent` file — not a re-encoding of the
//! parsed value. Re-encoding would silently diverge from the original if a
//! torrent ever contained non-canonical key order or an unrecognized key,
//! which would desync us from every other client in the swarm.
use sha1::{Digest, Sha1};

/// Hashes a raw byte span (as located by
/// [`crate::bencode::decoder::find_top_level_value_span`]).
pub fn calculate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(info_dict_bytes);
    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);
    info_hash
}
