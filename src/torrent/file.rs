//! Torrent file structure and parsing logic.
//!
//! This module defines [`TorrentFile`] and the helpers that turn a raw
//! `.torrent` byte buffer into it, including the info-hash computation that
//! depends on the *exact* byte span of the `info` dictionary.
use crate::bencode::decoder;
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;

use super::{TorrentError, TorrentResult};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: Option<i64>,
    pub files: Vec<FileDict>,
    pub is_directory: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

/// Splits the concatenated `pieces` blob into individual 20-byte SHA-1
/// digests, one per piece, in piece-index order.
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn utf8_field(bytes: Vec<u8>, field: &str) -> TorrentResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| TorrentError::InvalidFormat(format!("{field} is not valid UTF-8: {e}")))
}

/// Parses the (optional) `announce-list` field: a list of tiers, each a list
/// of tracker URLs (BEP-12).
fn parse_announce_list(value: &BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("announce-list is not a list".to_string()))?;
    tiers
        .iter()
        .map(|tier| {
            let trackers = tier.as_list().ok_or_else(|| {
                TorrentError::InvalidFormat("announce-list tier is not a list".to_string())
            })?;
            trackers
                .iter()
                .map(|url| {
                    let bytes = url.as_string().ok_or_else(|| {
                        TorrentError::InvalidFormat("tracker URL is not a string".to_string())
                    })?;
                    utf8_field(bytes.to_vec(), "tracker URL")
                })
                .collect()
        })
        .collect()
}

fn parse_info_dict(value: &BencodeValue) -> TorrentResult<InfoDict> {
    let dict = value
        .as_dict()
        .ok_or_else(|| TorrentError::InvalidFormat("info is not a dictionary".to_string()))?;

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(BencodeValue::as_integer)
        .ok_or_else(|| TorrentError::MissingField("piece length".to_string()))?;
    if piece_length <= 0 {
        return Err(TorrentError::InvalidFormat(
            "piece length must be positive".to_string(),
        ));
    }

    let pieces = dict
        .get(b"pieces".as_slice())
        .and_then(BencodeValue::as_string)
        .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?
        .to_vec();

    let private = matches!(
        dict.get(b"private".as_slice()).and_then(BencodeValue::as_integer),
        Some(1)
    );

    let name = dict
        .get(b"name".as_slice())
        .and_then(BencodeValue::as_string)
        .ok_or_else(|| TorrentError::MissingField("name".to_string()))
        .and_then(|s| utf8_field(s.to_vec(), "name"))?;

    let length = dict.get(b"length".as_slice()).and_then(BencodeValue::as_integer);

    let files = match dict.get(b"files".as_slice()) {
        Some(BencodeValue::List(list)) => list
            .iter()
            .map(|entry| {
                let file_dict = entry.as_dict().ok_or_else(|| {
                    TorrentError::InvalidFormat("file entry is not a dictionary".to_string())
                })?;
                let length = file_dict
                    .get(b"length".as_slice())
                    .and_then(BencodeValue::as_integer)
                    .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?;
                let path_list = file_dict
                    .get(b"path".as_slice())
                    .and_then(BencodeValue::as_list)
                    .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
                let path = path_list
                    .iter()
                    .map(|component| {
                        let s = component.as_string().ok_or_else(|| {
                            TorrentError::InvalidFormat(
                                "file path component is not a string".to_string(),
                            )
                        })?;
                        utf8_field(s.to_vec(), "file path component")
                    })
                    .collect::<TorrentResult<Vec<_>>>()?;
                Ok(FileDict { length, path })
            })
            .collect::<TorrentResult<Vec<_>>>()?,
        _ => Vec::new(),
    };

    if length.is_none() && files.is_empty() {
        return Err(TorrentError::MissingField(
            "length (single-file) or files (multi-file)".to_string(),
        ));
    }

    let is_directory = !files.is_empty();

    Ok(InfoDict {
        piece_length,
        pieces,
        private,
        name,
        length,
        files,
        is_directory,
    })
}

impl TorrentFile {
    /// Total byte length of the torrent's content.
    pub fn total_length(&self) -> i64 {
        if !self.info.is_directory {
            self.info.length.unwrap_or(0)
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    pub fn is_single_file(&self) -> bool {
        !self.info.is_directory
    }

    /// Length of piece `index`. The last piece is short unless the total
    /// length is an exact multiple of `piece_length`, in which case it is
    /// full-length (see Design Notes: the "zero remainder" correction).
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            let total_length = self.total_length();
            let full_pieces_length = (self.num_pieces() - 1) as i64 * self.info.piece_length;
            let remainder = total_length - full_pieces_length;
            if remainder == 0 {
                self.info.piece_length
            } else {
                remainder
            }
        }
    }

    /// File paths (relative to the torrent's destination directory) that
    /// overlap the byte range of piece `index`. For single-file torrents
    /// this is always a single path equal to `info.name`.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        if !self.info.is_directory {
            return vec![PathBuf::from(&self.info.name)];
        }
        let piece_start = (index as i64) * self.info.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut current_position: i64 = 0;
        let mut result_paths = Vec::new();
        for file_info in &self.info.files {
            let file_start = current_position;
            let file_end = file_start + file_info.length;
            if file_end > piece_start && file_start < piece_end {
                let mut full_path = PathBuf::from(&self.info.name);
                for component in &file_info.path {
                    full_path = full_path.join(component);
                }
                result_paths.push(full_path);
            }
            current_position = file_end;
        }
        result_paths
    }

    /// Parses a raw `.torrent` byte buffer into a [`TorrentFile`].
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn parse(data: &[u8]) -> TorrentResult<TorrentFile> {
        let top_level = decoder::decode_top_level(data)?;
        let dict = top_level.as_dict().expect("decode_top_level guarantees a dict");

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(BencodeValue::as_string)
            .ok_or_else(|| TorrentError::MissingField("announce".to_string()))
            .and_then(|s| utf8_field(s.to_vec(), "announce"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info = parse_info_dict(info_value)?;

        let (info_start, info_end) = decoder::find_top_level_value_span(data, b"info")?
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_hash = info_hash::calculate_info_hash(&data[info_start..info_end]);

        let announce_list = match dict.get(b"announce-list".as_slice()) {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };

        let creation_date = match dict.get(b"creation date".as_slice()) {
            Some(BencodeValue::Integer(timestamp)) => {
                let secs: u64 = (*timestamp)
                    .try_into()
                    .map_err(|_| TorrentError::InvalidFormat("creation date out of range".to_string()))?;
                Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            }
            None => None,
            Some(_) => {
                return Err(TorrentError::InvalidFormat(
                    "creation date is not an integer".to_string(),
                ))
            }
        };

        let comment = match dict.get(b"comment".as_slice()) {
            Some(v) => v.as_string().map(|s| s.to_vec()).unwrap_or_default(),
            None => Vec::new(),
        };
        let created_by = match dict.get(b"created by".as_slice()) {
            Some(v) => v.as_string().map(|s| s.to_vec()).unwrap_or_default(),
            None => Vec::new(),
        };

        let pieces_hash = parse_pieces(&info.pieces)?;

        Ok(TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment: String::from_utf8_lossy(&comment).into_owned(),
            created_by: String::from_utf8_lossy(&created_by).into_owned(),
            info,
            info_hash,
            pieces_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"d8:announce35:http://tracker.example.com/announce13:announce-listll35:http://tracker.example.com/announceel36:http://tracker2.example.com/announceee4:infod6:lengthi123456e4:name4:spam12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";

    #[test]
    fn parses_sample_metainfo() {
        let torrent = TorrentFile::parse(SAMPLE).unwrap();
        assert_eq!(torrent.announce, "http://tracker.example.com/announce");
        assert_eq!(torrent.announce_list.len(), 2);
        assert_eq!(torrent.info.length, Some(123456));
        assert_eq!(torrent.info.name, "spam");
        assert_eq!(torrent.info.piece_length, 16384);
        assert_eq!(torrent.pieces_hash, vec![[b'a'; 20]]);

        let expected_info_bytes: &[u8] =
            b"d6:lengthi123456e4:name4:spam12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let expected_hash = info_hash::calculate_info_hash(expected_info_bytes);
        assert_eq!(torrent.info_hash, expected_hash);
    }

    #[test]
    fn last_piece_zero_remainder_is_full_length() {
        // total_length is an exact multiple of piece_length: 2 pieces of 16384.
        let data = b"d8:announce3:foo4:infod6:lengthi32768e4:name4:spam12:piece lengthi16384e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbee";
        let torrent = TorrentFile::parse(data).unwrap();
        assert_eq!(torrent.num_pieces(), 2);
        assert_eq!(torrent.piece_size(1), 16384);
    }

    #[test]
    fn last_piece_short_remainder() {
        let data = b"d8:announce3:foo4:infod6:lengthi16389e4:name4:spam12:piece lengthi16384e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbee";
        let torrent = TorrentFile::parse(data).unwrap();
        assert_eq!(torrent.piece_size(0), 16384);
        assert_eq!(torrent.piece_size(1), 5);
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        let data = b"d8:announce3:foo4:infod6:lengthi1e4:name4:spam12:piece lengthi16384e6:pieces3:abcee";
        assert!(TorrentFile::parse(data).is_err());
    }
}
