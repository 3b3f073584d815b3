//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers: building
//! and sending `announce` requests, decoding the bencoded response, and
//! fanning out across `announce-list` tiers (BEP-12) when the primary
//! tracker fails.
use crate::bencode::{decoder, BencodeValue};
use crate::torrent::TorrentFile;
use rand::Rng;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("tracker returned non-200 status: {0}")]
    HttpStatus(u16),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("no tracker in any tier yielded peers")]
    Exhausted,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// The `event` announce parameter (§4.C). `Empty` is sent as the literal
/// string `"empty"` for periodic refreshes once a session is underway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    Empty,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
            Event::Empty => "empty",
        }
    }
}

/// A peer as reported by the tracker. `peer_id` is empty when the tracker
/// did not supply one for that peer (compact announces, in particular).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: Vec<u8>,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub min_interval: Option<i64>,
    pub complete: Option<i64>,
    pub incomplete: Option<i64>,
    pub peers: Vec<Peer>,
}

/// A tracker client bound to one torrent session: a stable `peer_id` and the
/// port we advertise (the client never actually listens on it, see
/// Design Notes on inbound connections being out of scope).
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
            http: reqwest::Client::new(),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces to the torrent's trackers, trying the primary `announce`
    /// URL first and then each `announce-list` tier in order. Within a tier,
    /// trackers are tried until one yields at least one peer. A tier whose
    /// URLs are all non-HTTP(S) is skipped entirely.
    #[instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(
        &self,
        torrent: &TorrentFile,
        uploaded: i64,
        downloaded: i64,
        left: i64,
        event: Event,
    ) -> TrackerResult<AnnounceResponse> {
        let mut urls = vec![torrent.announce.clone()];
        for tier in &torrent.announce_list {
            urls.extend(tier.iter().cloned());
        }

        let mut last_err = None;
        for candidate in urls {
            if !is_http_scheme(&candidate) {
                continue;
            }
            match self
                .announce_one(&candidate, torrent, uploaded, downloaded, left, event)
                .await
            {
                Ok(response) if !response.peers.is_empty() => return Ok(response),
                Ok(response) => {
                    debug!(url = %candidate, "tracker returned zero peers");
                    last_err = None;
                    let _ = response;
                }
                Err(e) => {
                    warn!(url = %candidate, error = %e, "tracker announce failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Err(TrackerError::Exhausted),
        }
    }

    async fn announce_one(
        &self,
        announce_url: &str,
        torrent: &TorrentFile,
        uploaded: i64,
        downloaded: i64,
        left: i64,
        event: Event,
    ) -> TrackerResult<AnnounceResponse> {
        let mut url = url::Url::parse(announce_url)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("port", &self.port.to_string());
            pairs.append_pair("uploaded", &uploaded.to_string());
            pairs.append_pair("downloaded", &downloaded.to_string());
            pairs.append_pair("left", &left.to_string());
            pairs.append_pair("compact", "0");
            pairs.append_pair("numwant", "50");
            pairs.append_pair("event", event.as_str());
        }
        // info_hash/peer_id are raw 20-byte strings; url's query-pair encoder
        // assumes UTF-8 text, so we append their percent-encoding by hand.
        let mut full_url = url.to_string();
        full_url.push_str("&info_hash=");
        full_url.push_str(&percent_encode_bytes(&torrent.info_hash));
        full_url.push_str("&peer_id=");
        full_url.push_str(&percent_encode_bytes(&self.peer_id));

        debug!(url = %full_url, "making announce request");
        let response = self.http.get(&full_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus(status.as_u16()));
        }
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

fn is_http_scheme(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let top = decoder::decode_top_level(bytes)?;
    let dict = top
        .as_dict()
        .expect("decode_top_level guarantees a dict");

    if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(BencodeValue::as_string) {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }
    if let Some(warning) = dict.get(b"warning message".as_slice()).and_then(BencodeValue::as_string) {
        warn!(message = %String::from_utf8_lossy(warning), "tracker warning");
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(BencodeValue::as_integer)
        .unwrap_or(0);
    let min_interval = dict
        .get(b"min interval".as_slice())
        .and_then(BencodeValue::as_integer);
    let complete = dict.get(b"complete".as_slice()).and_then(BencodeValue::as_integer);
    let incomplete = dict
        .get(b"incomplete".as_slice())
        .and_then(BencodeValue::as_integer);

    let peers = match dict.get(b"peers".as_slice()) {
        Some(BencodeValue::List(list)) => parse_dict_peers(list)?,
        Some(BencodeValue::String(_)) => {
            warn!("tracker returned compact peers, which this client does not support");
            Vec::new()
        }
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        min_interval,
        complete,
        incomplete,
        peers,
    })
}

fn parse_dict_peers(list: &[BencodeValue]) -> TrackerResult<Vec<Peer>> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let Some(dict) = entry.as_dict() else {
            continue;
        };
        let Some(ip_bytes) = dict.get(b"ip".as_slice()).and_then(BencodeValue::as_string) else {
            continue;
        };
        let Ok(ip_str) = std::str::from_utf8(ip_bytes) else {
            continue;
        };
        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            continue;
        };
        let Some(port) = dict.get(b"port".as_slice()).and_then(BencodeValue::as_integer) else {
            continue;
        };
        let peer_id = dict
            .get(b"peer id".as_slice())
            .and_then(BencodeValue::as_string)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        peers.push(Peer {
            peer_id,
            ip,
            port: port as u16,
        });
    }
    Ok(peers)
}

/// Generates a unique peer ID: a 9-byte Azureus-style prefix identifying
/// this client, followed by 11 random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes raw bytes per RFC 3986, for `info_hash`/`peer_id` query
/// parameters which are not valid UTF-8 text.
pub fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encodes_non_unreserved_bytes() {
        assert_eq!(percent_encode_bytes(b"Hello World!"), "Hello%20World%21");
    }

    #[test]
    fn parses_dict_peers_response() {
        let body = b"d8:intervali1800e5:peersld7:peer id20:aaaaaaaaaaaaaaaaaaaa2:ip9:127.0.0.14:porti6881eeee";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn compact_peers_yield_empty_list_not_error() {
        let body = b"d8:intervali1800e5:peers6:\0\0\0\0\0\0e";
        let response = parse_announce_response(body).unwrap();
        assert!(response.peers.is_empty());
    }

    #[test]
    fn failure_reason_surfaces_as_error() {
        let body = b"d14:failure reason13:torrent dead!e";
        assert!(matches!(
            parse_announce_response(body),
            Err(TrackerError::Failure(_))
        ));
    }

    #[test]
    fn non_http_scheme_is_not_announceable() {
        assert!(!is_http_scheme("udp://tracker.example.com:80"));
        assert!(is_http_scheme("http://tracker.example.com"));
        assert!(is_http_scheme("https://tracker.example.com"));
    }
}
