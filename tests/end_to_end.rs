//! End-to-end download against a stub tracker and a stub peer, mirroring
//! the shape of a real swarm without touching the network. Covers the
//! two-piece scenario plus resumability across a restart.
use std::collections::BTreeMap;

use rs_torrent_client::bencode::{encoder, BencodeValue};
use rs_torrent_client::config::Config;
use rs_torrent_client::engine::DownloadEngine;
use rs_torrent_client::peer::{Handshake, Message};
use rs_torrent_client::store;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PIECE_LENGTH: i64 = 16384;
const TOTAL_LENGTH: i64 = 16384 + 5;

fn piece_bytes() -> (Vec<u8>, Vec<u8>) {
    let piece0 = vec![0xABu8; PIECE_LENGTH as usize];
    let piece1 = vec![0xCDu8; 5];
    (piece0, piece1)
}

fn build_torrent_bytes(announce_url: &str, piece0: &[u8], piece1: &[u8]) -> (Vec<u8>, [u8; 20]) {
    let hash0: [u8; 20] = Sha1::digest(piece0).into();
    let hash1: [u8; 20] = Sha1::digest(piece1).into();
    let mut pieces = Vec::new();
    pieces.extend_from_slice(&hash0);
    pieces.extend_from_slice(&hash1);

    let mut info = BTreeMap::new();
    info.insert(b"piece length".to_vec(), BencodeValue::Integer(PIECE_LENGTH));
    info.insert(b"pieces".to_vec(), BencodeValue::String(pieces));
    info.insert(b"name".to_vec(), BencodeValue::String(b"stub.bin".to_vec()));
    info.insert(b"length".to_vec(), BencodeValue::Integer(TOTAL_LENGTH));
    let info_value = BencodeValue::Dict(info);
    let info_bytes = encoder::encode_to_vec(&info_value).unwrap();
    let info_hash: [u8; 20] = Sha1::digest(&info_bytes).into();

    let mut top = BTreeMap::new();
    top.insert(
        b"announce".to_vec(),
        BencodeValue::String(announce_url.as_bytes().to_vec()),
    );
    top.insert(b"info".to_vec(), info_value);
    let bytes = encoder::encode_to_vec(&BencodeValue::Dict(top)).unwrap();
    (bytes, info_hash)
}

fn bencode_announce_response(peer_port: u16) -> Vec<u8> {
    let mut peer = BTreeMap::new();
    peer.insert(b"ip".to_vec(), BencodeValue::String(b"127.0.0.1".to_vec()));
    peer.insert(b"port".to_vec(), BencodeValue::Integer(peer_port as i64));

    let mut top = BTreeMap::new();
    top.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
    top.insert(
        b"peers".to_vec(),
        BencodeValue::List(vec![BencodeValue::Dict(peer)]),
    );
    encoder::encode_to_vec(&BencodeValue::Dict(top)).unwrap()
}

/// Accepts one HTTP GET and replies with a bencoded announce response
/// pointing at `peer_port`. Runs once, for the single announce this test
/// drives.
async fn run_stub_tracker(listener: TcpListener, peer_port: u16) {
    if let Ok((mut stream, _)) = listener.accept().await {
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await;
        let body = bencode_announce_response(peer_port);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.write_all(&body).await;
        let _ = stream.shutdown().await;
    }
}

/// Speaks just enough BitTorrent wire protocol to serve a two-piece
/// torrent to exactly one connecting peer worker.
async fn run_stub_peer(listener: TcpListener, info_hash: [u8; 20], piece0: Vec<u8>, piece1: Vec<u8>) {
    let Ok((mut stream, _)) = listener.accept().await else {
        return;
    };

    let their_handshake = Handshake::read(&mut stream).await.expect("read handshake");
    assert_eq!(their_handshake.info_hash, info_hash);
    Handshake::new(info_hash, [9u8; 20])
        .write(&mut stream)
        .await
        .expect("write handshake");

    // Advertise both pieces available.
    Message::Bitfield(vec![0b1100_0000])
        .write_to(&mut stream)
        .await
        .expect("send bitfield");

    let msg = Message::read_from(&mut stream).await.expect("read interested");
    assert_eq!(msg, Message::Interested);

    Message::Unchoke.write_to(&mut stream).await.expect("send unchoke");

    for _ in 0..2 {
        let msg = Message::read_from(&mut stream).await.expect("read request");
        let Message::Request { index, begin, length } = msg else {
            panic!("expected Request, got {msg:?}");
        };
        assert_eq!(begin, 0);
        let block = match index {
            0 => piece0[..length as usize].to_vec(),
            1 => piece1[..length as usize].to_vec(),
            other => panic!("unexpected piece index {other}"),
        };
        Message::Piece { index, begin, block }
            .write_to(&mut stream)
            .await
            .expect("send piece");
    }

    // Keep the connection open briefly so the worker's save send lands
    // before this task (and the listener) drop.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}

#[tokio::test]
async fn downloads_two_piece_torrent_end_to_end() {
    let (piece0, piece1) = piece_bytes();

    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer_listener.local_addr().unwrap().port();

    let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tracker_port = tracker_listener.local_addr().unwrap().port();
    let announce_url = format!("http://127.0.0.1:{tracker_port}/announce");

    let (torrent_bytes, info_hash) = build_torrent_bytes(&announce_url, &piece0, &piece1);

    let dir = tempfile::tempdir().unwrap();
    let torrent_path = dir.path().join("stub.torrent");
    tokio::fs::write(&torrent_path, &torrent_bytes).await.unwrap();
    let dest_dir = dir.path().join("dest");
    let bitfield_dir = dir.path().join("bitfield");

    let tracker_task = tokio::spawn(run_stub_tracker(tracker_listener, peer_port));
    let peer_task = tokio::spawn(run_stub_peer(
        peer_listener,
        info_hash,
        piece0.clone(),
        piece1.clone(),
    ));

    let config = Config::new(torrent_path, dest_dir.clone(), Some(bitfield_dir.clone()), Some(1), None).unwrap();
    let mut engine = DownloadEngine::new(config);
    engine.start().await.expect("download should succeed");

    tracker_task.await.unwrap();
    peer_task.await.unwrap();

    let downloaded = tokio::fs::read(dest_dir.join("stub.bin")).await.unwrap();
    assert_eq!(downloaded.len(), TOTAL_LENGTH as usize);
    assert_eq!(&downloaded[..PIECE_LENGTH as usize], piece0.as_slice());
    assert_eq!(&downloaded[PIECE_LENGTH as usize..], piece1.as_slice());

    let bitfield = tokio::fs::read(store::bitfield_path(&bitfield_dir, "stub.bin"))
        .await
        .unwrap();
    assert_eq!(bitfield, vec![0b1100_0000]);

    let progress = engine.progress().await;
    assert_eq!(progress.downloaded, TOTAL_LENGTH as u64);
    assert_eq!(progress.percent, 100.0);
}

#[tokio::test]
async fn rerunning_against_a_complete_download_is_a_noop() {
    let (piece0, piece1) = piece_bytes();
    let announce_url = "http://127.0.0.1:1/announce"; // never dialed: store is already complete
    let (torrent_bytes, _info_hash) = build_torrent_bytes(announce_url, &piece0, &piece1);

    let dir = tempfile::tempdir().unwrap();
    let torrent_path = dir.path().join("stub.torrent");
    tokio::fs::write(&torrent_path, &torrent_bytes).await.unwrap();
    let dest_dir = dir.path().join("dest");
    let bitfield_dir = dir.path().join("bitfield");
    tokio::fs::create_dir_all(&dest_dir).await.unwrap();

    let mut full = piece0.clone();
    full.extend_from_slice(&piece1);
    tokio::fs::write(dest_dir.join("stub.bin"), &full).await.unwrap();
    tokio::fs::create_dir_all(&bitfield_dir).await.unwrap();
    tokio::fs::write(store::bitfield_path(&bitfield_dir, "stub.bin"), vec![0b1100_0000])
        .await
        .unwrap();

    let config = Config::new(torrent_path, dest_dir, Some(bitfield_dir), Some(1), None).unwrap();
    let mut engine = DownloadEngine::new(config);
    engine.start().await.expect("already-complete download should short-circuit");
}
