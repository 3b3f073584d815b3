//! Per-peer state machine (§4.E): dial, handshake, bitfield exchange,
//! then a task loop that pipelines block requests and verifies each
//! assembled piece before handing it to the save queue. A worker is not
//! bound to one peer for its life: it pulls peers from a shared intake
//! queue, and a dial/handshake/session failure sends it back to pull
//! the next one rather than ending the worker.
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, timeout};
use tracing::{debug, instrument, warn};

use crate::engine::{SaveTask, Task};
use crate::store;
use crate::tracker::Peer;

use super::{Handshake, Message, PeerError, PeerResult};

const BLOCK_SIZE: u32 = 16384;
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Pulls peers off the shared intake queue and drives each one through
/// the piece pipeline in turn. On a clean exit (task queue drained) the
/// worker stops; on any dial, handshake, or session failure it discards
/// the peer and loops back to pull the next one (§4.E steps 1-2).
pub struct PeerWorker {
    id: usize,
    peer_rx: Arc<Mutex<mpsc::Receiver<Peer>>>,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    our_bitfield: Vec<u8>,
    task_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    fallback_tx: mpsc::Sender<Task>,
    save_tx: mpsc::Sender<SaveTask>,
    cancel_rx: broadcast::Receiver<()>,
}

impl PeerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        peer_rx: Arc<Mutex<mpsc::Receiver<Peer>>>,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        our_bitfield: Vec<u8>,
        task_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
        fallback_tx: mpsc::Sender<Task>,
        save_tx: mpsc::Sender<SaveTask>,
        cancel_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            peer_rx,
            info_hash,
            our_peer_id,
            our_bitfield,
            task_rx,
            fallback_tx,
            save_tx,
            cancel_rx,
        }
    }

    /// Outer peer-intake loop (§4.E): pull the next peer, run one
    /// session against it, and on failure go back for another. Ends
    /// only when the intake queue closes or cancellation fires.
    #[instrument(skip(self), fields(worker = self.id))]
    pub async fn run(mut self) {
        loop {
            let peer = {
                let mut rx = self.peer_rx.lock().await;
                tokio::select! {
                    _ = self.cancel_rx.recv() => return,
                    peer = rx.recv() => peer,
                }
            };
            let Some(peer) = peer else {
                return;
            };

            match self.run_session(&peer).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(peer = %peer.ip, port = peer.port, error = %e, "peer session ended, returning to intake");
                }
            }
        }
    }

    async fn run_session(&mut self, peer: &Peer) -> PeerResult<()> {
        let addr = std::net::SocketAddr::new(peer.ip, peer.port);
        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::DialTimeout)??;

        let expected_peer_id = if peer.peer_id.is_empty() {
            None
        } else {
            Some(peer.peer_id.as_slice())
        };
        Handshake::perform(&mut stream, self.info_hash, self.our_peer_id, expected_peer_id).await?;

        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(8);
        let writer_handle = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let keepalive_tx = out_tx.clone();
        let keepalive_handle = tokio::spawn(async move {
            let mut ticker = interval(KEEPALIVE_INTERVAL);
            ticker.tick().await; // first tick fires immediately; consume it
            loop {
                ticker.tick().await;
                if keepalive_tx.send(Message::KeepAlive.encode()).await.is_err() {
                    break;
                }
            }
        });

        let result = self.drive(&mut read_half, &out_tx).await;

        drop(out_tx);
        keepalive_handle.abort();
        let _ = writer_handle.await;
        result
    }

    async fn drive<R>(&mut self, reader: &mut R, out_tx: &mpsc::Sender<Vec<u8>>) -> PeerResult<()>
    where
        R: AsyncReadExt + Unpin,
    {
        out_tx
            .send(Message::Bitfield(self.our_bitfield.clone()).encode())
            .await
            .map_err(|_| PeerError::Closed)?;

        let mut peer_choking = true;
        let mut am_interested = false;
        let mut peer_bitfield = vec![0u8; self.our_bitfield.len()];

        loop {
            tokio::select! {
                _ = self.cancel_rx.recv() => return Ok(()),
                msg = Message::read_from(reader) => {
                    match msg? {
                        Message::Bitfield(bits) => { peer_bitfield = bits; break; }
                        Message::Unchoke => peer_choking = false,
                        _ => {}
                    }
                }
            }
        }

        loop {
            let task = {
                let mut rx = self.task_rx.lock().await;
                tokio::select! {
                    _ = self.cancel_rx.recv() => return Ok(()),
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else {
                return Ok(());
            };

            if !store::is_set(&peer_bitfield, task.index) {
                let _ = self.fallback_tx.send(task).await;
                continue;
            }

            if !am_interested {
                out_tx
                    .send(Message::Interested.encode())
                    .await
                    .map_err(|_| PeerError::Closed)?;
                am_interested = true;
            }

            while peer_choking {
                tokio::select! {
                    _ = self.cancel_rx.recv() => return Ok(()),
                    msg = Message::read_from(reader) => {
                        match msg? {
                            Message::Unchoke => peer_choking = false,
                            Message::Choke => peer_choking = true,
                            Message::Have(index) => store::set(&mut peer_bitfield, index as usize),
                            _ => {}
                        }
                    }
                }
            }

            match self.download_piece(reader, out_tx, &task).await {
                Ok(bytes) => {
                    self.save_tx
                        .send(SaveTask { index: task.index, bytes })
                        .await
                        .map_err(|_| PeerError::Closed)?;
                }
                Err(PeerError::HashMismatch(index)) => {
                    debug!(index, "piece hash mismatch, returning to fallback");
                    let _ = self.fallback_tx.send(task).await;
                }
                Err(e) => {
                    let _ = self.fallback_tx.send(task).await;
                    return Err(e);
                }
            }
        }
    }

    /// Pipelines all block requests for `task` up front, then drains
    /// responses in order, dropping any response that doesn't match the
    /// index and expected next offset without advancing (§4.E step 5).
    async fn download_piece<R>(
        &mut self,
        reader: &mut R,
        out_tx: &mpsc::Sender<Vec<u8>>,
        task: &Task,
    ) -> PeerResult<Vec<u8>>
    where
        R: AsyncReadExt + Unpin,
    {
        let piece_len = task.length as u32;
        let num_blocks = piece_len.div_ceil(BLOCK_SIZE);
        for block_index in 0..num_blocks {
            let begin = block_index * BLOCK_SIZE;
            let length = BLOCK_SIZE.min(piece_len - begin);
            out_tx
                .send(
                    Message::Request {
                        index: task.index as u32,
                        begin,
                        length,
                    }
                    .encode(),
                )
                .await
                .map_err(|_| PeerError::Closed)?;
        }

        let mut buffer = vec![0u8; piece_len as usize];
        let mut blocks_received = 0u32;
        let mut expected_begin = 0u32;
        while blocks_received < num_blocks {
            let msg = tokio::select! {
                _ = self.cancel_rx.recv() => return Err(PeerError::Closed),
                msg = Message::read_from(reader) => msg?,
            };
            match msg {
                Message::Piece { index, begin, block }
                    if index as usize == task.index && begin == expected_begin =>
                {
                    let len = block.len();
                    buffer[begin as usize..begin as usize + len].copy_from_slice(&block);
                    expected_begin += len as u32;
                    blocks_received += 1;
                }
                Message::Piece { .. } => continue,
                // Have/Choke/Unchoke mid-piece are picked up on the next
                // task's choke-wait; dropping them here is safe since the
                // pipeline for this piece is already committed.
                _ => {}
            }
        }

        let mut hasher = Sha1::new();
        hasher.update(&buffer);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != task.hash {
            return Err(PeerError::HashMismatch(task.index));
        }
        Ok(buffer)
    }
}
