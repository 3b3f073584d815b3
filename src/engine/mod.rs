//! Download engine (§4.F): owns the shared queues, runs a standing
//! tracker fan-out that feeds a fixed pool of peer workers, dispatches
//! piece tasks, and drives the run to completion.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::peer::PeerWorker;
use crate::progress::{ProgressMeter, ProgressSnapshot};
use crate::store::{self, PieceStore, StoreError};
use crate::torrent::{TorrentError, TorrentFile};
use crate::tracker::{self, AnnounceResponse, Event, Peer, TrackerError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// One unit of work handed to a peer worker: download piece `index` and
/// verify it against `hash`.
#[derive(Debug, Clone)]
pub struct Task {
    pub index: usize,
    pub hash: [u8; 20],
    pub length: i64,
}

/// A verified piece ready to be written to disk.
#[derive(Debug)]
pub struct SaveTask {
    pub index: usize,
    pub bytes: Vec<u8>,
}

const TASK_Q_CAPACITY: usize = 100;
const SAVE_Q_CAPACITY: usize = 100;
const FANOUT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const FANOUT_MIN_INTERVAL_SECS: i64 = 30;

/// Orchestrates one torrent's download from metainfo parsing through
/// completion. `start` runs the whole pipeline to completion; `stop`
/// requests early cancellation from another task.
pub struct DownloadEngine {
    config: Config,
    progress: Arc<Mutex<ProgressMeter>>,
    peers: Arc<Mutex<HashMap<usize, Peer>>>,
    cancel_tx: broadcast::Sender<()>,
}

impl DownloadEngine {
    pub fn new(config: Config) -> Self {
        let (cancel_tx, _) = broadcast::channel(1);
        Self {
            config,
            progress: Arc::new(Mutex::new(ProgressMeter::new(0))),
            peers: Arc::new(Mutex::new(HashMap::new())),
            cancel_tx,
        }
    }

    /// Requests cancellation. Workers exit at their next safe point; the
    /// dispatcher stops forwarding fallback retries.
    pub fn stop(&self) {
        let _ = self.cancel_tx.send(());
    }

    pub async fn progress(&self) -> ProgressSnapshot {
        self.progress.lock().await.snapshot()
    }

    /// A clone of the shared progress handle, for callers that want to
    /// poll it from a separate task while `start` runs.
    pub fn progress_handle(&self) -> Arc<Mutex<ProgressMeter>> {
        self.progress.clone()
    }

    pub async fn peers(&self) -> HashMap<usize, Peer> {
        self.peers.lock().await.clone()
    }

    /// Runs the download to completion or cancellation.
    #[instrument(skip(self), fields(torrent = %self.config.torrent_path.display()))]
    pub async fn start(&mut self) -> EngineResult<()> {
        let data = tokio::fs::read(&self.config.torrent_path).await?;
        let torrent = Arc::new(TorrentFile::parse(&data)?);
        let total_length = torrent.total_length();
        let num_pieces = torrent.num_pieces();
        info!(
            info_hash = %hex::encode(torrent.info_hash),
            name = %torrent.info.name,
            num_pieces,
            total_length,
            "parsed torrent metainfo"
        );
        *self.progress.lock().await = ProgressMeter::new(total_length.max(0) as u64);

        let dest_path = self.config.dest_dir.join(&torrent.info.name);
        let bf_path = store::bitfield_path(&self.config.bitfield_dir, &torrent.info.name);
        let mut piece_store = PieceStore::open(
            &dest_path,
            &bf_path,
            total_length,
            torrent.info.piece_length,
            num_pieces,
        )
        .await?;
        let initial_bitfield = piece_store.bitfield_snapshot();
        self.progress
            .lock()
            .await
            .record(piece_store.saved_count() as u64 * torrent.info.piece_length as u64);

        let remaining_pieces = num_pieces - piece_store.saved_count();
        if remaining_pieces == 0 {
            info!("torrent already complete");
            return Ok(());
        }

        let tracker_client = tracker::Client::new(self.config.listen_port);
        let our_peer_id = tracker_client.peer_id();
        let left = total_length - piece_store.saved_count() as i64 * torrent.info.piece_length;

        let worker_count = self.config.worker_count;
        let (task_tx, task_rx) = mpsc::channel::<Task>(TASK_Q_CAPACITY);
        let (fallback_tx, fallback_rx) = mpsc::channel::<Task>(worker_count + 1);
        let (save_tx, mut save_rx) = mpsc::channel::<SaveTask>(SAVE_Q_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::channel::<Peer>(worker_count);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let peer_rx = Arc::new(Mutex::new(peer_rx));

        let fanout_torrent = torrent.clone();
        let fanout_peers = self.peers.clone();
        let fanout_cancel = self.cancel_tx.subscribe();
        let fanout_handle = tokio::spawn(run_tracker_fanout(
            tracker_client,
            fanout_torrent,
            left.max(0),
            peer_tx,
            fanout_peers,
            fanout_cancel,
        ));

        let mut worker_handles = Vec::new();
        for worker_id in 0..worker_count {
            let worker = PeerWorker::new(
                worker_id,
                peer_rx.clone(),
                torrent.info_hash,
                our_peer_id,
                initial_bitfield.clone(),
                task_rx.clone(),
                fallback_tx.clone(),
                save_tx.clone(),
                self.cancel_tx.subscribe(),
            );
            worker_handles.push(tokio::spawn(worker.run()));
        }
        drop(fallback_tx);
        drop(save_tx);

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let progress = self.progress.clone();
        let store_task = tokio::spawn(async move {
            let mut done_tx = Some(done_tx);
            while let Some(save_task) = save_rx.recv().await {
                let len = save_task.bytes.len() as u64;
                if let Err(e) = piece_store.save(save_task.index, &save_task.bytes).await {
                    error!(error = %e, "store write failed, tearing down");
                    break;
                }
                progress.lock().await.record(len);
                info!(
                    index = save_task.index,
                    saved = piece_store.saved_count(),
                    total = num_pieces,
                    "piece saved"
                );
                if piece_store.is_complete() {
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.send(());
                    }
                    break;
                }
            }
        });

        let dispatcher_bitfield = initial_bitfield.clone();
        let dispatcher_torrent = torrent.clone();
        let mut dispatcher_cancel = self.cancel_tx.subscribe();
        let dispatcher = tokio::spawn(async move {
            let mut fallback_rx = fallback_rx;
            for index in 0..num_pieces {
                if store::is_set(&dispatcher_bitfield, index) {
                    continue;
                }
                while let Ok(fb) = fallback_rx.try_recv() {
                    if task_tx.send(fb).await.is_err() {
                        return;
                    }
                }
                let task = Task {
                    index,
                    hash: dispatcher_torrent.pieces_hash[index],
                    length: dispatcher_torrent.piece_size(index),
                };
                tokio::select! {
                    _ = dispatcher_cancel.recv() => return,
                    result = task_tx.send(task) => if result.is_err() { return },
                }
            }
            loop {
                tokio::select! {
                    _ = dispatcher_cancel.recv() => return,
                    fb = fallback_rx.recv() => match fb {
                        Some(task) => if task_tx.send(task).await.is_err() { return },
                        None => return,
                    },
                }
            }
        });

        tokio::select! {
            _ = done_rx => {},
            _ = self.wait_for_cancel() => {
                warn!("download cancelled before completion");
            }
        }
        self.stop();
        dispatcher.abort();
        fanout_handle.abort();
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = store_task.await;

        Ok(())
    }

    async fn wait_for_cancel(&self) {
        let mut rx = self.cancel_tx.subscribe();
        let _ = rx.recv().await;
    }
}

/// Standing peer-intake loop (§4.E/§4.F), grounded on the original
/// client's `FetchPeers`: re-announces to the tracker forever, pushing
/// every returned peer into `peer_tx` for the worker pool to pick up.
/// Unlike the original, a failed announce is logged and retried after a
/// backoff rather than aborting the whole download, and the interval
/// between announces is taken from the tracker's response instead of
/// looping as fast as the network allows.
async fn run_tracker_fanout(
    client: tracker::Client,
    torrent: Arc<TorrentFile>,
    left: i64,
    peer_tx: mpsc::Sender<Peer>,
    known_peers: Arc<Mutex<HashMap<usize, Peer>>>,
    mut cancel_rx: broadcast::Receiver<()>,
) {
    let mut event = Event::Started;
    let mut next_id = 0usize;
    loop {
        let wait = match client.announce(&torrent, 0, 0, left, event).await {
            Ok(response) => {
                for peer in &response.peers {
                    let id = next_id;
                    next_id += 1;
                    known_peers.lock().await.insert(id, peer.clone());
                    if peer_tx.send(peer.clone()).await.is_err() {
                        return;
                    }
                }
                reannounce_interval(&response)
            }
            Err(e) => {
                warn!(error = %e, "tracker announce failed, retrying");
                FANOUT_RETRY_INTERVAL
            }
        };
        event = Event::Empty;

        tokio::select! {
            _ = cancel_rx.recv() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn reannounce_interval(response: &AnnounceResponse) -> Duration {
    let secs = response
        .min_interval
        .unwrap_or(response.interval)
        .max(FANOUT_MIN_INTERVAL_SECS);
    Duration::from_secs(secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_carries_piece_metadata() {
        let task = Task {
            index: 3,
            hash: [1u8; 20],
            length: 16384,
        };
        assert_eq!(task.index, 3);
        assert_eq!(task.length, 16384);
    }
}
