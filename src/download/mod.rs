//! The download orchestrator: a shared work queue, one worker per peer, requeue-on-failure,
//! SHA-1 verification, and the streams/counters an external caller observes progress through.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::peer::{PeerConnection, PeerConnectionError, PieceResult, PieceTask};
use crate::torrent::Metainfo;
use crate::tracker::{PeerInfo, TrackerClient, TrackerError};

/// Error stream capacity (§4.G): bounded and advisory, silently drops overflow.
const ERROR_STREAM_CAPACITY: usize = 50;

#[derive(Debug, Error)]
pub enum BuildTaskError {
    #[error("tracker announce failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("multi-file torrents are not downloadable: metainfo has no top-level `length` field")]
    MultiFileNotSupported,
}

pub type BuildTaskResult<T> = std::result::Result<T, BuildTaskError>;

/// Advisory error surfaced on [`DownloadContext::errors`]. Never stops the download; completion
/// is defined solely by `pieces_done == N`.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("peer connection failed: {0}")]
    PeerConnection(String),

    #[error("piece {0} failed SHA-1 verification")]
    Sha1Mismatch(usize),

    #[error("every worker exited with pieces still unreachable")]
    Stalled,
}

impl From<PeerConnectionError> for DownloadError {
    fn from(err: PeerConnectionError) -> Self {
        DownloadError::PeerConnection(err.to_string())
    }
}

/// Terminal state of a download, observed through [`DownloadContext::wait_done`]. `Stalled` is
/// this implementation's answer to the spec's open question about a download that can never
/// finish because every worker exited before `pieces_done == N` — rather than leaving the
/// context to hang forever, a watchdog declares it stalled once no worker remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DoneState {
    #[default]
    Pending,
    Completed,
    Stalled,
}

/// Constructed by [`Metainfo::build_task`]: everything needed to start downloading once the
/// tracker has been consulted for a peer list.
pub struct DownloadTask {
    metainfo: Arc<Metainfo>,
    peer_id: [u8; 20],
    peers: Vec<PeerInfo>,
}

impl Metainfo {
    /// Announces to this torrent's tracker and packages the resulting peer list into a
    /// [`DownloadTask`], ready to [`DownloadTask::start`].
    ///
    /// Only the single-file form drives a download (see the crate's multi-file non-goal): a
    /// metainfo with no top-level `length` is rejected outright rather than silently summing
    /// `files` and downloading bytes the rest of the pipeline has no way to split back apart.
    #[instrument(level = "debug", skip(self))]
    pub async fn build_task(&self, peer_id: [u8; 20], port: u16) -> BuildTaskResult<DownloadTask> {
        if self.info.length.is_none() {
            return Err(BuildTaskError::MultiFileNotSupported);
        }
        let client = TrackerClient::new(peer_id, port);
        let response = client.announce(self).await?;
        debug!(peer_count = response.peers.len(), interval = response.interval, "tracker announce complete");
        Ok(DownloadTask { metainfo: Arc::new(self.clone()), peer_id, peers: response.peers })
    }
}

/// State shared by every worker: the requeue/results/errors channel handles, the atomic
/// progress counters, and the set of peers a connection was successfully established with.
struct Shared {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    total_pieces: usize,
    bytes_done: Arc<AtomicU64>,
    pieces_done: Arc<AtomicUsize>,
    peers: Arc<RwLock<Vec<PeerInfo>>>,
    queue_tx: kanal::AsyncSender<PieceTask>,
    results_tx: kanal::AsyncSender<PieceResult>,
    errors_tx: kanal::AsyncSender<DownloadError>,
    done_tx: watch::Sender<DoneState>,
    finished: AtomicBool,
}

impl Shared {
    /// Errors are advisory: a full error stream simply drops the newest one.
    fn publish_error(&self, err: DownloadError) {
        let _ = self.errors_tx.try_send(err);
    }

    /// Idempotent: only the first caller (the piece that completes the torrent, or the
    /// watchdog that detects a stall) actually broadcasts and closes the streams.
    fn finish(&self, state: DoneState) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done_tx.send(state);
        let _ = self.results_tx.close();
        let _ = self.errors_tx.close();
        let _ = self.queue_tx.close();
    }
}

fn verify_piece(data: &[u8], expected: &[u8; 20]) -> bool {
    let digest = Sha1::digest(data);
    digest.as_slice() == expected
}

async fn run_worker(
    peer: PeerInfo,
    queue_tx: kanal::AsyncSender<PieceTask>,
    queue_rx: kanal::AsyncReceiver<PieceTask>,
    mut done_rx: watch::Receiver<DoneState>,
    shared: Arc<Shared>,
) {
    let mut conn = match PeerConnection::connect(peer, shared.info_hash, shared.peer_id).await {
        Ok(conn) => conn,
        Err(err) => {
            shared.publish_error(err.into());
            return;
        }
    };

    if let Err(err) = conn.send_interested().await {
        shared.publish_error(err.into());
        return;
    }

    shared
        .peers
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(peer);

    loop {
        if *done_rx.borrow() != DoneState::Pending {
            return;
        }

        let task = tokio::select! {
            biased;
            changed = done_rx.changed() => {
                if changed.is_err() || *done_rx.borrow() != DoneState::Pending {
                    return;
                }
                continue;
            }
            received = queue_rx.recv() => match received {
                Ok(task) => task,
                Err(_) => return,
            },
        };

        if !conn.has_piece(task.index) {
            if queue_tx.send(task).await.is_err() {
                return;
            }
            continue;
        }

        match conn.download_piece(task).await {
            Ok(result) => {
                if verify_piece(&result.data, &task.expected_sha1) {
                    let len = result.data.len() as u64;
                    if shared.results_tx.send(result).await.is_err() {
                        return;
                    }
                    shared.bytes_done.fetch_add(len, Ordering::SeqCst);
                    let completed = shared.pieces_done.fetch_add(1, Ordering::SeqCst) + 1;
                    if completed == shared.total_pieces {
                        shared.finish(DoneState::Completed);
                    }
                } else {
                    let _ = queue_tx.send(task).await;
                    shared.publish_error(DownloadError::Sha1Mismatch(task.index));
                }
            }
            Err(err) => {
                // The connection is presumed unusable after any piece-download failure, so
                // this worker exits instead of retrying on the same socket.
                let _ = queue_tx.send(task).await;
                shared.publish_error(err.into());
                return;
            }
        }
    }
}

impl DownloadTask {
    /// Pre-loads the work queue with one task per piece and spawns one worker per peer,
    /// returning a [`DownloadContext`] the caller observes the download through.
    #[instrument(level = "debug", skip(self), fields(peers = self.peers.len()))]
    pub fn start(self) -> DownloadContext {
        let total_pieces = self.metainfo.num_pieces();
        let queue_capacity = total_pieces.max(1);
        let (queue_tx, queue_rx) = kanal::bounded_async::<PieceTask>(queue_capacity);
        let (results_tx, results_rx) = kanal::bounded_async::<PieceResult>(0);
        let (errors_tx, errors_rx) = kanal::bounded_async::<DownloadError>(ERROR_STREAM_CAPACITY);
        let (done_tx, done_rx) = watch::channel(DoneState::Pending);

        for index in 0..total_pieces {
            let (begin, end) = self.metainfo.piece_bounds(index);
            let task = PieceTask {
                index,
                expected_sha1: self.metainfo.pieces_hash[index],
                length: (end - begin) as u32,
            };
            queue_tx
                .try_send(task)
                .expect("queue capacity equals the piece count, so preload never blocks");
        }

        let peers_seen = Arc::new(RwLock::new(Vec::new()));
        let bytes_done = Arc::new(AtomicU64::new(0));
        let pieces_done = Arc::new(AtomicUsize::new(0));

        let shared = Arc::new(Shared {
            info_hash: self.metainfo.info_hash,
            peer_id: self.peer_id,
            total_pieces,
            bytes_done: Arc::clone(&bytes_done),
            pieces_done: Arc::clone(&pieces_done),
            peers: Arc::clone(&peers_seen),
            queue_tx: queue_tx.clone(),
            results_tx: results_tx.clone(),
            errors_tx: errors_tx.clone(),
            done_tx: done_tx.clone(),
            finished: AtomicBool::new(false),
        });

        let mut workers = JoinSet::new();
        for peer in self.peers {
            let queue_tx = queue_tx.clone();
            let queue_rx = queue_rx.clone();
            let worker_done_rx = done_tx.subscribe();
            let worker_shared = Arc::clone(&shared);
            workers.spawn(async move {
                run_worker(peer, queue_tx, queue_rx, worker_done_rx, worker_shared).await;
            });
        }

        // Stall watchdog (§7, §9 open question): if every worker exits before pieces_done
        // reaches the total, nothing will ever send a completion signal on its own — declare
        // the download stalled instead of leaving the context open forever.
        let watchdog_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
            if watchdog_shared.pieces_done.load(Ordering::SeqCst) < watchdog_shared.total_pieces {
                warn!("all peer workers exited with pieces still unreachable; declaring download stalled");
                watchdog_shared.publish_error(DownloadError::Stalled);
                watchdog_shared.finish(DoneState::Stalled);
            }
        });

        DownloadContext {
            metainfo: self.metainfo,
            results_rx,
            errors_rx,
            done_rx,
            bytes_done,
            pieces_done,
            peers: peers_seen,
        }
    }
}

/// The live handle to an in-progress download: result/error streams, progress counters, the
/// connected-peer set, and the completion signal.
pub struct DownloadContext {
    metainfo: Arc<Metainfo>,
    results_rx: kanal::AsyncReceiver<PieceResult>,
    errors_rx: kanal::AsyncReceiver<DownloadError>,
    done_rx: watch::Receiver<DoneState>,
    bytes_done: Arc<AtomicU64>,
    pieces_done: Arc<AtomicUsize>,
    peers: Arc<RwLock<Vec<PeerInfo>>>,
}

impl DownloadContext {
    /// Stream of verified piece results, in verification order (not piece-index order) — the
    /// consumer must position bytes using [`PieceResult::index`] / [`Self::piece_bounds`].
    pub fn results(&self) -> &kanal::AsyncReceiver<PieceResult> {
        &self.results_rx
    }

    /// Advisory error stream; a full buffer silently drops new errors rather than blocking a
    /// worker.
    pub fn errors(&self) -> &kanal::AsyncReceiver<DownloadError> {
        &self.errors_rx
    }

    /// Current `(bytes_done, pieces_done)`, safe to sample concurrently with workers.
    pub fn progress(&self) -> (u64, usize) {
        (self.bytes_done.load(Ordering::SeqCst), self.pieces_done.load(Ordering::SeqCst))
    }

    /// Snapshot of peers a connection was successfully established with.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Half-open byte range `[begin, end)` piece `index` occupies in the full download.
    pub fn piece_bounds(&self, index: usize) -> (u64, u64) {
        self.metainfo.piece_bounds(index)
    }

    /// A fresh receiver on the completion signal, for callers that want to poll without
    /// consuming the context's own copy (e.g. a progress-bar timer alongside a result reader).
    pub fn subscribe_done(&self) -> watch::Receiver<DoneState> {
        self.done_rx.clone()
    }

    /// Awaits the terminal state: `Completed` once every piece has been verified, or `Stalled`
    /// if every worker exited first.
    pub async fn wait_done(&mut self) -> DoneState {
        loop {
            let state = *self.done_rx.borrow();
            if state != DoneState::Pending {
                return state;
            }
            if self.done_rx.changed().await.is_err() {
                return DoneState::Stalled;
            }
        }
    }
}
