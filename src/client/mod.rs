//! The client orchestrator: owns the peer queue, spawns a bounded pool of
//! peer workers, schedules periodic tracker announces, and signals
//! cooperative shutdown on completion.
//!
//! Runs entirely on a `tokio` current-thread runtime inside a `LocalSet`:
//! every worker and the announce scheduler is spawned with
//! `tokio::task::spawn_local`, so the shared [`PieceManager`] and
//! [`PeerQueue`] live behind `Rc<RefCell<_>>` rather than `Arc<Mutex<_>>`
//! so no explicit locking is needed, because nothing here ever crosses a thread.

pub mod queue;

pub use queue::PeerQueue;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::peer::{PeerConnection, PeerError};
use crate::piece::{PieceError, PieceManager};
use crate::torrent::{Metainfo, MetainfoError};
use crate::tracker::{self, TrackerError, TrackerEvent};

const DEFAULT_WORKER_COUNT: usize = 40;
const DEFAULT_QUEUE_CAPACITY: usize = 200;
const BLOCK_PENDING_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to parse torrent metainfo: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("tracker unreachable on initial announce: {0}")]
    Tracker(#[from] TrackerError),

    #[error("output file error: {0}")]
    Piece(#[from] PieceError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Tunables for a download session. Mirrors the spec's recommended
/// defaults (`K = 40` workers) while remaining caller-configurable.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub worker_count: usize,
    pub peer_queue_capacity: usize,
    pub listen_port: u16,
    pub connect_timeout: Duration,
    pub pending_block_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            peer_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            listen_port: 6881,
            connect_timeout: CONNECT_TIMEOUT,
            pending_block_timeout: BLOCK_PENDING_TIMEOUT,
        }
    }
}

/// Owns a single torrent's download session: the shared piece manager,
/// peer queue, tracker client, and the cancellation token that ties every
/// spawned task's lifetime together.
pub struct Client {
    config: ClientConfig,
    metainfo: Metainfo,
    tracker: tracker::Client,
    piece_manager: Rc<RefCell<PieceManager>>,
    queue: PeerQueue,
    cancellation: CancellationToken,
    /// Set by a worker that hit a fatal output-file error, so `run` can
    /// surface it to the caller instead of letting it vanish into a
    /// detached task's return value.
    fatal_error: Rc<RefCell<Option<PieceError>>>,
}

impl Client {
    pub fn new(metainfo: Metainfo, output_path: PathBuf, config: ClientConfig) -> ClientResult<Self> {
        let piece_manager = PieceManager::new(&metainfo, &output_path, config.pending_block_timeout)?;
        let tracker = tracker::Client::new(config.listen_port);
        let queue = PeerQueue::new(config.peer_queue_capacity);
        Ok(Self {
            config,
            metainfo,
            tracker,
            piece_manager: Rc::new(RefCell::new(piece_manager)),
            queue,
            cancellation: CancellationToken::new(),
            fatal_error: Rc::new(RefCell::new(None)),
        })
    }

    /// Requests cooperative shutdown: every worker and the scheduler
    /// unwind at their next suspension point.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Runs the full download session to completion (or until `stop()` is
    /// called). Must be driven inside a `LocalSet`, since workers are
    /// spawned with `spawn_local`.
    #[instrument(skip(self), fields(name = %self.metainfo.name))]
    pub async fn run(&self, local: &LocalSet) -> ClientResult<()> {
        let first = self
            .tracker
            .announce(&self.metainfo, self.piece_manager.borrow().downloaded_bytes(), TrackerEvent::Started)
            .await?;
        self.enqueue_peers(&first.peers).await;
        info!(peers = first.peers.len(), interval = first.interval, "initial announce complete");

        let scheduler_cancel = self.cancellation.clone();
        let scheduler_peer_id = self.tracker.peer_id();
        let scheduler_tracker_port = self.config.listen_port;
        let scheduler_metainfo = self.metainfo.clone();
        let scheduler_piece_manager = self.piece_manager.clone();
        let scheduler_queue = self.queue.clone();
        let mut interval_secs = first.interval.max(1) as u64;

        let _ = local.spawn_local(async move {
            let tracker_client = tracker::Client::with_peer_id(scheduler_peer_id, scheduler_tracker_port);
            let mut completed_sent = false;
            loop {
                tokio::select! {
                    _ = scheduler_cancel.cancelled() => {
                        debug!("announce scheduler cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                }

                let complete = scheduler_piece_manager.borrow().complete();
                let event = if complete && !completed_sent {
                    TrackerEvent::Completed
                } else {
                    TrackerEvent::None
                };
                let downloaded = scheduler_piece_manager.borrow().downloaded_bytes();
                match tracker_client.announce(&scheduler_metainfo, downloaded, event).await {
                    Ok(response) => {
                        interval_secs = response.interval.max(1) as u64;
                        for peer in response.peers {
                            scheduler_queue.put(SocketAddr::new(peer.ip, peer.port)).await;
                        }
                        if event == TrackerEvent::Completed {
                            completed_sent = true;
                            scheduler_cancel.cancel();
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "periodic announce failed, retrying next interval"),
                }
            }
        });

        for worker_id in 0..self.config.worker_count {
            let info_hash = self.metainfo.info_hash;
            let our_peer_id = self.tracker.peer_id();
            let piece_manager = self.piece_manager.clone();
            let queue = self.queue.clone();
            let cancellation = self.cancellation.clone();
            let connect_timeout = self.config.connect_timeout;
            let fatal_error = self.fatal_error.clone();

            let _ = local.spawn_local(async move {
                loop {
                    if piece_manager.borrow().complete() {
                        break;
                    }
                    let addr = tokio::select! {
                        _ = cancellation.cancelled() => break,
                        addr = queue.get() => addr,
                    };

                    let connect = tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(addr));
                    let stream = match tokio::select! {
                        _ = cancellation.cancelled() => break,
                        result = connect => result,
                    } {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            debug!(worker_id, %addr, error = %e, "connect failed");
                            continue;
                        }
                        Err(_) => {
                            debug!(worker_id, %addr, "connect timed out");
                            continue;
                        }
                    };

                    let mut connection = PeerConnection::new();
                    if let Err(e) = connection
                        .run(addr, stream, info_hash, our_peer_id, piece_manager.clone(), cancellation.clone())
                        .await
                    {
                        match e {
                            PeerError::Fatal(piece_err) => {
                                warn!(worker_id, %addr, error = %piece_err, "fatal output file error, aborting session");
                                *fatal_error.borrow_mut() = Some(piece_err);
                                cancellation.cancel();
                                break;
                            }
                            other => {
                                debug!(worker_id, %addr, error = %other, "peer connection ended");
                            }
                        }
                    }
                }
            });
        }

        self.cancellation.cancelled().await;

        if let Some(err) = self.fatal_error.borrow_mut().take() {
            return Err(ClientError::Piece(err));
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.piece_manager.borrow().complete()
    }

    async fn enqueue_peers(&self, peers: &[tracker::Peer]) {
        for peer in peers {
            self.queue.put(SocketAddr::new(peer.ip, peer.port)).await;
        }
    }
}
