//! One transfer per info hash: its files, pieces and swarm, and the tasks that drive it.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    bitfield::Bitfield,
    config::Config,
    peer_manager::{ConnectionContext, Dialer, workers::Workers},
    torrent::{InfoHash, Torrent},
    tracker::{AnnounceEvent, Announcer, Progress, Tracker, announce_periodically},
};

pub mod downloader;
pub mod error;
pub mod files;
pub mod piece;
pub mod registry;
pub mod signal;
pub mod swarm;
pub mod uploader;

pub use downloader::Downloader;
pub use error::TransferError;
pub use piece::Piece;
pub use registry::{Registration, TransferRegistry};
pub use signal::HaveSignal;
pub use swarm::{Direction, PeerEvent, PeerHandle, Swarm, TransferState};
pub use uploader::Uploader;

/// announce results and peer lists waiting for the run loop or the downloader
const RESULT_QUEUE_SIZE: usize = 4;

/// Settings a transfer copies out of the client config.
#[derive(Debug, Clone)]
struct TransferConfig {
    port: u16,
    max_dial: usize,
    num_want: u32,
    retry_interval: Duration,
    peer_queue_size: usize,
}

/// The coordinator of one transfer.
///
/// Created in the `Initializing` state by [`Transfer::new`], which prepares the files and
/// checks existing data. [`Transfer::run`] registers it so peers can find it, drives the tracker
/// announces, the downloader, the uploader and the dialer, and deregisters it on the way out.
pub struct Transfer {
    ctx: Arc<ConnectionContext>,
    swarm: Arc<Swarm>,
    events: mpsc::Receiver<PeerEvent>,
    have: Arc<HaveSignal>,
    tracker: Arc<dyn Tracker>,
    config: TransferConfig,
}

impl Transfer {
    /// Prepares the files below `dest` and builds the initial bitfield.
    ///
    /// Blocks on file io, run it off the async workers. If any file already had data every
    /// piece is hashed.
    pub fn new(
        torrent: &Torrent,
        dest: &Path,
        ctx: Arc<ConnectionContext>,
        tracker: Arc<dyn Tracker>,
        config: &Config,
    ) -> Result<Self, TransferError> {
        let info_hash = torrent.info_hash();
        let prepared = files::prepare_files(&torrent.info, dest)?;
        let pieces = Piece::build_all(&torrent.info);

        let mut bitfield = Bitfield::new(torrent.info.piece_count());
        if prepared.check_hash {
            for piece in &pieces {
                let valid = piece
                    .hash_check(&prepared.files)
                    .map_err(|error| TransferError::HashVerification {
                        index: piece.index,
                        error,
                    })?;
                if valid {
                    bitfield.set(piece.index);
                }
            }
            info!(
                %info_hash,
                have = bitfield.count(),
                pieces = bitfield.len(),
                "checked existing data"
            );
        }

        let (events_tx, events) = mpsc::channel(config.peer_queue_size);
        let swarm = Arc::new(Swarm::new(
            &torrent.info,
            info_hash,
            ctx.peer_id,
            bitfield,
            Arc::new(pieces),
            events_tx,
        ));
        Ok(Self {
            ctx,
            swarm,
            events,
            have: Arc::new(HaveSignal::default()),
            tracker,
            config: TransferConfig {
                port: config.port,
                max_dial: config.max_dial,
                num_want: config.tracker.num_want,
                retry_interval: config.tracker.retry_interval(),
                peer_queue_size: config.peer_queue_size,
            },
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.swarm.info_hash()
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    pub fn downloaded(&self) -> u64 {
        self.swarm.downloaded()
    }

    pub fn uploaded(&self) -> u64 {
        self.swarm.uploaded()
    }

    pub fn left(&self) -> u64 {
        self.swarm.left()
    }

    /// Runs the transfer until `stop` fires.
    ///
    /// Fails only if another transfer with the same info hash is registered.
    pub async fn run(mut self, stop: CancellationToken) -> Result<(), TransferError> {
        let _registration = self.ctx.registry.register(self.swarm.clone())?;
        self.swarm.set_state(TransferState::Running);

        // checked once, a transfer that completes later announces `completed` through the
        // regular announces
        let event = if self.swarm.is_complete() {
            AnnounceEvent::Completed
        } else {
            AnnounceEvent::Started
        };
        info!(
            info_hash = %self.swarm.info_hash(),
            event = event.as_str(),
            left = self.swarm.left(),
            "transfer running"
        );

        let mut workers = Workers::new(&stop);
        let (results_tx, mut results) = mpsc::channel(RESULT_QUEUE_SIZE);
        let announcer = Announcer {
            tracker: self.tracker.clone(),
            progress: self.swarm.clone(),
            info_hash: self.swarm.info_hash(),
            peer_id: self.swarm.peer_id(),
            port: self.config.port,
            num_want: self.config.num_want,
            retry_interval: self.config.retry_interval,
        };
        workers.spawn(move |stop| announce_periodically(announcer, event, results_tx, stop));

        let (peer_lists, peer_lists_rx) = mpsc::channel(RESULT_QUEUE_SIZE);
        let (addrs, addrs_rx) = mpsc::channel(self.config.peer_queue_size);
        let downloader = Downloader::new(
            self.swarm.clone(),
            peer_lists_rx,
            addrs,
            self.have.clone(),
        );
        workers.spawn(move |stop| downloader.run(stop));
        let uploader = Uploader::new(self.swarm.clone());
        workers.spawn(move |stop| uploader.run(stop));
        let dialer = Dialer::new(self.ctx.clone(), self.swarm.clone(), self.config.max_dial);
        workers.spawn(move |stop| dialer.run(addrs_rx, stop));

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(result) = results.recv() => match result {
                    Ok(response) => {
                        debug!(
                            peers = response.peers.len(),
                            seeders = ?response.seeders,
                            leechers = ?response.leechers,
                            "announce succeeded"
                        );
                        self.forward_peers(&peer_lists, response.peers);
                    }
                    Err(error) => error!(%error, "announce failed"),
                },
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        workers.stop().await;
        // inbound sessions run under the acceptor, they end here
        self.swarm.stop_sessions();
        self.swarm.set_state(TransferState::Terminated);
        info!(info_hash = %self.swarm.info_hash(), "transfer stopped");
        Ok(())
    }

    fn forward_peers(&self, peer_lists: &mpsc::Sender<Vec<SocketAddr>>, peers: Vec<SocketAddr>) {
        if peers.is_empty() {
            return;
        }
        if peer_lists.try_send(peers).is_err() {
            debug!("downloader is busy, dropped a peer list");
        }
    }

    /// Records which peer has which piece and wakes the downloader if that is news.
    fn handle_event(&self, event: PeerEvent) {
        let added = match event {
            PeerEvent::Have { peer, piece } => self.swarm.record_pieces(&peer, [piece]),
            PeerEvent::Bitfield { peer, bitfield } => {
                self.swarm.record_pieces(&peer, bitfield.iter_set())
            }
        };
        if added {
            self.have.notify();
        }
    }
}

#[cfg(test)]
mod test_transfer {
    use std::fs;

    use super::*;
    use crate::{
        peer::PeerId,
        torrent::test_torrent::torrent_bytes,
        tracker::test_tracker::MockTracker,
        transfer::swarm::test_swarm::handle,
    };

    const DATA: &[u8] = b"0123456789";

    fn torrent() -> Torrent {
        Torrent::from_bytes(&torrent_bytes("a.bin", 4, vec![(vec![], DATA.to_vec())])).unwrap()
    }

    fn context() -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext::new(
            TransferRegistry::new(),
            PeerId([1; 20]),
            &Config::default(),
        ))
    }

    async fn run_until_announced(transfer: Transfer, tracker: &MockTracker) {
        let registry = transfer.ctx.registry.clone();
        let swarm = transfer.swarm.clone();
        let stop = CancellationToken::new();
        let task = tokio::spawn(transfer.run(stop.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.requests.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(swarm.state(), TransferState::Running);
        assert!(registry.get(&swarm.info_hash()).is_some());

        stop.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(swarm.state(), TransferState::Terminated);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn new_transfer_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(MockTracker::default());
        let transfer = Transfer::new(
            &torrent(),
            dir.path(),
            context(),
            tracker.clone(),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(fs::metadata(dir.path().join("a.bin")).unwrap().len(), 10);
        assert_eq!(transfer.swarm().state(), TransferState::Initializing);
        assert_eq!(transfer.downloaded(), 0);
        assert_eq!(transfer.left(), 10);
        assert_eq!(transfer.uploaded(), 0);

        run_until_announced(transfer, &tracker).await;
        let requests = tracker.requests.lock();
        assert_eq!(requests[0].event, Some(AnnounceEvent::Started));
        assert_eq!(requests[0].port, 6881);
        assert_eq!(
            requests.last().unwrap().event,
            Some(AnnounceEvent::Stopped)
        );
    }

    #[tokio::test]
    async fn complete_data_announces_completed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), DATA).unwrap();
        let tracker = Arc::new(MockTracker::default());
        let transfer = Transfer::new(
            &torrent(),
            dir.path(),
            context(),
            tracker.clone(),
            &Config::default(),
        )
        .unwrap();
        assert!(transfer.swarm().is_complete());
        assert_eq!(transfer.left(), 0);

        run_until_announced(transfer, &tracker).await;
        assert_eq!(
            tracker.requests.lock()[0].event,
            Some(AnnounceEvent::Completed)
        );
    }

    #[test]
    fn corrupt_pieces_are_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"0123xxxx89").unwrap();
        let transfer = Transfer::new(
            &torrent(),
            dir.path(),
            context(),
            Arc::new(MockTracker::default()),
            &Config::default(),
        )
        .unwrap();
        let bitfield = transfer.swarm().bitfield();
        assert!(bitfield.test(0));
        assert!(!bitfield.test(1));
        assert!(bitfield.test(2));
        assert_eq!(transfer.downloaded(), 6);
    }

    #[test]
    fn wrong_file_size_fails_the_start() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"012").unwrap();
        let result = Transfer::new(
            &torrent(),
            dir.path(),
            context(),
            Arc::new(MockTracker::default()),
            &Config::default(),
        );
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch {
                expected: 10,
                actual: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn second_transfer_of_an_info_hash_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context();
        let tracker = Arc::new(MockTracker::default());
        let first = Transfer::new(
            &torrent(),
            dir.path(),
            ctx.clone(),
            tracker.clone(),
            &Config::default(),
        )
        .unwrap();
        let _registration = ctx.registry.register(first.swarm().clone()).unwrap();

        let second = Transfer::new(
            &torrent(),
            dir.path(),
            ctx,
            tracker.clone(),
            &Config::default(),
        )
        .unwrap();
        assert!(matches!(
            second.run(CancellationToken::new()).await,
            Err(TransferError::AlreadyRunning { .. })
        ));
        assert!(tracker.requests.lock().is_empty());
    }

    #[test]
    fn have_events_wake_the_downloader_once() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(
            &torrent(),
            dir.path(),
            context(),
            Arc::new(MockTracker::default()),
            &Config::default(),
        )
        .unwrap();
        let peer = PeerId([2; 20]);
        let (outbox, _inbox) = mpsc::channel(8);
        transfer.swarm.add_peer(peer, handle(outbox));
        let pieces = transfer.swarm.pieces().clone();

        for _ in 0..5 {
            transfer.handle_event(PeerEvent::Have { peer, piece: 1 });
        }
        assert!(transfer.have.is_pending());
        assert_eq!(pieces[1].peers(), vec![peer]);

        let mut bitfield = Bitfield::new(3);
        bitfield.set(0);
        bitfield.set(2);
        transfer.handle_event(PeerEvent::Bitfield { peer, bitfield });
        assert!(pieces.iter().all(|piece| piece.has_peers()));

        transfer.swarm.remove_peer(&peer);
        assert!(pieces.iter().all(|piece| !piece.has_peers()));
        transfer.handle_event(PeerEvent::Have { peer, piece: 1 });
        assert!(!pieces[1].has_peers());
    }
}
