use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transfer::{signal::HaveSignal, swarm::Swarm};

/// Feeds the dialer and keeps track of which missing pieces peers can give us.
///
/// Requesting blocks is not done here yet, a wake-up only re-scans the pieces.
pub struct Downloader {
    swarm: Arc<Swarm>,
    peer_lists: mpsc::Receiver<Vec<SocketAddr>>,
    addrs: mpsc::Sender<SocketAddr>,
    have: Arc<HaveSignal>,
    /// addresses already handed to the dialer
    seen: HashSet<SocketAddr>,
}

impl Downloader {
    pub fn new(
        swarm: Arc<Swarm>,
        peer_lists: mpsc::Receiver<Vec<SocketAddr>>,
        addrs: mpsc::Sender<SocketAddr>,
        have: Arc<HaveSignal>,
    ) -> Self {
        Self {
            swarm,
            peer_lists,
            addrs,
            have,
            seen: HashSet::new(),
        }
    }

    pub async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                peers = self.peer_lists.recv() => match peers {
                    Some(peers) => {
                        if !self.queue(peers) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = self.have.wait() => {
                    self.wanted();
                }
            }
        }
        trace!("downloader stopped");
    }

    /// Hands new addresses to the dialer. Returns false once the dialer is gone.
    ///
    /// When the dialer's queue is full the address is dropped and may come back with a later
    /// announce.
    fn queue(&mut self, peers: Vec<SocketAddr>) -> bool {
        let mut queued = 0;
        let mut dropped = 0;
        for addr in peers {
            if !self.seen.insert(addr) {
                continue;
            }
            match self.addrs.try_send(addr) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(addr)) => {
                    self.seen.remove(&addr);
                    dropped += 1;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        debug!(queued, dropped, "queued peer addresses");
        true
    }

    /// pieces we miss that at least one peer has
    fn wanted(&self) -> usize {
        let wanted = self
            .swarm
            .pieces()
            .iter()
            .filter(|piece| !self.swarm.has_piece(piece.index) && piece.has_peers())
            .count();
        debug!(wanted, "pieces available from peers");
        wanted
    }
}
