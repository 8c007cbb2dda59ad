use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transfer::swarm::Swarm;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Serves the peers of a transfer. For now it only reports who is connected.
pub struct Uploader {
    swarm: Arc<Swarm>,
}

impl Uploader {
    pub fn new(swarm: Arc<Swarm>) -> Self {
        Self { swarm }
    }

    pub async fn run(self, stop: CancellationToken) {
        let mut report = interval_at(Instant::now() + REPORT_INTERVAL, REPORT_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = report.tick() => {
                    debug!(
                        info_hash = %self.swarm.info_hash(),
                        peers = self.swarm.peer_count(),
                        "connected peers"
                    );
                }
            }
        }
        trace!("uploader stopped");
    }
}
