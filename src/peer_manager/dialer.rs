use std::{net::SocketAddr, sync::Arc};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    peer_manager::{ConnectionContext, handler::handle_outbound, workers::Workers},
    transfer::swarm::Swarm,
};

/// Bounds the number of outbound connections that are connecting or handshaking.
///
/// A permit is held from before the address is taken until the connection attempt is over,
/// including the peer session that follows a successful handshake.
#[derive(Debug, Clone)]
pub struct DialLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl DialLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// None once the limiter is closed
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

/// Connects to the addresses it is fed for one transfer.
pub struct Dialer {
    ctx: Arc<ConnectionContext>,
    swarm: Arc<Swarm>,
    limiter: DialLimiter,
}

impl Dialer {
    pub fn new(ctx: Arc<ConnectionContext>, swarm: Arc<Swarm>, max_dial: usize) -> Self {
        Self {
            ctx,
            swarm,
            limiter: DialLimiter::new(max_dial),
        }
    }

    pub fn limiter(&self) -> DialLimiter {
        self.limiter.clone()
    }

    /// Dials until `stop` fires or `addrs` is closed, then stops the connections it made.
    pub async fn run(self, mut addrs: mpsc::Receiver<SocketAddr>, stop: CancellationToken) {
        let mut workers = Workers::new(&stop);
        loop {
            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = self.limiter.acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };
            let addr = tokio::select! {
                _ = stop.cancelled() => break,
                addr = addrs.recv() => match addr {
                    Some(addr) => addr,
                    None => break,
                },
            };
            trace!(%addr, in_flight = self.limiter.in_flight(), "dialing");

            let ctx = self.ctx.clone();
            let swarm = self.swarm.clone();
            workers.spawn_with_on_finish(
                move |stop| async move {
                    let _ = handle_outbound(ctx, swarm, addr, stop).await;
                },
                move || drop(permit),
            );
        }
        workers.stop().await;
    }
}

#[cfg(test)]
mod test_dialer {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{peer::PeerId, peer_manager::test_peer_manager::context};

    #[tokio::test]
    async fn no_more_than_max_dial_in_flight() {
        let (ctx, swarm, _registration, _events) = context(PeerId([1; 20]));
        // accepts at the tcp level and never answers the handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Dialer::new(ctx, swarm, 40);
        let limiter = dialer.limiter();
        let (addrs, addrs_rx) = mpsc::channel(100);
        for _ in 0..60 {
            addrs.send(addr).await.unwrap();
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(dialer.run(addrs_rx, stop.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while limiter.in_flight() < 40 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.in_flight(), 40);
        // the rest is still waiting for a permit
        assert_eq!(addrs.capacity(), 100 - 20);

        stop.cancel();
        task.await.unwrap();
        assert_eq!(limiter.in_flight(), 0);
        drop(listener);
    }

    #[tokio::test]
    async fn closed_address_feed_ends_the_dialer() {
        let (ctx, swarm, _registration, _events) = context(PeerId([1; 20]));
        let dialer = Dialer::new(ctx, swarm, 4);
        let limiter = dialer.limiter();
        let (addrs, addrs_rx) = mpsc::channel(1);
        drop(addrs);
        dialer.run(addrs_rx, CancellationToken::new()).await;
        assert_eq!(limiter.in_flight(), 0);
    }
}
