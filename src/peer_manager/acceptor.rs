use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::peer_manager::{ConnectionContext, handler::handle_inbound, workers::Workers};

/// pause after a failed accept, e.g. when we ran out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts incoming connections for every registered transfer.
pub struct Acceptor {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl Acceptor {
    pub fn new(listener: TcpListener, ctx: Arc<ConnectionContext>) -> Self {
        Self { listener, ctx }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until `stop` fires, then waits for the connections it accepted.
    pub async fn run(self, stop: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "listening for peers");
        }
        let mut workers = Workers::new(&stop);
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    trace!(%addr, "accepted connection");
                    let ctx = self.ctx.clone();
                    workers.spawn(move |stop| async move {
                        let _ = handle_inbound(ctx, stream, addr, stop).await;
                    });
                }
                Err(error) => {
                    warn!(%error, "failed to accept a connection");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }
        workers.stop().await;
    }
}
