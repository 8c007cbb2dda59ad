use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::Path,
    sync::Arc,
};

use thiserror::Error;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::Config,
    peer::PeerId,
    peer_manager::{Acceptor, ConnectionContext},
    torrent::{InfoHash, Torrent},
    tracker::{HttpTracker, TrackerError},
    transfer::{Swarm, Transfer, TransferError, TransferRegistry},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to listen on port {port} with the error: `{error}`")]
    Listen { port: u16, error: std::io::Error },
    #[error("The transfer could not be started: {0}")]
    Transfer(#[from] TransferError),
    #[error("The tracker could not be set up: {0}")]
    Tracker(#[from] TrackerError),
    #[error("The transfer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One running client: a peer id, a listening socket shared by all transfers, and the transfers.
pub struct Client {
    config: Config,
    ctx: Arc<ConnectionContext>,
    stop: CancellationToken,
}

/// A transfer started by [`Client::start_transfer`].
pub struct TransferHandle {
    info_hash: InfoHash,
    swarm: Arc<Swarm>,
    stop: CancellationToken,
    task: JoinHandle<Result<(), TransferError>>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let peer_id = PeerId::generate();
        info!(%peer_id, "client created");
        let ctx = Arc::new(ConnectionContext::new(
            TransferRegistry::new(),
            peer_id,
            &config,
        ));
        Self {
            config,
            ctx,
            stop: CancellationToken::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.peer_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.ctx.registry
    }

    /// Binds the configured port and accepts peers for every transfer of this client.
    ///
    /// With port 0 the system picks one, it is announced to trackers from then on.
    pub async fn listen(&mut self) -> Result<SocketAddr, ClientError> {
        let port = self.config.port;
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|error| ClientError::Listen { port, error })?;
        let acceptor = Acceptor::new(listener, self.ctx.clone());
        let addr = acceptor
            .local_addr()
            .map_err(|error| ClientError::Listen { port, error })?;
        self.config.port = addr.port();
        tokio::spawn(acceptor.run(self.stop.child_token()));
        Ok(addr)
    }

    /// Prepares the files of `torrent` below `dest` and starts the transfer.
    pub async fn start_transfer(
        &self,
        torrent: Torrent,
        dest: &Path,
    ) -> Result<TransferHandle, ClientError> {
        let tracker = Arc::new(HttpTracker::new(
            &torrent.announce_urls(),
            &self.config.tracker,
        )?);
        let ctx = self.ctx.clone();
        let config = self.config.clone();
        let dest = dest.to_path_buf();
        let transfer = tokio::task::spawn_blocking(move || {
            Transfer::new(&torrent, &dest, ctx, tracker, &config)
        })
        .await??;
        info!(
            info_hash = %transfer.info_hash(),
            left = transfer.left(),
            "starting transfer"
        );

        let info_hash = transfer.info_hash();
        let swarm = transfer.swarm().clone();
        let stop = self.stop.child_token();
        let task = tokio::spawn(transfer.run(stop.clone()));
        Ok(TransferHandle {
            info_hash,
            swarm,
            stop,
            task,
        })
    }

    /// Stops the listener and every transfer.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

impl TransferHandle {
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// waits until the transfer has deregistered and stopped its tasks
    pub async fn wait(self) -> Result<(), ClientError> {
        self.task.await??;
        Ok(())
    }
}
