//! Connection handling: accepting and dialing peers, handshakes, and handing the connection to
//! a peer session of the right transfer.

use std::{sync::Arc, time::Duration};

use crate::{
    bitfield::{Extensions, FAST_EXTENSION_BIT},
    config::{Config, EncryptionConfig},
    peer::PeerId,
    transfer::registry::TransferRegistry,
};

pub mod acceptor;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod peer_ids;
pub mod workers;

pub use acceptor::Acceptor;
pub use dialer::{DialLimiter, Dialer};
pub use error::ConnectionError;
pub use handler::{handle_inbound, handle_outbound};

/// What every connection of a client shares, no matter the transfer.
#[derive(Debug)]
pub struct ConnectionContext {
    pub registry: Arc<TransferRegistry>,
    pub peer_id: PeerId,
    /// the reserved bits we send in every handshake
    pub extensions: Extensions,
    pub encryption: EncryptionConfig,
    pub handshake_timeout: Duration,
}

impl ConnectionContext {
    pub fn new(registry: Arc<TransferRegistry>, peer_id: PeerId, config: &Config) -> Self {
        Self {
            registry,
            peer_id,
            extensions: local_extensions(),
            encryption: config.encryption,
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// fast extension only
pub fn local_extensions() -> Extensions {
    let mut extensions = Extensions::new(64);
    extensions.set(FAST_EXTENSION_BIT);
    extensions
}

#[cfg(test)]
pub(crate) mod test_peer_manager {
    use std::net::SocketAddr;

    use tokio::{net::TcpListener, sync::mpsc};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::transfer::{
        registry::Registration,
        swarm::{PeerEvent, Swarm, test_swarm::swarm},
    };

    /// a registry holding the test swarm, and a context for the given local peer id
    pub(crate) fn context(
        peer_id: PeerId,
    ) -> (
        Arc<ConnectionContext>,
        Arc<Swarm>,
        Registration,
        mpsc::Receiver<PeerEvent>,
    ) {
        let registry = TransferRegistry::new();
        let (swarm, events) = swarm(peer_id);
        let swarm = Arc::new(swarm);
        let registration = registry.register(swarm.clone()).unwrap();
        let ctx = Arc::new(ConnectionContext::new(registry, peer_id, &Config::default()));
        (ctx, swarm, registration, events)
    }

    /// polls `check` for up to five seconds
    pub(crate) async fn until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn dialed_peer_meets_the_acceptor() {
        let (accepting, accepting_swarm, _a, _a_events) = context(PeerId([1; 20]));
        let (dialing, dialing_swarm, _b, _b_events) = context(PeerId([2; 20]));
        let stop = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let acceptor = Acceptor::new(listener, accepting);
        let addr: SocketAddr = acceptor.local_addr().unwrap();
        let acceptor = tokio::spawn(acceptor.run(stop.child_token()));

        let (addrs, addrs_rx) = mpsc::channel(4);
        let dialer = Dialer::new(dialing, dialing_swarm.clone(), 40);
        let dialer = tokio::spawn(dialer.run(addrs_rx, stop.child_token()));
        addrs.send(addr).await.unwrap();

        until(|| accepting_swarm.peer_count() == 1 && dialing_swarm.peer_count() == 1).await;
        let (id, handle) = accepting_swarm.peers().remove(0);
        assert_eq!(id, PeerId([2; 20]));
        assert!(handle.extensions.test(FAST_EXTENSION_BIT));
        assert_eq!(handle.direction.to_string(), "<-");
        let (id, handle) = dialing_swarm.peers().remove(0);
        assert_eq!(id, PeerId([1; 20]));
        assert_eq!(handle.addr, addr);

        stop.cancel();
        acceptor.await.unwrap();
        dialer.await.unwrap();
        assert_eq!(accepting_swarm.peer_count(), 0);
        assert_eq!(dialing_swarm.peer_count(), 0);
    }
}
