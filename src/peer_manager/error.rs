use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{
    peer::{HandshakeError, PeerError, PeerId},
    torrent::InfoHash,
};

/// Why a single peer connection ended.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to establish a tcp connection to the address `{addr}` with error: `{error}`")]
    FailedToConnect { error: io::Error, addr: SocketAddr },
    #[error("The handshake failed with the error: `{0}`")]
    Handshake(#[from] HandshakeError),
    #[error("The peer `{peer_id}` is already connected.")]
    DuplicatePeer { peer_id: PeerId },
    #[error("The transfer for `{info_hash}` stopped during the handshake.")]
    TransferGone { info_hash: InfoHash },
    #[error("The peer session failed with the error: `{0}`")]
    Session(#[from] PeerError),
    /// dialed ourselves or got looped back, not a failure
    #[error("Connected to ourselves.")]
    OwnConnection,
    #[error("The connection was stopped.")]
    Stopped,
}
