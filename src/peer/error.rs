use std::io;

use thiserror::Error;

use crate::{peer::PeerId, torrent::InfoHash};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Failed to read or write the handshake with the error: `{0}`.")]
    Io(#[from] io::Error),
    #[error("The remote peer does not speak the BitTorrent protocol.")]
    InvalidProtocol,
    #[error("The remote peer asked for the unknown info hash `{info_hash}`.")]
    UnknownInfoHash { info_hash: InfoHash },
    #[error("The remote peer sent the info hash `{got}` but `{expected}` was negotiated.")]
    InfoHashMismatch { expected: InfoHash, got: InfoHash },
    #[error("The remote peer used an obfuscation key that matches no torrent.")]
    UnknownSecretKey,
    #[error("Failed to find the synchronisation marker of the obfuscated handshake.")]
    SyncNotFound,
    #[error("The verification constant of the obfuscated handshake is not zero.")]
    InvalidVerificationConstant,
    #[error("No common cipher, the remote peer provided `{provided:#x}`.")]
    NoCommonCipher { provided: u32 },
    #[error("The remote peer selected the cipher `{selected:#x}` which was never offered.")]
    InvalidCryptoSelect { selected: u32 },
    #[error("Encryption is required but the remote peer did not encrypt the connection.")]
    NotEncrypted,
    #[error("The padding of the obfuscated handshake is {0} bytes long.")]
    PadTooLong(usize),
    #[error("Failed to decode the handshake received from the peer with the error: `{0}`")]
    DecodeHandshake(#[from] bincode::error::DecodeError),
    #[error("Failed to encode the handshake with the error: `{0}`")]
    EncodeHandshake(#[from] bincode::error::EncodeError),
    #[error("The handshake did not finish in time.")]
    TimedOut,
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error(
        "Failed to send a message with type {msg_type} to a remote peer with the id: `{peer_id}` with the error: `{error}`."
    )]
    SendToPeer {
        error: io::Error,
        peer_id: PeerId,
        msg_type: &'static str,
    },
    #[error("Failed to read a message from the peer with id `{peer_id}` with the error: `{error}`.")]
    RecvFromPeer { error: io::Error, peer_id: PeerId },
    #[error("The peer unexpectedly disconnected.")]
    PeerDisconnected,
    #[error("The peer `{peer_id}` sent the fast extension message {msg_type} without negotiating it.")]
    FastNotNegotiated {
        peer_id: PeerId,
        msg_type: &'static str,
    },
    #[error("The peer `{peer_id}` sent a malformed bitfield.")]
    InvalidBitfield { peer_id: PeerId },
    #[error("The peer `{peer_id}` referred to the piece {index} which does not exist.")]
    InvalidPieceIndex { peer_id: PeerId, index: u32 },
    #[error("The peer `{peer_id}` sent its bitfield after other messages.")]
    LateBitfield { peer_id: PeerId },
    #[error("The transfer the peer belongs to has shut down.")]
    TransferClosed,
}
