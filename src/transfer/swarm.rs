use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    bitfield::{Bitfield, Extensions},
    peer::{PeerId, message::PeerMessage, mse::secret_key_hash},
    peer_manager::peer_ids::PeerIdRegistry,
    torrent::{InfoHash, Metainfo},
    tracker::Progress,
    transfer::piece::Piece,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Initializing,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("<-"),
            Direction::Outbound => f.write_str("->"),
        }
    }
}

/// what a session reports back to the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Have { peer: PeerId, piece: u32 },
    Bitfield { peer: PeerId, bitfield: Bitfield },
}

/// A connected peer as seen by the rest of the transfer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub direction: Direction,
    /// the effective extensions of the connection
    pub extensions: Extensions,
    pub(crate) outbox: mpsc::Sender<PeerMessage>,
}

/// State of one transfer that its connections share.
#[derive(Debug)]
pub struct Swarm {
    info_hash: InfoHash,
    skey_hash: [u8; 20],
    peer_id: PeerId,
    piece_length: u32,
    total_length: u64,
    bitfield: RwLock<Bitfield>,
    pieces: Arc<Vec<Piece>>,
    state: Mutex<TransferState>,
    pub(crate) peer_ids: PeerIdRegistry,
    /// lock order: peers, then a piece
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    events: mpsc::Sender<PeerEvent>,
    /// cancelled when the transfer stops, ends every session of the swarm
    sessions: CancellationToken,
}

impl Swarm {
    pub fn new(
        info: &Metainfo,
        info_hash: InfoHash,
        peer_id: PeerId,
        bitfield: Bitfield,
        pieces: Arc<Vec<Piece>>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            info_hash,
            skey_hash: secret_key_hash(&info_hash),
            peer_id,
            piece_length: info.piece_length,
            total_length: info.total_length(),
            bitfield: RwLock::new(bitfield),
            pieces,
            state: Mutex::new(TransferState::Initializing),
            peer_ids: PeerIdRegistry::default(),
            peers: RwLock::new(HashMap::new()),
            events,
            sessions: CancellationToken::new(),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn skey_hash(&self) -> [u8; 20] {
        self.skey_hash
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn pieces(&self) -> &Arc<Vec<Piece>> {
        &self.pieces
    }

    pub fn piece_count(&self) -> u32 {
        self.bitfield.read().len()
    }

    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.read().clone()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.read().test(index)
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.read().all()
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        *self.state.lock() = state;
    }

    /// a token that fires once the transfer stopped
    pub(crate) fn sessions_token(&self) -> CancellationToken {
        self.sessions.clone()
    }

    /// ends every session, including ones still joining
    pub(crate) fn stop_sessions(&self) {
        self.sessions.cancel();
    }

    fn piece_len(&self, index: u32) -> u64 {
        let begin = index as u64 * self.piece_length as u64;
        self.total_length
            .saturating_sub(begin)
            .min(self.piece_length as u64)
    }

    /// Marks a verified piece as ours and tells every connected peer.
    ///
    /// Bits are never cleared, completing a piece twice only announces it once.
    pub fn piece_completed(&self, index: u32) {
        {
            let mut bitfield = self.bitfield.write();
            if bitfield.test(index) {
                return;
            }
            bitfield.set(index);
        }
        let peers = self.peers.read();
        for (id, peer) in peers.iter() {
            if peer.outbox.try_send(PeerMessage::Have(index)).is_err() {
                trace!(peer = %id, index, "dropped have for a busy peer");
            }
        }
    }

    pub(crate) fn add_peer(&self, id: PeerId, handle: PeerHandle) {
        self.peers.write().insert(id, handle);
    }

    /// Drops the peer and forgets which pieces it had.
    pub(crate) fn remove_peer(&self, id: &PeerId) {
        let mut peers = self.peers.write();
        peers.remove(id);
        for piece in self.pieces.iter() {
            piece.remove_peer(id);
        }
    }

    /// Notes that a connected peer has the pieces `indices`, returns whether any of it was new.
    ///
    /// Reports that arrive after the peer left are ignored.
    pub(crate) fn record_pieces(
        &self,
        peer: &PeerId,
        indices: impl IntoIterator<Item = u32>,
    ) -> bool {
        let peers = self.peers.read();
        if !peers.contains_key(peer) {
            return false;
        }
        let mut added = false;
        for index in indices {
            if let Some(piece) = self.pieces.get(index as usize) {
                added |= piece.add_peer(*peer);
            }
        }
        added
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peers(&self) -> Vec<(PeerId, PeerHandle)> {
        self.peers
            .read()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    /// returns false once the transfer stopped listening
    pub(crate) async fn send_event(&self, event: PeerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

impl Progress for Swarm {
    fn downloaded(&self) -> u64 {
        self.bitfield
            .read()
            .iter_set()
            .map(|index| self.piece_len(index))
            .sum()
    }

    // TODO: count the bytes the uploader serves once it sends blocks
    fn uploaded(&self) -> u64 {
        0
    }

    fn left(&self) -> u64 {
        self.total_length - self.downloaded()
    }
}
