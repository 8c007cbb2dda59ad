use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{Instant, interval_at},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace};

use crate::{
    bitfield::{Bitfield, Extensions, FAST_EXTENSION_BIT},
    peer::{
        PeerId,
        error::PeerError,
        message::{MessageFramer, PeerMessage},
        stream::PeerStream,
    },
    transfer::swarm::{Direction, PeerEvent, PeerHandle, Swarm},
};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);
/// messages other tasks can queue for one peer
const OUTBOX_SIZE: usize = 64;

#[derive(Debug)]
struct PeerState {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// the pieces of the remote peer
    has: Bitfield,
    /// whether anything but keep-alives arrived yet
    started: bool,
}

/// A connected peer after the handshake.
///
/// Reports the pieces the remote peer has to the transfer and passes our `have` messages on.
/// Requesting and serving blocks is up to the downloader and uploader.
pub struct PeerSession<S> {
    framed: Framed<PeerStream<S>, MessageFramer>,
    peer_id: PeerId,
    addr: SocketAddr,
    direction: Direction,
    extensions: Extensions,
    swarm: Arc<Swarm>,
    state: PeerState,
}

/// takes the peer out of the swarm and its pieces when the session ends
struct Registered {
    swarm: Arc<Swarm>,
    peer_id: PeerId,
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.swarm.remove_peer(&self.peer_id);
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `extensions` are the effective ones, i.e. ours AND theirs
    pub fn new(
        stream: PeerStream<S>,
        peer_id: PeerId,
        addr: SocketAddr,
        direction: Direction,
        extensions: Extensions,
        swarm: Arc<Swarm>,
    ) -> Self {
        let piece_count = swarm.piece_count();
        Self {
            framed: Framed::new(stream, MessageFramer),
            peer_id,
            addr,
            direction,
            extensions,
            swarm,
            state: PeerState {
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
                has: Bitfield::new(piece_count),
                started: false,
            },
        }
    }

    fn fast(&self) -> bool {
        self.extensions.test(FAST_EXTENSION_BIT)
    }

    /// Runs until the connection fails or the peer hangs up, or until `stop` fires or the
    /// transfer stops.
    pub async fn run(mut self, stop: CancellationToken) -> Result<(), PeerError> {
        let transfer_stopped = self.swarm.sessions_token();
        let (outbox, mut inbox) = mpsc::channel(OUTBOX_SIZE);
        self.swarm.add_peer(
            self.peer_id,
            PeerHandle {
                addr: self.addr,
                direction: self.direction,
                extensions: self.extensions.clone(),
                outbox,
            },
        );
        let _registered = Registered {
            swarm: self.swarm.clone(),
            peer_id: self.peer_id,
        };
        debug!(
            peer = %self.peer_id,
            addr = %self.addr,
            direction = %self.direction,
            client = self.peer_id.client().unwrap_or("unknown"),
            "peer session started"
        );

        self.send_initial().await?;
        let mut keep_alive = interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = transfer_stopped.cancelled() => return Ok(()),
                msg = self.framed.next() => match msg {
                    None => return Err(PeerError::PeerDisconnected),
                    Some(Err(error)) => {
                        return Err(PeerError::RecvFromPeer {
                            error,
                            peer_id: self.peer_id,
                        })
                    }
                    Some(Ok(msg)) => self.handle(msg).await?,
                },
                Some(msg) = inbox.recv() => self.send(msg).await?,
                _ = keep_alive.tick() => self.send(PeerMessage::KeepAlive).await?,
            }
        }
    }

    async fn send(&mut self, msg: PeerMessage) -> Result<(), PeerError> {
        let msg_type = msg.name();
        self.framed
            .send(msg)
            .await
            .map_err(|error| PeerError::SendToPeer {
                error,
                peer_id: self.peer_id,
                msg_type,
            })
    }

    async fn report(&self, event: PeerEvent) -> Result<(), PeerError> {
        if self.swarm.send_event(event).await {
            Ok(())
        } else {
            Err(PeerError::TransferClosed)
        }
    }

    /// our pieces, the compact fast-extension forms when possible
    async fn send_initial(&mut self) -> Result<(), PeerError> {
        let ours = self.swarm.bitfield();
        let msg = if self.fast() && ours.all() {
            PeerMessage::HaveAll
        } else if self.fast() && ours.count() == 0 {
            PeerMessage::HaveNone
        } else if ours.count() > 0 {
            PeerMessage::Bitfield(Bytes::copy_from_slice(ours.as_bytes()))
        } else {
            return Ok(());
        };
        self.send(msg).await
    }

    async fn handle(&mut self, msg: PeerMessage) -> Result<(), PeerError> {
        if msg.is_fast() && !self.fast() {
            return Err(PeerError::FastNotNegotiated {
                peer_id: self.peer_id,
                msg_type: msg.name(),
            });
        }
        let first = !self.state.started;
        if msg != PeerMessage::KeepAlive {
            self.state.started = true;
        }
        let piece_count = self.state.has.len();

        match msg {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke | PeerMessage::Unchoke => {
                self.state.peer_choking = msg == PeerMessage::Choke;
                trace!(peer = %self.peer_id, state = ?self.state, "choke state changed");
            }
            PeerMessage::Interested | PeerMessage::NotInterested => {
                self.state.peer_interested = msg == PeerMessage::Interested;
                trace!(peer = %self.peer_id, state = ?self.state, "interest changed");
            }
            PeerMessage::Have(index) => {
                if index >= piece_count {
                    return Err(PeerError::InvalidPieceIndex {
                        peer_id: self.peer_id,
                        index,
                    });
                }
                if !self.state.has.test(index) {
                    self.state.has.set(index);
                    self.report(PeerEvent::Have {
                        peer: self.peer_id,
                        piece: index,
                    })
                    .await?;
                    self.update_interest().await?;
                }
            }
            PeerMessage::Bitfield(bytes) => {
                if !first {
                    return Err(PeerError::LateBitfield {
                        peer_id: self.peer_id,
                    });
                }
                let has = Bitfield::from_bytes(&bytes, piece_count).ok_or(
                    PeerError::InvalidBitfield {
                        peer_id: self.peer_id,
                    },
                )?;
                self.accept_bitfield(has).await?;
            }
            PeerMessage::HaveAll => {
                if !first {
                    return Err(PeerError::LateBitfield {
                        peer_id: self.peer_id,
                    });
                }
                let mut has = Bitfield::new(piece_count);
                for index in 0..piece_count {
                    has.set(index);
                }
                self.accept_bitfield(has).await?;
            }
            PeerMessage::HaveNone => {
                if !first {
                    return Err(PeerError::LateBitfield {
                        peer_id: self.peer_id,
                    });
                }
            }
            PeerMessage::Request(request) if self.fast() => {
                // nothing is served while we choke, fast peers get told so
                if self.state.am_choking {
                    self.send(PeerMessage::Reject(request)).await?;
                }
            }
            other => trace!(peer = %self.peer_id, msg = other.name(), "ignored message"),
        }
        Ok(())
    }

    async fn accept_bitfield(&mut self, has: Bitfield) -> Result<(), PeerError> {
        self.state.has = has.clone();
        if has.count() > 0 {
            self.report(PeerEvent::Bitfield {
                peer: self.peer_id,
                bitfield: has,
            })
            .await?;
        }
        self.update_interest().await
    }

    /// we are interested as long as the peer has a piece we lack
    async fn update_interest(&mut self) -> Result<(), PeerError> {
        let ours = self.swarm.bitfield();
        let interested = self
            .state
            .has
            .iter_set()
            .any(|index| !ours.test(index));
        if interested == self.state.am_interested {
            return Ok(());
        }
        self.state.am_interested = interested;
        if interested {
            self.send(PeerMessage::Interested).await
        } else {
            self.send(PeerMessage::NotInterested).await
        }
    }
}
