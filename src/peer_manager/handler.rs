use std::{future::Future, io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    bitfield::Extensions,
    peer::{HandshakeError, Negotiated, PeerSession, Role, negotiate},
    peer_manager::{ConnectionContext, error::ConnectionError},
    transfer::swarm::{Direction, Swarm},
};

/// Serves one accepted connection: responder handshake, then a peer session in whichever
/// transfer the remote peer asked for.
pub async fn handle_inbound<S>(
    ctx: Arc<ConnectionContext>,
    stream: S,
    addr: SocketAddr,
    stop: CancellationToken,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let result = inbound(&ctx, stream, addr, &stop).await;
    log_outcome(Direction::Inbound, addr, &result);
    result
}

async fn inbound<S>(
    ctx: &ConnectionContext,
    stream: S,
    addr: SocketAddr,
    stop: &CancellationToken,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let role = Role::Responder {
        resolver: ctx.registry.as_ref(),
        validator: ctx.registry.as_ref(),
        force_encryption: ctx.encryption.force_incoming,
    };
    let negotiated = bounded(
        ctx,
        negotiate(stream, role, &ctx.extensions, ctx.peer_id),
        stop,
    )
    .await?;
    let swarm = ctx
        .registry
        .get(&negotiated.info_hash)
        .ok_or(ConnectionError::TransferGone {
            info_hash: negotiated.info_hash,
        })?;
    run_session(negotiated, swarm, addr, Direction::Inbound, &ctx.extensions, stop).await
}

/// Dials `addr` for `swarm`: tcp connect, initiator handshake, then a peer session.
pub async fn handle_outbound(
    ctx: Arc<ConnectionContext>,
    swarm: Arc<Swarm>,
    addr: SocketAddr,
    stop: CancellationToken,
) -> Result<(), ConnectionError> {
    let result = outbound(&ctx, swarm, addr, &stop).await;
    log_outcome(Direction::Outbound, addr, &result);
    result
}

async fn outbound(
    ctx: &ConnectionContext,
    swarm: Arc<Swarm>,
    addr: SocketAddr,
    stop: &CancellationToken,
) -> Result<(), ConnectionError> {
    let stream = tokio::select! {
        _ = stop.cancelled() => return Err(ConnectionError::Stopped),
        connected = tokio::time::timeout(ctx.handshake_timeout, TcpStream::connect(addr)) => {
            match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => return Err(ConnectionError::FailedToConnect { error, addr }),
                Err(_) => {
                    return Err(ConnectionError::FailedToConnect {
                        error: io::ErrorKind::TimedOut.into(),
                        addr,
                    })
                }
            }
        }
    };

    let role = Role::Initiator {
        info_hash: swarm.info_hash(),
        disable_encryption: ctx.encryption.disable_outgoing,
        force_encryption: ctx.encryption.force_outgoing,
    };
    let negotiated = bounded(
        ctx,
        negotiate(stream, role, &ctx.extensions, ctx.peer_id),
        stop,
    )
    .await?;
    run_session(negotiated, swarm, addr, Direction::Outbound, &ctx.extensions, stop).await
}

/// the handshake gives up when `stop` fires or the handshake timeout passes
async fn bounded<F, T>(
    ctx: &ConnectionContext,
    handshake: F,
    stop: &CancellationToken,
) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, HandshakeError>>,
{
    tokio::select! {
        _ = stop.cancelled() => Err(ConnectionError::Stopped),
        result = tokio::time::timeout(ctx.handshake_timeout, handshake) => match result {
            Ok(negotiated) => Ok(negotiated?),
            Err(_) => Err(HandshakeError::TimedOut.into()),
        },
    }
}

/// Claims the peer id for the lifetime of the session.
///
/// The session also ends when the transfer of `swarm` stops.
async fn run_session<S>(
    negotiated: Negotiated<S>,
    swarm: Arc<Swarm>,
    addr: SocketAddr,
    direction: Direction,
    local_extensions: &Extensions,
    stop: &CancellationToken,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let peer_id = negotiated.peer_id;
    if peer_id == swarm.peer_id() {
        return Err(ConnectionError::OwnConnection);
    }
    let Some(_claim) = swarm.peer_ids.claim(peer_id) else {
        return Err(ConnectionError::DuplicatePeer { peer_id });
    };

    let extensions = local_extensions.and(&negotiated.extensions);
    debug!(
        peer = %peer_id,
        %addr,
        %direction,
        cipher = %negotiated.cipher,
        extensions = %negotiated.extensions,
        "connection established"
    );
    PeerSession::new(
        negotiated.stream,
        peer_id,
        addr,
        direction,
        extensions,
        swarm.clone(),
    )
    .run(stop.clone())
    .await?;
    Ok(())
}

fn log_outcome(direction: Direction, addr: SocketAddr, result: &Result<(), ConnectionError>) {
    match result {
        Ok(()) => debug!(%addr, %direction, "peer session stopped"),
        Err(ConnectionError::OwnConnection) => debug!(%addr, %direction, "connected to ourselves"),
        Err(ConnectionError::Stopped) => trace!(%addr, %direction, "stopped during the handshake"),
        Err(
            error @ (ConnectionError::DuplicatePeer { .. }
            | ConnectionError::FailedToConnect { .. }
            | ConnectionError::Session(_)),
        ) => debug!(%addr, %direction, %error, "connection closed"),
        Err(error) => warn!(%addr, %direction, %error, "connection failed"),
    }
}

#[cfg(test)]
mod test_handler {
    use futures_util::StreamExt;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        bitfield::FAST_EXTENSION_BIT,
        peer::{
            PeerId,
            message::{MessageFramer, PeerMessage},
        },
        peer_manager::test_peer_manager::context,
    };

    fn peer_role(swarm: &Swarm, disable_encryption: bool) -> Role<'static> {
        Role::Initiator {
            info_hash: swarm.info_hash(),
            disable_encryption,
            force_encryption: false,
        }
    }

    #[tokio::test]
    async fn inbound_peer_joins_the_swarm() {
        for disable_encryption in [true, false] {
            let (ctx, swarm, _registration, _events) = context(PeerId([1; 20]));
            let (a, b) = tokio::io::duplex(1 << 16);
            let stop = CancellationToken::new();
            let handler = tokio::spawn(handle_inbound(
                ctx.clone(),
                b,
                "127.0.0.1:5000".parse().unwrap(),
                stop.clone(),
            ));

            let negotiated = negotiate(
                a,
                peer_role(&swarm, disable_encryption),
                &ctx.extensions,
                PeerId([2; 20]),
            )
            .await
            .unwrap();
            assert_eq!(negotiated.peer_id, PeerId([1; 20]));
            assert!(negotiated.extensions.test(FAST_EXTENSION_BIT));

            let mut remote = Framed::new(negotiated.stream, MessageFramer);
            assert_eq!(remote.next().await.unwrap().unwrap(), PeerMessage::HaveNone);
            assert!(swarm.peer_ids.contains(&PeerId([2; 20])));
            assert_eq!(swarm.peer_count(), 1);

            stop.cancel();
            handler.await.unwrap().unwrap();
            assert!(swarm.peer_ids.is_empty());
            assert_eq!(swarm.peer_count(), 0);
        }
    }

    #[tokio::test]
    async fn second_connection_of_a_peer_is_dropped() {
        let (ctx, swarm, _registration, _events) = context(PeerId([1; 20]));
        let _first = swarm.peer_ids.claim(PeerId([2; 20])).unwrap();

        let (a, b) = tokio::io::duplex(1 << 16);
        let handler = tokio::spawn(handle_inbound(
            ctx.clone(),
            b,
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        ));
        let _ = negotiate(a, peer_role(&swarm, true), &ctx.extensions, PeerId([2; 20])).await;

        assert!(matches!(
            handler.await.unwrap(),
            Err(ConnectionError::DuplicatePeer { peer_id }) if peer_id == PeerId([2; 20])
        ));
        // the first connection keeps its claim
        assert!(swarm.peer_ids.contains(&PeerId([2; 20])));
    }

    #[tokio::test]
    async fn own_connection_is_not_a_duplicate() {
        let (ctx, swarm, _registration, _events) = context(PeerId([1; 20]));
        let (a, b) = tokio::io::duplex(1 << 16);
        let handler = tokio::spawn(handle_inbound(
            ctx.clone(),
            b,
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        ));
        let ours = negotiate(a, peer_role(&swarm, false), &ctx.extensions, ctx.peer_id)
            .await
            .unwrap();

        assert_eq!(ours.peer_id, ctx.peer_id);
        assert!(matches!(
            handler.await.unwrap(),
            Err(ConnectionError::OwnConnection)
        ));
        assert!(swarm.peer_ids.is_empty());
        assert_eq!(swarm.peer_count(), 0);
    }

    #[tokio::test]
    async fn stopped_transfer_releases_its_inbound_peers() {
        let (ctx, swarm, _registration, _events) = context(PeerId([1; 20]));
        let (a, b) = tokio::io::duplex(1 << 16);
        let acceptor_stop = CancellationToken::new();
        let handler = tokio::spawn(handle_inbound(
            ctx.clone(),
            b,
            "127.0.0.1:5000".parse().unwrap(),
            acceptor_stop.clone(),
        ));

        let negotiated = negotiate(a, peer_role(&swarm, false), &ctx.extensions, PeerId([2; 20]))
            .await
            .unwrap();
        let mut remote = Framed::new(negotiated.stream, MessageFramer);
        assert_eq!(remote.next().await.unwrap().unwrap(), PeerMessage::HaveNone);
        assert_eq!(swarm.peer_count(), 1);

        swarm.stop_sessions();
        handler.await.unwrap().unwrap();
        assert!(!acceptor_stop.is_cancelled());
        assert_eq!(swarm.peer_count(), 0);
        assert!(swarm.peer_ids.is_empty());
        // the session dropped its end of the connection
        assert!(remote.next().await.is_none());
    }

    #[tokio::test]
    async fn stop_interrupts_a_stalled_handshake() {
        let (ctx, _swarm, _registration, _events) = context(PeerId([1; 20]));
        let (_a, b) = tokio::io::duplex(1 << 16);
        let stop = CancellationToken::new();
        let handler = tokio::spawn(handle_inbound(
            ctx,
            b,
            "127.0.0.1:5000".parse().unwrap(),
            stop.clone(),
        ));
        stop.cancel();
        assert!(matches!(
            handler.await.unwrap(),
            Err(ConnectionError::Stopped)
        ));
    }
}
