use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{
    bitfield::Extensions,
    peer::{
        PeerId,
        error::HandshakeError,
        mse::{self, CRYPTO_PLAINTEXT, CRYPTO_RC4},
        stream::{CipherKind, PeerStream},
    },
    torrent::InfoHash,
};

const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Maps the obfuscated `HASH('req2', SKEY)` of an incoming connection back to an info hash.
pub trait SecretKeyResolver: Send + Sync {
    fn info_hash_for(&self, skey_hash: &[u8; 20]) -> Option<InfoHash>;
}

/// Decides whether an incoming plaintext handshake asks for a torrent we serve.
pub trait InfoHashValidator: Send + Sync {
    fn is_known(&self, info_hash: &InfoHash) -> bool;
}

#[derive(Debug, Copy, Clone, bincode::Encode, bincode::Decode)]
pub struct Handshake {
    length: u8,
    protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, reserved: [u8; 8]) -> Self {
        Self {
            length: 19,
            protocol: PROTOCOL,
            reserved,
            info_hash: info_hash.0,
            peer_id: peer_id.0,
        }
    }

    pub fn encode(&self) -> Result<[u8; HANDSHAKE_LEN], HandshakeError> {
        let mut bytes = [0_u8; HANDSHAKE_LEN];
        bincode::encode_into_slice(*self, &mut bytes, config())?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, HandshakeError> {
        let (handshake, _) = bincode::decode_from_slice::<Handshake, _>(bytes, config())?;
        if handshake.length != 19 || handshake.protocol != PROTOCOL {
            return Err(HandshakeError::InvalidProtocol);
        }
        Ok(handshake)
    }

    /// the first 20 bytes every plaintext handshake starts with
    fn header() -> [u8; 20] {
        let mut header = [0u8; 20];
        header[0] = 19;
        header[1..].copy_from_slice(&PROTOCOL);
        header
    }

    /// reads and decodes the 68 byte record off the stream
    pub async fn read_from<R>(stream: &mut R) -> Result<Self, HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut bytes = [0_u8; HANDSHAKE_LEN];
        stream.read_exact(&mut bytes).await?;
        Self::decode(&bytes)
    }
}

fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<68>()
}

/// Which side of the connection we are on, and what that side needs to know.
pub enum Role<'a> {
    Initiator {
        info_hash: InfoHash,
        /// send the plain handshake
        disable_encryption: bool,
        /// refuse to fall back to plaintext
        force_encryption: bool,
    },
    Responder {
        resolver: &'a dyn SecretKeyResolver,
        validator: &'a dyn InfoHashValidator,
        /// reject plaintext handshakes and plaintext-only offers
        force_encryption: bool,
    },
}

/// A connection that finished the handshake.
#[derive(Debug)]
pub struct Negotiated<S> {
    pub stream: PeerStream<S>,
    pub cipher: CipherKind,
    /// the remote reserved bytes, not yet intersected with ours
    pub extensions: Extensions,
    pub peer_id: PeerId,
    pub info_hash: InfoHash,
}

/// Runs the plaintext or obfuscated BitTorrent handshake on `stream`.
///
/// Both ends always finish the exchange, so a connection to ourselves shows up on either side
/// as a remote peer id equal to `local_peer_id`. Telling that apart is up to the caller.
pub async fn negotiate<S>(
    stream: S,
    role: Role<'_>,
    local_extensions: &Extensions,
    local_peer_id: PeerId,
) -> Result<Negotiated<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reserved = local_extensions.to_reserved();
    let negotiated = match role {
        Role::Initiator {
            info_hash,
            disable_encryption,
            force_encryption,
        } => {
            let ours = Handshake::new(info_hash, local_peer_id, reserved).encode()?;
            let mut stream = if disable_encryption {
                let mut stream = stream;
                stream.write_all(&ours).await?;
                stream.flush().await?;
                PeerStream::plain(stream, BytesMut::new())
            } else {
                let provide = if force_encryption {
                    CRYPTO_RC4
                } else {
                    CRYPTO_RC4 | CRYPTO_PLAINTEXT
                };
                mse::initiate(stream, &info_hash, provide, &ours).await?
            };
            if force_encryption && stream.cipher() != CipherKind::Rc4 {
                return Err(HandshakeError::NotEncrypted);
            }

            let theirs = Handshake::read_from(&mut stream).await?;
            if theirs.info_hash != info_hash.0 {
                return Err(HandshakeError::InfoHashMismatch {
                    expected: info_hash,
                    got: InfoHash(theirs.info_hash),
                });
            }
            into_negotiated(stream, theirs)
        }
        Role::Responder {
            resolver,
            validator,
            force_encryption,
        } => {
            let mut stream = stream;
            let mut head = [0u8; 20];
            stream.read_exact(&mut head).await?;

            let (mut stream, theirs) = if head == Handshake::header() {
                if force_encryption {
                    return Err(HandshakeError::NotEncrypted);
                }
                let mut bytes = [0u8; HANDSHAKE_LEN];
                bytes[..20].copy_from_slice(&head);
                stream.read_exact(&mut bytes[20..]).await?;
                let theirs = Handshake::decode(&bytes)?;
                if !validator.is_known(&InfoHash(theirs.info_hash)) {
                    return Err(HandshakeError::UnknownInfoHash {
                        info_hash: InfoHash(theirs.info_hash),
                    });
                }
                (PeerStream::plain(stream, BytesMut::new()), theirs)
            } else {
                let (mut stream, info_hash) =
                    mse::respond(stream, &head, resolver, force_encryption).await?;
                let theirs = Handshake::read_from(&mut stream).await?;
                if theirs.info_hash != info_hash.0 {
                    return Err(HandshakeError::InfoHashMismatch {
                        expected: info_hash,
                        got: InfoHash(theirs.info_hash),
                    });
                }
                (stream, theirs)
            };

            let ours = Handshake::new(InfoHash(theirs.info_hash), local_peer_id, reserved);
            stream.write_all(&ours.encode()?).await?;
            stream.flush().await?;
            into_negotiated(stream, theirs)
        }
    };

    trace!(
        peer = %negotiated.peer_id,
        cipher = %negotiated.cipher,
        extensions = %negotiated.extensions,
        "handshake done"
    );
    Ok(negotiated)
}

fn into_negotiated<S>(stream: PeerStream<S>, theirs: Handshake) -> Negotiated<S> {
    Negotiated {
        cipher: stream.cipher(),
        stream,
        extensions: Extensions::from_reserved(theirs.reserved),
        peer_id: PeerId(theirs.peer_id),
        info_hash: InfoHash(theirs.info_hash),
    }
}
