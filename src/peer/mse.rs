//! Message stream encryption (the BitTorrent protocol encryption handshake).
//!
//! Both sides agree on a shared secret with a 768 bit Diffie-Hellman exchange, prove
//! knowledge of the info hash without sending it, and then pick either RC4 or plaintext
//! for the rest of the connection.

use bytes::{Buf, BufMut, BytesMut};
use num_bigint::BigUint;
use rand::{Rng, RngCore};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{
    peer::{
        error::HandshakeError,
        handshake::SecretKeyResolver,
        stream::{Cipher, PeerStream},
    },
    torrent::InfoHash,
};

pub(crate) const CRYPTO_PLAINTEXT: u32 = 0x01;
pub(crate) const CRYPTO_RC4: u32 = 0x02;

const PRIME: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];
const GENERATOR: u32 = 2;
const KEY_LEN: usize = 96;
const PRIVATE_KEY_LEN: usize = 20;
const MAX_PAD: usize = 512;
const VC: [u8; 8] = [0; 8];

/// one side of the Diffie-Hellman exchange
struct KeyPair {
    private: BigUint,
    public: [u8; KEY_LEN],
}

impl KeyPair {
    fn generate() -> Self {
        let mut secret = [0u8; PRIVATE_KEY_LEN];
        rand::rng().fill_bytes(&mut secret);
        let private = BigUint::from_bytes_be(&secret);
        let public = BigUint::from(GENERATOR).modpow(&private, &prime());
        Self {
            private,
            public: pad_key(&public),
        }
    }

    fn shared_secret(&self, remote_public: &[u8]) -> [u8; KEY_LEN] {
        let remote = BigUint::from_bytes_be(remote_public);
        pad_key(&remote.modpow(&self.private, &prime()))
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}

fn pad_key(n: &BigUint) -> [u8; KEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut key = [0u8; KEY_LEN];
    key[KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    key
}

/// 0 to 512 random bytes
fn random_pad() -> Vec<u8> {
    let mut rng = rand::rng();
    let mut pad = vec![0u8; rng.random_range(0..=MAX_PAD)];
    rng.fill_bytes(&mut pad);
    pad
}

fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor(a: [u8; 20], b: [u8; 20]) -> [u8; 20] {
    std::array::from_fn(|i| a[i] ^ b[i])
}

/// the HASH('req2', SKEY) a responder uses to find the torrent of an obfuscated connection
pub(crate) fn secret_key_hash(info_hash: &InfoHash) -> [u8; 20] {
    hash(&[b"req2", info_hash.as_bytes()])
}

/// reads until `buf` holds at least `n` bytes
async fn fill<S>(stream: &mut S, buf: &mut BytesMut, n: usize) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < n {
        buf.reserve(n - buf.len());
        if stream.read_buf(buf).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
    Ok(())
}

/// Consumes everything up to and including `pattern`, which has to end within the first `max`
/// bytes of the stream.
async fn synchronize<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    pattern: &[u8],
    max: usize,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(pattern.len()).position(|w| w == pattern) {
            if pos + pattern.len() > max {
                return Err(HandshakeError::SyncNotFound);
            }
            buf.advance(pos + pattern.len());
            return Ok(());
        }
        if buf.len() >= max {
            return Err(HandshakeError::SyncNotFound);
        }
        let want = buf.len() + 1;
        fill(stream, buf, want).await?;
    }
}

/// decrypts the next `n` buffered bytes and hands them out
fn take_decrypted(buf: &mut BytesMut, n: usize, cipher: &mut Cipher) -> BytesMut {
    let mut out = buf.split_to(n);
    cipher.apply(&mut out);
    out
}

/// Runs the obfuscation handshake as the connecting side.
///
/// `initial_payload` is sent encrypted right after the handshake, which is where the regular
/// BitTorrent handshake goes. The resulting stream is encrypted if the responder picked RC4.
pub(crate) async fn initiate<S>(
    mut stream: S,
    info_hash: &InfoHash,
    crypto_provide: u32,
    initial_payload: &[u8],
) -> Result<PeerStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let keys = KeyPair::generate();
    let mut out = BytesMut::with_capacity(KEY_LEN + MAX_PAD);
    out.extend_from_slice(&keys.public);
    out.extend_from_slice(&random_pad());
    stream.write_all(&out).await?;

    let mut buf = BytesMut::with_capacity(1024);
    fill(&mut stream, &mut buf, KEY_LEN).await?;
    let secret = keys.shared_secret(&buf.split_to(KEY_LEN));
    let skey = info_hash.as_bytes();

    let mut encrypt = Cipher::new(hash(&[b"keyA", &secret, skey]));
    let pad_c = random_pad();
    let mut out = BytesMut::new();
    out.extend_from_slice(&hash(&[b"req1", &secret]));
    out.extend_from_slice(&xor(secret_key_hash(info_hash), hash(&[b"req3", &secret])));
    let encrypted_from = out.len();
    out.extend_from_slice(&VC);
    out.put_u32(crypto_provide);
    out.put_u16(pad_c.len() as u16);
    out.extend_from_slice(&pad_c);
    out.put_u16(initial_payload.len() as u16);
    out.extend_from_slice(initial_payload);
    encrypt.apply(&mut out[encrypted_from..]);
    stream.write_all(&out).await?;

    // the responder's VC is the first 8 bytes of its keystream, look for that behind PadB
    let key_b = hash(&[b"keyB", &secret, skey]);
    let mut vc = VC;
    Cipher::new(key_b).apply(&mut vc);
    synchronize(&mut stream, &mut buf, &vc, MAX_PAD + VC.len()).await?;
    let mut decrypt = Cipher::new(key_b);
    decrypt.apply(&mut [0u8; 8]);

    fill(&mut stream, &mut buf, 6).await?;
    let mut head = take_decrypted(&mut buf, 6, &mut decrypt);
    let selected = head.get_u32();
    let pad_d = head.get_u16() as usize;
    if pad_d > MAX_PAD {
        return Err(HandshakeError::PadTooLong(pad_d));
    }
    if selected & crypto_provide == 0 || selected.count_ones() != 1 {
        return Err(HandshakeError::InvalidCryptoSelect { selected });
    }
    fill(&mut stream, &mut buf, pad_d).await?;
    // PadD is encrypted with keyB whatever was selected
    take_decrypted(&mut buf, pad_d, &mut decrypt);

    trace!(selected, "obfuscated handshake done");
    if selected == CRYPTO_RC4 {
        decrypt.apply(&mut buf);
        Ok(PeerStream::obfuscated(stream, buf, Some((decrypt, encrypt))))
    } else {
        Ok(PeerStream::obfuscated(stream, buf, None))
    }
}

/// Picks the cipher for an incoming obfuscated connection, RC4 wins when offered.
pub(crate) fn select_crypto(provided: u32, force_encryption: bool) -> Result<u32, HandshakeError> {
    if provided & CRYPTO_RC4 != 0 {
        Ok(CRYPTO_RC4)
    } else if provided & CRYPTO_PLAINTEXT != 0 {
        if force_encryption {
            Err(HandshakeError::NotEncrypted)
        } else {
            Ok(CRYPTO_PLAINTEXT)
        }
    } else {
        Err(HandshakeError::NoCommonCipher { provided })
    }
}

/// Runs the obfuscation handshake as the accepting side.
///
/// `head` holds the first bytes already read off the connection while telling plaintext and
/// obfuscated handshakes apart. Returns the stream with the initiator's initial payload in its
/// read-ahead buffer and the info hash the secret key resolved to.
pub(crate) async fn respond<S>(
    mut stream: S,
    head: &[u8],
    resolver: &dyn SecretKeyResolver,
    force_encryption: bool,
) -> Result<(PeerStream<S>, InfoHash), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    buf.extend_from_slice(head);
    fill(&mut stream, &mut buf, KEY_LEN).await?;
    let remote_public = buf.split_to(KEY_LEN);

    let keys = KeyPair::generate();
    let mut out = BytesMut::with_capacity(KEY_LEN + MAX_PAD);
    out.extend_from_slice(&keys.public);
    out.extend_from_slice(&random_pad());
    stream.write_all(&out).await?;

    let secret = keys.shared_secret(&remote_public);
    let req1 = hash(&[b"req1", &secret]);
    synchronize(&mut stream, &mut buf, &req1, MAX_PAD + req1.len()).await?;

    fill(&mut stream, &mut buf, 20).await?;
    let mut obfuscated = [0u8; 20];
    buf.copy_to_slice(&mut obfuscated);
    let skey_hash = xor(obfuscated, hash(&[b"req3", &secret]));
    let info_hash = resolver
        .info_hash_for(&skey_hash)
        .ok_or(HandshakeError::UnknownSecretKey)?;
    let skey = info_hash.as_bytes();

    let mut decrypt = Cipher::new(hash(&[b"keyA", &secret, skey]));
    let mut encrypt = Cipher::new(hash(&[b"keyB", &secret, skey]));

    fill(&mut stream, &mut buf, 14).await?;
    let mut head = take_decrypted(&mut buf, 14, &mut decrypt);
    if head.split_to(8)[..] != VC {
        return Err(HandshakeError::InvalidVerificationConstant);
    }
    let provided = head.get_u32();
    let pad_c = head.get_u16() as usize;
    if pad_c > MAX_PAD {
        return Err(HandshakeError::PadTooLong(pad_c));
    }
    fill(&mut stream, &mut buf, pad_c + 2).await?;
    let mut rest = take_decrypted(&mut buf, pad_c + 2, &mut decrypt);
    rest.advance(pad_c);
    let ia_len = rest.get_u16() as usize;
    fill(&mut stream, &mut buf, ia_len).await?;
    let mut read_ahead = take_decrypted(&mut buf, ia_len, &mut decrypt);

    let selected = select_crypto(provided, force_encryption)?;
    let pad_d = random_pad();
    let mut out = BytesMut::new();
    out.extend_from_slice(&VC);
    out.put_u32(selected);
    out.put_u16(pad_d.len() as u16);
    out.extend_from_slice(&pad_d);
    encrypt.apply(&mut out);
    stream.write_all(&out).await?;

    trace!(selected, provided, "obfuscated handshake done");
    if selected == CRYPTO_RC4 {
        decrypt.apply(&mut buf);
        read_ahead.unsplit(buf);
        Ok((
            PeerStream::obfuscated(stream, read_ahead, Some((decrypt, encrypt))),
            info_hash,
        ))
    } else {
        read_ahead.unsplit(buf);
        Ok((PeerStream::obfuscated(stream, read_ahead, None), info_hash))
    }
}

#[cfg(test)]
mod test_mse {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    struct OneTorrent(InfoHash);

    impl SecretKeyResolver for OneTorrent {
        fn info_hash_for(&self, skey_hash: &[u8; 20]) -> Option<InfoHash> {
            (secret_key_hash(&self.0) == *skey_hash).then_some(self.0)
        }
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(a.shared_secret(&b.public), b.shared_secret(&a.public));
    }

    #[test]
    fn rc4_is_preferred() {
        assert_eq!(select_crypto(CRYPTO_RC4 | CRYPTO_PLAINTEXT, false).unwrap(), CRYPTO_RC4);
        assert_eq!(select_crypto(CRYPTO_PLAINTEXT, false).unwrap(), CRYPTO_PLAINTEXT);
        assert!(matches!(
            select_crypto(CRYPTO_PLAINTEXT, true),
            Err(HandshakeError::NotEncrypted)
        ));
        assert!(matches!(
            select_crypto(0x10, false),
            Err(HandshakeError::NoCommonCipher { provided: 0x10 })
        ));
    }

    async fn run_pair(provide: u32) -> (PeerStream<tokio::io::DuplexStream>, PeerStream<tokio::io::DuplexStream>) {
        let info_hash = InfoHash([7u8; 20]);
        let (a, mut b) = tokio::io::duplex(1 << 16);

        let responder = tokio::spawn(async move {
            let mut head = [0u8; 20];
            b.read_exact(&mut head).await.unwrap();
            respond(b, &head, &OneTorrent(info_hash), false).await.unwrap()
        });
        let initiator = initiate(a, &info_hash, provide, b"hello").await.unwrap();
        let (responder, resolved) = responder.await.unwrap();
        assert_eq!(resolved, info_hash);
        (initiator, responder)
    }

    #[tokio::test]
    async fn rc4_connection_carries_initial_payload() {
        let (mut initiator, mut responder) = run_pair(CRYPTO_RC4 | CRYPTO_PLAINTEXT).await;
        assert_eq!(initiator.cipher(), crate::peer::CipherKind::Rc4);
        assert_eq!(responder.cipher(), crate::peer::CipherKind::Rc4);

        let mut ia = [0u8; 5];
        responder.read_exact(&mut ia).await.unwrap();
        assert_eq!(&ia, b"hello");

        responder.write_all(b"world").await.unwrap();
        responder.flush().await.unwrap();
        let mut reply = [0u8; 5];
        initiator.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
    }

    #[tokio::test]
    async fn rc4_keystreams_stay_in_step_across_paddings() {
        // padding lengths are random, repeat so nonzero PadC and PadD are both exercised
        for _ in 0..20 {
            let (mut initiator, mut responder) = run_pair(CRYPTO_RC4).await;
            let mut ia = [0u8; 5];
            responder.read_exact(&mut ia).await.unwrap();
            assert_eq!(&ia, b"hello");

            responder.write_all(b"world").await.unwrap();
            responder.flush().await.unwrap();
            let mut reply = [0u8; 5];
            initiator.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"world");

            initiator.write_all(b"again").await.unwrap();
            initiator.flush().await.unwrap();
            responder.read_exact(&mut ia).await.unwrap();
            assert_eq!(&ia, b"again");
        }
    }

    #[tokio::test]
    async fn plaintext_selection_leaves_the_stream_unencrypted() {
        let (mut initiator, mut responder) = run_pair(CRYPTO_PLAINTEXT).await;
        assert_eq!(initiator.cipher(), crate::peer::CipherKind::PlainText);

        let mut ia = [0u8; 5];
        responder.read_exact(&mut ia).await.unwrap();
        assert_eq!(&ia, b"hello");

        initiator.write_all(b"again").await.unwrap();
        initiator.flush().await.unwrap();
        responder.read_exact(&mut ia).await.unwrap();
        assert_eq!(&ia, b"again");
    }

    #[tokio::test]
    async fn unknown_secret_key_is_rejected() {
        let (a, mut b) = tokio::io::duplex(1 << 16);
        let responder = tokio::spawn(async move {
            let mut head = [0u8; 20];
            b.read_exact(&mut head).await.unwrap();
            respond(b, &head, &OneTorrent(InfoHash([1u8; 20])), false).await
        });
        let initiator = tokio::spawn(async move {
            initiate(a, &InfoHash([2u8; 20]), CRYPTO_RC4, b"").await
        });

        assert!(matches!(
            responder.await.unwrap(),
            Err(HandshakeError::UnknownSecretKey)
        ));
        // the responder hangs up, so the initiator never gets its VC
        assert!(initiator.await.unwrap().is_err());
    }
}
