use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BytesMut};
use rc4::{KeyInit, Rc4, StreamCipher, consts::U20};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// number of keystream bytes both sides throw away before using RC4
const RC4_DISCARD: usize = 1024;

/// The cipher that ended up protecting a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// the plain BitTorrent handshake was used
    None,
    /// the obfuscation handshake happened but the payload stream is not encrypted
    PlainText,
    Rc4,
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::None => f.write_str("none"),
            CipherKind::PlainText => f.write_str("plaintext"),
            CipherKind::Rc4 => f.write_str("rc4"),
        }
    }
}

/// RC4 keyed with a 20 byte SHA1 digest that has already dropped the first 1024 bytes
pub(crate) struct Cipher(Rc4<U20>);

impl Cipher {
    pub(crate) fn new(key: [u8; 20]) -> Self {
        let mut rc4 = Rc4::<U20>::new(&key.into());
        let mut discard = [0u8; RC4_DISCARD];
        rc4.apply_keystream(&mut discard);
        Self(rc4)
    }

    pub(crate) fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

/// A connection after the handshake negotiation.
///
/// Wraps the raw stream with the negotiated ciphers and the bytes that were already read (and
/// decrypted) while negotiating. Encrypted writes are buffered until the inner stream takes them,
/// so callers have to flush like with any buffered writer.
pub struct PeerStream<S> {
    inner: S,
    read_ahead: BytesMut,
    decrypt: Option<Cipher>,
    encrypt: Option<Cipher>,
    pending_write: BytesMut,
    cipher: CipherKind,
}

impl<S> PeerStream<S> {
    pub(crate) fn plain(inner: S, read_ahead: BytesMut) -> Self {
        Self {
            inner,
            read_ahead,
            decrypt: None,
            encrypt: None,
            pending_write: BytesMut::new(),
            cipher: CipherKind::None,
        }
    }

    pub(crate) fn obfuscated(
        inner: S,
        read_ahead: BytesMut,
        ciphers: Option<(Cipher, Cipher)>,
    ) -> Self {
        let (cipher, decrypt, encrypt) = match ciphers {
            Some((decrypt, encrypt)) => (CipherKind::Rc4, Some(decrypt), Some(encrypt)),
            None => (CipherKind::PlainText, None, None),
        };
        Self {
            inner,
            read_ahead,
            decrypt,
            encrypt,
            pending_write: BytesMut::new(),
            cipher,
        }
    }

    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }
}

impl<S: AsyncWrite + Unpin> PeerStream<S> {
    /// pushes the buffered ciphertext into the inner stream
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending_write.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending_write))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_write.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeerStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.read_ahead.is_empty() {
            let n = this.read_ahead.len().min(buf.remaining());
            buf.put_slice(&this.read_ahead.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(decrypt) = &mut this.decrypt {
            decrypt.apply(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeerStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let Some(encrypt) = &mut this.encrypt else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };
        let start = this.pending_write.len();
        this.pending_write.extend_from_slice(buf);
        encrypt.apply(&mut this.pending_write[start..]);

        // the bytes are ours now, a pending drain is finished by the next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S> fmt::Debug for PeerStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("cipher", &self.cipher)
            .field("read_ahead", &self.read_ahead.len())
            .field("pending_write", &self.pending_write.len())
            .finish()
    }
}

#[cfg(test)]
mod test_stream {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn read_ahead_comes_first() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = PeerStream::plain(a, BytesMut::from(&b"hello "[..]));
        b.write_all(b"world").await.unwrap();

        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        assert_eq!(stream.cipher(), CipherKind::None);
    }

    #[tokio::test]
    async fn rc4_pair_round_trips() {
        let (a, b) = tokio::io::duplex(4096);
        let key_a = [1u8; 20];
        let key_b = [2u8; 20];
        let mut left = PeerStream::obfuscated(
            a,
            BytesMut::new(),
            Some((Cipher::new(key_b), Cipher::new(key_a))),
        );
        let mut right = PeerStream::obfuscated(
            b,
            BytesMut::new(),
            Some((Cipher::new(key_a), Cipher::new(key_b))),
        );

        left.write_all(b"ping").await.unwrap();
        left.flush().await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        right.flush().await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(left.cipher(), CipherKind::Rc4);
    }

    #[tokio::test]
    async fn ciphertext_differs_from_plaintext() {
        let (a, mut raw) = tokio::io::duplex(4096);
        let mut enc = PeerStream::obfuscated(
            a,
            BytesMut::new(),
            Some((Cipher::new([3u8; 20]), Cipher::new([4u8; 20]))),
        );
        enc.write_all(b"BitTorrent protocol").await.unwrap();
        enc.flush().await.unwrap();

        let mut buf = [0u8; 19];
        raw.read_exact(&mut buf).await.unwrap();
        assert_ne!(&buf, b"BitTorrent protocol");

        let mut plain = buf;
        Cipher::new([4u8; 20]).apply(&mut plain);
        assert_eq!(&plain, b"BitTorrent protocol");
    }
}
