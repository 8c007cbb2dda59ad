use std::fmt;

use rand::RngCore;

pub mod client_id;
pub mod error;
pub mod handshake;
pub mod message;
pub(crate) mod mse;
pub mod session;
pub mod stream;

pub use error::{HandshakeError, PeerError};
pub use handshake::{InfoHashValidator, Negotiated, Role, SecretKeyResolver, negotiate};
pub use session::PeerSession;
pub use stream::{CipherKind, PeerStream};

/// Azureus-style prefix of our peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RS0100-";

/// The 20 byte id a client picks for itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// our prefix followed by 12 random bytes
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        rand::rng().fill_bytes(&mut id[8..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// best guess of the client software that generated this id
    pub fn client(&self) -> Option<&'static str> {
        client_id::identify(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0[..8]))
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod test_peer_id {
    use super::*;

    #[test]
    fn generated_ids_carry_the_prefix() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_eq!(&a.0[..8], PEER_ID_PREFIX);
        assert_ne!(a, b);
    }
}
