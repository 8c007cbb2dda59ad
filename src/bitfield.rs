use std::fmt;

/// bit used in the reserved handshake bytes to advertise the fast extension (BEP 6)
pub const FAST_EXTENSION_BIT: u32 = 61;

/// A fixed-width bit vector.
///
/// Bit 0 is the most significant bit of the first byte, which is the layout used both by the
/// `bitfield` peer message and by the 8 reserved bytes of the handshake.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Bitfield {
    bytes: Vec<u8>,
    len: u32,
}

/// the reserved handshake bytes seen as a 64 bit capability set
pub type Extensions = Bitfield;

impl Bitfield {
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0; byte_len(len)],
            len,
        }
    }

    /// builds a bitfield of `len` bits from raw bytes
    /// returns None if the byte count doesn't match or a spare trailing bit is set
    pub fn from_bytes(bytes: &[u8], len: u32) -> Option<Self> {
        if bytes.len() != byte_len(len) {
            return None;
        }
        let spare = (bytes.len() as u64 * 8 - len as u64) as u32;
        if spare > 0 {
            let last = bytes[bytes.len() - 1];
            if last & ((1u8 << spare) - 1) != 0 {
                return None;
            }
        }
        Some(Self {
            bytes: bytes.to_vec(),
            len,
        })
    }

    pub fn from_reserved(reserved: [u8; 8]) -> Extensions {
        Self {
            bytes: reserved.to_vec(),
            len: 64,
        }
    }

    /// the 8 reserved handshake bytes, only meaningful for a 64 bit set
    pub fn to_reserved(&self) -> [u8; 8] {
        let mut reserved = [0u8; 8];
        let n = self.bytes.len().min(8);
        reserved[..n].copy_from_slice(&self.bytes[..n]);
        reserved
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// # Panics
    /// if `i` is out of range
    pub fn set(&mut self, i: u32) {
        assert!(i < self.len, "bit {i} out of range for a bitfield of {}", self.len);
        self.bytes[(i / 8) as usize] |= mask(i);
    }

    /// out of range bits are never set
    pub fn test(&self, i: u32) -> bool {
        i < self.len && self.bytes[(i / 8) as usize] & mask(i) != 0
    }

    /// bitwise AND, the result has the length of the shorter operand
    pub fn and(&self, other: &Bitfield) -> Bitfield {
        let len = self.len.min(other.len);
        let bytes = self
            .bytes
            .iter()
            .zip(other.bytes.iter())
            .take(byte_len(len))
            .map(|(a, b)| a & b)
            .collect();
        let mut result = Self { bytes, len };
        result.clear_spare_bits();
        result
    }

    /// number of set bits
    pub fn count(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    pub fn all(&self) -> bool {
        self.count() == self.len
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|i| self.test(*i))
    }

    fn clear_spare_bits(&mut self) {
        let spare = (self.bytes.len() as u64 * 8 - self.len as u64) as u32;
        if spare > 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= !((1u8 << spare) - 1);
            }
        }
    }
}

fn byte_len(bits: u32) -> usize {
    bits.div_ceil(8) as usize
}

fn mask(i: u32) -> u8 {
    1 << (7 - i % 8)
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitfield({}/{} {})", self.count(), self.len, hex::encode(&self.bytes))
    }
}

impl fmt::Display for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.bytes))
    }
}
