//! Incremental content digests used by clients as fixed-size keys.
//!
//! One façade over the MD5 / SHA-1 / SHA-2 family: pick a kind (or a width
//! in bits), feed bytes, take a [`Digest`]. The store itself only needs the
//! output to be deterministic and fixed-size; equality and ordering are
//! defined on the raw bytes.

use std::fmt;
use std::str::FromStr;

use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

/// Widest digest we produce (SHA-512).
pub const MAX_DIGEST_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    /// Digest width in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha224 => 28,
            HashKind::Sha256 => 32,
            HashKind::Sha384 => 48,
            HashKind::Sha512 => 64,
        }
    }

    /// Pick a kind by digest width in bits: 128, 160, 224, 256, 384 or 512.
    pub fn from_bits(bits: usize) -> Option<HashKind> {
        match bits {
            128 => Some(HashKind::Md5),
            160 => Some(HashKind::Sha1),
            224 => Some(HashKind::Sha224),
            256 => Some(HashKind::Sha256),
            384 => Some(HashKind::Sha384),
            512 => Some(HashKind::Sha512),
            _ => None,
        }
    }
}

/// An in-progress digest computation.
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(kind: HashKind) -> Hasher {
        match kind {
            HashKind::Md5 => Hasher::Md5(Md5::new()),
            HashKind::Sha1 => Hasher::Sha1(Sha1::new()),
            HashKind::Sha224 => Hasher::Sha224(Sha224::new()),
            HashKind::Sha256 => Hasher::Sha256(Sha256::new()),
            HashKind::Sha384 => Hasher::Sha384(Sha384::new()),
            HashKind::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn kind(&self) -> HashKind {
        match self {
            Hasher::Md5(_) => HashKind::Md5,
            Hasher::Sha1(_) => HashKind::Sha1,
            Hasher::Sha224(_) => HashKind::Sha224,
            Hasher::Sha256(_) => HashKind::Sha256,
            Hasher::Sha384(_) => HashKind::Sha384,
            Hasher::Sha512(_) => HashKind::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Md5(h) => Digest::copy_from(h.finalize().as_slice()),
            Hasher::Sha1(h) => Digest::copy_from(h.finalize().as_slice()),
            Hasher::Sha224(h) => Digest::copy_from(h.finalize().as_slice()),
            Hasher::Sha256(h) => Digest::copy_from(h.finalize().as_slice()),
            Hasher::Sha384(h) => Digest::copy_from(h.finalize().as_slice()),
            Hasher::Sha512(h) => Digest::copy_from(h.finalize().as_slice()),
        }
    }
}

/// Digest `data` in one call.
pub fn digest(kind: HashKind, data: &[u8]) -> Digest {
    let mut hasher = Hasher::new(kind);
    hasher.update(data);
    hasher.finalize()
}

/// A finished digest: up to [`MAX_DIGEST_SIZE`] bytes, ordered and compared
/// lexicographically on the raw bytes.
#[derive(Clone, Copy)]
pub struct Digest {
    bytes: [u8; MAX_DIGEST_SIZE],
    len: u8,
}

impl Digest {
    fn copy_from(raw: &[u8]) -> Digest {
        debug_assert!(raw.len() <= MAX_DIGEST_SIZE);
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);
        Digest {
            bytes,
            len: raw.len() as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Digest) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Digest {}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Digest) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Digest {
    fn cmp(&self, other: &Digest) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Parse the lowercase or uppercase hex form produced by `Display`.
impl FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Digest, Self::Err> {
        let hex = s.as_bytes();
        if hex.len() % 2 != 0 || hex.len() / 2 > MAX_DIGEST_SIZE {
            return Err(crate::Error::InvalidState("bad digest hex length"));
        }
        fn nibble(c: u8) -> Option<u8> {
            match c {
                b'0'..=b'9' => Some(c - b'0'),
                b'a'..=b'f' => Some(c - b'a' + 10),
                b'A'..=b'F' => Some(c - b'A' + 10),
                _ => None,
            }
        }
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        for (i, pair) in hex.chunks_exact(2).enumerate() {
            let hi = nibble(pair[0]);
            let lo = nibble(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => bytes[i] = (hi << 4) | lo,
                _ => return Err(crate::Error::InvalidState("bad digest hex digit")),
            }
        }
        Ok(Digest {
            bytes,
            len: (hex.len() / 2) as u8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            digest(HashKind::Md5, b"abc").to_string(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            digest(HashKind::Sha1, b"abc").to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            digest(HashKind::Sha256, b"abc").to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = Hasher::new(HashKind::Sha256);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), digest(HashKind::Sha256, b"hello world"));
    }

    #[test]
    fn kinds_report_their_widths() {
        for bits in [128, 160, 224, 256, 384, 512] {
            let kind = HashKind::from_bits(bits).unwrap();
            assert_eq!(kind.digest_size() * 8, bits);
            assert_eq!(digest(kind, b"x").len(), kind.digest_size());
        }
        assert!(HashKind::from_bits(100).is_none());
    }

    #[test]
    fn hex_round_trip_and_ordering() {
        let d = digest(HashKind::Md5, b"ordering");
        let parsed: Digest = d.to_string().parse().unwrap();
        assert_eq!(parsed, d);

        let a = digest(HashKind::Md5, b"a");
        let b = digest(HashKind::Md5, b"b");
        assert_ne!(a.cmp(&b), std::cmp::Ordering::Equal);
        assert!("zz".parse::<Digest>().is_err());
    }
}
