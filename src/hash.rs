//! The fixed-width SHA-256 digest used throughout the tree, plus the leaf
//! and internal hashing functions. Mirrors `pmtorrent`'s `hasher::sha256`
//! module, minus the generic `Hasher` trait: version 1 of the footer fixes
//! the algorithm, so there is nothing left to be generic over.

use lazy_static::lazy_static;
use ring::digest;
use std::fmt;

pub const HASH_BYTES: usize = 32;

/// A fixed-width opaque byte string. Two hashes are equal iff their byte
/// sequences are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_BYTES]);

impl Hash {
    pub fn from_bytes(bytes: [u8; HASH_BYTES]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }

    /// The hash used for phantom leaves beyond `total_chunks`.
    pub fn zero() -> Self {
        *ZERO_HASH
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

lazy_static! {
    static ref ZERO_HASH: Hash = Hash([0u8; HASH_BYTES]);
}

/// Leaf hash of a chunk: `SHA-256(chunk_bytes)`. Callers must pass the
/// exact `end - start` bytes of the chunk; the final real leaf is shorter
/// than `chunk_size` and must not be padded.
pub fn leaf_hash(chunk_bytes: &[u8]) -> Hash {
    digest_bytes(chunk_bytes)
}

/// Internal node hash: `SHA-256(left ‖ right)`.
pub fn internal_hash(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; HASH_BYTES * 2];
    buf[..HASH_BYTES].copy_from_slice(&left.0);
    buf[HASH_BYTES..].copy_from_slice(&right.0);
    digest_bytes(&buf)
}

fn digest_bytes(data: &[u8]) -> Hash {
    let d = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; HASH_BYTES];
    out.copy_from_slice(d.as_ref());
    Hash(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = leaf_hash(b"hello world");
        let b = leaf_hash(b"hello world");
        assert_eq!(a, b);

        let c = leaf_hash(b"hello worlD");
        assert_ne!(a, c);
    }

    #[test]
    fn internal_hash_order_matters() {
        let l = leaf_hash(b"left");
        let r = leaf_hash(b"right");
        assert_ne!(internal_hash(&l, &r), internal_hash(&r, &l));
    }

    #[test]
    fn zero_hash_is_all_zero_bytes() {
        assert_eq!(Hash::zero().as_bytes(), &[0u8; HASH_BYTES]);
    }
}
