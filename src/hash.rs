//! Injectable truncated hash functions.
//!
//! The digest of a record is `truncate(Hash(nonce), D)`. The hash is treated as an
//! opaque, deterministic primitive whose output is uniformly distributed; that
//! uniformity is what lets [`RangePartitioner`](crate::RangePartitioner) split the
//! digest space analytically instead of sampling it.

use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A deterministic hash truncated to the caller's buffer length.
pub trait HashFunction: Send + Sync {
    /// Stable identifier recorded in the manifest so readers can re-verify digests.
    fn name(&self) -> &str;

    /// Write the first `out.len()` bytes of `Hash(nonce)` into `out`.
    ///
    /// Callers never ask for more than [`MAX_DIGEST_LEN`](crate::record::MAX_DIGEST_LEN) bytes.
    fn digest_into(&self, nonce: &[u8], out: &mut [u8]);

    fn digest(&self, nonce: &[u8], len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.digest_into(nonce, &mut out);
        out
    }
}

/// BLAKE3, the hash the vault format was defined with.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3Hash;

impl HashFunction for Blake3Hash {
    fn name(&self) -> &str {
        "blake3"
    }

    #[inline]
    fn digest_into(&self, nonce: &[u8], out: &mut [u8]) {
        // The XOF stream starts with the regular 32-byte hash, so any prefix is a truncation.
        let mut hasher = blake3::Hasher::new();
        hasher.update(nonce);
        hasher.finalize_xof().fill(out);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Hash;

impl HashFunction for Sha256Hash {
    fn name(&self) -> &str {
        "sha256"
    }

    #[inline]
    fn digest_into(&self, nonce: &[u8], out: &mut [u8]) {
        let full = Sha256::digest(nonce);
        out.copy_from_slice(&full[..out.len()]);
    }
}

/// Resolve a hash recorded in a manifest.
#[must_use]
pub fn hash_by_name(name: &str) -> Option<Arc<dyn HashFunction>> {
    match name {
        "blake3" => Some(Arc::new(Blake3Hash)),
        "sha256" => Some(Arc::new(Sha256Hash)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_digest_is_a_prefix_of_the_full_hash() {
        let nonce = [1u8, 2, 3, 4, 5, 6];
        let full = blake3::hash(&nonce);
        for len in [1, 10, 32] {
            assert_eq!(Blake3Hash.digest(&nonce, len), full.as_bytes()[..len].to_vec());
        }
    }

    #[test]
    fn sha256_digest_is_a_prefix_of_the_full_hash() {
        let nonce = b"nonce!";
        let full = Sha256::digest(nonce);
        assert_eq!(Sha256Hash.digest(nonce, 10), full[..10].to_vec());
    }

    #[test]
    fn names_round_trip() {
        for hash in [&Blake3Hash as &dyn HashFunction, &Sha256Hash] {
            let resolved = hash_by_name(hash.name()).unwrap();
            assert_eq!(resolved.digest(b"abc", 8), hash.digest(b"abc", 8));
        }
        assert!(hash_by_name("md5").is_none());
    }
}
