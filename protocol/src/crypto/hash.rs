//! # Hashing Utilities
//!
//! Cryptographic hash functions used throughout LUMEN. We support two hash
//! functions and refuse to support more without a very good reason:
//!
//! - **BLAKE3** — Our default. Fast on every platform, parallelizable, and
//!   provably secure under standard assumptions. Used for transaction IDs,
//!   vote identity hashes, signing hashes, and Merkle roots.
//!
//! - **SHA-256** — For interoperability with the PoW chain underneath us,
//!   which chose SHA-256 long before we showed up and is now stuck with it.
//!
//! ## Domain separation
//!
//! Consensus messages of different kinds must never collide: a transaction
//! vote must not hash to the same digest as a round vote over the same bytes,
//! or a signature could be replayed across message types. We use BLAKE3's
//! built-in `derive_key` mode for this. Don't try to prepend a tag manually —
//! that's what amateurs do. `derive_key` uses a different internal IV derived
//! from the context string, making cross-context collisions impossible by
//! construction.

use sha2::{Digest, Sha256};

/// Compute the BLAKE3 hash of the input data.
///
/// Returns a 32-byte digest as a fixed-size array. This is the workhorse
/// hash function of LUMEN. The `blake3` crate automatically takes advantage
/// of SIMD instructions on supported platforms.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Compute the SHA-256 hash of the input data.
///
/// Kept for cross-chain compatibility with the underlying PoW chain. For
/// LUMEN-internal hashing, prefer [`blake3_hash`].
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Compute a domain-separated hash using BLAKE3 with a context string.
///
/// `domain_separated_hash("lumen/txvote-id", data)` and
/// `domain_separated_hash("lumen/rvote-id", data)` will never collide even
/// for identical `data`, because the domain tag is baked into the hash IV.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash multiple byte slices together without concatenation overhead.
///
/// Instead of allocating a buffer to concatenate inputs, we feed them
/// sequentially into the hasher. Same result, less allocation. Used for
/// hashing composite structures like `(tip || round || subject)` without
/// the temporary buffer.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Compute a Merkle root from a list of leaf hashes using BLAKE3.
///
/// A simple binary Merkle tree over the transaction IDs of a vice-block.
/// If the number of leaves is odd, the last leaf is duplicated — the same
/// approach Bitcoin uses. The known duplicate-leaf ambiguity is handled a
/// layer up by enforcing transaction uniqueness before building the tree.
///
/// Returns the 32-byte root hash. If the input is empty, returns all zeros
/// (the "empty tree" sentinel).
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut current_level: Vec<[u8; 32]> = leaves.to_vec();

    // A single leaf is paired with itself so the root is always the output
    // of a hash operation, never a raw leaf.
    if current_level.len() == 1 {
        return blake3_hash_multi(&[current_level[0].as_slice(), current_level[0].as_slice()]);
    }

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity((current_level.len() + 1) / 2);

        for chunk in current_level.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next_level.push(blake3_hash_multi(&[left.as_slice(), right.as_slice()]));
        }

        current_level = next_level;
    }

    current_level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_deterministic() {
        let a = blake3_hash(b"lumen");
        let b = blake3_hash(b"lumen");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string — the canonical test vector everyone
        // should have memorized by now.
        let hash = sha256(b"");
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(hash.as_slice(), expected.as_slice());
    }

    #[test]
    fn domain_separation_changes_digest() {
        // Same data, different contexts = different hashes.
        // This is the whole point of domain separation.
        let data = b"same data";
        let a = domain_separated_hash("context-a", data);
        let b = domain_separated_hash("context-b", data);
        assert_ne!(a, b);
        assert_ne!(a, blake3_hash(data));
    }

    #[test]
    fn multi_matches_concatenation() {
        let multi = blake3_hash_multi(&[b"hello", b" world"]);
        let single = blake3_hash(b"hello world");
        assert_eq!(multi, single);
    }

    #[test]
    fn merkle_root_empty_is_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn merkle_root_single_leaf_paired_with_itself() {
        let leaf = blake3_hash(b"only child");
        let expected = blake3_hash_multi(&[leaf.as_slice(), leaf.as_slice()]);
        assert_eq!(merkle_root(&[leaf]), expected);
    }

    #[test]
    fn merkle_root_order_matters() {
        // Everyone must agree on tx ordering, so swapping leaves must
        // change the root.
        let a = blake3_hash(b"first");
        let b = blake3_hash(b"second");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
