//! # Cryptographic Primitives for LUMEN
//!
//! Every hash and every signing operation in the protocol flows through here.
//! We deliberately chose boring, well-audited cryptography:
//!
//! - **Ed25519** for operator signatures — fast, deterministic, and nobody
//!   has broken it.
//! - **BLAKE3** for hashing — because we live in the future.
//! - **SHA-256** for compatibility — because the rest of the world doesn't.
//!
//! ## A note on "rolling your own crypto"
//!
//! We don't. Everything here is a thin, type-safe wrapper around audited
//! implementations. If you're tempted to optimize these functions, please
//! reconsider. Then reconsider again. Then go read about timing attacks
//! and come back when you've lost the urge.

pub mod hash;
pub mod keys;

// Re-export the things people actually need so they don't have to memorize
// our module hierarchy.
pub use hash::{blake3_hash, blake3_hash_multi, domain_separated_hash, merkle_root, sha256};
pub use keys::{KeyError, OperatorKeypair, OperatorPublicKey, VoteSignature};
