//! # Operator Key Management
//!
//! Ed25519 keypairs for dPoS committee operators.
//!
//! Every committee member signs its votes with an operator key; every peer
//! authenticates incoming votes against the committee registered at the
//! referenced chain tip. This module handles creation, serialization, and
//! the sign/verify pair — nothing else.
//!
//! ## Why Ed25519?
//!
//! - Deterministic signatures (no k-value footguns like ECDSA).
//! - 128-bit security level in 32+32 bytes. Compact and sufficient.
//! - Fast verification — important when you're checking a committee's worth
//!   of signatures per vice-block.
//!
//! Ed25519 cannot recover a public key from a signature, so wire votes carry
//! the signer's public key alongside the signature; authentication verifies
//! the signature and then resolves the key against the committee.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (thanks, ed25519-dalek).
//! - Key generation uses the OS RNG. If your OS RNG is broken, you have
//!   bigger problems than LUMEN.
//! - Key bytes are never logged. If you add logging to this module, you
//!   will be asked to leave.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::SIGNATURE_LENGTH;

/// Errors that can occur during key operations.
///
/// Intentionally vague about *why* something failed — leaking details about
/// key material through error messages is a classic footgun.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not a valid scalar")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,
}

/// An operator's Ed25519 keypair.
///
/// Deliberately does NOT implement `Serialize`/`Deserialize` — serializing
/// private keys should be a conscious act, not something that happens
/// because someone shoved a keypair into a JSON response. Use
/// `secret_key_bytes()` / `from_seed()` explicitly.
pub struct OperatorKeypair {
    signing_key: SigningKey,
}

/// The public half of an operator identity, safe to share with the world.
///
/// This is what the committee registry stores per member, and what wire
/// votes carry so peers can authenticate them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorPublicKey {
    bytes: [u8; 32],
}

/// An Ed25519 signature over a 32-byte signing hash.
///
/// Stored as `Vec<u8>` for serde compatibility, but always exactly 64 bytes
/// when produced by us. If someone hands us a signature that isn't 64 bytes,
/// verification simply fails — no panics, no undefined behavior, just `false`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSignature {
    bytes: Vec<u8>,
}

impl OperatorKeypair {
    /// Generate a fresh keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Construct a keypair deterministically from a 32-byte seed.
    ///
    /// In Ed25519 the 32-byte secret key *is* the seed. Useful for loading
    /// operator keys from a KDF or, on devnet, from a config file.
    ///
    /// **Warning**: a weak seed gives a weak key. Use a proper CSPRNG or
    /// KDF to produce the seed bytes.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Reconstruct a keypair from a hex-encoded secret key.
    ///
    /// Please don't put raw hex keys in config files in production. But for
    /// devnet, we're not going to pretend you won't do it anyway.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&arr))
    }

    /// The public key associated with this keypair.
    pub fn public_key(&self) -> OperatorPublicKey {
        OperatorPublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign a 32-byte signing hash.
    ///
    /// Ed25519 signatures are deterministic — the same (key, digest) pair
    /// always produces the same signature. No nonce games, no randomness
    /// needed at signing time.
    pub fn sign(&self, digest: &[u8; 32]) -> VoteSignature {
        let sig = self.signing_key.sign(digest);
        VoteSignature {
            bytes: sig.to_bytes().to_vec(),
        }
    }

    /// Export the raw 32-byte secret key material.
    ///
    /// **Handle with extreme care.** Don't log it. Don't send it over the
    /// network. Don't store it in a text file called `my_keys.txt`.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for OperatorKeypair {
    /// Cloning a keypair is allowed but should make you uncomfortable.
    /// Every copy of a private key is another thing to protect.
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for OperatorKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret key material in debug output. Not even
        // "partially" — a partial leak is still a leak.
        write!(f, "OperatorKeypair(pub={})", self.public_key())
    }
}

impl OperatorPublicKey {
    /// Create a public key from raw bytes without point validation.
    ///
    /// Invalid points fail later at `verify` time, which returns `false`.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Verify a signature over a 32-byte signing hash.
    ///
    /// Returns a plain boolean because the vast majority of callers just
    /// want a yes/no answer and don't care about the failure mode. A wrong
    /// length, an invalid curve point, a forged signature — all `false`.
    pub fn verify(&self, digest: &[u8; 32], signature: &VoteSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let sig_bytes: [u8; SIGNATURE_LENGTH] = match signature.bytes.as_slice().try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let dalek_sig = DalekSignature::from_bytes(&sig_bytes);
        verifying_key.verify(digest, &dalek_sig).is_ok()
    }

    /// Hex-encoded representation. 64 characters for 32 bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse a hex-encoded public key string.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes: arr })
    }
}

impl fmt::Display for OperatorPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for OperatorPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorPublicKey({})", self.to_hex())
    }
}

impl VoteSignature {
    /// Wrap raw signature bytes. Length is checked at verification time.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether this signature has the fixed wire length.
    pub fn is_well_formed(&self) -> bool {
        self.bytes.len() == SIGNATURE_LENGTH
    }
}

impl fmt::Debug for VoteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VoteSignature({})", hex::encode(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = OperatorKeypair::generate();
        let digest = [7u8; 32];
        let sig = kp.sign(&digest);
        assert!(sig.is_well_formed());
        assert!(kp.public_key().verify(&digest, &sig));
    }

    #[test]
    fn wrong_digest_fails() {
        let kp = OperatorKeypair::generate();
        let sig = kp.sign(&[1u8; 32]);
        assert!(!kp.public_key().verify(&[2u8; 32], &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = OperatorKeypair::generate();
        let other = OperatorKeypair::generate();
        let digest = [3u8; 32];
        let sig = kp.sign(&digest);
        assert!(!other.public_key().verify(&digest, &sig));
    }

    #[test]
    fn truncated_signature_fails_closed() {
        let kp = OperatorKeypair::generate();
        let digest = [9u8; 32];
        let sig = kp.sign(&digest);
        let truncated = VoteSignature::from_bytes(sig.as_bytes()[..32].to_vec());
        assert!(!truncated.is_well_formed());
        assert!(!kp.public_key().verify(&digest, &truncated));
    }

    #[test]
    fn seed_is_deterministic() {
        let a = OperatorKeypair::from_seed(&[42u8; 32]);
        let b = OperatorKeypair::from_seed(&[42u8; 32]);
        assert_eq!(a.public_key(), b.public_key());

        let sig_a = a.sign(&[0u8; 32]);
        let sig_b = b.sign(&[0u8; 32]);
        // Ed25519 is deterministic: same key, same digest, same signature.
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn hex_roundtrip() {
        let kp = OperatorKeypair::generate();
        let pk = kp.public_key();
        let parsed = OperatorPublicKey::from_hex(&pk.to_hex()).unwrap();
        assert_eq!(pk, parsed);
    }
}
