//! Cryptographic operations for vote signatures and blocks
//!
//! - Ed25519 key pairs for participant votes
//! - SHA-256 hashing and Merkle roots for sealed blocks

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Ed25519 key pair of one node
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from a 32 byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Create from a hex encoded seed
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed).map_err(|e| Error::Key(format!("invalid hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Key("seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Seed bytes, for persisting the identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Public key
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// Verify a signature with a public key
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &VerifyingKey) -> bool {
    public_key.verify(message, signature).is_ok()
}

/// Message signed by every participant of a transaction
///
/// `sha256(transaction || configuration digest)`
pub fn vote_payload(transaction: Uuid, digest: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(transaction.as_bytes());
    hasher.update(digest);
    hasher.finalize().into()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Merkle root over leaf hashes
///
/// An odd node at any level is paired with itself.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            })
            .collect();
    }

    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_seed() {
        let seed = [42u8; 32];
        let first = KeyPair::from_seed(&seed);
        let second = KeyPair::from_seed(&seed);
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.seed(), seed);
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let payload = vote_payload(Uuid::new_v4(), &[7u8; 32]);
        let signature = keypair.sign(&payload);

        assert!(verify_signature(&payload, &signature, &keypair.public_key()));
        assert!(!verify_signature(b"other", &signature, &keypair.public_key()));
        assert!(!verify_signature(
            &payload,
            &signature,
            &KeyPair::generate().public_key()
        ));
    }

    #[test]
    fn test_vote_payload_binds_digest() {
        let tx = Uuid::new_v4();
        assert_ne!(vote_payload(tx, &[0u8; 32]), vote_payload(tx, &[1u8; 32]));
        assert_eq!(vote_payload(tx, &[3u8; 32]), vote_payload(tx, &[3u8; 32]));
    }

    #[test]
    fn test_hex_seed() {
        let seed = "2a".repeat(32);
        let keypair = KeyPair::from_hex_seed(&seed).unwrap();
        assert_eq!(keypair.seed(), [42u8; 32]);
        assert!(KeyPair::from_hex_seed("2a2a").is_err());
        assert!(KeyPair::from_hex_seed("zz").is_err());
        assert!(KeyPair::from_hex_seed("2a2").is_err());
        assert!(KeyPair::from_hex_seed(&"2A".repeat(32)).is_ok());
    }

    #[test]
    fn test_merkle_root() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);

        let leaf = hash_bytes(b"a");
        assert_eq!(merkle_root(&[leaf]), leaf);

        let leaves: Vec<[u8; 32]> = (0..5u8).map(|i| hash_bytes(&[i])).collect();
        let root = merkle_root(&leaves);
        assert_eq!(root, merkle_root(&leaves));

        let mut tampered = leaves.clone();
        tampered[4] = hash_bytes(b"x");
        assert_ne!(root, merkle_root(&tampered));
    }
}
