//! Records and blocks of the observing ledger

use crate::crypto::{hash_bytes, verify_signature, vote_payload};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use line_ledger::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fate of a transaction as recorded by the observing ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservingState {
    /// Nothing recorded, or the claim window is still open
    NoInfo,
    /// Claim accepted, not yet sealed
    Claimed,
    /// Claim sealed into a block
    Committed,
    /// Window closed without a claim, or the coordinator rejected
    Rejected,
}

impl ObservingState {
    /// True once the outcome can no longer change
    pub fn is_final(&self) -> bool {
        !matches!(self, ObservingState::NoInfo)
    }

    /// True when the transaction is to be applied
    pub fn is_accepted(&self) -> bool {
        matches!(self, ObservingState::Claimed | ObservingState::Committed)
    }
}

/// Vote of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSignature {
    /// Signing node
    pub node: NodeId,

    /// Node public key
    pub public_key: VerifyingKey,

    /// Signature over the vote payload
    pub signature: Signature,
}

impl ParticipantSignature {
    /// Check the signature against the vote payload
    pub fn verify(&self, transaction: Uuid, digest: &[u8; 32]) -> Result<()> {
        let payload = vote_payload(transaction, digest);
        if verify_signature(&payload, &self.signature, &self.public_key) {
            Ok(())
        } else {
            Err(Error::InvalidSignature {
                node: self.node.clone(),
            })
        }
    }
}

/// Proof that every participant voted for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Transaction
    pub transaction: Uuid,

    /// Digest of the agreed path configuration
    pub digest: [u8; 32],

    /// One signature per participant
    pub signatures: Vec<ParticipantSignature>,

    /// Node submitting the claim
    pub submitted_by: NodeId,
}

impl Claim {
    /// Verify every signature of the claim
    pub fn verify(&self) -> Result<()> {
        if self.signatures.is_empty() {
            return Err(Error::EmptyClaim(self.transaction));
        }
        self.signatures
            .iter()
            .try_for_each(|signature| signature.verify(self.transaction, &self.digest))
    }

    /// Leaf hash used in block Merkle roots
    pub fn leaf_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.transaction.as_bytes());
        hasher.update(self.digest);
        for signature in &self.signatures {
            hasher.update(signature.node.as_str().as_bytes());
            hasher.update(signature.signature.to_bytes());
        }
        hasher.finalize().into()
    }
}

/// Record kept per transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservingRecord {
    /// Transaction
    pub transaction: Uuid,

    /// Current state
    pub state: ObservingState,

    /// Height at which the claim window closes, once arbitration was requested
    pub window_end: Option<u64>,

    /// Nodes that requested arbitration
    pub requested_by: Vec<NodeId>,

    /// Accepted claim
    pub claim: Option<Claim>,

    /// Height at which the claim was accepted
    pub claimed_at: Option<u64>,

    /// Height of the sealing block
    pub block_height: Option<u64>,
}

impl ObservingRecord {
    pub(crate) fn new(transaction: Uuid) -> Self {
        Self {
            transaction,
            state: ObservingState::NoInfo,
            window_end: None,
            requested_by: Vec::new(),
            claim: None,
            claimed_at: None,
            block_height: None,
        }
    }
}

/// Sealed block of claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Block height
    pub height: u64,

    /// Merkle root of the claims in this block
    pub merkle_root: [u8; 32],

    /// Hash of the previous sealed block
    pub previous_hash: [u8; 32],

    /// Hash of this block
    pub hash: [u8; 32],

    /// Claimed transactions, in acceptance order
    pub transactions: Vec<Uuid>,

    /// Sealing time
    pub sealed_at: DateTime<Utc>,
}

impl Block {
    /// Compute block hash
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(8 + 32 + 32 + 8);
        bytes.extend_from_slice(&self.height.to_be_bytes());
        bytes.extend_from_slice(&self.merkle_root);
        bytes.extend_from_slice(&self.previous_hash);
        bytes.extend_from_slice(&(self.transactions.len() as u64).to_be_bytes());
        hash_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn signed(node: &str, keypair: &KeyPair, tx: Uuid, digest: &[u8; 32]) -> ParticipantSignature {
        ParticipantSignature {
            node: NodeId::new(node),
            public_key: keypair.public_key(),
            signature: keypair.sign(&vote_payload(tx, digest)),
        }
    }

    #[test]
    fn test_claim_verification() {
        let tx = Uuid::new_v4();
        let digest = [9u8; 32];
        let (a, b) = (KeyPair::generate(), KeyPair::generate());

        let claim = Claim {
            transaction: tx,
            digest,
            signatures: vec![signed("a", &a, tx, &digest), signed("b", &b, tx, &digest)],
            submitted_by: NodeId::new("a"),
        };
        assert!(claim.verify().is_ok());

        let mut forged = claim.clone();
        forged.signatures[1] = signed("b", &b, tx, &[0u8; 32]);
        assert!(matches!(
            forged.verify(),
            Err(Error::InvalidSignature { node }) if node.as_str() == "b"
        ));
    }

    #[test]
    fn test_empty_claim_rejected() {
        let claim = Claim {
            transaction: Uuid::new_v4(),
            digest: [0u8; 32],
            signatures: vec![],
            submitted_by: NodeId::new("a"),
        };
        assert!(matches!(claim.verify(), Err(Error::EmptyClaim(_))));
    }

    #[test]
    fn test_state_flags() {
        assert!(!ObservingState::NoInfo.is_final());
        assert!(ObservingState::Claimed.is_accepted());
        assert!(ObservingState::Committed.is_accepted());
        assert!(!ObservingState::Rejected.is_accepted());
    }
}
