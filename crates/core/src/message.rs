//! Signed feed messages exchanged between node operators and aggregators.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::types::{PolicyId, PosixTime};

/// A single node's price feed, bound to one oracle by its policy id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFeedMessage {
    pub feed: u64,
    pub timestamp: PosixTime,
    pub oracle_policy_id: PolicyId,
}

impl NodeFeedMessage {
    /// SHA-256 digest over the canonical binary encoding; this is what gets
    /// signed.
    pub fn digest(&self) -> [u8; 32] {
        let bytes = bincode::serialize(self).expect("message serialization is infallible");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    pub fn sign(&self, key: &SigningKey) -> SignedNodeMessage {
        let signature = key.sign(&self.digest());
        SignedNodeMessage {
            message: self.clone(),
            signature: signature.to_bytes().to_vec(),
            verifying_key: key.verifying_key().to_bytes(),
        }
    }
}

/// A feed message together with the node's signature over its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedNodeMessage {
    pub message: NodeFeedMessage,
    pub signature: Vec<u8>,
    pub verifying_key: [u8; 32],
}

impl SignedNodeMessage {
    /// Verifies the signature against the embedded verifying key.
    ///
    /// Malformed keys or signatures verify as false rather than erroring;
    /// a bad response from one node must never take the round down.
    pub fn verify(&self) -> bool {
        let key = match VerifyingKey::from_bytes(&self.verifying_key) {
            Ok(key) => key,
            Err(_) => {
                warn!(
                    key = %hex::encode(self.verifying_key),
                    "invalid verifying key in signed message"
                );
                return false;
            }
        };
        let sig_bytes: [u8; 64] = match self.signature.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!(len = self.signature.len(), "signature has wrong length");
                return false;
            }
        };
        let signature = Signature::from_bytes(&sig_bytes);
        match key.verify_strict(&self.message.digest(), &signature) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    key = %hex::encode(self.verifying_key),
                    feed = self.message.feed,
                    "signature verification failed"
                );
                false
            }
        }
    }
}
