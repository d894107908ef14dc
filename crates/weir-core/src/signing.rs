//! Signing capability and signature verification
//!
//! Wallet code never touches key material directly. Signing goes through
//! the `CommitmentSigner` capability, keyed by `KeyRef`; verification only
//! needs the expected mover's address.

use crate::commitment::{Commitment, SignedCommitment};
use crate::identifiers::{Address, KeyRef};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An ed25519 signature over a commitment digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentSignature(pub Signature);

impl fmt::Display for CommitmentSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig-{}", hex::encode(&self.0.to_bytes()[..8]))
    }
}

/// Errors from signing or verifying commitments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    /// The address bytes do not decode to a valid verifying key.
    #[error("malformed address: {address}")]
    MalformedAddress {
        /// The offending address.
        address: Address,
    },

    /// The keystore holds no key under this reference.
    #[error("unknown key: {key_ref}")]
    UnknownKey {
        /// The missing reference.
        key_ref: KeyRef,
    },

    /// The signature does not verify against the expected mover.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Capability to sign commitments with keys the wallet holds.
///
/// Implementations live outside the protocol engine (keystore, HSM,
/// test fixtures). The engine only ever passes a `KeyRef` through.
pub trait CommitmentSigner: fmt::Debug + Send + Sync {
    /// Sign the commitment's digest with the referenced key.
    fn sign(
        &self,
        commitment: &Commitment,
        key_ref: &KeyRef,
    ) -> Result<CommitmentSignature, SigningError>;
}

/// Verify that `signed` carries a valid signature from `signer`.
pub fn verify_commitment_signature(
    signed: &SignedCommitment,
    signer: &Address,
) -> Result<(), SigningError> {
    let key = VerifyingKey::from_bytes(signer.as_bytes())
        .map_err(|_| SigningError::MalformedAddress { address: *signer })?;
    key.verify_strict(&signed.commitment.digest(), &signed.signature.0)
        .map_err(|_| SigningError::InvalidSignature)
}

/// The address whose signature a commitment must carry: the mover for its
/// turn number.
pub fn expected_signer(commitment: &Commitment) -> Address {
    commitment.mover()
}
