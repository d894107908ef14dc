//! Weir Testkit - Deterministic Fixtures
//!
//! Seeded participants, an in-memory signer, and commitment builders for
//! ledger channels. Everything here is deterministic so tests can assert
//! on exact channel ids and signatures.

#![allow(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use ed25519_dalek::{Signer, SigningKey};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use weir_core::commitment::{
    ChannelIdentity, ChannelType, Commitment, CommitmentType, SignedCommitment,
};
use weir_core::consensus::ConsensusAttrs;
use weir_core::identifiers::{Address, KeyRef};
use weir_core::signing::{CommitmentSignature, CommitmentSigner, SigningError};

/// A signer backed by an in-memory key map.
#[derive(Debug, Clone)]
pub struct InMemorySigner {
    keys: BTreeMap<KeyRef, SigningKey>,
}

impl InMemorySigner {
    pub fn new(keys: BTreeMap<KeyRef, SigningKey>) -> Self {
        Self { keys }
    }
}

impl CommitmentSigner for InMemorySigner {
    fn sign(
        &self,
        commitment: &Commitment,
        key_ref: &KeyRef,
    ) -> Result<CommitmentSignature, SigningError> {
        let key = self.keys.get(key_ref).ok_or_else(|| SigningError::UnknownKey {
            key_ref: key_ref.clone(),
        })?;
        Ok(CommitmentSignature(key.sign(&commitment.digest())))
    }
}

/// A fixed cast of channel participants with seeded keys.
#[derive(Debug, Clone)]
pub struct Participants {
    keys: Vec<SigningKey>,
    signer: InMemorySigner,
}

impl Participants {
    /// `count` participants with keys derived from seeds 1, 2, ...
    pub fn generate(count: usize) -> Self {
        let keys: Vec<SigningKey> = (0..count)
            .map(|i| {
                let mut rng = ChaCha20Rng::seed_from_u64(i as u64 + 1);
                SigningKey::generate(&mut rng)
            })
            .collect();
        let map = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (key_ref(i), key.clone()))
            .collect();
        Self {
            keys,
            signer: InMemorySigner::new(map),
        }
    }

    /// Two participants, for direct channels.
    pub fn pair() -> Self {
        Self::generate(2)
    }

    /// Three participants, for multi-party ledger channels.
    pub fn trio() -> Self {
        Self::generate(3)
    }

    /// Participant addresses in signing order.
    pub fn addresses(&self) -> Vec<Address> {
        self.keys
            .iter()
            .map(|k| Address(k.verifying_key().to_bytes()))
            .collect()
    }

    /// The key reference participant `index` signs with.
    pub fn key_ref(&self, index: usize) -> KeyRef {
        key_ref(index)
    }

    /// A signer that knows every participant's key.
    pub fn signer(&self) -> &InMemorySigner {
        &self.signer
    }

    /// The signer behind an `Arc`, for building contexts.
    pub fn shared_signer(&self) -> Arc<dyn CommitmentSigner> {
        Arc::new(self.signer.clone())
    }

    /// Sign a commitment as a specific participant, regardless of whose
    /// turn it is. Useful for forging bad signatures in tests.
    pub fn sign_as(&self, index: usize, commitment: Commitment) -> SignedCommitment {
        let signature = CommitmentSignature(self.keys[index].sign(&commitment.digest()));
        SignedCommitment {
            commitment,
            signature,
        }
    }
}

fn key_ref(index: usize) -> KeyRef {
    KeyRef(format!("participant-{index}"))
}

/// Sign a commitment with the key of its turn's mover.
pub fn sign_by_mover(participants: &Participants, commitment: Commitment) -> SignedCommitment {
    let index = commitment.mover_index();
    participants.sign_as(index, commitment)
}

/// A consensus-channel identity over the given participants.
pub fn ledger_identity(participants: &[Address], nonce: u64) -> ChannelIdentity {
    ChannelIdentity {
        channel_type: ChannelType::Consensus,
        nonce,
        participants: participants.to_vec(),
    }
}

/// Five units per participant, the default setup allocation.
pub fn default_allocation(identity: &ChannelIdentity) -> Vec<u128> {
    vec![5; identity.num_participants()]
}

/// A pre-fund setup commitment for the given turn.
pub fn prefund_commitment(identity: &ChannelIdentity, turn_num: u64) -> Commitment {
    Commitment {
        channel: identity.clone(),
        turn_num,
        allocation: default_allocation(identity),
        destination: identity.participants.clone(),
        commitment_type: CommitmentType::PreFundSetup,
        commitment_count: turn_num as u32,
        app_attributes: ConsensusAttrs::consensus().encode(),
    }
}

/// A post-fund setup commitment. Post-fund turns run from `n` to `2n - 1`.
pub fn postfund_commitment(identity: &ChannelIdentity, turn_num: u64) -> Commitment {
    let n = identity.num_participants() as u64;
    Commitment {
        channel: identity.clone(),
        turn_num,
        allocation: default_allocation(identity),
        destination: identity.participants.clone(),
        commitment_type: CommitmentType::PostFundSetup,
        commitment_count: turn_num.saturating_sub(n) as u32,
        app_attributes: ConsensusAttrs::consensus().encode(),
    }
}

/// A settled consensus commitment carrying the given balances.
pub fn ledger_commitment(
    identity: &ChannelIdentity,
    turn_num: u64,
    balances: &[u128],
) -> Commitment {
    Commitment {
        channel: identity.clone(),
        turn_num,
        allocation: balances.to_vec(),
        destination: identity.participants.clone(),
        commitment_type: CommitmentType::App,
        commitment_count: 0,
        app_attributes: ConsensusAttrs::consensus().encode(),
    }
}

/// A conclude commitment carrying the given balances.
pub fn conclude_commitment(
    identity: &ChannelIdentity,
    turn_num: u64,
    balances: &[u128],
    commitment_count: u32,
) -> Commitment {
    Commitment {
        channel: identity.clone(),
        turn_num,
        allocation: balances.to_vec(),
        destination: identity.participants.clone(),
        commitment_type: CommitmentType::Conclude,
        commitment_count,
        app_attributes: Vec::new(),
    }
}
