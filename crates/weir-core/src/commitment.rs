//! Channel identities, commitments, and signed commitments
//!
//! A commitment is one participant's signed snapshot of a channel's state.
//! The `turn_num` totally orders commitments within a channel and decides
//! whose signature is expected: the mover for turn `t` is the participant
//! at index `t mod n`.

use crate::identifiers::{Address, AppId, ChannelId};
use crate::signing::CommitmentSignature;
use serde::{Deserialize, Serialize};

/// The application governing a channel's transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelType {
    /// Ledger channels run the built-in consensus application.
    Consensus,
    /// Application channels run a registered app-specific rule.
    Application(AppId),
}

/// The immutable identity of a channel.
///
/// Two channels with the same participants are distinguished by `nonce`.
/// The channel id is the hash of the canonical encoding of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    /// Which application validates transitions in this channel.
    pub channel_type: ChannelType,
    /// Disambiguates channels between the same participant set.
    pub nonce: u64,
    /// Participant addresses in signing order. Length is the channel size `n`.
    pub participants: Vec<Address>,
}

impl ChannelIdentity {
    /// Derive the channel id by hashing the canonical encoding.
    pub fn channel_id(&self) -> ChannelId {
        // bincode of a fixed struct layout is canonical for our purposes.
        #[allow(clippy::expect_used)]
        let bytes = bincode::serialize(self).expect("plain derives always encode");
        ChannelId(*blake3::hash(&bytes).as_bytes())
    }

    /// Number of participants in the channel.
    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }
}

/// The phase a commitment belongs to within the channel lifecycle.
///
/// Phases are strictly ordered: PreFundSetup, then PostFundSetup, then
/// App rounds, then Conclude. `commitment_count` positions a commitment
/// within the setup and conclude phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommitmentType {
    PreFundSetup,
    PostFundSetup,
    App,
    Conclude,
}

/// One participant's snapshot of channel state at a given turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    /// The channel this commitment belongs to.
    pub channel: ChannelIdentity,
    /// Total order over commitments within the channel.
    pub turn_num: u64,
    /// Funds assigned per destination, index-aligned with `destination`.
    pub allocation: Vec<u128>,
    /// Beneficiaries of `allocation`. May name channels as well as
    /// participants.
    pub destination: Vec<Address>,
    /// Lifecycle phase.
    pub commitment_type: CommitmentType,
    /// Position within a setup or conclude round.
    pub commitment_count: u32,
    /// Opaque application data, interpreted by the channel's rule.
    pub app_attributes: Vec<u8>,
}

impl Commitment {
    /// The id of the channel this commitment belongs to.
    pub fn channel_id(&self) -> ChannelId {
        self.channel.channel_id()
    }

    /// Canonical digest signed by the mover.
    pub fn digest(&self) -> [u8; 32] {
        #[allow(clippy::expect_used)]
        let bytes = bincode::serialize(self).expect("plain derives always encode");
        *blake3::hash(&bytes).as_bytes()
    }

    /// Index of the participant whose turn it is to sign this commitment.
    pub fn mover_index(&self) -> usize {
        (self.turn_num % self.channel.num_participants() as u64) as usize
    }

    /// Address of the participant whose turn it is to sign this commitment.
    pub fn mover(&self) -> Address {
        self.channel.participants[self.mover_index()]
    }

    /// Total funds allocated by this commitment.
    pub fn total_allocation(&self) -> u128 {
        self.allocation.iter().sum()
    }
}

/// A commitment together with its mover's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommitment {
    pub commitment: Commitment,
    pub signature: CommitmentSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(n: usize) -> ChannelIdentity {
        ChannelIdentity {
            channel_type: ChannelType::Consensus,
            nonce: 42,
            participants: (0..n).map(|i| Address([i as u8; 32])).collect(),
        }
    }

    fn commitment(turn_num: u64, n: usize) -> Commitment {
        Commitment {
            channel: identity(n),
            turn_num,
            allocation: vec![5, 5],
            destination: vec![Address([0; 32]), Address([1; 32])],
            commitment_type: CommitmentType::App,
            commitment_count: 0,
            app_attributes: vec![],
        }
    }

    #[test]
    fn channel_id_depends_on_nonce() {
        let a = identity(2);
        let mut b = identity(2);
        b.nonce = 43;
        assert_ne!(a.channel_id(), b.channel_id());
    }

    #[test]
    fn channel_id_depends_on_channel_type() {
        let a = identity(2);
        let mut b = identity(2);
        b.channel_type = ChannelType::Application(AppId([7; 32]));
        assert_ne!(a.channel_id(), b.channel_id());
    }

    #[test]
    fn channel_id_is_stable() {
        assert_eq!(identity(2).channel_id(), identity(2).channel_id());
    }

    #[test]
    fn mover_cycles_through_participants() {
        for turn in 0..6u64 {
            let c = commitment(turn, 3);
            assert_eq!(c.mover_index(), (turn % 3) as usize);
            assert_eq!(c.mover(), Address([(turn % 3) as u8; 32]));
        }
    }

    #[test]
    fn digest_changes_with_turn_num() {
        assert_ne!(commitment(4, 2).digest(), commitment(5, 2).digest());
    }

    #[test]
    fn commitments_round_trip_through_json() {
        let original = commitment(4, 2);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Commitment = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.channel_id(), original.channel_id());
    }
}
