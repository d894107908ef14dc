//! Per-channel records and lifecycle queries
//!
//! A `ChannelRecord` is the wallet's view of one channel: its identity,
//! our position in it, and the signed commitments seen so far. Records are
//! created from the first commitment of a channel and grow one commitment
//! per turn.

use weir_core::commitment::{ChannelIdentity, ChannelType, CommitmentType, SignedCommitment};
use weir_core::identifiers::{Address, ChannelId, KeyRef};

/// How far a channel has progressed from its first commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStage {
    /// Only the opening commitment is stored.
    PartiallyOpen,
    /// At least two commitments are stored; transitions can be validated.
    Open,
}

/// The wallet's record of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    /// Cached hash of the identity below.
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub participants: Vec<Address>,
    pub nonce: u64,
    /// Our position in `participants`.
    pub our_index: usize,
    /// Turn number of the latest stored commitment.
    pub turn_num: u64,
    /// Set once on-chain funding reaches the channel's total allocation.
    pub funded: bool,
    /// Our address in this channel.
    pub own_address: Address,
    /// The key the signer uses for this channel.
    pub signing_key_ref: KeyRef,
    /// Signed commitments in turn order.
    pub commitments: Vec<SignedCommitment>,
}

/// Errors constructing a record from an opening commitment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelRecordError {
    /// Our address is not among the channel's participants.
    #[error("own address {own_address} is not a participant of {channel_id}")]
    NotAParticipant {
        channel_id: ChannelId,
        own_address: Address,
    },

    /// Channels open at turn zero; anything else is not an opening
    /// commitment.
    #[error("opening commitment for {channel_id} has turn {turn_num}, expected 0")]
    NotAnOpeningCommitment { channel_id: ChannelId, turn_num: u64 },
}

impl ChannelRecord {
    /// Build a record from a channel's opening commitment.
    pub fn from_first_commitment(
        signed: SignedCommitment,
        own_address: Address,
        signing_key_ref: KeyRef,
    ) -> Result<Self, ChannelRecordError> {
        let channel_id = signed.commitment.channel_id();
        if signed.commitment.turn_num != 0 {
            return Err(ChannelRecordError::NotAnOpeningCommitment {
                channel_id,
                turn_num: signed.commitment.turn_num,
            });
        }
        let our_index = signed
            .commitment
            .channel
            .participants
            .iter()
            .position(|p| *p == own_address)
            .ok_or(ChannelRecordError::NotAParticipant {
                channel_id,
                own_address,
            })?;
        Ok(Self {
            channel_id,
            channel_type: signed.commitment.channel.channel_type,
            participants: signed.commitment.channel.participants.clone(),
            nonce: signed.commitment.channel.nonce,
            our_index,
            turn_num: 0,
            funded: false,
            own_address,
            signing_key_ref,
            commitments: vec![signed],
        })
    }

    /// Reconstruct the channel's identity from the record.
    pub fn identity(&self) -> ChannelIdentity {
        ChannelIdentity {
            channel_type: self.channel_type,
            nonce: self.nonce,
            participants: self.participants.clone(),
        }
    }

    /// Number of participants.
    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    /// Append a validated commitment. The caller has already checked the
    /// transition; this only keeps the record's cache in step.
    pub fn push_commitment(&mut self, signed: SignedCommitment) {
        self.turn_num = signed.commitment.turn_num;
        self.commitments.push(signed);
    }

    /// Whether the next commitment is ours to sign.
    ///
    /// Reads as: the latest commitment was not signed by us. For two
    /// participants this is exactly "the other side moved last". For three
    /// or more it is deliberately looser, and the turn gate in protocols
    /// relies on that reading.
    pub fn our_turn(&self) -> bool {
        self.turn_num % self.num_participants() as u64 != self.our_index as u64
    }

    /// Stage of the record's lifecycle.
    pub fn stage(&self) -> ChannelStage {
        if self.commitments.len() >= 2 {
            ChannelStage::Open
        } else {
            ChannelStage::PartiallyOpen
        }
    }

    /// A channel is fully open once it holds at least two commitments, so
    /// both a latest and a penultimate commitment exist.
    pub fn is_fully_open(&self) -> bool {
        self.stage() == ChannelStage::Open
    }

    /// The latest stored commitment.
    pub fn last_commitment(&self) -> Option<&SignedCommitment> {
        self.commitments.last()
    }

    /// The commitment before the latest one.
    pub fn penultimate_commitment(&self) -> Option<&SignedCommitment> {
        self.commitments.len().checked_sub(2).map(|i| &self.commitments[i])
    }

    /// The window of commitments a counterparty needs to catch up: at most
    /// the last two.
    pub fn recent_commitments(&self) -> Vec<SignedCommitment> {
        let start = self.commitments.len().saturating_sub(2);
        self.commitments[start..].to_vec()
    }

    /// Whether both setup rounds have completed and the channel is live.
    /// Setup spans turns `0 .. 2n - 1`, so the channel is ready once the
    /// latest turn reaches `2n - 1` without concluding.
    pub fn setup_complete(&self) -> bool {
        let ready_turn = 2 * self.num_participants() as u64 - 1;
        self.turn_num >= ready_turn
            && self
                .last_commitment()
                .map(|c| c.commitment.commitment_type != CommitmentType::Conclude)
                .unwrap_or(false)
    }

    /// The address of the participant expected to sign the next turn.
    pub fn next_mover(&self) -> Address {
        let next = (self.turn_num + 1) % self.num_participants() as u64;
        self.participants[next as usize]
    }

    /// The participant we forward our commitments to.
    pub fn next_participant(&self) -> Address {
        let next = (self.our_index + 1) % self.num_participants();
        self.participants[next]
    }

    /// Total funds the latest commitment allocates.
    pub fn total_allocation(&self) -> u128 {
        self.last_commitment()
            .map(|c| c.commitment.total_allocation())
            .unwrap_or(0)
    }
}
