//! Consensus channel application
//!
//! Ledger channels run this built-in application. Participants take turns
//! either proposing a new allocation or voting on the standing proposal.
//! Balances only change at the final vote, when the proposal becomes the
//! outcome. Every intermediate commitment leaves the allocation untouched.
//!
//! The app attributes of a consensus commitment encode `ConsensusAttrs`.
//! `further_votes_required` counts down from `n - 1` as votes accumulate;
//! reaching zero means consensus.

use crate::commitment::{Commitment, CommitmentType};
use crate::identifiers::Address;
use serde::{Deserialize, Serialize};

/// Whether a commitment carries a live proposal or a settled consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    /// A proposal is on the table and votes are outstanding.
    Proposal,
    /// All participants have agreed; no proposal is pending.
    Consensus,
}

/// Application attributes carried by every consensus-channel commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusAttrs {
    /// Votes still needed before the proposal becomes the outcome.
    /// Zero whenever `update_type` is `Consensus`.
    pub further_votes_required: u32,
    /// The allocation the proposal would install.
    pub proposed_allocation: Vec<u128>,
    /// The destinations the proposal would install.
    pub proposed_destination: Vec<Address>,
    /// Proposal or consensus.
    pub update_type: UpdateType,
}

impl ConsensusAttrs {
    /// Attributes for a settled consensus with no pending proposal.
    pub fn consensus() -> Self {
        Self {
            further_votes_required: 0,
            proposed_allocation: Vec::new(),
            proposed_destination: Vec::new(),
            update_type: UpdateType::Consensus,
        }
    }

    /// Canonical encoding for `Commitment::app_attributes`.
    pub fn encode(&self) -> Vec<u8> {
        #[allow(clippy::expect_used)]
        let bytes = bincode::serialize(self).expect("plain derives always encode");
        bytes
    }

    /// Decode from a commitment's app attributes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        bincode::deserialize(bytes).map_err(|_| ConsensusError::MalformedAttributes)
    }
}

/// Errors from consensus attribute handling and commitment crafting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    /// App attributes did not decode to `ConsensusAttrs`.
    #[error("app attributes are not valid consensus attributes")]
    MalformedAttributes,

    /// An accept was requested but no proposal is pending.
    #[error("no proposal to vote on")]
    NoProposal,
}

/// Craft the commitment that puts a new allocation up for a vote.
///
/// The proposer implicitly casts the first vote, so `n - 1` further votes
/// remain. Current balances are untouched until the final vote.
pub fn propose(
    last: &Commitment,
    proposed_allocation: Vec<u128>,
    proposed_destination: Vec<Address>,
) -> Commitment {
    let n = last.channel.num_participants() as u32;
    let attrs = ConsensusAttrs {
        further_votes_required: n - 1,
        proposed_allocation,
        proposed_destination,
        update_type: UpdateType::Proposal,
    };
    Commitment {
        channel: last.channel.clone(),
        turn_num: last.turn_num + 1,
        allocation: last.allocation.clone(),
        destination: last.destination.clone(),
        commitment_type: CommitmentType::App,
        commitment_count: last.commitment_count + 1,
        app_attributes: attrs.encode(),
    }
}

/// Craft the commitment that accepts the standing proposal.
///
/// When other votes are still outstanding this is an intermediate vote
/// that decrements the counter. When ours is the last vote required, the
/// proposal becomes the outcome and the attributes reset to consensus.
pub fn accept(last: &Commitment) -> Result<Commitment, ConsensusError> {
    let attrs = ConsensusAttrs::decode(&last.app_attributes)?;
    if attrs.update_type != UpdateType::Proposal {
        return Err(ConsensusError::NoProposal);
    }
    if attrs.further_votes_required == 1 {
        // Final vote: install the proposed outcome, round complete.
        Ok(Commitment {
            channel: last.channel.clone(),
            turn_num: last.turn_num + 1,
            allocation: attrs.proposed_allocation.clone(),
            destination: attrs.proposed_destination.clone(),
            commitment_type: CommitmentType::App,
            commitment_count: 0,
            app_attributes: ConsensusAttrs::consensus().encode(),
        })
    } else {
        Ok(Commitment {
            channel: last.channel.clone(),
            turn_num: last.turn_num + 1,
            allocation: last.allocation.clone(),
            destination: last.destination.clone(),
            commitment_type: CommitmentType::App,
            commitment_count: last.commitment_count + 1,
            app_attributes: ConsensusAttrs {
                further_votes_required: attrs.further_votes_required - 1,
                ..attrs
            }
            .encode(),
        })
    }
}

/// Craft the commitment that passes the turn without proposing anything.
pub fn pass(last: &Commitment) -> Commitment {
    Commitment {
        channel: last.channel.clone(),
        turn_num: last.turn_num + 1,
        allocation: last.allocation.clone(),
        destination: last.destination.clone(),
        commitment_type: CommitmentType::App,
        commitment_count: last.commitment_count + 1,
        app_attributes: ConsensusAttrs::consensus().encode(),
    }
}

/// Craft the commitment that rejects the standing proposal outright.
pub fn veto(last: &Commitment) -> Result<Commitment, ConsensusError> {
    let attrs = ConsensusAttrs::decode(&last.app_attributes)?;
    if attrs.update_type != UpdateType::Proposal {
        return Err(ConsensusError::NoProposal);
    }
    Ok(Commitment {
        channel: last.channel.clone(),
        turn_num: last.turn_num + 1,
        allocation: last.allocation.clone(),
        destination: last.destination.clone(),
        commitment_type: CommitmentType::App,
        commitment_count: 0,
        app_attributes: ConsensusAttrs::consensus().encode(),
    })
}

/// A transition violates the consensus application's rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusViolation {
    #[error("app attributes are not valid consensus attributes")]
    MalformedAttributes,

    #[error("balances changed outside a final vote")]
    BalancesChanged,

    #[error("further votes required must start at {expected}, got {actual}")]
    WrongInitialVoteCount { expected: u32, actual: u32 },

    #[error("further votes required must decrement from {from} to {expected}, got {actual}")]
    WrongVoteCountdown { from: u32, expected: u32, actual: u32 },

    #[error("outcome after final vote must equal the proposal")]
    OutcomeMismatch,

    #[error("proposal must be cleared after the round settles")]
    ProposalNotCleared,
}

fn balances_unchanged(from: &Commitment, to: &Commitment) -> Result<(), ConsensusViolation> {
    if from.allocation != to.allocation || from.destination != to.destination {
        return Err(ConsensusViolation::BalancesChanged);
    }
    Ok(())
}

/// Validate an App-to-App transition under the consensus rules.
///
/// Turn-number and identity checks are the caller's responsibility; this
/// only judges the application content.
pub fn valid_consensus_transition(
    from: &Commitment,
    to: &Commitment,
) -> Result<(), ConsensusViolation> {
    let from_attrs = ConsensusAttrs::decode(&from.app_attributes)
        .map_err(|_| ConsensusViolation::MalformedAttributes)?;
    let to_attrs = ConsensusAttrs::decode(&to.app_attributes)
        .map_err(|_| ConsensusViolation::MalformedAttributes)?;
    let n = from.channel.num_participants() as u32;

    match (from_attrs.update_type, to_attrs.update_type) {
        // propose: a fresh proposal opens with n - 1 votes outstanding.
        (UpdateType::Consensus, UpdateType::Proposal) => {
            balances_unchanged(from, to)?;
            if to_attrs.further_votes_required != n - 1 {
                return Err(ConsensusViolation::WrongInitialVoteCount {
                    expected: n - 1,
                    actual: to_attrs.further_votes_required,
                });
            }
            Ok(())
        }
        // pass: nothing proposed, nothing changed.
        (UpdateType::Consensus, UpdateType::Consensus) => balances_unchanged(from, to),
        (UpdateType::Proposal, UpdateType::Proposal) => {
            balances_unchanged(from, to)?;
            if to_attrs.proposed_allocation == from_attrs.proposed_allocation
                && to_attrs.proposed_destination == from_attrs.proposed_destination
            {
                // vote: counter must tick down by exactly one.
                let expected = from_attrs.further_votes_required.saturating_sub(1);
                if to_attrs.further_votes_required != expected || expected == 0 {
                    return Err(ConsensusViolation::WrongVoteCountdown {
                        from: from_attrs.further_votes_required,
                        expected,
                        actual: to_attrs.further_votes_required,
                    });
                }
                Ok(())
            } else {
                // proposeAlternative: restarts the vote count.
                if to_attrs.further_votes_required != n - 1 {
                    return Err(ConsensusViolation::WrongInitialVoteCount {
                        expected: n - 1,
                        actual: to_attrs.further_votes_required,
                    });
                }
                Ok(())
            }
        }
        (UpdateType::Proposal, UpdateType::Consensus) => {
            if to_attrs != ConsensusAttrs::consensus() {
                return Err(ConsensusViolation::ProposalNotCleared);
            }
            if from_attrs.further_votes_required == 1 {
                // finalVote: the proposal becomes the outcome.
                if to.allocation != from_attrs.proposed_allocation
                    || to.destination != from_attrs.proposed_destination
                {
                    // A veto from fvr == 1 is also legal; then balances hold.
                    balances_unchanged(from, to)
                        .map_err(|_| ConsensusViolation::OutcomeMismatch)?;
                }
                Ok(())
            } else {
                // veto: balances hold.
                balances_unchanged(from, to)
            }
        }
    }
}
