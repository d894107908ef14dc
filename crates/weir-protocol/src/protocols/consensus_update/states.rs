//! Consensus-update protocol states

use weir_core::identifiers::{Address, ChannelId, ProcessId};
use weir_core::locator::ProtocolLocator;

/// Why the round terminated without consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// A participant moved without reaching or matching consensus.
    ConsensusNotReached,
    /// The standing proposal targets a different outcome than ours.
    ProposalDoesNotMatch,
    /// The channel to update is not in the store.
    ChannelDoesntExist,
}

/// Waiting to act: either the turn is not ours yet or the external gate
/// has not opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotSafeToSend {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub proposed_allocation: Vec<u128>,
    pub proposed_destination: Vec<Address>,
    /// Full path to this instance, used on outgoing messages.
    pub locator: ProtocolLocator,
    /// Gate serializing multiple updates that share one ledger channel.
    pub cleared_to_send: bool,
}

/// Our commitment for this round is signed, stored, and relayed; waiting
/// for the remaining votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentSent {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub proposed_allocation: Vec<u128>,
    pub proposed_destination: Vec<Address>,
    pub locator: ProtocolLocator,
}

/// The consensus-update state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusUpdateState {
    NotSafeToSend(NotSafeToSend),
    CommitmentSent(CommitmentSent),
    Success,
    Failure { reason: FailureReason },
}

impl ConsensusUpdateState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsensusUpdateState::Success | ConsensusUpdateState::Failure { .. }
        )
    }
}
