//! Defunding protocol
//!
//! Returns a closed channel's funds to their owners. A directly funded
//! channel gets an on-chain withdrawal; a channel nested in a ledger
//! allocation gets a consensus update on the ledger channel that replaces
//! the channel's entry with payouts to its participants.

use tracing::warn;
use weir_core::chain::TransactionRequest;
use weir_core::identifiers::{Address, ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::{ChannelRecord, SharedContext};

use crate::events::RoutedEvent;
use crate::protocols::consensus_update::{self, ConsensusUpdateState};
use crate::protocols::transaction_submission::{self, TransactionSubmissionState};
use crate::Transition;

/// Why defunding ended without recovering funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefundingFailureReason {
    ChannelDoesntExist,
    /// No funding record exists for the channel.
    ChannelNotFunded,
    WithdrawalFailed,
    LedgerDefundingFailed,
}

/// Waiting for the on-chain withdrawal of a directly funded channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForWithdrawal {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub transaction: TransactionSubmissionState,
}

/// Waiting for the ledger channel to agree the unwound allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForLedgerDefunding {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub ledger_channel_id: ChannelId,
    pub consensus_update: ConsensusUpdateState,
}

/// The defunding state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefundingState {
    WaitForWithdrawal(WaitForWithdrawal),
    WaitForLedgerDefunding(WaitForLedgerDefunding),
    Success,
    Failure { reason: DefundingFailureReason },
}

impl DefundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DefundingState::Success | DefundingState::Failure { .. }
        )
    }
}

/// The amount the channel's latest commitment allocates to us.
fn our_share(record: &ChannelRecord) -> u128 {
    let Some(last) = record.last_commitment() else {
        return 0;
    };
    last.commitment
        .destination
        .iter()
        .zip(&last.commitment.allocation)
        .filter(|(dest, _)| **dest == record.own_address)
        .map(|(_, amount)| *amount)
        .sum()
}

/// The ledger outcome with the defunded channel's entry replaced by its
/// own interior payouts. Amounts for destinations the ledger already pays
/// are merged rather than duplicated.
fn unwound_ledger_outcome(
    ledger: &ChannelRecord,
    defunded: &ChannelRecord,
) -> Option<(Vec<u128>, Vec<Address>)> {
    let ledger_last = ledger.last_commitment()?;
    let defunded_last = defunded.last_commitment()?;
    let channel_destination = Address::from(defunded.channel_id);

    let mut allocation = Vec::new();
    let mut destination = Vec::new();
    for (dest, amount) in ledger_last
        .commitment
        .destination
        .iter()
        .zip(&ledger_last.commitment.allocation)
    {
        if *dest == channel_destination {
            continue;
        }
        destination.push(*dest);
        allocation.push(*amount);
    }
    for (dest, amount) in defunded_last
        .commitment
        .destination
        .iter()
        .zip(&defunded_last.commitment.allocation)
    {
        match destination.iter().position(|d| d == dest) {
            Some(i) => allocation[i] += *amount,
            None => {
                destination.push(*dest);
                allocation.push(*amount);
            }
        }
    }
    Some((allocation, destination))
}

/// Pick the defunding route from the channel's funding record and start it.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    mut context: SharedContext,
) -> Transition<DefundingState> {
    let Some(record) = context.get_channel(&channel_id) else {
        return Transition::new(
            DefundingState::Failure {
                reason: DefundingFailureReason::ChannelDoesntExist,
            },
            context,
        );
    };
    let Some(descriptor) = context.funding_state(&channel_id).cloned() else {
        return Transition::new(
            DefundingState::Failure {
                reason: DefundingFailureReason::ChannelNotFunded,
            },
            context,
        );
    };

    if descriptor.directly_funded {
        let amount = our_share(record);
        let destination = record.own_address;
        let request = TransactionRequest::Withdraw {
            channel_id,
            destination,
            amount,
        };
        let child = transaction_submission::initialize(process_id.clone(), request, context);
        return child.map(|transaction| {
            DefundingState::WaitForWithdrawal(WaitForWithdrawal {
                process_id,
                channel_id,
                transaction,
            })
        });
    }

    let Some(ledger_channel_id) = descriptor.funding_channel_id else {
        return Transition::new(
            DefundingState::Failure {
                reason: DefundingFailureReason::ChannelNotFunded,
            },
            context,
        );
    };
    let Some(ledger) = context.get_channel(&ledger_channel_id) else {
        return Transition::new(
            DefundingState::Failure {
                reason: DefundingFailureReason::LedgerDefundingFailed,
            },
            context,
        );
    };
    let Some((allocation, destination)) = unwound_ledger_outcome(ledger, record) else {
        return Transition::new(
            DefundingState::Failure {
                reason: DefundingFailureReason::LedgerDefundingFailed,
            },
            context,
        );
    };

    let child = consensus_update::initialize(
        process_id.clone(),
        ledger_channel_id,
        allocation,
        destination,
        true,
        locator.descend(ProtocolTag::ConsensusUpdate),
        context,
    );
    fold_ledger_defunding(process_id, channel_id, ledger_channel_id, child)
}

fn fold_ledger_defunding(
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_channel_id: ChannelId,
    child: Transition<ConsensusUpdateState>,
) -> Transition<DefundingState> {
    match child.state {
        ConsensusUpdateState::Success => Transition::new(DefundingState::Success, child.context),
        ConsensusUpdateState::Failure { .. } => Transition::new(
            DefundingState::Failure {
                reason: DefundingFailureReason::LedgerDefundingFailed,
            },
            child.context,
        ),
        consensus_update => Transition::new(
            DefundingState::WaitForLedgerDefunding(WaitForLedgerDefunding {
                process_id,
                channel_id,
                ledger_channel_id,
                consensus_update,
            }),
            child.context,
        ),
    }
}

/// Consume one routed event.
pub fn update(
    state: DefundingState,
    context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<DefundingState> {
    match state {
        DefundingState::WaitForWithdrawal(inner) => {
            let Some(child_event) = routed.for_child(ProtocolTag::TransactionSubmission) else {
                warn!(?routed, "unexpected event for defunding withdrawal");
                return Transition::new(DefundingState::WaitForWithdrawal(inner), context);
            };
            let child =
                transaction_submission::update(inner.transaction, context, &child_event.event);
            match child.state {
                TransactionSubmissionState::Success { .. } => {
                    Transition::new(DefundingState::Success, child.context)
                }
                TransactionSubmissionState::Failure { .. } => Transition::new(
                    DefundingState::Failure {
                        reason: DefundingFailureReason::WithdrawalFailed,
                    },
                    child.context,
                ),
                transaction => Transition::new(
                    DefundingState::WaitForWithdrawal(WaitForWithdrawal {
                        transaction,
                        ..inner
                    }),
                    child.context,
                ),
            }
        }
        DefundingState::WaitForLedgerDefunding(inner) => {
            let Some(child_event) = routed.for_child(ProtocolTag::ConsensusUpdate) else {
                warn!(?routed, "unexpected event for ledger defunding");
                return Transition::new(DefundingState::WaitForLedgerDefunding(inner), context);
            };
            let child = consensus_update::update(inner.consensus_update, context, &child_event.event);
            fold_ledger_defunding(
                inner.process_id,
                inner.channel_id,
                inner.ledger_channel_id,
                child,
            )
        }
        terminal => {
            warn!(?routed, "event for terminal defunding ignored");
            Transition::new(terminal, context)
        }
    }
}
