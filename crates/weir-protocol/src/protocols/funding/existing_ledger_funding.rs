//! Funding from an existing ledger channel
//!
//! Carves an allocation for the application channel out of a ledger
//! channel that is already open and funded: each participant's stake
//! moves from their ledger entry to a single entry whose destination is
//! the application channel itself. When the ledger balances fall short
//! the channel is topped up first. A ledger participant outside the
//! application channel (a hub) fronts the stakes of the participants it
//! stands in for.

use tracing::warn;
use weir_core::identifiers::{Address, ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::{ChannelRecord, FundingDescriptor, SharedContext};

use crate::events::{EngineEvent, RoutedEvent};
use crate::protocols::consensus_update::{self, ConsensusUpdateState};
use crate::protocols::funding::advance_post_fund_setup;
use crate::protocols::funding::ledger_top_up::{self, LedgerTopUpState};
use crate::protocols::store_new_commitments;
use crate::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingLedgerFundingFailureReason {
    ChannelDoesntExist,
    LedgerChannelDoesntExist,
    TopUpFailed,
    LedgerUpdateFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingLedgerFundingState {
    WaitForLedgerTopUp {
        process_id: ProcessId,
        channel_id: ChannelId,
        ledger_channel_id: ChannelId,
        locator: ProtocolLocator,
        top_up: LedgerTopUpState,
    },
    WaitForLedgerUpdate {
        process_id: ProcessId,
        channel_id: ChannelId,
        ledger_channel_id: ChannelId,
        locator: ProtocolLocator,
        consensus_update: ConsensusUpdateState,
    },
    /// The carve-out is agreed; the application channel's setup rounds
    /// finish over direct messages.
    WaitForPostFundSetup {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
    },
    Success,
    Failure {
        reason: ExistingLedgerFundingFailureReason,
    },
}

impl ExistingLedgerFundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExistingLedgerFundingState::Success | ExistingLedgerFundingState::Failure { .. }
        )
    }
}

/// Fund `channel_id` out of `ledger_channel_id`.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_channel_id: ChannelId,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<ExistingLedgerFundingState> {
    let Some(app) = context.get_channel(&channel_id) else {
        return Transition::new(
            ExistingLedgerFundingState::Failure {
                reason: ExistingLedgerFundingFailureReason::ChannelDoesntExist,
            },
            context,
        );
    };
    let Some(ledger) = context.get_channel(&ledger_channel_id) else {
        return Transition::new(
            ExistingLedgerFundingState::Failure {
                reason: ExistingLedgerFundingFailureReason::LedgerChannelDoesntExist,
            },
            context,
        );
    };

    let stakes = ledger_stakes(app, ledger);
    let balances: Vec<u128> = ledger
        .participants
        .iter()
        .map(|participant| balance_for(ledger, participant))
        .collect();
    if stakes
        .iter()
        .zip(&balances)
        .any(|(stake, balance)| stake > balance)
    {
        let targets = stakes
            .iter()
            .zip(&balances)
            .map(|(stake, balance)| (*stake).max(*balance))
            .collect();
        let child = ledger_top_up::initialize(
            process_id.clone(),
            ledger_channel_id,
            targets,
            locator.descend(ProtocolTag::LedgerTopUp),
            context,
        );
        return fold_top_up(process_id, channel_id, ledger_channel_id, locator, child);
    }
    start_ledger_update(process_id, channel_id, ledger_channel_id, locator, context)
}

/// Consume one routed event.
pub fn update(
    state: ExistingLedgerFundingState,
    mut context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<ExistingLedgerFundingState> {
    if state.is_terminal() {
        warn!(?routed, "event for terminal ledger funding ignored");
        return Transition::new(state, context);
    }
    match state {
        ExistingLedgerFundingState::WaitForLedgerTopUp {
            process_id,
            channel_id,
            ledger_channel_id,
            locator,
            top_up,
        } => match routed.for_child(ProtocolTag::LedgerTopUp) {
            Some(child_event) => {
                let child = ledger_top_up::update(top_up, context, &child_event);
                fold_top_up(process_id, channel_id, ledger_channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the top-up child");
                Transition::new(
                    ExistingLedgerFundingState::WaitForLedgerTopUp {
                        process_id,
                        channel_id,
                        ledger_channel_id,
                        locator,
                        top_up,
                    },
                    context,
                )
            }
        },
        ExistingLedgerFundingState::WaitForLedgerUpdate {
            process_id,
            channel_id,
            ledger_channel_id,
            locator,
            consensus_update: inner,
        } => match routed.for_child(ProtocolTag::ConsensusUpdate) {
            Some(child_event) => {
                let child = consensus_update::update(inner, context, &child_event.event);
                fold_ledger_update(process_id, channel_id, ledger_channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the ledger update");
                Transition::new(
                    ExistingLedgerFundingState::WaitForLedgerUpdate {
                        process_id,
                        channel_id,
                        ledger_channel_id,
                        locator,
                        consensus_update: inner,
                    },
                    context,
                )
            }
        },
        ExistingLedgerFundingState::WaitForPostFundSetup {
            process_id,
            channel_id,
            locator,
        } => match &routed.event {
            EngineEvent::CommitmentsReceived {
                signed_commitments, ..
            } if routed.is_local() => {
                store_new_commitments(&mut context, signed_commitments);
                if advance_post_fund_setup(&process_id, &channel_id, &locator, &mut context) {
                    Transition::new(ExistingLedgerFundingState::Success, context)
                } else {
                    Transition::new(
                        ExistingLedgerFundingState::WaitForPostFundSetup {
                            process_id,
                            channel_id,
                            locator,
                        },
                        context,
                    )
                }
            }
            other => {
                warn!(?other, "unexpected event during post-fund setup");
                Transition::new(
                    ExistingLedgerFundingState::WaitForPostFundSetup {
                        process_id,
                        channel_id,
                        locator,
                    },
                    context,
                )
            }
        },
        terminal => Transition::new(terminal, context),
    }
}

/// Propose the ledger outcome with the application channel's entry carved
/// out of its participants' balances.
fn start_ledger_update(
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_channel_id: ChannelId,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<ExistingLedgerFundingState> {
    let (Some(app), Some(ledger)) = (
        context.get_channel(&channel_id),
        context.get_channel(&ledger_channel_id),
    ) else {
        return Transition::new(
            ExistingLedgerFundingState::Failure {
                reason: ExistingLedgerFundingFailureReason::LedgerChannelDoesntExist,
            },
            context,
        );
    };
    let stakes = ledger_stakes(app, ledger);
    let total = app.total_allocation();
    let mut proposed_allocation = Vec::with_capacity(ledger.num_participants() + 1);
    let mut proposed_destination = Vec::with_capacity(ledger.num_participants() + 1);
    for (participant, stake) in ledger.participants.iter().zip(&stakes) {
        // Affordability is checked before this runs; top-ups cover any gap.
        let remainder = balance_for(ledger, participant).saturating_sub(*stake);
        proposed_allocation.push(remainder);
        proposed_destination.push(*participant);
    }
    proposed_allocation.push(total);
    proposed_destination.push(Address::from(channel_id));

    let child = consensus_update::initialize(
        process_id.clone(),
        ledger_channel_id,
        proposed_allocation,
        proposed_destination,
        true,
        locator.descend(ProtocolTag::ConsensusUpdate),
        context,
    );
    fold_ledger_update(process_id, channel_id, ledger_channel_id, locator, child)
}

fn fold_top_up(
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<LedgerTopUpState>,
) -> Transition<ExistingLedgerFundingState> {
    match child.state {
        LedgerTopUpState::Success => start_ledger_update(
            process_id,
            channel_id,
            ledger_channel_id,
            locator,
            child.context,
        ),
        LedgerTopUpState::Failure { .. } => Transition::new(
            ExistingLedgerFundingState::Failure {
                reason: ExistingLedgerFundingFailureReason::TopUpFailed,
            },
            child.context,
        ),
        top_up => Transition::new(
            ExistingLedgerFundingState::WaitForLedgerTopUp {
                process_id,
                channel_id,
                ledger_channel_id,
                locator,
                top_up,
            },
            child.context,
        ),
    }
}

fn fold_ledger_update(
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<ConsensusUpdateState>,
) -> Transition<ExistingLedgerFundingState> {
    match child.state {
        ConsensusUpdateState::Success => {
            let mut context = child.context;
            context.set_funding(channel_id, FundingDescriptor::via_channel(ledger_channel_id));
            if let Err(error) = context.set_channel_funded(&channel_id) {
                warn!(%error, "funded channel has no record");
            }
            if advance_post_fund_setup(&process_id, &channel_id, &locator, &mut context) {
                Transition::new(ExistingLedgerFundingState::Success, context)
            } else {
                Transition::new(
                    ExistingLedgerFundingState::WaitForPostFundSetup {
                        process_id,
                        channel_id,
                        locator,
                    },
                    context,
                )
            }
        }
        ConsensusUpdateState::Failure { .. } => Transition::new(
            ExistingLedgerFundingState::Failure {
                reason: ExistingLedgerFundingFailureReason::LedgerUpdateFailed,
            },
            child.context,
        ),
        consensus_update => Transition::new(
            ExistingLedgerFundingState::WaitForLedgerUpdate {
                process_id,
                channel_id,
                ledger_channel_id,
                locator,
                consensus_update,
            },
            child.context,
        ),
    }
}

/// Each ledger participant's stake in the application channel. A ledger
/// participant outside the application channel fronts whatever the
/// application's own participants do not cover through this ledger.
fn ledger_stakes(app: &ChannelRecord, ledger: &ChannelRecord) -> Vec<u128> {
    let mut stakes: Vec<u128> = ledger
        .participants
        .iter()
        .map(|participant| app_contribution(app, participant))
        .collect();
    let covered: u128 = stakes.iter().sum();
    let remainder = app.total_allocation().saturating_sub(covered);
    if remainder > 0 {
        if let Some(index) = ledger
            .participants
            .iter()
            .position(|participant| !app.participants.contains(participant))
        {
            stakes[index] += remainder;
        }
    }
    stakes
}

/// What `participant` owes the application channel, from its latest
/// commitment.
fn app_contribution(app: &ChannelRecord, participant: &Address) -> u128 {
    app.last_commitment()
        .map(|signed| {
            signed
                .commitment
                .destination
                .iter()
                .zip(&signed.commitment.allocation)
                .filter(|(destination, _)| *destination == participant)
                .map(|(_, amount)| amount)
                .sum()
        })
        .unwrap_or(0)
}

fn balance_for(record: &ChannelRecord, participant: &Address) -> u128 {
    record
        .last_commitment()
        .map(|signed| {
            signed
                .commitment
                .destination
                .iter()
                .zip(&signed.commitment.allocation)
                .filter(|(destination, _)| *destination == participant)
                .map(|(_, amount)| amount)
                .sum()
        })
        .unwrap_or(0)
}
