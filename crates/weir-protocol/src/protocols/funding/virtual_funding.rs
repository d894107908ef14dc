//! Hub-mediated funding
//!
//! Funds an application channel when no ledger channel with the
//! counterparty exists, by carving the allocation out of a ledger
//! channel we hold with a hub instead. The hub fronts the
//! counterparty's stake and settles with them over its own channels.

use tracing::warn;
use weir_core::commitment::ChannelType;
use weir_core::identifiers::{Address, ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::SharedContext;

use crate::events::RoutedEvent;
use crate::protocols::funding::existing_ledger_funding::{self, ExistingLedgerFundingState};
use crate::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualFundingFailureReason {
    ChannelDoesntExist,
    /// No open, funded ledger channel with the hub.
    NoHubChannel,
    HubFundingFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualFundingState {
    WaitForHubLedgerFunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        hub: Address,
        locator: ProtocolLocator,
        inner: ExistingLedgerFundingState,
    },
    Success,
    Failure { reason: VirtualFundingFailureReason },
}

impl VirtualFundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VirtualFundingState::Success | VirtualFundingState::Failure { .. }
        )
    }
}

/// Fund `channel_id` through our ledger channel with `hub`.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    hub: Address,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<VirtualFundingState> {
    if context.get_channel(&channel_id).is_none() {
        return Transition::new(
            VirtualFundingState::Failure {
                reason: VirtualFundingFailureReason::ChannelDoesntExist,
            },
            context,
        );
    }
    let Some(hub_ledger_id) = hub_ledger(&context, hub) else {
        return Transition::new(
            VirtualFundingState::Failure {
                reason: VirtualFundingFailureReason::NoHubChannel,
            },
            context,
        );
    };
    let child = existing_ledger_funding::initialize(
        process_id.clone(),
        channel_id,
        hub_ledger_id,
        locator.descend(ProtocolTag::ExistingLedgerFunding),
        context,
    );
    fold(process_id, channel_id, hub, locator, child)
}

/// Consume one routed event.
pub fn update(
    state: VirtualFundingState,
    context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<VirtualFundingState> {
    match state {
        VirtualFundingState::WaitForHubLedgerFunding {
            process_id,
            channel_id,
            hub,
            locator,
            inner,
        } => match routed.for_child(ProtocolTag::ExistingLedgerFunding) {
            Some(child_event) => {
                let child = existing_ledger_funding::update(inner, context, &child_event);
                fold(process_id, channel_id, hub, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the hub-ledger child");
                Transition::new(
                    VirtualFundingState::WaitForHubLedgerFunding {
                        process_id,
                        channel_id,
                        hub,
                        locator,
                        inner,
                    },
                    context,
                )
            }
        },
        terminal => {
            warn!(?routed, "event for terminal virtual funding ignored");
            Transition::new(terminal, context)
        }
    }
}

/// An open, funded two-party ledger channel we share with the hub.
fn hub_ledger(context: &SharedContext, hub: Address) -> Option<ChannelId> {
    context
        .channel_store
        .iter()
        .find(|(_, candidate)| {
            candidate.channel_type == ChannelType::Consensus
                && candidate.funded
                && candidate.setup_complete()
                && candidate.num_participants() == 2
                && candidate.participants.contains(&hub)
        })
        .map(|(channel_id, _)| *channel_id)
}

fn fold(
    process_id: ProcessId,
    channel_id: ChannelId,
    hub: Address,
    locator: ProtocolLocator,
    child: Transition<ExistingLedgerFundingState>,
) -> Transition<VirtualFundingState> {
    match child.state {
        ExistingLedgerFundingState::Success => {
            Transition::new(VirtualFundingState::Success, child.context)
        }
        ExistingLedgerFundingState::Failure { .. } => Transition::new(
            VirtualFundingState::Failure {
                reason: VirtualFundingFailureReason::HubFundingFailed,
            },
            child.context,
        ),
        inner => Transition::new(
            VirtualFundingState::WaitForHubLedgerFunding {
                process_id,
                channel_id,
                hub,
                locator,
                inner,
            },
            child.context,
        ),
    }
}
