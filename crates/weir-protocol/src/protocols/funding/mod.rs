//! Funding orchestration
//!
//! Picks a funding strategy for a channel and composes the child
//! protocols that carry it out:
//!
//! - a consensus (ledger) channel is funded *directly* by on-chain
//!   deposits;
//! - an application channel is funded out of an *existing ledger
//!   channel* with the same counterparty when one is open and funded;
//! - failing that, through a *hub* ledger channel when one was named;
//! - otherwise by opening and funding a *new ledger channel* first.

use tracing::warn;
use weir_core::commitment::{ChannelType, Commitment, CommitmentType};
use weir_core::identifiers::{Address, ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::{ChannelRecord, SharedContext};

use crate::events::RoutedEvent;
use crate::Transition;

pub mod direct_funding;
pub mod existing_ledger_funding;
pub mod ledger_top_up;
pub mod new_ledger_channel;
pub mod virtual_funding;

use direct_funding::DirectFundingState;
use existing_ledger_funding::ExistingLedgerFundingState;
use new_ledger_channel::NewLedgerChannelState;
use virtual_funding::VirtualFundingState;

/// Why funding a channel failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingFailureReason {
    ChannelDoesntExist,
    DirectFundingFailed,
    LedgerFundingFailed,
    NewLedgerChannelFailed,
    VirtualFundingFailed,
}

/// The funding orchestrator state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingState {
    WaitForDirectFunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
        funding: DirectFundingState,
    },
    WaitForExistingLedgerFunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
        inner: ExistingLedgerFundingState,
    },
    WaitForNewLedgerChannel {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
        inner: NewLedgerChannelState,
    },
    WaitForVirtualFunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
        inner: VirtualFundingState,
    },
    Success,
    Failure { reason: FundingFailureReason },
}

impl FundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FundingState::Success | FundingState::Failure { .. }
        )
    }
}

/// Pick a strategy for the channel and launch it.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    hub: Option<Address>,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<FundingState> {
    if context.funding_state(&channel_id).is_some() {
        return Transition::new(FundingState::Success, context);
    }
    let Some(record) = context.get_channel(&channel_id) else {
        return Transition::new(
            FundingState::Failure {
                reason: FundingFailureReason::ChannelDoesntExist,
            },
            context,
        );
    };

    match record.channel_type {
        ChannelType::Consensus => {
            let child = direct_funding::initialize(
                process_id.clone(),
                channel_id,
                locator.descend(ProtocolTag::DirectFunding),
                context,
            );
            fold_direct(process_id, channel_id, locator, child)
        }
        ChannelType::Application(_) => {
            if let Some(ledger_channel_id) = suitable_ledger(&context, record) {
                let child = existing_ledger_funding::initialize(
                    process_id.clone(),
                    channel_id,
                    ledger_channel_id,
                    locator.descend(ProtocolTag::ExistingLedgerFunding),
                    context,
                );
                fold_existing(process_id, channel_id, locator, child)
            } else if let Some(hub) = hub {
                let child = virtual_funding::initialize(
                    process_id.clone(),
                    channel_id,
                    hub,
                    locator.descend(ProtocolTag::VirtualFunding),
                    context,
                );
                fold_virtual(process_id, channel_id, locator, child)
            } else {
                let child = new_ledger_channel::initialize(
                    process_id.clone(),
                    channel_id,
                    locator.descend(ProtocolTag::NewLedgerChannel),
                    context,
                );
                fold_new_ledger(process_id, channel_id, locator, child)
            }
        }
    }
}

/// Route one event to the running strategy.
pub fn update(
    state: FundingState,
    context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<FundingState> {
    if state.is_terminal() {
        warn!(?routed, "event for terminal funding process ignored");
        return Transition::new(state, context);
    }
    match state {
        FundingState::WaitForDirectFunding {
            process_id,
            channel_id,
            locator,
            funding,
        } => match routed.for_child(ProtocolTag::DirectFunding) {
            Some(child_event) => {
                let child = direct_funding::update(funding, context, &child_event);
                fold_direct(process_id, channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the direct-funding child");
                Transition::new(
                    FundingState::WaitForDirectFunding {
                        process_id,
                        channel_id,
                        locator,
                        funding,
                    },
                    context,
                )
            }
        },
        FundingState::WaitForExistingLedgerFunding {
            process_id,
            channel_id,
            locator,
            inner,
        } => match routed.for_child(ProtocolTag::ExistingLedgerFunding) {
            Some(child_event) => {
                let child = existing_ledger_funding::update(inner, context, &child_event);
                fold_existing(process_id, channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the ledger-funding child");
                Transition::new(
                    FundingState::WaitForExistingLedgerFunding {
                        process_id,
                        channel_id,
                        locator,
                        inner,
                    },
                    context,
                )
            }
        },
        FundingState::WaitForNewLedgerChannel {
            process_id,
            channel_id,
            locator,
            inner,
        } => match routed.for_child(ProtocolTag::NewLedgerChannel) {
            Some(child_event) => {
                let child = new_ledger_channel::update(inner, context, &child_event);
                fold_new_ledger(process_id, channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the new-ledger child");
                Transition::new(
                    FundingState::WaitForNewLedgerChannel {
                        process_id,
                        channel_id,
                        locator,
                        inner,
                    },
                    context,
                )
            }
        },
        FundingState::WaitForVirtualFunding {
            process_id,
            channel_id,
            locator,
            inner,
        } => match routed.for_child(ProtocolTag::VirtualFunding) {
            Some(child_event) => {
                let child = virtual_funding::update(inner, context, &child_event);
                fold_virtual(process_id, channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the virtual-funding child");
                Transition::new(
                    FundingState::WaitForVirtualFunding {
                        process_id,
                        channel_id,
                        locator,
                        inner,
                    },
                    context,
                )
            }
        },
        terminal => Transition::new(terminal, context),
    }
}

/// An open, funded ledger channel with exactly the channel's participants.
fn suitable_ledger(context: &SharedContext, record: &ChannelRecord) -> Option<ChannelId> {
    context
        .channel_store
        .iter()
        .find(|(_, candidate)| {
            candidate.channel_type == ChannelType::Consensus
                && candidate.funded
                && candidate.setup_complete()
                && candidate.participants == record.participants
        })
        .map(|(channel_id, _)| *channel_id)
}

fn fold_direct(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<DirectFundingState>,
) -> Transition<FundingState> {
    match child.state {
        DirectFundingState::Success => Transition::new(FundingState::Success, child.context),
        DirectFundingState::Failure { .. } => Transition::new(
            FundingState::Failure {
                reason: FundingFailureReason::DirectFundingFailed,
            },
            child.context,
        ),
        funding => Transition::new(
            FundingState::WaitForDirectFunding {
                process_id,
                channel_id,
                locator,
                funding,
            },
            child.context,
        ),
    }
}

fn fold_existing(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<ExistingLedgerFundingState>,
) -> Transition<FundingState> {
    match child.state {
        ExistingLedgerFundingState::Success => {
            Transition::new(FundingState::Success, child.context)
        }
        ExistingLedgerFundingState::Failure { .. } => Transition::new(
            FundingState::Failure {
                reason: FundingFailureReason::LedgerFundingFailed,
            },
            child.context,
        ),
        inner => Transition::new(
            FundingState::WaitForExistingLedgerFunding {
                process_id,
                channel_id,
                locator,
                inner,
            },
            child.context,
        ),
    }
}

fn fold_new_ledger(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<NewLedgerChannelState>,
) -> Transition<FundingState> {
    match child.state {
        NewLedgerChannelState::Success => Transition::new(FundingState::Success, child.context),
        NewLedgerChannelState::Failure { .. } => Transition::new(
            FundingState::Failure {
                reason: FundingFailureReason::NewLedgerChannelFailed,
            },
            child.context,
        ),
        inner => Transition::new(
            FundingState::WaitForNewLedgerChannel {
                process_id,
                channel_id,
                locator,
                inner,
            },
            child.context,
        ),
    }
}

fn fold_virtual(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<VirtualFundingState>,
) -> Transition<FundingState> {
    match child.state {
        VirtualFundingState::Success => Transition::new(FundingState::Success, child.context),
        VirtualFundingState::Failure { .. } => Transition::new(
            FundingState::Failure {
                reason: FundingFailureReason::VirtualFundingFailed,
            },
            child.context,
        ),
        inner => Transition::new(
            FundingState::WaitForVirtualFunding {
                process_id,
                channel_id,
                locator,
                inner,
            },
            child.context,
        ),
    }
}

/// The next post-fund-setup commitment for the channel, if it is still in
/// its setup rounds.
fn craft_post_fund_setup(record: &ChannelRecord) -> Option<Commitment> {
    let last = &record.last_commitment()?.commitment;
    if !matches!(
        last.commitment_type,
        CommitmentType::PreFundSetup | CommitmentType::PostFundSetup
    ) {
        return None;
    }
    let n = record.num_participants() as u64;
    let turn_num = last.turn_num + 1;
    Some(Commitment {
        channel: record.identity(),
        turn_num,
        allocation: last.allocation.clone(),
        destination: last.destination.clone(),
        commitment_type: CommitmentType::PostFundSetup,
        commitment_count: (turn_num - n) as u32,
        app_attributes: last.app_attributes.clone(),
    })
}

/// Push the channel's setup rounds forward: sign our post-fund-setup
/// commitment when the turn is ours and relay it. Returns whether setup
/// has completed.
pub(crate) fn advance_post_fund_setup(
    process_id: &ProcessId,
    channel_id: &ChannelId,
    locator: &ProtocolLocator,
    context: &mut SharedContext,
) -> bool {
    let Some(record) = context.get_channel(channel_id) else {
        return false;
    };
    if record.setup_complete() {
        return true;
    }
    if !record.our_turn() {
        return false;
    }
    let Some(commitment) = craft_post_fund_setup(record) else {
        return false;
    };
    let to = record.next_participant();
    if let Err(error) = context.sign_and_store(commitment) {
        warn!(%error, %channel_id, "could not sign post-fund setup");
        return false;
    }
    if let Err(error) =
        context.queue_commitments(to, process_id.clone(), locator.clone(), channel_id)
    {
        warn!(%error, %channel_id, "could not relay post-fund setup");
    }
    context
        .get_channel(channel_id)
        .map(|record| record.setup_complete())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::commitment::ChannelIdentity;
    use weir_core::identifiers::AppId;
    use weir_testkit::{
        ledger_commitment, ledger_identity, postfund_commitment, prefund_commitment, sign_by_mover,
        Participants,
    };

    fn app_identity(p: &Participants) -> ChannelIdentity {
        ChannelIdentity {
            channel_type: ChannelType::Application(AppId([7; 32])),
            nonce: 40,
            participants: p.addresses(),
        }
    }

    fn open_ledger(p: &Participants, ctx: &mut SharedContext) -> ChannelId {
        let identity = ledger_identity(&p.addresses(), 1);
        let channel_id = identity.channel_id();
        ctx.check_and_initialize(sign_by_mover(p, prefund_commitment(&identity, 0)))
            .unwrap();
        let record = ctx.channel_store.get_mut(&channel_id).unwrap();
        record.push_commitment(sign_by_mover(p, prefund_commitment(&identity, 1)));
        record.push_commitment(sign_by_mover(p, postfund_commitment(&identity, 2)));
        record.push_commitment(sign_by_mover(p, postfund_commitment(&identity, 3)));
        record.push_commitment(sign_by_mover(p, ledger_commitment(&identity, 4, &[5, 5])));
        record.funded = true;
        channel_id
    }

    #[test]
    fn consensus_channels_fund_directly() {
        let p = Participants::pair();
        let identity = ledger_identity(&p.addresses(), 1);
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[0], p.key_ref(0));
        ctx.sign_and_initialize(prefund_commitment(&identity, 0))
            .unwrap();
        let channel_id = identity.channel_id();

        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            None,
            ProtocolLocator::of(ProtocolTag::Funding),
            ctx,
        );
        assert!(matches!(t.state, FundingState::WaitForDirectFunding { .. }));
    }

    #[test]
    fn app_channels_prefer_an_open_ledger_with_the_same_participants() {
        let p = Participants::pair();
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[0], p.key_ref(0));
        open_ledger(&p, &mut ctx);

        let identity = app_identity(&p);
        ctx.rules.register(
            AppId([7; 32]),
            std::sync::Arc::new(weir_store::ConsensusRule),
        );
        ctx.sign_and_initialize(weir_core::commitment::Commitment {
            channel: identity.clone(),
            turn_num: 0,
            allocation: vec![2, 3],
            destination: p.addresses(),
            commitment_type: CommitmentType::PreFundSetup,
            commitment_count: 0,
            app_attributes: weir_core::consensus::ConsensusAttrs::consensus().encode(),
        })
        .unwrap();
        let channel_id = identity.channel_id();

        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            None,
            ProtocolLocator::of(ProtocolTag::Funding),
            ctx,
        );
        assert!(
            matches!(t.state, FundingState::WaitForExistingLedgerFunding { .. }),
            "got {:?}",
            t.state
        );
    }

    #[test]
    fn app_channels_without_a_ledger_open_a_new_one() {
        let p = Participants::pair();
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[0], p.key_ref(0));
        let identity = app_identity(&p);
        ctx.rules.register(
            AppId([7; 32]),
            std::sync::Arc::new(weir_store::ConsensusRule),
        );
        ctx.sign_and_initialize(weir_core::commitment::Commitment {
            channel: identity.clone(),
            turn_num: 0,
            allocation: vec![2, 3],
            destination: p.addresses(),
            commitment_type: CommitmentType::PreFundSetup,
            commitment_count: 0,
            app_attributes: weir_core::consensus::ConsensusAttrs::consensus().encode(),
        })
        .unwrap();
        let channel_id = identity.channel_id();

        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            None,
            ProtocolLocator::of(ProtocolTag::Funding),
            ctx,
        );
        assert!(matches!(t.state, FundingState::WaitForNewLedgerChannel { .. }));
    }

    #[test]
    fn already_funded_channels_succeed_immediately() {
        let p = Participants::pair();
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[0], p.key_ref(0));
        let channel_id = open_ledger(&p, &mut ctx);
        ctx.set_funding(channel_id, weir_store::FundingDescriptor::direct());

        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            None,
            ProtocolLocator::of(ProtocolTag::Funding),
            ctx,
        );
        assert_eq!(t.state, FundingState::Success);
    }

    #[test]
    fn unknown_channels_fail() {
        let p = Participants::pair();
        let ctx = SharedContext::new(p.shared_signer(), p.addresses()[0], p.key_ref(0));
        let channel_id = ChannelId([9; 32]);
        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            None,
            ProtocolLocator::of(ProtocolTag::Funding),
            ctx,
        );
        assert_eq!(
            t.state,
            FundingState::Failure {
                reason: FundingFailureReason::ChannelDoesntExist
            }
        );
    }
}
