//! Funding through a freshly opened ledger channel
//!
//! When no ledger channel exists with the counterparty, open one with
//! the same participants, fund it by direct deposits, then carve the
//! application channel's allocation out of it. Both sides derive the
//! ledger channel's nonce from the application channel id, so they
//! agree on its identity without negotiation.

use tracing::warn;
use weir_core::commitment::{ChannelIdentity, ChannelType, Commitment, CommitmentType};
use weir_core::consensus::ConsensusAttrs;
use weir_core::identifiers::{ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::SharedContext;

use crate::events::{EngineEvent, RoutedEvent};
use crate::protocols::funding::direct_funding::{self, DirectFundingState};
use crate::protocols::funding::existing_ledger_funding::{self, ExistingLedgerFundingState};
use crate::protocols::store_new_commitments;
use crate::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewLedgerChannelFailureReason {
    ChannelDoesntExist,
    DirectFundingFailed,
    LedgerFundingFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewLedgerChannelState {
    /// Exchanging the new ledger channel's pre-fund commitments.
    WaitForPreFundSetup {
        process_id: ProcessId,
        channel_id: ChannelId,
        ledger_channel_id: ChannelId,
        locator: ProtocolLocator,
    },
    WaitForDirectFunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        ledger_channel_id: ChannelId,
        locator: ProtocolLocator,
        funding: DirectFundingState,
    },
    WaitForLedgerFunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        ledger_channel_id: ChannelId,
        locator: ProtocolLocator,
        inner: ExistingLedgerFundingState,
    },
    Success,
    Failure {
        reason: NewLedgerChannelFailureReason,
    },
}

impl NewLedgerChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NewLedgerChannelState::Success | NewLedgerChannelState::Failure { .. }
        )
    }
}

/// The identity both sides derive for the ledger channel backing
/// `channel_id`.
pub fn ledger_identity_for(app: &ChannelIdentity, channel_id: &ChannelId) -> ChannelIdentity {
    let mut nonce_bytes = [0u8; 8];
    nonce_bytes.copy_from_slice(&channel_id.0[..8]);
    ChannelIdentity {
        channel_type: ChannelType::Consensus,
        nonce: u64::from_le_bytes(nonce_bytes),
        participants: app.participants.clone(),
    }
}

/// Open a ledger channel for `channel_id` and start its setup.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    mut context: SharedContext,
) -> Transition<NewLedgerChannelState> {
    let Some(app) = context.get_channel(&channel_id) else {
        return Transition::new(
            NewLedgerChannelState::Failure {
                reason: NewLedgerChannelFailureReason::ChannelDoesntExist,
            },
            context,
        );
    };
    let identity = ledger_identity_for(&app.identity(), &channel_id);
    let ledger_channel_id = identity.channel_id();
    let opener = app.our_index == 0;
    let stakes = app
        .last_commitment()
        .map(|signed| signed.commitment.allocation.clone())
        .unwrap_or_default();
    let next_participant = app.next_participant();

    if opener {
        // The ledger channel seeds each participant's balance with their
        // application-channel stake.
        let opening = Commitment {
            channel: identity.clone(),
            turn_num: 0,
            allocation: stakes,
            destination: identity.participants.clone(),
            commitment_type: CommitmentType::PreFundSetup,
            commitment_count: 0,
            app_attributes: ConsensusAttrs::consensus().encode(),
        };
        if let Err(error) = context.sign_and_initialize(opening) {
            warn!(%error, "could not open the ledger channel");
            return Transition::new(
                NewLedgerChannelState::Failure {
                    reason: NewLedgerChannelFailureReason::DirectFundingFailed,
                },
                context,
            );
        }
        if let Err(error) = context.queue_commitments(
            next_participant,
            process_id.clone(),
            locator.clone(),
            &ledger_channel_id,
        ) {
            warn!(%error, "could not relay the opening commitment");
        }
    }
    Transition::new(
        NewLedgerChannelState::WaitForPreFundSetup {
            process_id,
            channel_id,
            ledger_channel_id,
            locator,
        },
        context,
    )
}

/// Consume one routed event.
pub fn update(
    state: NewLedgerChannelState,
    mut context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<NewLedgerChannelState> {
    if state.is_terminal() {
        warn!(?routed, "event for terminal new-ledger funding ignored");
        return Transition::new(state, context);
    }
    match state {
        NewLedgerChannelState::WaitForPreFundSetup {
            process_id,
            channel_id,
            ledger_channel_id,
            locator,
        } => match &routed.event {
            EngineEvent::CommitmentsReceived {
                signed_commitments, ..
            } if routed.is_local() => {
                store_new_commitments(&mut context, signed_commitments);
                advance_pre_fund_setup(&process_id, &ledger_channel_id, &locator, &mut context);
                let complete = context
                    .get_channel(&ledger_channel_id)
                    .map(|record| {
                        record.turn_num + 1 == record.num_participants() as u64
                    })
                    .unwrap_or(false);
                if complete {
                    let child = direct_funding::initialize(
                        process_id.clone(),
                        ledger_channel_id,
                        locator.descend(ProtocolTag::DirectFunding),
                        context,
                    );
                    fold_direct(process_id, channel_id, ledger_channel_id, locator, child)
                } else {
                    Transition::new(
                        NewLedgerChannelState::WaitForPreFundSetup {
                            process_id,
                            channel_id,
                            ledger_channel_id,
                            locator,
                        },
                        context,
                    )
                }
            }
            other => {
                warn!(?other, "unexpected event during pre-fund setup");
                Transition::new(
                    NewLedgerChannelState::WaitForPreFundSetup {
                        process_id,
                        channel_id,
                        ledger_channel_id,
                        locator,
                    },
                    context,
                )
            }
        },
        NewLedgerChannelState::WaitForDirectFunding {
            process_id,
            channel_id,
            ledger_channel_id,
            locator,
            funding,
        } => match routed.for_child(ProtocolTag::DirectFunding) {
            Some(child_event) => {
                let child = direct_funding::update(funding, context, &child_event);
                fold_direct(process_id, channel_id, ledger_channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the direct-funding child");
                Transition::new(
                    NewLedgerChannelState::WaitForDirectFunding {
                        process_id,
                        channel_id,
                        ledger_channel_id,
                        locator,
                        funding,
                    },
                    context,
                )
            }
        },
        NewLedgerChannelState::WaitForLedgerFunding {
            process_id,
            channel_id,
            ledger_channel_id,
            locator,
            inner,
        } => match routed.for_child(ProtocolTag::ExistingLedgerFunding) {
            Some(child_event) => {
                let child = existing_ledger_funding::update(inner, context, &child_event);
                fold_ledger(process_id, channel_id, ledger_channel_id, locator, child)
            }
            None => {
                warn!(?routed, "event does not address the ledger-funding child");
                Transition::new(
                    NewLedgerChannelState::WaitForLedgerFunding {
                        process_id,
                        channel_id,
                        ledger_channel_id,
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

/// Sign our pre-fund commitment once the opener's is in and the turn is
/// ours.
fn advance_pre_fund_setup(
    process_id: &ProcessId,
    ledger_channel_id: &ChannelId,
    locator: &ProtocolLocator,
    context: &mut SharedContext,
) {
    let Some(record) = context.get_channel(ledger_channel_id) else {
        return;
    };
    let Some(last) = record.last_commitment() else {
        return;
    };
    if last.commitment.commitment_type != CommitmentType::PreFundSetup || !record.our_turn() {
        return;
    }
    let turn_num = last.commitment.turn_num + 1;
    if turn_num >= record.num_participants() as u64 {
        return;
    }
    let commitment = Commitment {
        channel: record.identity(),
        turn_num,
        allocation: last.commitment.allocation.clone(),
        destination: last.commitment.destination.clone(),
        commitment_type: CommitmentType::PreFundSetup,
        commitment_count: turn_num as u32,
        app_attributes: last.commitment.app_attributes.clone(),
    };
    let to = record.next_participant();
    if let Err(error) = context.sign_and_store(commitment) {
        warn!(%error, "could not sign our pre-fund commitment");
        return;
    }
    if let Err(error) =
        context.queue_commitments(to, process_id.clone(), locator.clone(), ledger_channel_id)
    {
        warn!(%error, "could not relay our pre-fund commitment");
    }
}

fn fold_direct(
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<DirectFundingState>,
) -> Transition<NewLedgerChannelState> {
    match child.state {
        DirectFundingState::Success => {
            let inner = existing_ledger_funding::initialize(
                process_id.clone(),
                channel_id,
                ledger_channel_id,
                locator.descend(ProtocolTag::ExistingLedgerFunding),
                child.context,
            );
            fold_ledger(process_id, channel_id, ledger_channel_id, locator, inner)
        }
        DirectFundingState::Failure { .. } => Transition::new(
            NewLedgerChannelState::Failure {
                reason: NewLedgerChannelFailureReason::DirectFundingFailed,
            },
            child.context,
        ),
        funding => Transition::new(
            NewLedgerChannelState::WaitForDirectFunding {
                process_id,
                channel_id,
                ledger_channel_id,
                locator,
                funding,
            },
            child.context,
        ),
    }
}

fn fold_ledger(
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<ExistingLedgerFundingState>,
) -> Transition<NewLedgerChannelState> {
    match child.state {
        ExistingLedgerFundingState::Success => {
            Transition::new(NewLedgerChannelState::Success, child.context)
        }
        ExistingLedgerFundingState::Failure { .. } => Transition::new(
            NewLedgerChannelState::Failure {
                reason: NewLedgerChannelFailureReason::LedgerFundingFailed,
            },
            child.context,
        ),
        inner => Transition::new(
            NewLedgerChannelState::WaitForLedgerFunding {
                process_id,
                channel_id,
                ledger_channel_id,
                locator,
                inner,
            },
            child.context,
        ),
    }
}
