//! Direct funding
//!
//! Funds a channel by on-chain deposits. Deposits are staggered: a
//! participant only submits theirs once the chain already holds the
//! amounts covered by everyone earlier in the allocation, so a crashed
//! counterparty can never strand later deposits. Once the chain holds
//! the full allocation the participants exchange post-fund-setup
//! commitments and the channel goes live.

use tracing::warn;
use weir_core::chain::TransactionRequest;
use weir_core::identifiers::{ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::{FundingDescriptor, SharedContext};

use crate::events::{EngineEvent, RoutedEvent};
use crate::protocols::funding::advance_post_fund_setup;
use crate::protocols::store_new_commitments;
use crate::protocols::transaction_submission::{self, TransactionSubmissionState};
use crate::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectFundingFailureReason {
    ChannelDoesntExist,
    TransactionFailed,
}

/// Waiting for earlier participants' deposits to reach the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotSafeToDeposit {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    /// Chain balance that must be held before our deposit is safe.
    pub safe_to_deposit_level: u128,
    pub required_deposit: u128,
    pub total_funding_required: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForDepositTransaction {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub total_funding_required: u128,
    pub transaction: TransactionSubmissionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForFundingAndPostFundSetup {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub total_funding_required: u128,
    /// Set once the chain holds the full allocation.
    pub channel_funded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectFundingState {
    NotSafeToDeposit(NotSafeToDeposit),
    WaitForDepositTransaction(WaitForDepositTransaction),
    WaitForFundingAndPostFundSetup(WaitForFundingAndPostFundSetup),
    Success,
    Failure { reason: DirectFundingFailureReason },
}

impl DirectFundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DirectFundingState::Success | DirectFundingState::Failure { .. }
        )
    }
}

/// Fund a channel's own allocation, deriving our deposit and its safety
/// level from the latest commitment.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<DirectFundingState> {
    let Some(record) = context.get_channel(&channel_id) else {
        return Transition::new(
            DirectFundingState::Failure {
                reason: DirectFundingFailureReason::ChannelDoesntExist,
            },
            context,
        );
    };
    let Some(last) = record.last_commitment() else {
        return Transition::new(
            DirectFundingState::Failure {
                reason: DirectFundingFailureReason::ChannelDoesntExist,
            },
            context,
        );
    };
    // Deposits pay out in allocation order, so everything allocated ahead
    // of our entry must be on chain before ours is safe.
    let commitment = &last.commitment;
    let mut safe_to_deposit_level: u128 = 0;
    let mut required_deposit: u128 = 0;
    for (destination, amount) in commitment.destination.iter().zip(&commitment.allocation) {
        if *destination == record.own_address {
            required_deposit = *amount;
            break;
        }
        safe_to_deposit_level += amount;
    }
    let total_funding_required = commitment.total_allocation();
    initialize_with_amounts(
        process_id,
        channel_id,
        safe_to_deposit_level,
        required_deposit,
        total_funding_required,
        locator,
        context,
    )
}

/// Fund a channel with explicit amounts. Top-ups use this directly, with
/// the safety level set to the balance already held.
pub fn initialize_with_amounts(
    process_id: ProcessId,
    channel_id: ChannelId,
    safe_to_deposit_level: u128,
    required_deposit: u128,
    total_funding_required: u128,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<DirectFundingState> {
    if required_deposit == 0 {
        return Transition::new(
            DirectFundingState::WaitForFundingAndPostFundSetup(WaitForFundingAndPostFundSetup {
                process_id,
                channel_id,
                locator,
                total_funding_required,
                channel_funded: false,
            }),
            context,
        );
    }
    if safe_to_deposit_level == 0 {
        return deposit(
            process_id,
            channel_id,
            locator,
            required_deposit,
            0,
            total_funding_required,
            context,
        );
    }
    Transition::new(
        DirectFundingState::NotSafeToDeposit(NotSafeToDeposit {
            process_id,
            channel_id,
            locator,
            safe_to_deposit_level,
            required_deposit,
            total_funding_required,
        }),
        context,
    )
}

/// Consume one routed event.
pub fn update(
    state: DirectFundingState,
    mut context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<DirectFundingState> {
    if state.is_terminal() {
        warn!(?routed, "event for terminal direct funding ignored");
        return Transition::new(state, context);
    }
    match state {
        DirectFundingState::NotSafeToDeposit(inner) => match &routed.event {
            EngineEvent::FundingReceived {
                channel_id,
                total_for_destination,
            } if routed.is_local() && *channel_id == inner.channel_id => {
                if *total_for_destination >= inner.safe_to_deposit_level {
                    deposit(
                        inner.process_id,
                        inner.channel_id,
                        inner.locator,
                        inner.required_deposit,
                        *total_for_destination,
                        inner.total_funding_required,
                        context,
                    )
                } else {
                    Transition::new(DirectFundingState::NotSafeToDeposit(inner), context)
                }
            }
            other => {
                warn!(?other, "unexpected event while holding back deposit");
                Transition::new(DirectFundingState::NotSafeToDeposit(inner), context)
            }
        },
        DirectFundingState::WaitForDepositTransaction(inner) => {
            let Some(child_event) = routed.for_child(ProtocolTag::TransactionSubmission) else {
                warn!(?routed, "unexpected event while depositing");
                return Transition::new(
                    DirectFundingState::WaitForDepositTransaction(inner),
                    context,
                );
            };
            let child =
                transaction_submission::update(inner.transaction, context, &child_event.event);
            match child.state {
                TransactionSubmissionState::Success { .. } => Transition::new(
                    DirectFundingState::WaitForFundingAndPostFundSetup(
                        WaitForFundingAndPostFundSetup {
                            process_id: inner.process_id,
                            channel_id: inner.channel_id,
                            locator: inner.locator,
                            total_funding_required: inner.total_funding_required,
                            channel_funded: false,
                        },
                    ),
                    child.context,
                ),
                TransactionSubmissionState::Failure { .. } => Transition::new(
                    DirectFundingState::Failure {
                        reason: DirectFundingFailureReason::TransactionFailed,
                    },
                    child.context,
                ),
                transaction => Transition::new(
                    DirectFundingState::WaitForDepositTransaction(WaitForDepositTransaction {
                        transaction,
                        ..inner
                    }),
                    child.context,
                ),
            }
        }
        DirectFundingState::WaitForFundingAndPostFundSetup(mut inner) => match &routed.event {
            EngineEvent::FundingReceived {
                channel_id,
                total_for_destination,
            } if routed.is_local() && *channel_id == inner.channel_id => {
                if *total_for_destination < inner.total_funding_required {
                    return Transition::new(
                        DirectFundingState::WaitForFundingAndPostFundSetup(inner),
                        context,
                    );
                }
                inner.channel_funded = true;
                if let Err(error) = context.set_channel_funded(&inner.channel_id) {
                    warn!(%error, "funded channel has no record");
                }
                context.set_funding(inner.channel_id, FundingDescriptor::direct());
                finish_setup(inner, context)
            }
            EngineEvent::CommitmentsReceived {
                signed_commitments, ..
            } if routed.is_local() => {
                store_new_commitments(&mut context, signed_commitments);
                if inner.channel_funded {
                    finish_setup(inner, context)
                } else {
                    Transition::new(
                        DirectFundingState::WaitForFundingAndPostFundSetup(inner),
                        context,
                    )
                }
            }
            other => {
                warn!(?other, "unexpected event while waiting for funding");
                Transition::new(
                    DirectFundingState::WaitForFundingAndPostFundSetup(inner),
                    context,
                )
            }
        },
        terminal => Transition::new(terminal, context),
    }
}

#[allow(clippy::too_many_arguments)]
fn deposit(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    amount: u128,
    expected_held: u128,
    total_funding_required: u128,
    context: SharedContext,
) -> Transition<DirectFundingState> {
    let request = TransactionRequest::Deposit {
        channel_id,
        amount,
        expected_held,
    };
    let child = transaction_submission::initialize(process_id.clone(), request, context);
    child.map(|transaction| {
        DirectFundingState::WaitForDepositTransaction(WaitForDepositTransaction {
            process_id,
            channel_id,
            locator,
            total_funding_required,
            transaction,
        })
    })
}

/// Advance the post-fund-setup exchange on a funded channel.
fn finish_setup(
    inner: WaitForFundingAndPostFundSetup,
    mut context: SharedContext,
) -> Transition<DirectFundingState> {
    if advance_post_fund_setup(
        &inner.process_id,
        &inner.channel_id,
        &inner.locator,
        &mut context,
    ) {
        Transition::new(DirectFundingState::Success, context)
    } else {
        Transition::new(
            DirectFundingState::WaitForFundingAndPostFundSetup(inner),
            context,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::commitment::CommitmentType;
    use weir_testkit::{
        ledger_identity, postfund_commitment, prefund_commitment, sign_by_mover, Participants,
    };

    fn tx(event: EngineEvent) -> RoutedEvent {
        RoutedEvent::at(ProtocolLocator::of(ProtocolTag::TransactionSubmission), event)
    }

    fn funding_process(channel_id: &ChannelId) -> ProcessId {
        ProcessId::funding(channel_id)
    }

    // Both prefund commitments are in; deposits come next.
    fn prefunded_context(p: &Participants, index: usize) -> (SharedContext, ChannelId) {
        let identity = ledger_identity(&p.addresses(), 1);
        let channel_id = identity.channel_id();
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[index], p.key_ref(index));
        ctx.check_and_initialize(sign_by_mover(p, prefund_commitment(&identity, 0)))
            .unwrap();
        ctx.check_and_store(sign_by_mover(p, prefund_commitment(&identity, 1)))
            .unwrap();
        (ctx, channel_id)
    }

    #[test]
    fn first_participant_deposits_immediately() {
        let p = Participants::pair();
        let (ctx, channel_id) = prefunded_context(&p, 0);
        let t = initialize(
            funding_process(&channel_id),
            channel_id,
            ProtocolLocator::of(ProtocolTag::DirectFunding),
            ctx,
        );
        assert!(matches!(
            t.state,
            DirectFundingState::WaitForDepositTransaction(_)
        ));
        match &t.context.outbox.transactions[0].request {
            TransactionRequest::Deposit {
                amount,
                expected_held,
                ..
            } => {
                assert_eq!(*amount, 5);
                assert_eq!(*expected_held, 0);
            }
            other => panic!("expected Deposit, got {other:?}"),
        }
    }

    #[test]
    fn second_participant_waits_for_the_first_deposit() {
        let p = Participants::pair();
        let (ctx, channel_id) = prefunded_context(&p, 1);
        let t = initialize(
            funding_process(&channel_id),
            channel_id,
            ProtocolLocator::of(ProtocolTag::DirectFunding),
            ctx,
        );
        match &t.state {
            DirectFundingState::NotSafeToDeposit(inner) => {
                assert_eq!(inner.safe_to_deposit_level, 5);
                assert_eq!(inner.required_deposit, 5);
            }
            other => panic!("expected NotSafeToDeposit, got {other:?}"),
        }

        // A partial balance is not enough.
        let t = update(
            t.state,
            t.context,
            &RoutedEvent::local(EngineEvent::FundingReceived {
                channel_id,
                total_for_destination: 3,
            }),
        );
        assert!(matches!(t.state, DirectFundingState::NotSafeToDeposit(_)));

        let t = update(
            t.state,
            t.context,
            &RoutedEvent::local(EngineEvent::FundingReceived {
                channel_id,
                total_for_destination: 5,
            }),
        );
        assert!(matches!(
            t.state,
            DirectFundingState::WaitForDepositTransaction(_)
        ));
        match &t.context.outbox.transactions[0].request {
            TransactionRequest::Deposit { expected_held, .. } => assert_eq!(*expected_held, 5),
            other => panic!("expected Deposit, got {other:?}"),
        }
    }

    #[test]
    fn full_funding_triggers_our_post_fund_setup_and_completes() {
        let p = Participants::pair();
        let (ctx, channel_id) = prefunded_context(&p, 0);
        let t = initialize(
            funding_process(&channel_id),
            channel_id,
            ProtocolLocator::of(ProtocolTag::DirectFunding),
            ctx,
        );
        let t = update(t.state, t.context, &tx(EngineEvent::TransactionSubmitted));
        let t = update(
            t.state,
            t.context,
            &tx(EngineEvent::TransactionConfirmed { observed_at: 10 }),
        );
        assert!(matches!(
            t.state,
            DirectFundingState::WaitForFundingAndPostFundSetup(_)
        ));

        // Channel fully funded on chain: we sign the first post-fund setup.
        let t = update(
            t.state,
            t.context,
            &RoutedEvent::local(EngineEvent::FundingReceived {
                channel_id,
                total_for_destination: 10,
            }),
        );
        let record = t.context.get_channel(&channel_id).unwrap();
        assert!(record.funded);
        assert_eq!(record.turn_num, 2);
        assert_eq!(
            record.last_commitment().unwrap().commitment.commitment_type,
            CommitmentType::PostFundSetup
        );
        assert_eq!(t.context.outbox.messages.len(), 1);

        // The counterparty's post-fund setup closes the exchange.
        let identity = ledger_identity(&p.addresses(), 1);
        let theirs = sign_by_mover(&p, postfund_commitment(&identity, 3));
        let t = update(
            t.state,
            t.context,
            &RoutedEvent::local(EngineEvent::CommitmentsReceived {
                process_id: funding_process(&channel_id),
                signed_commitments: vec![theirs],
            }),
        );
        assert_eq!(t.state, DirectFundingState::Success);
        assert!(t
            .context
            .funding_state(&channel_id)
            .unwrap()
            .directly_funded);
    }

    #[test]
    fn counterparty_post_fund_setup_waits_for_our_funding_event() {
        let p = Participants::pair();
        let (ctx, channel_id) = prefunded_context(&p, 1);
        let identity = ledger_identity(&p.addresses(), 1);

        let t = initialize(
            funding_process(&channel_id),
            channel_id,
            ProtocolLocator::of(ProtocolTag::DirectFunding),
            ctx,
        );
        let t = update(
            t.state,
            t.context,
            &RoutedEvent::local(EngineEvent::FundingReceived {
                channel_id,
                total_for_destination: 5,
            }),
        );
        let t = update(t.state, t.context, &tx(EngineEvent::TransactionSubmitted));
        let t = update(
            t.state,
            t.context,
            &tx(EngineEvent::TransactionConfirmed { observed_at: 11 }),
        );

        // Their post-fund setup can land before our funding event; we hold
        // our signature until the chain confirms the full amount.
        let theirs = sign_by_mover(&p, postfund_commitment(&identity, 2));
        let t = update(
            t.state,
            t.context,
            &RoutedEvent::local(EngineEvent::CommitmentsReceived {
                process_id: funding_process(&channel_id),
                signed_commitments: vec![theirs],
            }),
        );
        assert!(matches!(
            t.state,
            DirectFundingState::WaitForFundingAndPostFundSetup(_)
        ));
        assert!(t.context.outbox.messages.is_empty());

        let t = update(
            t.state,
            t.context,
            &RoutedEvent::local(EngineEvent::FundingReceived {
                channel_id,
                total_for_destination: 10,
            }),
        );
        assert_eq!(t.state, DirectFundingState::Success);
        assert_eq!(t.context.get_channel(&channel_id).unwrap().turn_num, 3);
    }
}
