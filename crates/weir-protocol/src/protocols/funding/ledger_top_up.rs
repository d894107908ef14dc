//! Ledger top-up
//!
//! Raises the balances of a two-party ledger channel so it can back a
//! larger allocation. Deposits pay out in allocation order, so a party
//! topping up must hold the *last* entry while its deposit lands or the
//! new funds would be claimable by the other side. The protocol therefore
//! interleaves consensus updates with deposits in up to four phases:
//!
//! 1. consensus update moving the first party's entry last, raised to
//!    its target;
//! 2. the first party's deposit;
//! 3. consensus update restoring the original order with the second
//!    party's target;
//! 4. the second party's deposit.
//!
//! Phases are skipped for a party that already holds its target.

use tracing::warn;
use weir_core::identifiers::{Address, ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::SharedContext;

use crate::events::RoutedEvent;
use crate::protocols::consensus_update::{self, ConsensusUpdateState};
use crate::protocols::funding::direct_funding::{self, DirectFundingState};
use crate::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerTopUpFailureReason {
    ChannelDoesntExist,
    /// Top-ups only reorder allocations for exactly two parties.
    NotTwoParty,
    ConsensusUpdateFailed,
    DepositFailed,
}

/// Everything the phases share: the targets and the balances the channel
/// held when the top-up started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopUpPlan {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub participants: Vec<Address>,
    pub our_index: usize,
    /// Target balance per participant.
    pub targets: Vec<u128>,
    /// Balances before the top-up started.
    pub originals: Vec<u128>,
}

impl TopUpPlan {
    fn delta(&self, index: usize) -> u128 {
        self.targets[index].saturating_sub(self.originals[index])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerTopUpState {
    WaitForSwitchOrderUpdate {
        plan: TopUpPlan,
        consensus_update: ConsensusUpdateState,
    },
    WaitForFirstDeposit {
        plan: TopUpPlan,
        funding: DirectFundingState,
    },
    WaitForRestoreOrderUpdate {
        plan: TopUpPlan,
        consensus_update: ConsensusUpdateState,
    },
    WaitForSecondDeposit {
        plan: TopUpPlan,
        funding: DirectFundingState,
    },
    Success,
    Failure { reason: LedgerTopUpFailureReason },
}

impl LedgerTopUpState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerTopUpState::Success | LedgerTopUpState::Failure { .. }
        )
    }
}

/// Start topping the channel up to `targets` (one entry per participant).
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    targets: Vec<u128>,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<LedgerTopUpState> {
    let Some(record) = context.get_channel(&channel_id) else {
        return Transition::new(
            LedgerTopUpState::Failure {
                reason: LedgerTopUpFailureReason::ChannelDoesntExist,
            },
            context,
        );
    };
    if record.num_participants() != 2 || targets.len() != 2 {
        return Transition::new(
            LedgerTopUpState::Failure {
                reason: LedgerTopUpFailureReason::NotTwoParty,
            },
            context,
        );
    }
    let originals = record
        .participants
        .iter()
        .map(|participant| balance_for(record, participant))
        .collect();
    let plan = TopUpPlan {
        process_id,
        channel_id,
        locator,
        participants: record.participants.clone(),
        our_index: record.our_index,
        targets,
        originals,
    };
    start_switch_phase(plan, context)
}

/// Consume one routed event.
pub fn update(
    state: LedgerTopUpState,
    context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<LedgerTopUpState> {
    if state.is_terminal() {
        warn!(?routed, "event for terminal ledger top-up ignored");
        return Transition::new(state, context);
    }
    match state {
        LedgerTopUpState::WaitForSwitchOrderUpdate {
            plan,
            consensus_update: inner,
        } => match routed.for_child(ProtocolTag::ConsensusUpdate) {
            Some(child_event) => {
                let child = consensus_update::update(inner, context, &child_event.event);
                fold_switch(plan, child)
            }
            None => {
                warn!(?routed, "event does not address the order-switch update");
                Transition::new(
                    LedgerTopUpState::WaitForSwitchOrderUpdate {
                        plan,
                        consensus_update: inner,
                    },
                    context,
                )
            }
        },
        LedgerTopUpState::WaitForFirstDeposit { plan, funding } => {
            match routed.for_child(ProtocolTag::DirectFunding) {
                Some(child_event) => {
                    let child = direct_funding::update(funding, context, &child_event);
                    fold_first_deposit(plan, child)
                }
                None => {
                    warn!(?routed, "event does not address the first deposit");
                    Transition::new(LedgerTopUpState::WaitForFirstDeposit { plan, funding }, context)
                }
            }
        }
        LedgerTopUpState::WaitForRestoreOrderUpdate {
            plan,
            consensus_update: inner,
        } => match routed.for_child(ProtocolTag::ConsensusUpdate) {
            Some(child_event) => {
                let child = consensus_update::update(inner, context, &child_event.event);
                fold_restore(plan, child)
            }
            None => {
                warn!(?routed, "event does not address the order-restore update");
                Transition::new(
                    LedgerTopUpState::WaitForRestoreOrderUpdate {
                        plan,
                        consensus_update: inner,
                    },
                    context,
                )
            }
        },
        LedgerTopUpState::WaitForSecondDeposit { plan, funding } => {
            match routed.for_child(ProtocolTag::DirectFunding) {
                Some(child_event) => {
                    let child = direct_funding::update(funding, context, &child_event);
                    fold_second_deposit(plan, child)
                }
                None => {
                    warn!(?routed, "event does not address the second deposit");
                    Transition::new(
                        LedgerTopUpState::WaitForSecondDeposit { plan, funding },
                        context,
                    )
                }
            }
        }
        terminal => Transition::new(terminal, context),
    }
}

/// Phase 1: move the first party's raised entry last. Skipped when the
/// first party needs no top-up.
fn start_switch_phase(plan: TopUpPlan, context: SharedContext) -> Transition<LedgerTopUpState> {
    if plan.delta(0) == 0 {
        return start_restore_phase(plan, context);
    }
    let child = consensus_update::initialize(
        plan.process_id.clone(),
        plan.channel_id,
        vec![plan.originals[1], plan.targets[0]],
        vec![plan.participants[1], plan.participants[0]],
        true,
        plan.locator.descend(ProtocolTag::ConsensusUpdate),
        context,
    );
    fold_switch(plan, child)
}

/// Phase 2: the first party deposits its raise while holding the last
/// entry.
fn start_first_deposit(plan: TopUpPlan, context: SharedContext) -> Transition<LedgerTopUpState> {
    let held = plan.originals[0] + plan.originals[1];
    let required = if plan.our_index == 0 { plan.delta(0) } else { 0 };
    let child = direct_funding::initialize_with_amounts(
        plan.process_id.clone(),
        plan.channel_id,
        held,
        required,
        held + plan.delta(0),
        plan.locator.descend(ProtocolTag::DirectFunding),
        context,
    );
    fold_first_deposit(plan, child)
}

/// Phase 3: restore the original order with both targets in place. Runs
/// whenever any phase ran before it; only a no-op top-up skips it.
fn start_restore_phase(plan: TopUpPlan, context: SharedContext) -> Transition<LedgerTopUpState> {
    if plan.delta(0) == 0 && plan.delta(1) == 0 {
        return Transition::new(LedgerTopUpState::Success, context);
    }
    let child = consensus_update::initialize(
        plan.process_id.clone(),
        plan.channel_id,
        plan.targets.clone(),
        plan.participants.clone(),
        true,
        plan.locator.descend(ProtocolTag::ConsensusUpdate),
        context,
    );
    fold_restore(plan, child)
}

/// Phase 4: the second party deposits its raise.
fn start_second_deposit(plan: TopUpPlan, context: SharedContext) -> Transition<LedgerTopUpState> {
    if plan.delta(1) == 0 {
        return Transition::new(LedgerTopUpState::Success, context);
    }
    let held = plan.targets[0] + plan.originals[1];
    let required = if plan.our_index == 1 { plan.delta(1) } else { 0 };
    let child = direct_funding::initialize_with_amounts(
        plan.process_id.clone(),
        plan.channel_id,
        held,
        required,
        held + plan.delta(1),
        plan.locator.descend(ProtocolTag::DirectFunding),
        context,
    );
    fold_second_deposit(plan, child)
}

fn fold_switch(
    plan: TopUpPlan,
    child: Transition<ConsensusUpdateState>,
) -> Transition<LedgerTopUpState> {
    match child.state {
        ConsensusUpdateState::Success => start_first_deposit(plan, child.context),
        ConsensusUpdateState::Failure { .. } => Transition::new(
            LedgerTopUpState::Failure {
                reason: LedgerTopUpFailureReason::ConsensusUpdateFailed,
            },
            child.context,
        ),
        consensus_update => Transition::new(
            LedgerTopUpState::WaitForSwitchOrderUpdate {
                plan,
                consensus_update,
            },
            child.context,
        ),
    }
}

fn fold_first_deposit(
    plan: TopUpPlan,
    child: Transition<DirectFundingState>,
) -> Transition<LedgerTopUpState> {
    match child.state {
        DirectFundingState::Success => start_restore_phase(plan, child.context),
        DirectFundingState::Failure { .. } => Transition::new(
            LedgerTopUpState::Failure {
                reason: LedgerTopUpFailureReason::DepositFailed,
            },
            child.context,
        ),
        funding => Transition::new(
            LedgerTopUpState::WaitForFirstDeposit { plan, funding },
            child.context,
        ),
    }
}

fn fold_restore(
    plan: TopUpPlan,
    child: Transition<ConsensusUpdateState>,
) -> Transition<LedgerTopUpState> {
    match child.state {
        ConsensusUpdateState::Success => start_second_deposit(plan, child.context),
        ConsensusUpdateState::Failure { .. } => Transition::new(
            LedgerTopUpState::Failure {
                reason: LedgerTopUpFailureReason::ConsensusUpdateFailed,
            },
            child.context,
        ),
        consensus_update => Transition::new(
            LedgerTopUpState::WaitForRestoreOrderUpdate {
                plan,
                consensus_update,
            },
            child.context,
        ),
    }
}

fn fold_second_deposit(
    plan: TopUpPlan,
    child: Transition<DirectFundingState>,
) -> Transition<LedgerTopUpState> {
    match child.state {
        DirectFundingState::Success => Transition::new(LedgerTopUpState::Success, child.context),
        DirectFundingState::Failure { .. } => Transition::new(
            LedgerTopUpState::Failure {
                reason: LedgerTopUpFailureReason::DepositFailed,
            },
            child.context,
        ),
        funding => Transition::new(
            LedgerTopUpState::WaitForSecondDeposit { plan, funding },
            child.context,
        ),
    }
}

/// The channel's latest balance allocated to `participant`.
fn balance_for(record: &weir_store::ChannelRecord, participant: &Address) -> u128 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use weir_core::chain::TransactionRequest;
    use weir_testkit::{ledger_commitment, ledger_identity, sign_by_mover, Participants};

    // An open, funded [5, 5] ledger channel seen from `index`.
    fn funded_ledger(p: &Participants, index: usize) -> (SharedContext, ChannelId) {
        let identity = ledger_identity(&p.addresses(), 1);
        let channel_id = identity.channel_id();
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[index], p.key_ref(index));
        ctx.check_and_initialize(sign_by_mover(
            p,
            weir_testkit::prefund_commitment(&identity, 0),
        ))
        .unwrap();
        let record = ctx.channel_store.get_mut(&channel_id).unwrap();
        record.push_commitment(sign_by_mover(
            p,
            weir_testkit::prefund_commitment(&identity, 1),
        ));
        record.push_commitment(sign_by_mover(
            p,
            weir_testkit::postfund_commitment(&identity, 2),
        ));
        record.push_commitment(sign_by_mover(
            p,
            weir_testkit::postfund_commitment(&identity, 3),
        ));
        record.push_commitment(sign_by_mover(p, ledger_commitment(&identity, 4, &[5, 5])));
        record.funded = true;
        (ctx, channel_id)
    }

    fn consensus(event: EngineEvent) -> RoutedEvent {
        RoutedEvent::at(ProtocolLocator::of(ProtocolTag::ConsensusUpdate), event)
    }

    fn deposit_tx(event: EngineEvent) -> RoutedEvent {
        RoutedEvent::at(
            ProtocolLocator::root()
                .descend(ProtocolTag::DirectFunding)
                .descend(ProtocolTag::TransactionSubmission),
            event,
        )
    }

    fn deposit_local(event: EngineEvent) -> RoutedEvent {
        RoutedEvent::at(ProtocolLocator::of(ProtocolTag::DirectFunding), event)
    }

    #[test]
    fn no_op_top_up_succeeds_immediately() {
        let p = Participants::pair();
        let (ctx, channel_id) = funded_ledger(&p, 0);
        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            vec![5, 5],
            ProtocolLocator::of(ProtocolTag::LedgerTopUp),
            ctx,
        );
        assert_eq!(t.state, LedgerTopUpState::Success);
    }

    #[test]
    fn first_party_raise_switches_order_before_the_deposit() {
        let p = Participants::pair();
        let (ctx, channel_id) = funded_ledger(&p, 0);

        // Raise our own balance from 5 to 8.
        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            vec![8, 5],
            ProtocolLocator::of(ProtocolTag::LedgerTopUp),
            ctx,
        );
        assert!(matches!(
            t.state,
            LedgerTopUpState::WaitForSwitchOrderUpdate { .. }
        ));
        // Turn 5 belongs to participant 1, so the initializer proposed
        // nothing yet and waits for the counterparty's proposal.
        let record = t.context.get_channel(&channel_id).unwrap();
        let proposal_turn = record.turn_num;

        // The counterparty proposes the switched order; our reducer accepts
        // and the final vote completes the update.
        let last = record.last_commitment().unwrap().commitment.clone();
        let proposal = weir_core::consensus::propose(
            &last,
            vec![5, 8],
            vec![p.addresses()[1], p.addresses()[0]],
        );
        let signed_proposal = sign_by_mover(&p, proposal);
        let t = update(
            t.state,
            t.context,
            &consensus(EngineEvent::CommitmentsReceived {
                process_id: ProcessId::funding(&channel_id),
                signed_commitments: vec![signed_proposal],
            }),
        );
        assert!(
            matches!(t.state, LedgerTopUpState::WaitForFirstDeposit { .. }),
            "got {:?}",
            t.state
        );
        assert_eq!(
            t.context.get_channel(&channel_id).unwrap().turn_num,
            proposal_turn + 2
        );

        // We hold the raised entry, so the deposit is ours: 3 on top of the
        // 10 already held.
        let t = update(
            t.state,
            t.context,
            &deposit_local(EngineEvent::FundingReceived {
                channel_id,
                total_for_destination: 10,
            }),
        );
        match &t.context.outbox.transactions[0].request {
            TransactionRequest::Deposit {
                amount,
                expected_held,
                ..
            } => {
                assert_eq!(*amount, 3);
                assert_eq!(*expected_held, 10);
            }
            other => panic!("expected Deposit, got {other:?}"),
        }
        let t = update(t.state, t.context, &deposit_tx(EngineEvent::TransactionSubmitted));
        let t = update(
            t.state,
            t.context,
            &deposit_tx(EngineEvent::TransactionConfirmed { observed_at: 60 }),
        );
        let t = update(
            t.state,
            t.context,
            &deposit_local(EngineEvent::FundingReceived {
                channel_id,
                total_for_destination: 13,
            }),
        );

        // Restore phase: our final vote took turn 6, so the counterparty
        // proposes the restored order and we cast the final vote again.
        assert!(
            matches!(t.state, LedgerTopUpState::WaitForRestoreOrderUpdate { .. }),
            "got {:?}",
            t.state
        );
        let record = t.context.get_channel(&channel_id).unwrap();
        let last = record.last_commitment().unwrap().commitment.clone();
        let their_proposal =
            weir_core::consensus::propose(&last, vec![8, 5], p.addresses());
        let signed_proposal = sign_by_mover(&p, their_proposal);
        let t = update(
            t.state,
            t.context,
            &consensus(EngineEvent::CommitmentsReceived {
                process_id: ProcessId::funding(&channel_id),
                signed_commitments: vec![signed_proposal],
            }),
        );

        // The second party needed no raise, so the top-up is done.
        assert_eq!(t.state, LedgerTopUpState::Success);
        let record = t.context.get_channel(&channel_id).unwrap();
        let last = &record.last_commitment().unwrap().commitment;
        assert_eq!(last.allocation, vec![8, 5]);
        assert_eq!(last.destination, p.addresses());
    }

    #[test]
    fn second_party_raise_skips_the_switch_phase() {
        let p = Participants::pair();
        let (ctx, channel_id) = funded_ledger(&p, 0);
        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            vec![5, 9],
            ProtocolLocator::of(ProtocolTag::LedgerTopUp),
            ctx,
        );
        // No switch needed; we go straight to restoring with B's target.
        assert!(matches!(
            t.state,
            LedgerTopUpState::WaitForRestoreOrderUpdate { .. }
        ));
    }

    #[test]
    fn unknown_channel_fails() {
        let p = Participants::pair();
        let ctx = SharedContext::new(p.shared_signer(), p.addresses()[0], p.key_ref(0));
        let channel_id = ChannelId([4; 32]);
        let t = initialize(
            ProcessId::funding(&channel_id),
            channel_id,
            vec![1, 1],
            ProtocolLocator::of(ProtocolTag::LedgerTopUp),
            ctx,
        );
        assert_eq!(
            t.state,
            LedgerTopUpState::Failure {
                reason: LedgerTopUpFailureReason::ChannelDoesntExist
            }
        );
    }
}
