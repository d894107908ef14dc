//! Consensus-update transitions
//!
//! The whole protocol is one function, `send_if_safe`, run on initialize
//! and after every commitment batch. It short-circuits on consensus
//! already reached, gates on turn order and the external clearance flag,
//! and otherwise signs exactly one commitment: an accept when the standing
//! proposal matches our target, a fresh proposal when none does.

use tracing::warn;
use weir_core::consensus::{self, ConsensusAttrs, UpdateType};
use weir_core::identifiers::{Address, ChannelId, ProcessId};
use weir_core::locator::ProtocolLocator;
use weir_store::{ChannelRecord, SharedContext};

use crate::events::EngineEvent;
use crate::protocols::store_new_commitments;
use crate::Transition;

use super::states::{CommitmentSent, ConsensusUpdateState, FailureReason, NotSafeToSend};

/// Start a consensus round targeting `(proposed_allocation,
/// proposed_destination)` in the given channel.
///
/// `cleared_to_send` opens the gate immediately; parents serializing
/// several updates over one ledger channel pass `false` and send
/// `ClearedToSend` later.
#[allow(clippy::too_many_arguments)]
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    proposed_allocation: Vec<u128>,
    proposed_destination: Vec<Address>,
    cleared_to_send: bool,
    locator: ProtocolLocator,
    context: SharedContext,
) -> Transition<ConsensusUpdateState> {
    let state = ConsensusUpdateState::NotSafeToSend(NotSafeToSend {
        process_id,
        channel_id,
        proposed_allocation,
        proposed_destination,
        locator,
        cleared_to_send,
    });
    send_if_safe(state, context)
}

/// Consume one event.
pub fn update(
    state: ConsensusUpdateState,
    mut context: SharedContext,
    event: &EngineEvent,
) -> Transition<ConsensusUpdateState> {
    if state.is_terminal() {
        warn!(?event, "event for terminal consensus update ignored");
        return Transition::new(state, context);
    }
    match event {
        EngineEvent::CommitmentsReceived {
            signed_commitments, ..
        } => {
            store_new_commitments(&mut context, signed_commitments);
            send_if_safe(state, context)
        }
        EngineEvent::ClearedToSend => {
            let state = match state {
                ConsensusUpdateState::NotSafeToSend(inner) => {
                    ConsensusUpdateState::NotSafeToSend(NotSafeToSend {
                        cleared_to_send: true,
                        ..inner
                    })
                }
                other => other,
            };
            send_if_safe(state, context)
        }
        other => {
            warn!(?other, "unexpected event for consensus update");
            Transition::new(state, context)
        }
    }
}

/// Whether the channel's latest commitment settles consensus on exactly
/// the target outcome.
fn consensus_reached(record: &ChannelRecord, allocation: &[u128], destination: &[Address]) -> bool {
    let Some(last) = record.last_commitment() else {
        return false;
    };
    let Ok(attrs) = ConsensusAttrs::decode(&last.commitment.app_attributes) else {
        return false;
    };
    attrs.update_type == UpdateType::Consensus
        && last.commitment.allocation == allocation
        && last.commitment.destination == destination
}

fn send_if_safe(
    state: ConsensusUpdateState,
    mut context: SharedContext,
) -> Transition<ConsensusUpdateState> {
    let (channel_id, proposed_allocation, proposed_destination) = match &state {
        ConsensusUpdateState::NotSafeToSend(s) => {
            (s.channel_id, &s.proposed_allocation, &s.proposed_destination)
        }
        ConsensusUpdateState::CommitmentSent(s) => {
            (s.channel_id, &s.proposed_allocation, &s.proposed_destination)
        }
        terminal => return Transition::new(terminal.clone(), context),
    };

    let Some(record) = context.get_channel(&channel_id) else {
        return Transition::new(
            ConsensusUpdateState::Failure {
                reason: FailureReason::ChannelDoesntExist,
            },
            context,
        );
    };

    // Idempotent short-circuit: our own earlier send may already have
    // completed the round.
    if consensus_reached(record, proposed_allocation, proposed_destination) {
        return Transition::new(ConsensusUpdateState::Success, context);
    }
    if !record.our_turn() {
        return Transition::new(state, context);
    }

    let inner = match state {
        // Our turn again after sending, yet no consensus: someone
        // deviated from the single-round protocol.
        ConsensusUpdateState::CommitmentSent(_) => {
            return Transition::new(
                ConsensusUpdateState::Failure {
                    reason: FailureReason::ConsensusNotReached,
                },
                context,
            );
        }
        ConsensusUpdateState::NotSafeToSend(inner) if !inner.cleared_to_send => {
            return Transition::new(ConsensusUpdateState::NotSafeToSend(inner), context);
        }
        ConsensusUpdateState::NotSafeToSend(inner) => inner,
        terminal => return Transition::new(terminal, context),
    };

    let Some(last) = record.last_commitment() else {
        return Transition::new(
            ConsensusUpdateState::Failure {
                reason: FailureReason::ChannelDoesntExist,
            },
            context,
        );
    };
    let last_commitment = last.commitment.clone();
    let next_participant = record.next_participant();

    let attrs = match ConsensusAttrs::decode(&last_commitment.app_attributes) {
        Ok(attrs) => attrs,
        Err(error) => {
            warn!(%error, %channel_id, "latest commitment is not a consensus commitment");
            return Transition::new(
                ConsensusUpdateState::Failure {
                    reason: FailureReason::ConsensusNotReached,
                },
                context,
            );
        }
    };

    let next = if attrs.update_type == UpdateType::Proposal {
        if attrs.proposed_allocation == inner.proposed_allocation
            && attrs.proposed_destination == inner.proposed_destination
        {
            match consensus::accept(&last_commitment) {
                Ok(commitment) => commitment,
                Err(error) => {
                    warn!(%error, %channel_id, "cannot accept standing proposal");
                    return Transition::new(
                        ConsensusUpdateState::Failure {
                            reason: FailureReason::ConsensusNotReached,
                        },
                        context,
                    );
                }
            }
        } else {
            return Transition::new(
                ConsensusUpdateState::Failure {
                    reason: FailureReason::ProposalDoesNotMatch,
                },
                context,
            );
        }
    } else {
        consensus::propose(
            &last_commitment,
            inner.proposed_allocation.clone(),
            inner.proposed_destination.clone(),
        )
    };

    if let Err(error) = context.sign_and_store(next) {
        warn!(%error, %channel_id, "could not sign consensus commitment");
        return Transition::new(ConsensusUpdateState::NotSafeToSend(inner), context);
    }
    if let Err(error) = context.queue_commitments(
        next_participant,
        inner.process_id.clone(),
        inner.locator.clone(),
        &channel_id,
    ) {
        warn!(%error, %channel_id, "could not relay consensus commitment");
    }

    let reached = context
        .get_channel(&channel_id)
        .map(|record| {
            consensus_reached(record, &inner.proposed_allocation, &inner.proposed_destination)
        })
        .unwrap_or(false);
    if reached {
        Transition::new(ConsensusUpdateState::Success, context)
    } else {
        Transition::new(
            ConsensusUpdateState::CommitmentSent(CommitmentSent {
                process_id: inner.process_id,
                channel_id: inner.channel_id,
                proposed_allocation: inner.proposed_allocation,
                proposed_destination: inner.proposed_destination,
                locator: inner.locator,
            }),
            context,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::consensus::propose;
    use weir_core::locator::ProtocolTag;
    use weir_testkit::{
        ledger_commitment, ledger_identity, prefund_commitment, sign_by_mover, Participants,
    };

    fn ledger_context(
        p: &Participants,
        our_index: usize,
        turn: u64,
        balances: &[u128],
    ) -> (SharedContext, ChannelId) {
        let identity = ledger_identity(&p.addresses(), 1);
        let mut ctx = SharedContext::new(
            p.shared_signer(),
            p.addresses()[our_index],
            p.key_ref(our_index),
        );
        ctx.check_and_initialize(sign_by_mover(p, prefund_commitment(&identity, 0)))
            .unwrap();
        let channel_id = identity.channel_id();
        if let Some(record) = ctx.channel_store.get_mut(&channel_id) {
            record.push_commitment(sign_by_mover(p, ledger_commitment(&identity, turn, balances)));
        }
        (ctx, channel_id)
    }

    fn start(
        p: &Participants,
        our_index: usize,
        turn: u64,
        target: Vec<u128>,
        cleared: bool,
    ) -> (Transition<ConsensusUpdateState>, ChannelId) {
        let (ctx, channel_id) = ledger_context(p, our_index, turn, &[5, 5]);
        let transition = initialize(
            ProcessId("consensus-test".into()),
            channel_id,
            target,
            p.addresses(),
            cleared,
            ProtocolLocator::of(ProtocolTag::ConsensusUpdate),
            ctx,
        );
        (transition, channel_id)
    }

    #[test]
    fn proposer_signs_and_relays_immediately() {
        let p = Participants::pair();
        // Latest turn 5 was the other side's; ours is next.
        let (t, channel_id) = start(&p, 0, 5, vec![2, 8], true);
        assert!(matches!(t.state, ConsensusUpdateState::CommitmentSent(_)));

        let record = t.context.get_channel(&channel_id).unwrap();
        assert_eq!(record.turn_num, 6);
        assert_eq!(t.context.outbox.messages.len(), 1);
        let envelope = &t.context.outbox.messages[0];
        assert_eq!(envelope.to, p.addresses()[1]);
        assert_eq!(
            envelope.locator,
            ProtocolLocator::of(ProtocolTag::ConsensusUpdate)
        );
    }

    #[test]
    fn proposer_reaches_success_on_the_final_vote() {
        let p = Participants::pair();
        let (t, _) = start(&p, 0, 5, vec![2, 8], true);
        let ConsensusUpdateState::CommitmentSent(_) = &t.state else {
            panic!("expected CommitmentSent");
        };

        // The counterparty casts the final vote at turn 7.
        let identity = ledger_identity(&p.addresses(), 1);
        let proposal = propose(
            &ledger_commitment(&identity, 5, &[5, 5]),
            vec![2, 8],
            p.addresses(),
        );
        let vote = weir_core::consensus::accept(&proposal).unwrap();
        assert_eq!(vote.turn_num, 7);
        let event = EngineEvent::CommitmentsReceived {
            process_id: ProcessId("consensus-test".into()),
            signed_commitments: vec![sign_by_mover(&p, vote)],
        };
        let t = update(t.state, t.context, &event);
        assert_eq!(t.state, ConsensusUpdateState::Success);
    }

    #[test]
    fn receiver_accepts_a_matching_proposal_and_completes() {
        let p = Participants::pair();
        let (ctx, channel_id) = ledger_context(&p, 1, 5, &[5, 5]);
        let identity = ledger_identity(&p.addresses(), 1);
        let proposal = propose(
            &ledger_commitment(&identity, 5, &[5, 5]),
            vec![2, 8],
            p.addresses(),
        );

        let t = initialize(
            ProcessId("consensus-test".into()),
            channel_id,
            vec![2, 8],
            p.addresses(),
            true,
            ProtocolLocator::of(ProtocolTag::ConsensusUpdate),
            ctx,
        );
        // Turn 6 is the proposer's; we wait.
        assert!(matches!(t.state, ConsensusUpdateState::NotSafeToSend(_)));

        let event = EngineEvent::CommitmentsReceived {
            process_id: ProcessId("consensus-test".into()),
            signed_commitments: vec![sign_by_mover(&p, proposal)],
        };
        let t = update(t.state, t.context, &event);
        // Our accept was the final vote; consensus reached by our own send.
        assert_eq!(t.state, ConsensusUpdateState::Success);
        let record = t.context.get_channel(&channel_id).unwrap();
        assert_eq!(record.turn_num, 7);
        assert_eq!(
            record.last_commitment().unwrap().commitment.allocation,
            vec![2, 8]
        );
    }

    #[test]
    fn unopened_gate_blocks_sending_until_cleared() {
        let p = Participants::pair();
        let (t, channel_id) = start(&p, 0, 5, vec![2, 8], false);
        assert!(matches!(
            t.state,
            ConsensusUpdateState::NotSafeToSend(NotSafeToSend {
                cleared_to_send: false,
                ..
            })
        ));
        assert!(t.context.outbox.is_empty());

        let t = update(t.state, t.context, &EngineEvent::ClearedToSend);
        assert!(matches!(t.state, ConsensusUpdateState::CommitmentSent(_)));
        assert_eq!(t.context.get_channel(&channel_id).unwrap().turn_num, 6);
    }

    #[test]
    fn no_progress_without_our_turn() {
        let p = Participants::pair();
        // Latest turn 4 was ours (index 0); the counterparty moves next.
        let (t, channel_id) = start(&p, 0, 4, vec![2, 8], true);
        assert!(matches!(t.state, ConsensusUpdateState::NotSafeToSend(_)));
        assert!(t.context.outbox.is_empty());
        assert_eq!(t.context.get_channel(&channel_id).unwrap().turn_num, 4);
    }

    #[test]
    fn mismatched_proposal_fails_the_round() {
        let p = Participants::pair();
        let (ctx, channel_id) = ledger_context(&p, 1, 5, &[5, 5]);
        let identity = ledger_identity(&p.addresses(), 1);
        let other_proposal = propose(
            &ledger_commitment(&identity, 5, &[5, 5]),
            vec![9, 1],
            p.addresses(),
        );

        let t = initialize(
            ProcessId("consensus-test".into()),
            channel_id,
            vec![2, 8],
            p.addresses(),
            true,
            ProtocolLocator::of(ProtocolTag::ConsensusUpdate),
            ctx,
        );
        let event = EngineEvent::CommitmentsReceived {
            process_id: ProcessId("consensus-test".into()),
            signed_commitments: vec![sign_by_mover(&p, other_proposal)],
        };
        let t = update(t.state, t.context, &event);
        assert_eq!(
            t.state,
            ConsensusUpdateState::Failure {
                reason: FailureReason::ProposalDoesNotMatch
            }
        );
    }

    #[test]
    fn deviation_after_our_send_fails_with_consensus_not_reached() {
        let p = Participants::pair();
        let (t, _) = start(&p, 0, 5, vec![2, 8], true);

        // Instead of voting, the counterparty proposes something else.
        let identity = ledger_identity(&p.addresses(), 1);
        let our_proposal = propose(
            &ledger_commitment(&identity, 5, &[5, 5]),
            vec![2, 8],
            p.addresses(),
        );
        let counter = propose(&our_proposal, vec![9, 1], p.addresses());
        assert_eq!(counter.turn_num, 7);

        let event = EngineEvent::CommitmentsReceived {
            process_id: ProcessId("consensus-test".into()),
            signed_commitments: vec![sign_by_mover(&p, counter)],
        };
        let t = update(t.state, t.context, &event);
        assert_eq!(
            t.state,
            ConsensusUpdateState::Failure {
                reason: FailureReason::ConsensusNotReached
            }
        );
    }

    #[test]
    fn success_is_idempotent_and_leaves_the_store_alone() {
        let p = Participants::pair();
        let (t, channel_id) = start(&p, 0, 5, vec![2, 8], true);
        let identity = ledger_identity(&p.addresses(), 1);
        let proposal = propose(
            &ledger_commitment(&identity, 5, &[5, 5]),
            vec![2, 8],
            p.addresses(),
        );
        let vote = weir_core::consensus::accept(&proposal).unwrap();
        let event = EngineEvent::CommitmentsReceived {
            process_id: ProcessId("consensus-test".into()),
            signed_commitments: vec![sign_by_mover(&p, vote)],
        };
        let t = update(t.state, t.context, &event);
        assert_eq!(t.state, ConsensusUpdateState::Success);

        let store_before = t.context.channel_store.clone();
        let t = update(t.state, t.context, &EngineEvent::ClearedToSend);
        assert_eq!(t.state, ConsensusUpdateState::Success);
        assert_eq!(t.context.channel_store, store_before);
    }

    #[test]
    fn three_party_round_takes_two_votes() {
        let p = Participants::trio();
        // Latest turn 5 (mover index 2); the proposer at index 0 moves next.
        let identity = ledger_identity(&p.addresses(), 1);
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[0], p.key_ref(0));
        ctx.check_and_initialize(sign_by_mover(&p, prefund_commitment(&identity, 0)))
            .unwrap();
        let channel_id = identity.channel_id();
        let last = ledger_commitment(&identity, 5, &[5, 5, 5]);
        if let Some(record) = ctx.channel_store.get_mut(&channel_id) {
            record.push_commitment(sign_by_mover(&p, last.clone()));
        }

        let target = vec![1, 7, 7];
        let t = initialize(
            ProcessId("consensus-test".into()),
            channel_id,
            target.clone(),
            p.addresses(),
            true,
            ProtocolLocator::of(ProtocolTag::ConsensusUpdate),
            ctx,
        );
        assert!(matches!(t.state, ConsensusUpdateState::CommitmentSent(_)));

        // Commitments relay around the ring, so the proposer hears back
        // once, with the last two commitments: the intermediate vote and
        // the final one.
        let proposal = propose(&last, target.clone(), p.addresses());
        let first_vote = weir_core::consensus::accept(&proposal).unwrap();
        let final_vote = weir_core::consensus::accept(&first_vote).unwrap();
        assert_eq!(final_vote.turn_num, 8);
        let event = EngineEvent::CommitmentsReceived {
            process_id: ProcessId("consensus-test".into()),
            signed_commitments: vec![
                sign_by_mover(&p, first_vote),
                sign_by_mover(&p, final_vote),
            ],
        };
        let t = update(t.state, t.context, &event);
        assert_eq!(t.state, ConsensusUpdateState::Success);
    }

    #[test]
    fn last_voter_completes_consensus_with_their_own_send() {
        let p = Participants::trio();
        let identity = ledger_identity(&p.addresses(), 1);
        // We are the third participant; turn 5 was ours, so we wait.
        let mut ctx = SharedContext::new(p.shared_signer(), p.addresses()[2], p.key_ref(2));
        ctx.check_and_initialize(sign_by_mover(&p, prefund_commitment(&identity, 0)))
            .unwrap();
        let channel_id = identity.channel_id();
        let last = ledger_commitment(&identity, 5, &[5, 5, 5]);
        if let Some(record) = ctx.channel_store.get_mut(&channel_id) {
            record.push_commitment(sign_by_mover(&p, last.clone()));
        }

        let target = vec![1, 7, 7];
        let t = initialize(
            ProcessId("consensus-test".into()),
            channel_id,
            target.clone(),
            p.addresses(),
            true,
            ProtocolLocator::of(ProtocolTag::ConsensusUpdate),
            ctx,
        );
        assert!(matches!(t.state, ConsensusUpdateState::NotSafeToSend(_)));

        // The proposal and the first vote arrive as one batch; our accept
        // is the final vote.
        let proposal = propose(&last, target, p.addresses());
        let first_vote = weir_core::consensus::accept(&proposal).unwrap();
        let event = EngineEvent::CommitmentsReceived {
            process_id: ProcessId("consensus-test".into()),
            signed_commitments: vec![
                sign_by_mover(&p, proposal),
                sign_by_mover(&p, first_vote),
            ],
        };
        let t = update(t.state, t.context, &event);
        assert_eq!(t.state, ConsensusUpdateState::Success);
        let record = t.context.get_channel(&channel_id).unwrap();
        assert_eq!(record.turn_num, 8);
        assert_eq!(
            record.last_commitment().unwrap().commitment.allocation,
            vec![1, 7, 7]
        );
    }
}
