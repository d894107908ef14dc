//! Responder state chart
//!
//! Runs when the adjudicator reports a challenge raised against us. We
//! answer with a move before the expiry: either a commitment we already
//! hold that outruns the challenge, or a fresh one the application
//! provides. Missing the window closes the channel and offers defunding.

use tracing::warn;
use weir_core::chain::TransactionRequest;
use weir_core::commitment::SignedCommitment;
use weir_core::identifiers::{ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::{DisplayCommand, SharedContext};

use crate::events::{EngineEvent, RoutedEvent};
use crate::protocols::defunding::{self, DefundingState};
use crate::protocols::transaction_submission::{self, TransactionSubmissionState};
use crate::Transition;

/// Why responding ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderFailureReason {
    TransactionFailed,
    /// The response window passed and the channel closed.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForApproval {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub expiry_time: u64,
    /// The commitment the challenge was raised with.
    pub challenge_turn_num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForTransaction {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub transaction: TransactionSubmissionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForDefund {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub defunding: DefundingState,
}

/// The responder state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderState {
    WaitForApproval(WaitForApproval),
    WaitForTransaction(WaitForTransaction),
    /// The response is on chain; waiting for the user to dismiss.
    WaitForAcknowledgement {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    /// The window passed; waiting for the user to pick defunding.
    AcknowledgeTimeout {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
    },
    WaitForDefund(WaitForDefund),
    AcknowledgeDefundingSuccess {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    AcknowledgeClosedButNotDefunded {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    Success,
    ClosedAndDefunded,
    ClosedButNotDefunded,
    Failure { reason: ResponderFailureReason },
}

impl ResponderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponderState::Success
                | ResponderState::ClosedAndDefunded
                | ResponderState::ClosedButNotDefunded
                | ResponderState::Failure { .. }
        )
    }
}

/// Record the challenge and put the response to the user.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    expiry_time: u64,
    challenge_commitment: SignedCommitment,
    locator: ProtocolLocator,
    mut context: SharedContext,
) -> Transition<ResponderState> {
    let challenge_turn_num = challenge_commitment.commitment.turn_num;
    // The challenge may carry a commitment we had not seen yet.
    if let Err(error) = context.check_and_store(challenge_commitment) {
        warn!(%error, %channel_id, "challenge commitment already known or invalid");
    }
    context.queue_display(DisplayCommand::Show);
    context.register_channel_to_monitor(process_id.clone(), channel_id);
    Transition::new(
        ResponderState::WaitForApproval(WaitForApproval {
            process_id,
            channel_id,
            locator,
            expiry_time,
            challenge_turn_num,
        }),
        context,
    )
}

/// Consume one routed event.
pub fn update(
    state: ResponderState,
    mut context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<ResponderState> {
    if state.is_terminal() {
        warn!(?routed, "event for terminal responder ignored");
        return Transition::new(state, context);
    }
    match state {
        ResponderState::WaitForApproval(inner) => match &routed.event {
            EngineEvent::ChallengeApproved if routed.is_local() => {
                respond_with_existing_move(inner, context)
            }
            EngineEvent::ChallengeResponseProvided { commitment } if routed.is_local() => {
                match context.sign_and_store(commitment.clone()) {
                    Ok(signed) => submit_response(inner, signed, context),
                    Err(error) => {
                        warn!(%error, "provided response did not validate");
                        Transition::new(ResponderState::WaitForApproval(inner), context)
                    }
                }
            }
            EngineEvent::ChallengeExpired if routed.is_local() => Transition::new(
                ResponderState::AcknowledgeTimeout {
                    process_id: inner.process_id,
                    channel_id: inner.channel_id,
                    locator: inner.locator,
                },
                context,
            ),
            other => {
                warn!(?other, "unexpected event while approving response");
                Transition::new(ResponderState::WaitForApproval(inner), context)
            }
        },
        ResponderState::WaitForTransaction(inner) => {
            if let Some(child_event) = routed.for_child(ProtocolTag::TransactionSubmission) {
                let child =
                    transaction_submission::update(inner.transaction, context, &child_event.event);
                return match child.state {
                    TransactionSubmissionState::Success { .. } => Transition::new(
                        ResponderState::WaitForAcknowledgement {
                            process_id: inner.process_id,
                            channel_id: inner.channel_id,
                        },
                        child.context,
                    ),
                    TransactionSubmissionState::Failure { .. } => Transition::new(
                        ResponderState::Failure {
                            reason: ResponderFailureReason::TransactionFailed,
                        },
                        child.context,
                    ),
                    transaction => Transition::new(
                        ResponderState::WaitForTransaction(WaitForTransaction {
                            transaction,
                            ..inner
                        }),
                        child.context,
                    ),
                };
            }
            match &routed.event {
                EngineEvent::ChallengeExpired if routed.is_local() => Transition::new(
                    ResponderState::AcknowledgeTimeout {
                        process_id: inner.process_id,
                        channel_id: inner.channel_id,
                        locator: inner.locator,
                    },
                    context,
                ),
                other => {
                    warn!(?other, "unexpected event while submitting response");
                    Transition::new(ResponderState::WaitForTransaction(inner), context)
                }
            }
        }
        ResponderState::WaitForAcknowledgement {
            process_id,
            channel_id,
        } => match &routed.event {
            EngineEvent::Acknowledged if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ResponderState::Success, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging response");
                Transition::new(
                    ResponderState::WaitForAcknowledgement {
                        process_id,
                        channel_id,
                    },
                    context,
                )
            }
        },
        ResponderState::AcknowledgeTimeout {
            process_id,
            channel_id,
            locator,
        } => match &routed.event {
            EngineEvent::DefundChosen if routed.is_local() => {
                let child = defunding::initialize(
                    process_id.clone(),
                    channel_id,
                    locator.descend(ProtocolTag::Defunding),
                    context,
                );
                fold_defunding(process_id, channel_id, locator, child)
            }
            EngineEvent::ExitChallenge if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ResponderState::ClosedButNotDefunded, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging timeout");
                Transition::new(
                    ResponderState::AcknowledgeTimeout {
                        process_id,
                        channel_id,
                        locator,
                    },
                    context,
                )
            }
        },
        ResponderState::WaitForDefund(inner) => {
            if let Some(child_event) = routed.for_child(ProtocolTag::Defunding) {
                let child = defunding::update(inner.defunding, context, &child_event);
                fold_defunding(inner.process_id, inner.channel_id, inner.locator, child)
            } else {
                warn!(?routed, "unexpected event while defunding");
                Transition::new(ResponderState::WaitForDefund(inner), context)
            }
        }
        ResponderState::AcknowledgeDefundingSuccess {
            process_id,
            channel_id,
        } => match &routed.event {
            EngineEvent::Acknowledged if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ResponderState::ClosedAndDefunded, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging defund");
                Transition::new(
                    ResponderState::AcknowledgeDefundingSuccess {
                        process_id,
                        channel_id,
                    },
                    context,
                )
            }
        },
        ResponderState::AcknowledgeClosedButNotDefunded {
            process_id,
            channel_id,
        } => match &routed.event {
            EngineEvent::Acknowledged if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ResponderState::ClosedButNotDefunded, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging close");
                Transition::new(
                    ResponderState::AcknowledgeClosedButNotDefunded {
                        process_id,
                        channel_id,
                    },
                    context,
                )
            }
        },
        terminal => Transition::new(terminal, context),
    }
}

/// Respond with a commitment we already hold that outruns the challenge.
fn respond_with_existing_move(
    inner: WaitForApproval,
    context: SharedContext,
) -> Transition<ResponderState> {
    let existing = context.get_channel(&inner.channel_id).and_then(|record| {
        record
            .last_commitment()
            .filter(|signed| signed.commitment.turn_num > inner.challenge_turn_num)
            .cloned()
    });
    match existing {
        Some(signed) => submit_response(inner, signed, context),
        None => {
            // Nothing newer stored; the application must provide the move.
            warn!(channel_id = %inner.channel_id, "no stored move outruns the challenge");
            Transition::new(ResponderState::WaitForApproval(inner), context)
        }
    }
}

fn submit_response(
    inner: WaitForApproval,
    response: SignedCommitment,
    context: SharedContext,
) -> Transition<ResponderState> {
    let request = TransactionRequest::RespondWithMove {
        channel_id: inner.channel_id,
        response,
    };
    let child = transaction_submission::initialize(inner.process_id.clone(), request, context);
    child.map(|transaction| {
        ResponderState::WaitForTransaction(WaitForTransaction {
            process_id: inner.process_id,
            channel_id: inner.channel_id,
            locator: inner.locator,
            transaction,
        })
    })
}

fn fold_defunding(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<DefundingState>,
) -> Transition<ResponderState> {
    match child.state {
        DefundingState::Success => Transition::new(
            ResponderState::AcknowledgeDefundingSuccess {
                process_id,
                channel_id,
            },
            child.context,
        ),
        DefundingState::Failure { .. } => Transition::new(
            ResponderState::AcknowledgeClosedButNotDefunded {
                process_id,
                channel_id,
            },
            child.context,
        ),
        defunding => Transition::new(
            ResponderState::WaitForDefund(WaitForDefund {
                process_id,
                channel_id,
                locator,
                defunding,
            }),
            child.context,
        ),
    }
}

fn close_display(process_id: &ProcessId, context: &mut SharedContext) {
    context.queue_display(DisplayCommand::Hide);
    context.unregister_all_channels_to_monitor(process_id);
}
