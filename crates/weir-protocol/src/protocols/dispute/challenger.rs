//! Challenger state chart
//!
//! Raised when the counterparty stalls and we hold the latest commitment.
//! The force-move transaction presents the penultimate and latest
//! commitments; the adjudicator then gives the counterparty until the
//! expiry to respond. A response reopens the channel, a timeout closes it
//! and offers defunding.

use tracing::warn;
use weir_core::chain::TransactionRequest;
use weir_core::identifiers::{ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_store::{DisplayCommand, SharedContext};

use crate::events::{EngineEvent, RoutedEvent};
use crate::protocols::defunding::{self, DefundingState};
use crate::protocols::store_new_commitments;
use crate::protocols::transaction_submission::{self, TransactionSubmissionState};
use crate::Transition;

use super::CHALLENGE_TIMEOUT_MS;

/// Why a challenge could not run to a useful end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengerFailureReason {
    ChannelDoesntExist,
    /// The channel lacks the penultimate+last pair required as evidence.
    NotFullyOpen,
    DeclinedByUser,
    /// It is our move; a challenge forces nobody.
    AlreadyHaveLatest,
    /// The awaited commitment arrived while the user was deciding.
    LatestWhileApproving,
    TransactionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproveChallenge {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForTransaction {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    /// Set early if the adjudicator reports the expiry before the
    /// transaction confirms.
    pub expiry_time: Option<u64>,
    pub transaction: TransactionSubmissionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForResponseOrTimeout {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub expiry_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForDefund {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub locator: ProtocolLocator,
    pub defunding: DefundingState,
}

/// The challenger state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengerState {
    ApproveChallenge(ApproveChallenge),
    WaitForTransaction(WaitForTransaction),
    WaitForResponseOrTimeout(WaitForResponseOrTimeout),
    /// The counterparty responded; waiting for the user to dismiss.
    AcknowledgeResponse {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
    },
    /// The challenge expired; waiting for the user to pick defunding.
    AcknowledgeTimeout {
        process_id: ProcessId,
        channel_id: ChannelId,
        locator: ProtocolLocator,
    },
    WaitForDefund(WaitForDefund),
    /// Defunding recovered the funds; waiting for dismissal.
    AcknowledgeSuccess {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    /// The channel closed but its funds were not recovered.
    AcknowledgeClosedButNotDefunded {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    AcknowledgeFailure {
        process_id: ProcessId,
        channel_id: ChannelId,
        reason: ChallengerFailureReason,
    },
    SuccessOpen,
    SuccessClosedAndDefunded,
    SuccessClosedButNotDefunded,
    Failure { reason: ChallengerFailureReason },
}

impl ChallengerState {
    fn process_id(&self) -> Option<&ProcessId> {
        match self {
            ChallengerState::ApproveChallenge(inner) => Some(&inner.process_id),
            ChallengerState::WaitForTransaction(inner) => Some(&inner.process_id),
            ChallengerState::WaitForResponseOrTimeout(inner) => Some(&inner.process_id),
            ChallengerState::WaitForDefund(inner) => Some(&inner.process_id),
            ChallengerState::AcknowledgeResponse { process_id, .. }
            | ChallengerState::AcknowledgeTimeout { process_id, .. }
            | ChallengerState::AcknowledgeSuccess { process_id, .. }
            | ChallengerState::AcknowledgeClosedButNotDefunded { process_id, .. }
            | ChallengerState::AcknowledgeFailure { process_id, .. } => Some(process_id),
            ChallengerState::SuccessOpen
            | ChallengerState::SuccessClosedAndDefunded
            | ChallengerState::SuccessClosedButNotDefunded
            | ChallengerState::Failure { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChallengerState::SuccessOpen
                | ChallengerState::SuccessClosedAndDefunded
                | ChallengerState::SuccessClosedButNotDefunded
                | ChallengerState::Failure { .. }
        )
    }
}

/// Guard the entry conditions and put the challenge to the user.
pub fn initialize(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    mut context: SharedContext,
) -> Transition<ChallengerState> {
    context.queue_display(DisplayCommand::Show);
    let fail = |reason| ChallengerState::AcknowledgeFailure {
        process_id: process_id.clone(),
        channel_id,
        reason,
    };
    let Some(record) = context.get_channel(&channel_id) else {
        let state = fail(ChallengerFailureReason::ChannelDoesntExist);
        return Transition::new(state, context);
    };
    if !record.is_fully_open() {
        let state = fail(ChallengerFailureReason::NotFullyOpen);
        return Transition::new(state, context);
    }
    if record.our_turn() {
        let state = fail(ChallengerFailureReason::AlreadyHaveLatest);
        return Transition::new(state, context);
    }
    context.register_channel_to_monitor(process_id.clone(), channel_id);
    Transition::new(
        ChallengerState::ApproveChallenge(ApproveChallenge {
            process_id,
            channel_id,
            locator,
        }),
        context,
    )
}

/// Consume one routed event.
pub fn update(
    state: ChallengerState,
    mut context: SharedContext,
    routed: &RoutedEvent,
) -> Transition<ChallengerState> {
    if state.is_terminal() {
        warn!(?routed, "event for terminal challenger ignored");
        return Transition::new(state, context);
    }
    // The user can abandon the dispute from any live state.
    if routed.is_local() && matches!(routed.event, EngineEvent::ExitChallenge) {
        if let Some(process_id) = state.process_id() {
            let process_id = process_id.clone();
            close_display(&process_id, &mut context);
        }
        return Transition::new(ChallengerState::SuccessClosedButNotDefunded, context);
    }
    match state {
        ChallengerState::ApproveChallenge(inner) => match &routed.event {
            EngineEvent::ChallengeApproved if routed.is_local() => {
                launch_challenge(inner, context)
            }
            EngineEvent::ChallengeDenied if routed.is_local() => {
                let state = ChallengerState::AcknowledgeFailure {
                    process_id: inner.process_id,
                    channel_id: inner.channel_id,
                    reason: ChallengerFailureReason::DeclinedByUser,
                };
                Transition::new(state, context)
            }
            EngineEvent::CommitmentsReceived {
                signed_commitments, ..
            } => {
                // The move we wanted to force arrived on its own.
                store_new_commitments(&mut context, signed_commitments);
                let state = ChallengerState::AcknowledgeFailure {
                    process_id: inner.process_id,
                    channel_id: inner.channel_id,
                    reason: ChallengerFailureReason::LatestWhileApproving,
                };
                Transition::new(state, context)
            }
            other => {
                warn!(?other, "unexpected event while approving challenge");
                Transition::new(ChallengerState::ApproveChallenge(inner), context)
            }
        },
        ChallengerState::WaitForTransaction(inner) => {
            if let Some(child_event) = routed.for_child(ProtocolTag::TransactionSubmission) {
                let child =
                    transaction_submission::update(inner.transaction, context, &child_event.event);
                return match child.state {
                    TransactionSubmissionState::Success { confirmed_at } => {
                        let expiry_time = inner
                            .expiry_time
                            .unwrap_or(confirmed_at + CHALLENGE_TIMEOUT_MS);
                        Transition::new(
                            ChallengerState::WaitForResponseOrTimeout(WaitForResponseOrTimeout {
                                process_id: inner.process_id,
                                channel_id: inner.channel_id,
                                locator: inner.locator,
                                expiry_time,
                            }),
                            child.context,
                        )
                    }
                    TransactionSubmissionState::Failure { .. } => Transition::new(
                        ChallengerState::AcknowledgeFailure {
                            process_id: inner.process_id,
                            channel_id: inner.channel_id,
                            reason: ChallengerFailureReason::TransactionFailed,
                        },
                        child.context,
                    ),
                    transaction => Transition::new(
                        ChallengerState::WaitForTransaction(WaitForTransaction {
                            transaction,
                            ..inner
                        }),
                        child.context,
                    ),
                };
            }
            match &routed.event {
                EngineEvent::ChallengeExpirySet { expiry_time } if routed.is_local() => {
                    Transition::new(
                        ChallengerState::WaitForTransaction(WaitForTransaction {
                            expiry_time: Some(*expiry_time),
                            ..inner
                        }),
                        context,
                    )
                }
                other => {
                    warn!(?other, "unexpected event while submitting challenge");
                    Transition::new(ChallengerState::WaitForTransaction(inner), context)
                }
            }
        }
        ChallengerState::WaitForResponseOrTimeout(inner) => match &routed.event {
            EngineEvent::ChallengeExpirySet { expiry_time } if routed.is_local() => {
                Transition::new(
                    ChallengerState::WaitForResponseOrTimeout(WaitForResponseOrTimeout {
                        expiry_time: *expiry_time,
                        ..inner
                    }),
                    context,
                )
            }
            EngineEvent::ChallengeResponseReceived { signed_commitment } if routed.is_local() => {
                if let Err(error) = context.check_and_store(signed_commitment.clone()) {
                    warn!(%error, "challenge response did not validate");
                }
                Transition::new(
                    ChallengerState::AcknowledgeResponse {
                        process_id: inner.process_id,
                        channel_id: inner.channel_id,
                        locator: inner.locator,
                    },
                    context,
                )
            }
            EngineEvent::Refuted if routed.is_local() => Transition::new(
                // A refutation proves a later commitment exists; the
                // channel stays open just as with a response.
                ChallengerState::AcknowledgeResponse {
                    process_id: inner.process_id,
                    channel_id: inner.channel_id,
                    locator: inner.locator,
                },
                context,
            ),
            EngineEvent::ChallengeExpired if routed.is_local() => Transition::new(
                ChallengerState::AcknowledgeTimeout {
                    process_id: inner.process_id,
                    channel_id: inner.channel_id,
                    locator: inner.locator,
                },
                context,
            ),
            other => {
                warn!(?other, "unexpected event while waiting for response");
                Transition::new(ChallengerState::WaitForResponseOrTimeout(inner), context)
            }
        },
        ChallengerState::AcknowledgeResponse {
            process_id,
            channel_id,
            locator,
        } => match &routed.event {
            EngineEvent::Acknowledged if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ChallengerState::SuccessOpen, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging response");
                Transition::new(
                    ChallengerState::AcknowledgeResponse {
                        process_id,
                        channel_id,
                        locator,
                    },
                    context,
                )
            }
        },
        ChallengerState::AcknowledgeTimeout {
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
            other => {
                warn!(?other, "unexpected event while acknowledging timeout");
                Transition::new(
                    ChallengerState::AcknowledgeTimeout {
                        process_id,
                        channel_id,
                        locator,
                    },
                    context,
                )
            }
        },
        ChallengerState::WaitForDefund(inner) => {
            if let Some(child_event) = routed.for_child(ProtocolTag::Defunding) {
                let child = defunding::update(inner.defunding, context, &child_event);
                fold_defunding(inner.process_id, inner.channel_id, inner.locator, child)
            } else {
                warn!(?routed, "unexpected event while defunding");
                Transition::new(ChallengerState::WaitForDefund(inner), context)
            }
        }
        ChallengerState::AcknowledgeSuccess {
            process_id,
            channel_id,
        } => match &routed.event {
            EngineEvent::Acknowledged if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ChallengerState::SuccessClosedAndDefunded, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging defund");
                Transition::new(
                    ChallengerState::AcknowledgeSuccess {
                        process_id,
                        channel_id,
                    },
                    context,
                )
            }
        },
        ChallengerState::AcknowledgeClosedButNotDefunded {
            process_id,
            channel_id,
        } => match &routed.event {
            EngineEvent::Acknowledged if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ChallengerState::SuccessClosedButNotDefunded, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging close");
                Transition::new(
                    ChallengerState::AcknowledgeClosedButNotDefunded {
                        process_id,
                        channel_id,
                    },
                    context,
                )
            }
        },
        ChallengerState::AcknowledgeFailure {
            process_id,
            channel_id,
            reason,
        } => match &routed.event {
            EngineEvent::Acknowledged if routed.is_local() => {
                close_display(&process_id, &mut context);
                Transition::new(ChallengerState::Failure { reason }, context)
            }
            other => {
                warn!(?other, "unexpected event while acknowledging failure");
                Transition::new(
                    ChallengerState::AcknowledgeFailure {
                        process_id,
                        channel_id,
                        reason,
                    },
                    context,
                )
            }
        },
        terminal => Transition::new(terminal, context),
    }
}

fn launch_challenge(
    inner: ApproveChallenge,
    context: SharedContext,
) -> Transition<ChallengerState> {
    let evidence = context.get_channel(&inner.channel_id).and_then(|record| {
        let penultimate = record.penultimate_commitment()?.clone();
        let last = record.last_commitment()?.clone();
        Some((penultimate, last))
    });
    let Some((penultimate, last)) = evidence else {
        // Guarded at initialize; hitting this means the record regressed.
        return Transition::new(
            ChallengerState::AcknowledgeFailure {
                process_id: inner.process_id,
                channel_id: inner.channel_id,
                reason: ChallengerFailureReason::NotFullyOpen,
            },
            context,
        );
    };
    let request = TransactionRequest::ForceMove {
        channel_id: inner.channel_id,
        penultimate,
        last,
    };
    let child = transaction_submission::initialize(inner.process_id.clone(), request, context);
    child.map(|transaction| {
        ChallengerState::WaitForTransaction(WaitForTransaction {
            process_id: inner.process_id,
            channel_id: inner.channel_id,
            locator: inner.locator,
            expiry_time: None,
            transaction,
        })
    })
}

fn fold_defunding(
    process_id: ProcessId,
    channel_id: ChannelId,
    locator: ProtocolLocator,
    child: Transition<DefundingState>,
) -> Transition<ChallengerState> {
    match child.state {
        DefundingState::Success => Transition::new(
            ChallengerState::AcknowledgeSuccess {
                process_id,
                channel_id,
            },
            child.context,
        ),
        DefundingState::Failure { .. } => Transition::new(
            ChallengerState::AcknowledgeClosedButNotDefunded {
                process_id,
                channel_id,
            },
            child.context,
        ),
        defunding => Transition::new(
            ChallengerState::WaitForDefund(WaitForDefund {
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
