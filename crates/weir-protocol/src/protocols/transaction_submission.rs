//! Transaction-submission protocol
//!
//! Wraps one chain transaction in a submit-confirm loop with a single
//! user-approved retry path. The chain adapter drains the request from
//! the outbox and reports back through transaction events.

use tracing::warn;
use weir_core::chain::TransactionRequest;
use weir_core::identifiers::ProcessId;
use weir_store::SharedContext;

use crate::events::EngineEvent;
use crate::Transition;

/// Why the transaction flow ended without a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFailureReason {
    /// The transaction failed or could not be submitted, and the user
    /// declined to retry.
    UserDeclinedRetry,
}

/// Waiting for the chain adapter to pick up and submit the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForSubmission {
    pub process_id: ProcessId,
    pub request: TransactionRequest,
}

/// Submitted; waiting for the chain to confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForConfirmation {
    pub process_id: ProcessId,
    pub request: TransactionRequest,
}

/// The attempt failed; waiting for the user to approve a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproveRetry {
    pub process_id: ProcessId,
    pub request: TransactionRequest,
}

/// The transaction-submission state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSubmissionState {
    WaitForSubmission(WaitForSubmission),
    WaitForConfirmation(WaitForConfirmation),
    ApproveRetry(ApproveRetry),
    /// Confirmed at the given wall-clock time.
    Success { confirmed_at: u64 },
    Failure { reason: TransactionFailureReason },
}

impl TransactionSubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionSubmissionState::Success { .. }
                | TransactionSubmissionState::Failure { .. }
        )
    }
}

/// Queue the request and wait for the adapter.
pub fn initialize(
    process_id: ProcessId,
    request: TransactionRequest,
    mut context: SharedContext,
) -> Transition<TransactionSubmissionState> {
    context.queue_transaction(process_id.clone(), request.clone());
    Transition::new(
        TransactionSubmissionState::WaitForSubmission(WaitForSubmission {
            process_id,
            request,
        }),
        context,
    )
}

/// Consume one event.
pub fn update(
    state: TransactionSubmissionState,
    mut context: SharedContext,
    event: &EngineEvent,
) -> Transition<TransactionSubmissionState> {
    use TransactionSubmissionState as S;
    let state = match (state, event) {
        (S::WaitForSubmission(inner), EngineEvent::TransactionSubmitted) => {
            S::WaitForConfirmation(WaitForConfirmation {
                process_id: inner.process_id,
                request: inner.request,
            })
        }
        (S::WaitForSubmission(inner), EngineEvent::TransactionSubmissionFailed) => {
            S::ApproveRetry(ApproveRetry {
                process_id: inner.process_id,
                request: inner.request,
            })
        }
        (S::WaitForConfirmation(_), EngineEvent::TransactionConfirmed { observed_at }) => {
            S::Success {
                confirmed_at: *observed_at,
            }
        }
        (S::WaitForConfirmation(inner), EngineEvent::TransactionFailed) => {
            S::ApproveRetry(ApproveRetry {
                process_id: inner.process_id,
                request: inner.request,
            })
        }
        (S::ApproveRetry(inner), EngineEvent::TransactionRetryApproved) => {
            context.queue_transaction(inner.process_id.clone(), inner.request.clone());
            S::WaitForSubmission(WaitForSubmission {
                process_id: inner.process_id,
                request: inner.request,
            })
        }
        (S::ApproveRetry(_), EngineEvent::TransactionRetryDenied) => S::Failure {
            reason: TransactionFailureReason::UserDeclinedRetry,
        },
        (state, event) => {
            warn!(?event, "unexpected event for transaction submission");
            state
        }
    };
    Transition::new(state, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::identifiers::{Address, ChannelId, KeyRef};
    use weir_testkit::Participants;

    fn request() -> TransactionRequest {
        TransactionRequest::Deposit {
            channel_id: ChannelId([1; 32]),
            amount: 5,
            expected_held: 0,
        }
    }

    fn context() -> SharedContext {
        let p = Participants::pair();
        SharedContext::new(p.shared_signer(), Address([1; 32]), KeyRef("k".into()))
    }

    #[test]
    fn happy_path_queues_once_and_confirms() {
        let pid = ProcessId("tx-test".into());
        let t = initialize(pid, request(), context());
        assert_eq!(t.context.outbox.transactions.len(), 1);
        assert!(matches!(
            t.state,
            TransactionSubmissionState::WaitForSubmission(_)
        ));

        let t = update(t.state, t.context, &EngineEvent::TransactionSubmitted);
        assert!(matches!(
            t.state,
            TransactionSubmissionState::WaitForConfirmation(_)
        ));

        let t = update(
            t.state,
            t.context,
            &EngineEvent::TransactionConfirmed { observed_at: 900 },
        );
        assert_eq!(
            t.state,
            TransactionSubmissionState::Success { confirmed_at: 900 }
        );
        assert_eq!(t.context.outbox.transactions.len(), 1);
    }

    #[test]
    fn approved_retry_requeues_the_request() {
        let pid = ProcessId("tx-test".into());
        let t = initialize(pid, request(), context());
        let t = update(t.state, t.context, &EngineEvent::TransactionSubmissionFailed);
        assert!(matches!(t.state, TransactionSubmissionState::ApproveRetry(_)));

        let t = update(t.state, t.context, &EngineEvent::TransactionRetryApproved);
        assert!(matches!(
            t.state,
            TransactionSubmissionState::WaitForSubmission(_)
        ));
        assert_eq!(t.context.outbox.transactions.len(), 2);
        assert_eq!(
            t.context.outbox.transactions[0].request,
            t.context.outbox.transactions[1].request
        );
    }

    #[test]
    fn denied_retry_fails_the_flow() {
        let pid = ProcessId("tx-test".into());
        let t = initialize(pid, request(), context());
        let t = update(t.state, t.context, &EngineEvent::TransactionSubmitted);
        let t = update(t.state, t.context, &EngineEvent::TransactionFailed);
        let t = update(t.state, t.context, &EngineEvent::TransactionRetryDenied);
        assert_eq!(
            t.state,
            TransactionSubmissionState::Failure {
                reason: TransactionFailureReason::UserDeclinedRetry
            }
        );
    }

    #[test]
    fn unexpected_events_leave_the_state_alone() {
        let pid = ProcessId("tx-test".into());
        let t = initialize(pid, request(), context());
        let before = t.state.clone();
        let t = update(t.state, t.context, &EngineEvent::Acknowledged);
        assert_eq!(t.state, before);
    }
}
