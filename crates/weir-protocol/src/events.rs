//! Engine events and the locator-carrying envelope
//!
//! The event set is closed. External collaborators (relay, chain watcher,
//! timer, UI) translate their observations into these variants; protocols
//! match exhaustively and warn on events they cannot use in their current
//! state.

use serde::{Deserialize, Serialize};
use weir_core::commitment::{Commitment, SignedCommitment};
use weir_core::identifiers::{ChannelId, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};

/// Everything that can happen to a running protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A counterparty's wallet relayed commitments to us.
    CommitmentsReceived {
        process_id: ProcessId,
        signed_commitments: Vec<SignedCommitment>,
    },
    /// An external gate serializing consensus updates has opened.
    ClearedToSend,
    /// The user approved launching a challenge.
    ChallengeApproved,
    /// The user declined launching a challenge.
    ChallengeDenied,
    /// The user acknowledged a terminal outcome screen.
    Acknowledged,
    /// The user chose to defund after a challenge timed out.
    DefundChosen,
    /// The user left the challenge flow without defunding.
    ExitChallenge,
    /// The user cancelled the running protocol.
    Cancelled,
    /// The chain watcher saw funds arrive for a channel.
    FundingReceived {
        channel_id: ChannelId,
        total_for_destination: u128,
    },
    /// The adjudicator fixed the challenge expiry.
    ChallengeExpirySet { expiry_time: u64 },
    /// The timer fired past the challenge expiry.
    ChallengeExpired,
    /// The adjudicator saw the counterparty respond to our challenge.
    ChallengeResponseReceived { signed_commitment: SignedCommitment },
    /// The application supplied the move to respond to a challenge with.
    ChallengeResponseProvided { commitment: Commitment },
    /// The adjudicator saw our challenge refuted by a later commitment.
    Refuted,
    /// The chain adapter submitted our transaction.
    TransactionSubmitted,
    /// The chain adapter could not submit our transaction.
    TransactionSubmissionFailed,
    /// Our transaction was confirmed at the given wall-clock time.
    TransactionConfirmed { observed_at: u64 },
    /// The user approved retrying a failed transaction.
    TransactionRetryApproved,
    /// The user declined retrying a failed transaction.
    TransactionRetryDenied,
    /// A submitted transaction failed on chain.
    TransactionFailed,
}

/// An event together with the path to the protocol it addresses.
///
/// The locator is relative to the receiver: an empty locator means the
/// event is for the receiving protocol itself, otherwise the head names
/// the child to forward to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedEvent {
    pub locator: ProtocolLocator,
    pub event: EngineEvent,
}

impl RoutedEvent {
    /// An event addressed to the receiving protocol itself.
    pub fn local(event: EngineEvent) -> Self {
        Self {
            locator: ProtocolLocator::root(),
            event,
        }
    }

    /// An event addressed along a path.
    pub fn at(locator: ProtocolLocator, event: EngineEvent) -> Self {
        Self { locator, event }
    }

    /// Whether the event addresses the receiver itself.
    pub fn is_local(&self) -> bool {
        self.locator.is_empty()
    }

    /// If the event addresses the child behind `tag`, strip the tag and
    /// return the event as the child will see it.
    pub fn for_child(&self, tag: ProtocolTag) -> Option<RoutedEvent> {
        match self.locator.split_first() {
            Some((head, rest)) if head == tag => Some(RoutedEvent {
                locator: rest,
                event: self.event.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_child_strips_exactly_one_tag() {
        let routed = RoutedEvent::at(
            ProtocolLocator(vec![ProtocolTag::LedgerTopUp, ProtocolTag::ConsensusUpdate]),
            EngineEvent::ClearedToSend,
        );
        let child = routed.for_child(ProtocolTag::LedgerTopUp).unwrap();
        assert_eq!(child.locator.0, vec![ProtocolTag::ConsensusUpdate]);
        assert_eq!(child.event, EngineEvent::ClearedToSend);

        let grandchild = child.for_child(ProtocolTag::ConsensusUpdate).unwrap();
        assert!(grandchild.is_local());
    }

    #[test]
    fn mismatched_tag_is_not_forwarded() {
        let routed = RoutedEvent::at(
            ProtocolLocator::of(ProtocolTag::Defunding),
            EngineEvent::Acknowledged,
        );
        assert!(routed.for_child(ProtocolTag::TransactionSubmission).is_none());
        assert!(!routed.is_local());
    }
}
