//! Transaction requests queued for the on-chain adjudicator
//!
//! The protocol engine never talks to a blockchain. It queues requests in
//! the outbox and an outer adapter submits them, reporting back through
//! engine events.

use crate::commitment::SignedCommitment;
use crate::identifiers::{Address, ChannelId};
use serde::{Deserialize, Serialize};

/// A request for the chain adapter to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionRequest {
    /// Open a challenge by presenting the two most recent commitments.
    ForceMove {
        channel_id: ChannelId,
        penultimate: SignedCommitment,
        last: SignedCommitment,
    },
    /// Answer an open challenge with the next commitment.
    RespondWithMove {
        channel_id: ChannelId,
        response: SignedCommitment,
    },
    /// Deposit funds into the channel's on-chain holdings.
    ///
    /// `expected_held` is the amount that must already be held before this
    /// deposit is safe to submit.
    Deposit {
        channel_id: ChannelId,
        amount: u128,
        expected_held: u128,
    },
    /// Withdraw concluded funds to a destination.
    Withdraw {
        channel_id: ChannelId,
        destination: Address,
        amount: u128,
    },
}

impl TransactionRequest {
    /// The channel this request concerns.
    pub fn channel_id(&self) -> ChannelId {
        match self {
            TransactionRequest::ForceMove { channel_id, .. }
            | TransactionRequest::RespondWithMove { channel_id, .. }
            | TransactionRequest::Deposit { channel_id, .. }
            | TransactionRequest::Withdraw { channel_id, .. } => *channel_id,
        }
    }
}
