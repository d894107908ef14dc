//! Pending effects accumulated during a run
//!
//! Protocol steps never perform I/O. They queue messages to counterparties,
//! display commands for the UI, and transaction requests for the chain
//! adapter. An outer loop drains the outbox after each run; within a run
//! the outbox only ever grows.

use serde::{Deserialize, Serialize};
use weir_core::chain::TransactionRequest;
use weir_core::commitment::SignedCommitment;
use weir_core::identifiers::{Address, ProcessId};
use weir_core::locator::ProtocolLocator;

/// A wallet-to-wallet message carrying commitments for a protocol
/// instance on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Recipient wallet.
    pub to: Address,
    /// The protocol instance this message belongs to.
    pub process_id: ProcessId,
    /// Path to the protocol within the recipient's instance tree.
    pub locator: ProtocolLocator,
    /// Commitments the recipient needs, latest last.
    pub signed_commitments: Vec<SignedCommitment>,
}

/// Instructions for the wallet UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayCommand {
    /// Bring the wallet interface into view.
    Show,
    /// Hide the wallet interface.
    Hide,
}

/// A transaction request tagged with the protocol instance that queued it,
/// so confirmation events can find their way back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequestEntry {
    pub process_id: ProcessId,
    pub request: TransactionRequest,
}

/// Effects queued during a run, drained by the outer loop afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outbox {
    pub messages: Vec<MessageEnvelope>,
    pub display: Vec<DisplayCommand>,
    pub transactions: Vec<TransactionRequestEntry>,
}

impl Outbox {
    /// An empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.display.is_empty() && self.transactions.is_empty()
    }
}
