//! Weir Protocol - Nested State Machines
//!
//! Every sub-protocol follows the same shape: an `initialize` that builds
//! the starting state against the shared context, and an `update` that
//! consumes one event and returns the next state plus the mutated context.
//! Transitions run to completion on a single thread and never perform I/O;
//! effects accumulate in the context's outbox.
//!
//! Protocols compose by embedding child states. Events reach a nested
//! instance through a locator, the path of protocol tags from the root;
//! each composite strips its own tag before forwarding.
//!
//! # Protocols
//!
//! - **consensus_update**: one strictly ordered round agreeing a new
//!   allocation in a (possibly multi-party) channel
//! - **transaction_submission**: submit-confirm-retry loop for chain
//!   transactions
//! - **dispute**: challenger and responder state charts
//! - **defunding**: withdraw direct funds or unwind a ledger allocation
//! - **funding**: strategy selection over direct funding, existing or new
//!   ledger channels, ledger top-up, and hub-routed virtual funding

#![allow(missing_docs)]
#![forbid(unsafe_code)]

/// Engine events and the locator-carrying envelope
pub mod events;

/// Top-level process dispatch
pub mod engine;

/// The sub-protocol state machines
pub mod protocols;

use weir_store::SharedContext;

/// The result of one protocol step: the next state and the context the
/// step mutated.
#[derive(Debug)]
pub struct Transition<S> {
    pub state: S,
    pub context: SharedContext,
}

impl<S> Transition<S> {
    /// Pair a state with a context.
    pub fn new(state: S, context: SharedContext) -> Self {
        Self { state, context }
    }

    /// Fold the state into an enclosing protocol's variant.
    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> Transition<T> {
        Transition {
            state: f(self.state),
            context: self.context,
        }
    }
}
