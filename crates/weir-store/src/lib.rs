//! Weir Store - Channel State and Shared Context
//!
//! Everything a protocol instance reads or mutates lives here: the channel
//! store keyed by channel id, the transition-rule registry, the outbox of
//! pending effects, and the `SharedContext` value that threads all of them
//! through a run of the engine.
//!
//! The context is a plain value. Reducers receive it by value, mutate
//! their copy, and return it; nothing here is shared across threads while
//! a run is in progress.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

/// Per-channel records and lifecycle queries
pub mod channel;

/// Transition-rule registry and the built-in consensus rule
pub mod rules;

/// The channel store and its commitment operations
pub mod store;

/// Pending messages, display commands, and transaction requests
pub mod outbox;

/// The shared context threaded through every protocol step
pub mod context;

pub use channel::{ChannelRecord, ChannelStage};
pub use context::{FundingDescriptor, SharedContext};
pub use outbox::{DisplayCommand, MessageEnvelope, Outbox};
pub use rules::{ConsensusRule, RuleRegistry, RuleViolation, TransitionRule};
pub use store::{ChannelStore, ChannelStoreError, TransitionError};
