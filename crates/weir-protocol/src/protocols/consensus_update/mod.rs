//! Consensus-update protocol
//!
//! Drives one strictly ordered round of propose-then-vote commitments to
//! move a channel's participants onto a new allocation. Every funding,
//! top-up, and defunding flow delegates its money movement here.

mod states;
mod transitions;

pub use states::{
    CommitmentSent, ConsensusUpdateState, FailureReason, NotSafeToSend,
};
pub use transitions::{initialize, update};
