//! Weir Core - Commitment Model Foundation
//!
//! Foundational types for the Weir state-channel wallet: channel identities,
//! commitments, signatures, and the pairwise transition rules that every
//! higher layer validates against. This crate is pure data plus pure
//! functions; it performs no I/O and holds no mutable state.
//!
//! # Layering
//!
//! - **identifiers**: Addresses, channel ids, process ids, key references
//! - **commitment**: `ChannelIdentity`, `Commitment`, `SignedCommitment`
//! - **signing**: The `CommitmentSigner` capability and signature checks
//! - **consensus**: The consensus channel application (attribute codec,
//!   commitment crafting, pairwise validity)
//! - **locator**: Protocol tags and locators used to route events through
//!   a running protocol tree
//! - **chain**: Requests the wallet queues for the blockchain adjudicator
//!
//! Higher crates (`weir-store`, `weir-protocol`) depend on this one and
//! never the other way around.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

/// Addresses, channel ids, process ids, key references
pub mod identifiers;

/// Channel identities, commitments, and signed commitments
pub mod commitment;

/// Signing capability and signature verification
pub mod signing;

/// Consensus channel application rules and attribute codec
pub mod consensus;

/// Protocol tags and locators for event routing
pub mod locator;

/// Transaction requests queued for the on-chain adjudicator
pub mod chain;

pub use commitment::{
    ChannelIdentity, ChannelType, Commitment, CommitmentType, SignedCommitment,
};
pub use identifiers::{Address, AppId, ChannelId, KeyRef, ProcessId};
pub use locator::{ProtocolLocator, ProtocolTag};
pub use signing::{CommitmentSignature, CommitmentSigner, SigningError};
