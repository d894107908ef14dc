//! Core identifier types used across the Weir wallet
//!
//! Addresses are ed25519 verifying-key bytes. Channel ids are hashes of a
//! channel identity. Process ids tie wallet events to a running protocol
//! instance, and key references name signing keys held by a keystore.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A participant address: the 32 bytes of an ed25519 verifying key.
///
/// Allocation destinations are also addresses; a channel funding another
/// channel appears as an `Address` derived from the inner channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr-{}", hex::encode(&self.0[..8]))
    }
}

impl From<ChannelId> for Address {
    /// A channel can itself be an allocation destination. The destination
    /// address for a channel is its id bytes verbatim.
    fn from(channel_id: ChannelId) -> Self {
        Self(channel_id.0)
    }
}

/// Identifies a channel: the hash of its `ChannelIdentity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// Borrow the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", hex::encode(&self.0[..8]))
    }
}

/// Identifies an application kind for application channels.
///
/// Transition rules are registered per `AppId`; a commitment in a channel
/// whose app id has no registered rule cannot be validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppId(pub [u8; 32]);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app-{}", hex::encode(&self.0[..8]))
    }
}

/// Identifies a running protocol instance within the wallet.
///
/// Every routed event and outgoing message carries the process id so the
/// counterparty's wallet can deliver it to the matching instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    /// Conventional process id for the funding protocol of a channel.
    pub fn funding(channel_id: &ChannelId) -> Self {
        Self(format!("funding-{channel_id}"))
    }

    /// Conventional process id for a dispute over a channel.
    pub fn dispute(channel_id: &ChannelId) -> Self {
        Self(format!("dispute-{channel_id}"))
    }

    /// Conventional process id for defunding a channel.
    pub fn defunding(channel_id: &ChannelId) -> Self {
        Self(format!("defunding-{channel_id}"))
    }

    /// Conventional process id for a standalone consensus update.
    pub fn consensus_update(channel_id: &ChannelId) -> Self {
        Self(format!("consensus-update-{channel_id}"))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names a signing key held by the wallet's keystore.
///
/// Channel records store a key reference rather than key material; actual
/// signing happens behind the `CommitmentSigner` capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRef(pub String);

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_converts_to_destination_address() {
        let id = ChannelId([7u8; 32]);
        let addr = Address::from(id);
        assert_eq!(addr.0, id.0);
    }

    #[test]
    fn display_is_prefixed_and_truncated() {
        let addr = Address([0xab; 32]);
        assert_eq!(addr.to_string(), "addr-abababababababab");
        let pid = ProcessId::funding(&ChannelId([1u8; 32]));
        assert!(pid.0.starts_with("funding-chan-"));
    }
}
