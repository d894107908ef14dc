//! Protocol tags and locators for event routing
//!
//! A running wallet hosts a tree of protocol instances. Events address an
//! instance by locator: the ordered list of tags on the path from the root
//! protocol down to the target. Each composite protocol recognizes an
//! event when its own tag is the first element, strips it, and forwards
//! the rest to the matching child.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Names one protocol in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolTag {
    Funding,
    DirectFunding,
    ExistingLedgerFunding,
    NewLedgerChannel,
    LedgerTopUp,
    VirtualFunding,
    ConsensusUpdate,
    Defunding,
    Challenger,
    Responder,
    TransactionSubmission,
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolTag::Funding => "funding",
            ProtocolTag::DirectFunding => "direct-funding",
            ProtocolTag::ExistingLedgerFunding => "existing-ledger-funding",
            ProtocolTag::NewLedgerChannel => "new-ledger-channel",
            ProtocolTag::LedgerTopUp => "ledger-top-up",
            ProtocolTag::VirtualFunding => "virtual-funding",
            ProtocolTag::ConsensusUpdate => "consensus-update",
            ProtocolTag::Defunding => "defunding",
            ProtocolTag::Challenger => "challenger",
            ProtocolTag::Responder => "responder",
            ProtocolTag::TransactionSubmission => "transaction-submission",
        };
        write!(f, "{name}")
    }
}

/// Path from the root protocol to one instance in the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolLocator(pub Vec<ProtocolTag>);

impl ProtocolLocator {
    /// The empty locator, addressing the root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// A single-element locator.
    pub fn of(tag: ProtocolTag) -> Self {
        Self(vec![tag])
    }

    /// Extend a locator one level down the tree.
    pub fn descend(&self, tag: ProtocolTag) -> Self {
        let mut tags = self.0.clone();
        tags.push(tag);
        Self(tags)
    }

    /// Split off the first tag, yielding the remainder of the path.
    pub fn split_first(&self) -> Option<(ProtocolTag, ProtocolLocator)> {
        self.0
            .split_first()
            .map(|(head, rest)| (*head, ProtocolLocator(rest.to_vec())))
    }

    /// Whether the path starts at the given protocol.
    pub fn starts_with(&self, tag: ProtocolTag) -> bool {
        self.0.first() == Some(&tag)
    }

    /// Whether this locator addresses the current protocol itself.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Build the locator for a child protocol under `base`.
pub fn make_locator(base: &ProtocolLocator, tag: ProtocolTag) -> ProtocolLocator {
    base.descend(tag)
}

impl fmt::Display for ProtocolLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for tag in &self.0 {
            write!(f, "/{tag}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descend_appends_and_split_first_inverts() {
        let base = ProtocolLocator::of(ProtocolTag::Funding);
        let child = make_locator(&base, ProtocolTag::LedgerTopUp);
        let grandchild = make_locator(&child, ProtocolTag::ConsensusUpdate);
        assert_eq!(
            grandchild.0,
            vec![
                ProtocolTag::Funding,
                ProtocolTag::LedgerTopUp,
                ProtocolTag::ConsensusUpdate
            ]
        );

        let (head, rest) = grandchild.split_first().unwrap();
        assert_eq!(head, ProtocolTag::Funding);
        assert_eq!(
            rest.0,
            vec![ProtocolTag::LedgerTopUp, ProtocolTag::ConsensusUpdate]
        );
    }

    #[test]
    fn root_locator_addresses_self() {
        let root = ProtocolLocator::root();
        assert!(root.is_empty());
        assert_eq!(root.split_first(), None);
        assert_eq!(root.to_string(), "/");
    }

    #[test]
    fn starts_with_checks_only_the_head() {
        let loc = ProtocolLocator(vec![ProtocolTag::Defunding, ProtocolTag::ConsensusUpdate]);
        assert!(loc.starts_with(ProtocolTag::Defunding));
        assert!(!loc.starts_with(ProtocolTag::ConsensusUpdate));
    }
}
