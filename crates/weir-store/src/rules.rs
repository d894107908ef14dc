//! Transition-rule registry
//!
//! App-phase transitions are judged by the application governing the
//! channel. The consensus application is built in; application channels
//! must have a rule registered under their app id before the store will
//! validate their commitments.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use weir_core::commitment::{ChannelType, Commitment};
use weir_core::consensus::{valid_consensus_transition, ConsensusViolation};
use weir_core::identifiers::AppId;

/// An application transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleViolation {
    /// The consensus application rejected the transition.
    #[error(transparent)]
    Consensus(#[from] ConsensusViolation),

    /// A registered application rule rejected the transition.
    #[error("application rule rejected transition: {reason}")]
    App {
        /// Rule-specific description of the violation.
        reason: String,
    },
}

/// Validates App-phase transitions for one application kind.
pub trait TransitionRule: fmt::Debug + Send + Sync {
    /// Judge a transition between consecutive App commitments.
    fn validate(&self, from: &Commitment, to: &Commitment) -> Result<(), RuleViolation>;
}

/// The built-in rule for ledger channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusRule;

impl TransitionRule for ConsensusRule {
    fn validate(&self, from: &Commitment, to: &Commitment) -> Result<(), RuleViolation> {
        valid_consensus_transition(from, to)?;
        Ok(())
    }
}

/// Maps channel types to the rule that validates their transitions.
///
/// BTreeMap keeps iteration deterministic.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    apps: BTreeMap<AppId, Arc<dyn TransitionRule>>,
}

impl RuleRegistry {
    /// A registry with only the built-in consensus application.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rule for an application kind, replacing any previous
    /// registration.
    pub fn register(&mut self, app_id: AppId, rule: Arc<dyn TransitionRule>) {
        self.apps.insert(app_id, rule);
    }

    /// Look up the rule for a channel type. Application channels without a
    /// registered rule are a hard error, never a silent pass.
    pub fn rule_for(&self, channel_type: ChannelType) -> Option<Arc<dyn TransitionRule>> {
        match channel_type {
            ChannelType::Consensus => Some(Arc::new(ConsensusRule)),
            ChannelType::Application(app_id) => self.apps.get(&app_id).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct AlwaysOk;

    impl TransitionRule for AlwaysOk {
        fn validate(&self, _from: &Commitment, _to: &Commitment) -> Result<(), RuleViolation> {
            Ok(())
        }
    }

    #[test]
    fn consensus_rule_is_always_available() {
        let registry = RuleRegistry::new();
        assert!(registry.rule_for(ChannelType::Consensus).is_some());
    }

    #[test]
    fn unregistered_app_has_no_rule() {
        let registry = RuleRegistry::new();
        let app = AppId([1; 32]);
        assert!(registry.rule_for(ChannelType::Application(app)).is_none());
    }

    #[test]
    fn registered_app_rule_is_returned() {
        let mut registry = RuleRegistry::new();
        let app = AppId([1; 32]);
        registry.register(app, Arc::new(AlwaysOk));
        assert!(registry.rule_for(ChannelType::Application(app)).is_some());
    }
}
