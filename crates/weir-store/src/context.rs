//! The shared context threaded through every protocol step
//!
//! `SharedContext` bundles the channel store, the rule registry, the
//! funding registry, the monitor registry, the outbox, and the signing
//! capability. Protocol reducers take the context by value and return it;
//! runs are single-threaded and run to completion, so no locking is
//! needed.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use weir_core::chain::TransactionRequest;
use weir_core::commitment::{Commitment, SignedCommitment};
use weir_core::identifiers::{Address, ChannelId, KeyRef, ProcessId};
use weir_core::locator::ProtocolLocator;
use weir_core::signing::CommitmentSigner;

use crate::channel::ChannelRecord;
use crate::outbox::{DisplayCommand, MessageEnvelope, Outbox, TransactionRequestEntry};
use crate::rules::RuleRegistry;
use crate::store::{ChannelStore, ChannelStoreError};

/// How a channel is funded, recorded once funding completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingDescriptor {
    /// True when funds were deposited on chain for this channel directly.
    pub directly_funded: bool,
    /// The ledger channel allocating to this one, if funded indirectly.
    pub funding_channel_id: Option<ChannelId>,
}

impl FundingDescriptor {
    /// Funded by on-chain deposits.
    pub fn direct() -> Self {
        Self {
            directly_funded: true,
            funding_channel_id: None,
        }
    }

    /// Funded by an allocation inside a ledger channel.
    pub fn via_channel(funding_channel_id: ChannelId) -> Self {
        Self {
            directly_funded: false,
            funding_channel_id: Some(funding_channel_id),
        }
    }
}

/// All wallet state a protocol step can read or mutate.
#[derive(Debug, Clone)]
pub struct SharedContext {
    /// Validated channel records.
    pub channel_store: ChannelStore,
    /// Transition rules for application channels.
    pub rules: RuleRegistry,
    /// How funded channels are funded.
    pub funding: BTreeMap<ChannelId, FundingDescriptor>,
    /// Channels each process instance watches for adjudicator events.
    pub monitors: BTreeMap<ProcessId, Vec<ChannelId>>,
    /// Effects queued during the current run.
    pub outbox: Outbox,
    /// Signing capability for commitments we author.
    pub signer: Arc<dyn CommitmentSigner>,
    /// Our wallet address.
    pub own_address: Address,
    /// The key the signer uses for us.
    pub key_ref: KeyRef,
}

impl SharedContext {
    /// A fresh context for a wallet identified by `own_address`.
    pub fn new(signer: Arc<dyn CommitmentSigner>, own_address: Address, key_ref: KeyRef) -> Self {
        Self {
            channel_store: ChannelStore::new(),
            rules: RuleRegistry::new(),
            funding: BTreeMap::new(),
            monitors: BTreeMap::new(),
            outbox: Outbox::new(),
            signer,
            own_address,
            key_ref,
        }
    }

    /// Look up a channel record.
    pub fn get_channel(&self, channel_id: &ChannelId) -> Option<&ChannelRecord> {
        self.channel_store.get(channel_id)
    }

    /// Look up a channel record that must exist.
    pub fn get_existing_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<&ChannelRecord, ChannelStoreError> {
        self.channel_store
            .get(channel_id)
            .ok_or(ChannelStoreError::ChannelDoesntExist {
                channel_id: *channel_id,
            })
    }

    /// Sign a commitment we authored and append it to its channel.
    pub fn sign_and_store(
        &mut self,
        commitment: Commitment,
    ) -> Result<SignedCommitment, ChannelStoreError> {
        self.channel_store
            .sign_and_store(&self.rules, self.signer.as_ref(), commitment)
    }

    /// Validate and append a received commitment, initializing the channel
    /// when it is an opening commitment.
    pub fn check_and_store(&mut self, signed: SignedCommitment) -> Result<(), ChannelStoreError> {
        self.channel_store
            .check_and_store(&self.rules, signed, self.own_address, &self.key_ref)
    }

    /// Create a channel record from a counterparty's opening commitment.
    pub fn check_and_initialize(
        &mut self,
        signed: SignedCommitment,
    ) -> Result<(), ChannelStoreError> {
        self.channel_store
            .check_and_initialize(signed, self.own_address, &self.key_ref)
    }

    /// Sign a new channel's opening commitment and create its record.
    pub fn sign_and_initialize(
        &mut self,
        commitment: Commitment,
    ) -> Result<SignedCommitment, ChannelStoreError> {
        self.channel_store.sign_and_initialize(
            self.signer.as_ref(),
            commitment,
            self.own_address,
            &self.key_ref,
        )
    }

    /// Mark a channel as funded.
    pub fn set_channel_funded(&mut self, channel_id: &ChannelId) -> Result<(), ChannelStoreError> {
        let record = self.channel_store.get_mut(channel_id).ok_or(
            ChannelStoreError::ChannelDoesntExist {
                channel_id: *channel_id,
            },
        )?;
        record.funded = true;
        Ok(())
    }

    /// Record how a channel was funded.
    pub fn set_funding(&mut self, channel_id: ChannelId, descriptor: FundingDescriptor) {
        self.funding.insert(channel_id, descriptor);
    }

    /// How a channel is funded, if funding has completed.
    pub fn funding_state(&self, channel_id: &ChannelId) -> Option<&FundingDescriptor> {
        self.funding.get(channel_id)
    }

    /// Watch a channel for adjudicator events on behalf of a process.
    pub fn register_channel_to_monitor(&mut self, process_id: ProcessId, channel_id: ChannelId) {
        let watched = self.monitors.entry(process_id).or_default();
        if !watched.contains(&channel_id) {
            watched.push(channel_id);
        }
    }

    /// Drop every channel a process was watching, typically when the
    /// process reaches a terminal state.
    pub fn unregister_all_channels_to_monitor(&mut self, process_id: &ProcessId) {
        if self.monitors.remove(process_id).is_some() {
            debug!(%process_id, "unregistered monitored channels");
        }
    }

    /// Queue a wallet-to-wallet message.
    pub fn queue_message(&mut self, envelope: MessageEnvelope) {
        self.outbox.messages.push(envelope);
    }

    /// Queue the channel's recent commitments for the next participant.
    ///
    /// The locator is the full path to the protocol instance on the
    /// recipient's side that should consume the commitments.
    pub fn queue_commitments(
        &mut self,
        to: Address,
        process_id: ProcessId,
        locator: ProtocolLocator,
        channel_id: &ChannelId,
    ) -> Result<(), ChannelStoreError> {
        let record = self.get_existing_channel(channel_id)?;
        let signed_commitments = record.recent_commitments();
        self.queue_message(MessageEnvelope {
            to,
            process_id,
            locator,
            signed_commitments,
        });
        Ok(())
    }

    /// Queue a display command for the UI.
    pub fn queue_display(&mut self, command: DisplayCommand) {
        self.outbox.display.push(command);
    }

    /// Queue a transaction request for the chain adapter.
    pub fn queue_transaction(&mut self, process_id: ProcessId, request: TransactionRequest) {
        self.outbox
            .transactions
            .push(TransactionRequestEntry { process_id, request });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::locator::ProtocolTag;
    use weir_testkit::{ledger_identity, prefund_commitment, sign_by_mover, Participants};

    fn context_for(p: &Participants, index: usize) -> SharedContext {
        SharedContext::new(p.shared_signer(), p.addresses()[index], p.key_ref(index))
    }

    #[test]
    fn context_wrappers_round_trip_a_channel_opening() {
        let p = Participants::pair();
        let identity = ledger_identity(&p.addresses(), 1);
        let mut ctx = context_for(&p, 1);

        ctx.check_and_store(sign_by_mover(&p, prefund_commitment(&identity, 0)))
            .unwrap();
        ctx.sign_and_store(prefund_commitment(&identity, 1)).unwrap();

        let channel_id = identity.channel_id();
        assert!(ctx.get_channel(&channel_id).unwrap().is_fully_open());

        ctx.set_channel_funded(&channel_id).unwrap();
        assert!(ctx.get_channel(&channel_id).unwrap().funded);

        ctx.set_funding(channel_id, FundingDescriptor::direct());
        assert!(ctx.funding_state(&channel_id).unwrap().directly_funded);
    }

    #[test]
    fn queue_commitments_sends_the_recent_window() {
        let p = Participants::pair();
        let identity = ledger_identity(&p.addresses(), 1);
        let mut ctx = context_for(&p, 1);
        ctx.check_and_store(sign_by_mover(&p, prefund_commitment(&identity, 0)))
            .unwrap();
        ctx.sign_and_store(prefund_commitment(&identity, 1)).unwrap();

        let channel_id = identity.channel_id();
        ctx.queue_commitments(
            p.addresses()[0],
            ProcessId::funding(&channel_id),
            ProtocolLocator::of(ProtocolTag::Funding),
            &channel_id,
        )
        .unwrap();

        assert_eq!(ctx.outbox.messages.len(), 1);
        let envelope = &ctx.outbox.messages[0];
        assert_eq!(envelope.to, p.addresses()[0]);
        assert_eq!(envelope.signed_commitments.len(), 2);
    }

    #[test]
    fn monitor_registration_is_idempotent_and_clears() {
        let p = Participants::pair();
        let mut ctx = context_for(&p, 0);
        let pid = ProcessId("dispute-x".into());
        let channel_id = weir_core::identifiers::ChannelId([3; 32]);

        ctx.register_channel_to_monitor(pid.clone(), channel_id);
        ctx.register_channel_to_monitor(pid.clone(), channel_id);
        assert_eq!(ctx.monitors[&pid], vec![channel_id]);

        ctx.unregister_all_channels_to_monitor(&pid);
        assert!(ctx.monitors.is_empty());
    }
}
