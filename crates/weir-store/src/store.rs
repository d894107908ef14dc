//! The channel store and its commitment operations
//!
//! All validated channel state enters through two doors: `sign_and_store`
//! for commitments we author and `check_and_store` for commitments a
//! counterparty sent. Both validate before mutating; a rejected commitment
//! leaves the store untouched.

use std::collections::BTreeMap;
use tracing::debug;
use weir_core::commitment::{ChannelType, Commitment, CommitmentType, SignedCommitment};
use weir_core::identifiers::{Address, AppId, ChannelId, KeyRef};
use weir_core::signing::{verify_commitment_signature, CommitmentSigner, SigningError};

use crate::channel::{ChannelRecord, ChannelRecordError};
use crate::rules::{RuleRegistry, RuleViolation};

/// Why a proposed transition between consecutive commitments is invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("turn number must increment by one: {from} -> {to}")]
    TurnNumMustIncrement { from: u64, to: u64 },

    #[error("commitments belong to different channels")]
    ChannelMismatch,

    #[error("illegal phase order: {from:?} -> {to:?}")]
    PhaseOrder {
        from: CommitmentType,
        to: CommitmentType,
    },

    #[error("commitment count must be {expected}, got {actual}")]
    CommitmentCount { expected: u32, actual: u32 },

    #[error("allocation or destination changed where it must not")]
    OutcomeChanged,

    #[error("no transition rule registered for application {app_id}")]
    UnknownChannelType { app_id: AppId },

    #[error(transparent)]
    Rule(#[from] RuleViolation),
}

/// Errors from channel-store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelStoreError {
    #[error("channel does not exist: {channel_id}")]
    ChannelDoesntExist { channel_id: ChannelId },

    #[error("channel already exists: {channel_id}")]
    ChannelAlreadyExists { channel_id: ChannelId },

    #[error("not our turn in {channel_id}")]
    NotOurTurn { channel_id: ChannelId },

    #[error("unsafe transition: {0}")]
    TransitionUnsafe(#[from] TransitionError),

    #[error("invalid signature on commitment for {channel_id}")]
    InvalidSignature { channel_id: ChannelId },

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Record(#[from] ChannelRecordError),
}

fn outcome_unchanged(from: &Commitment, to: &Commitment) -> Result<(), TransitionError> {
    if from.allocation != to.allocation || from.destination != to.destination {
        return Err(TransitionError::OutcomeChanged);
    }
    Ok(())
}

fn count_is(actual: u32, expected: u32) -> Result<(), TransitionError> {
    if actual != expected {
        return Err(TransitionError::CommitmentCount { expected, actual });
    }
    Ok(())
}

/// Validate a transition between consecutive commitments of one channel.
///
/// Checks the turn ordering, the phase machine (setup rounds, app rounds,
/// conclusion) and, for App-to-App steps, the application's own rule.
pub fn valid_transition(
    registry: &RuleRegistry,
    from: &Commitment,
    to: &Commitment,
) -> Result<(), TransitionError> {
    if to.turn_num != from.turn_num + 1 {
        return Err(TransitionError::TurnNumMustIncrement {
            from: from.turn_num,
            to: to.turn_num,
        });
    }
    if from.channel != to.channel {
        return Err(TransitionError::ChannelMismatch);
    }
    let n = from.channel.num_participants() as u32;

    use CommitmentType::*;
    match (from.commitment_type, to.commitment_type) {
        // Setup commitments repeat the opening state verbatim, counting up.
        (PreFundSetup, PreFundSetup) | (PostFundSetup, PostFundSetup) => {
            count_is(to.commitment_count, from.commitment_count + 1)?;
            outcome_unchanged(from, to)?;
            if from.app_attributes != to.app_attributes {
                return Err(TransitionError::OutcomeChanged);
            }
            Ok(())
        }
        (PreFundSetup, PostFundSetup) => {
            count_is(from.commitment_count, n - 1)?;
            count_is(to.commitment_count, 0)?;
            outcome_unchanged(from, to)
        }
        (PostFundSetup, App) => {
            count_is(from.commitment_count, n - 1)?;
            outcome_unchanged(from, to)
        }
        (App, App) => {
            let rule = registry
                .rule_for(from.channel.channel_type)
                .ok_or_else(|| match from.channel.channel_type {
                    ChannelType::Application(app_id) => {
                        TransitionError::UnknownChannelType { app_id }
                    }
                    // Consensus always has a rule; unreachable in practice.
                    ChannelType::Consensus => TransitionError::ChannelMismatch,
                })?;
            rule.validate(from, to)?;
            Ok(())
        }
        (App, Conclude) => {
            count_is(to.commitment_count, 0)?;
            outcome_unchanged(from, to)
        }
        (Conclude, Conclude) => {
            count_is(to.commitment_count, from.commitment_count + 1)?;
            outcome_unchanged(from, to)
        }
        (from_type, to_type) => Err(TransitionError::PhaseOrder {
            from: from_type,
            to: to_type,
        }),
    }
}

/// All channel records the wallet knows, keyed by channel id.
///
/// BTreeMap keeps iteration deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStore {
    channels: BTreeMap<ChannelId, ChannelRecord>,
}

impl ChannelStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a channel record.
    pub fn get(&self, channel_id: &ChannelId) -> Option<&ChannelRecord> {
        self.channels.get(channel_id)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, channel_id: &ChannelId) -> Option<&mut ChannelRecord> {
        self.channels.get_mut(channel_id)
    }

    /// Whether the store has a record for the channel.
    pub fn contains(&self, channel_id: &ChannelId) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Iterate records in channel-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ChannelId, &ChannelRecord)> {
        self.channels.iter()
    }

    /// Sign a commitment we authored and append it to its channel.
    ///
    /// Fails without mutating if the channel is unknown, the turn is not
    /// ours, or the transition is invalid.
    pub fn sign_and_store(
        &mut self,
        registry: &RuleRegistry,
        signer: &dyn CommitmentSigner,
        commitment: Commitment,
    ) -> Result<SignedCommitment, ChannelStoreError> {
        let channel_id = commitment.channel_id();
        let record = self
            .channels
            .get(&channel_id)
            .ok_or(ChannelStoreError::ChannelDoesntExist { channel_id })?;
        if !record.our_turn() || commitment.mover() != record.own_address {
            return Err(ChannelStoreError::NotOurTurn { channel_id });
        }
        let last = record
            .last_commitment()
            .ok_or(ChannelStoreError::ChannelDoesntExist { channel_id })?;
        valid_transition(registry, &last.commitment, &commitment)?;

        let signature = signer.sign(&commitment, &record.signing_key_ref)?;
        let signed = SignedCommitment {
            commitment,
            signature,
        };
        debug!(%channel_id, turn = signed.commitment.turn_num, "signed and stored commitment");
        // Checked above; the entry still exists.
        if let Some(record) = self.channels.get_mut(&channel_id) {
            record.push_commitment(signed.clone());
        }
        Ok(signed)
    }

    /// Validate and append a commitment received from a counterparty.
    ///
    /// An opening commitment for a channel we have no record of creates a
    /// partially open record; any other commitment for an unknown channel
    /// is an error.
    pub fn check_and_store(
        &mut self,
        registry: &RuleRegistry,
        signed: SignedCommitment,
        own_address: Address,
        signing_key_ref: &KeyRef,
    ) -> Result<(), ChannelStoreError> {
        let channel_id = signed.commitment.channel_id();
        let mover = signed.commitment.mover();
        verify_commitment_signature(&signed, &mover)
            .map_err(|_| ChannelStoreError::InvalidSignature { channel_id })?;

        match self.channels.get_mut(&channel_id) {
            Some(record) => {
                let last = record
                    .last_commitment()
                    .ok_or(ChannelStoreError::ChannelDoesntExist { channel_id })?;
                valid_transition(registry, &last.commitment, &signed.commitment)?;
                debug!(%channel_id, turn = signed.commitment.turn_num, "checked and stored commitment");
                record.push_commitment(signed);
                Ok(())
            }
            None if signed.commitment.turn_num == 0 => {
                self.check_and_initialize(signed, own_address, signing_key_ref)
            }
            None => Err(ChannelStoreError::ChannelDoesntExist { channel_id }),
        }
    }

    /// Create a partially open record from a counterparty's opening
    /// commitment. The signature has the same check as `check_and_store`.
    pub fn check_and_initialize(
        &mut self,
        signed: SignedCommitment,
        own_address: Address,
        signing_key_ref: &KeyRef,
    ) -> Result<(), ChannelStoreError> {
        let channel_id = signed.commitment.channel_id();
        if self.channels.contains_key(&channel_id) {
            return Err(ChannelStoreError::ChannelAlreadyExists { channel_id });
        }
        let mover = signed.commitment.mover();
        verify_commitment_signature(&signed, &mover)
            .map_err(|_| ChannelStoreError::InvalidSignature { channel_id })?;
        let record =
            ChannelRecord::from_first_commitment(signed, own_address, signing_key_ref.clone())?;
        debug!(%channel_id, "initialized channel from opening commitment");
        self.channels.insert(channel_id, record);
        Ok(())
    }

    /// Sign the opening commitment of a new channel and create its record.
    pub fn sign_and_initialize(
        &mut self,
        signer: &dyn CommitmentSigner,
        commitment: Commitment,
        own_address: Address,
        signing_key_ref: &KeyRef,
    ) -> Result<SignedCommitment, ChannelStoreError> {
        let channel_id = commitment.channel_id();
        if self.channels.contains_key(&channel_id) {
            return Err(ChannelStoreError::ChannelAlreadyExists { channel_id });
        }
        if commitment.mover() != own_address {
            return Err(ChannelStoreError::NotOurTurn { channel_id });
        }
        let signature = signer.sign(&commitment, signing_key_ref)?;
        let signed = SignedCommitment {
            commitment,
            signature,
        };
        let record = ChannelRecord::from_first_commitment(
            signed.clone(),
            own_address,
            signing_key_ref.clone(),
        )?;
        debug!(%channel_id, "signed opening commitment and initialized channel");
        self.channels.insert(channel_id, record);
        Ok(signed)
    }
}
