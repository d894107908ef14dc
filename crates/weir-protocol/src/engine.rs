//! The dispatch loop
//!
//! `WalletEngine` owns the shared context and every running protocol
//! instance, keyed by process id. Events are dispatched one at a time:
//! the engine looks the process up, strips the top tag off the event's
//! locator, runs the protocol's transition function, and stores the new
//! state and context. Terminal processes are dropped after their final
//! transition.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};
use weir_core::commitment::{Commitment, SignedCommitment};
use weir_core::identifiers::{Address, ChannelId, KeyRef, ProcessId};
use weir_core::locator::{ProtocolLocator, ProtocolTag};
use weir_core::signing::CommitmentSigner;
use weir_store::{Outbox, SharedContext};

use crate::events::{EngineEvent, RoutedEvent};
use crate::protocols::consensus_update::{self, ConsensusUpdateState};
use crate::protocols::defunding::{self, DefundingState};
use crate::protocols::dispute::challenger::{self, ChallengerState};
use crate::protocols::dispute::responder::{self, ResponderState};
use crate::protocols::funding::{self, FundingState};
use crate::Transition;

/// One running protocol instance.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletProtocol {
    Funding(FundingState),
    ConsensusUpdate(ConsensusUpdateState),
    Challenger(ChallengerState),
    Responder(ResponderState),
    Defunding(DefundingState),
}

impl WalletProtocol {
    /// The locator tag this protocol answers to.
    pub fn tag(&self) -> ProtocolTag {
        match self {
            WalletProtocol::Funding(_) => ProtocolTag::Funding,
            WalletProtocol::ConsensusUpdate(_) => ProtocolTag::ConsensusUpdate,
            WalletProtocol::Challenger(_) => ProtocolTag::Challenger,
            WalletProtocol::Responder(_) => ProtocolTag::Responder,
            WalletProtocol::Defunding(_) => ProtocolTag::Defunding,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            WalletProtocol::Funding(state) => state.is_terminal(),
            WalletProtocol::ConsensusUpdate(state) => state.is_terminal(),
            WalletProtocol::Challenger(state) => state.is_terminal(),
            WalletProtocol::Responder(state) => state.is_terminal(),
            WalletProtocol::Defunding(state) => state.is_terminal(),
        }
    }
}

/// Errors starting or addressing a process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("process {process_id} is already running")]
    ProcessAlreadyRunning { process_id: ProcessId },

    #[error("no process {process_id} is running")]
    ProcessNotFound { process_id: ProcessId },
}

/// The wallet's protocol engine: one shared context, many processes.
#[derive(Debug, Clone)]
pub struct WalletEngine {
    context: SharedContext,
    processes: BTreeMap<ProcessId, WalletProtocol>,
}

impl WalletEngine {
    pub fn new(signer: Arc<dyn CommitmentSigner>, own_address: Address, key_ref: KeyRef) -> Self {
        Self {
            context: SharedContext::new(signer, own_address, key_ref),
            processes: BTreeMap::new(),
        }
    }

    /// The shared context, for seeding channels and registering rules.
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SharedContext {
        &mut self.context
    }

    /// Running processes by id.
    pub fn processes(&self) -> &BTreeMap<ProcessId, WalletProtocol> {
        &self.processes
    }

    /// Take every queued outbox effect, leaving the outbox empty.
    pub fn drain_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.context.outbox)
    }

    /// Start funding a channel, optionally through a hub.
    pub fn fund_channel(
        &mut self,
        channel_id: ChannelId,
        hub: Option<Address>,
    ) -> Result<ProcessId, EngineError> {
        let process_id = ProcessId::funding(&channel_id);
        self.claim(&process_id)?;
        let transition = funding::initialize(
            process_id.clone(),
            channel_id,
            hub,
            ProtocolLocator::of(ProtocolTag::Funding),
            self.context.clone(),
        );
        self.install(process_id.clone(), transition.map(WalletProtocol::Funding));
        Ok(process_id)
    }

    /// Start a standalone consensus update on a ledger channel.
    pub fn propose_update(
        &mut self,
        channel_id: ChannelId,
        proposed_allocation: Vec<u128>,
        proposed_destination: Vec<Address>,
    ) -> Result<ProcessId, EngineError> {
        let process_id = ProcessId::consensus_update(&channel_id);
        self.claim(&process_id)?;
        let transition = consensus_update::initialize(
            process_id.clone(),
            channel_id,
            proposed_allocation,
            proposed_destination,
            true,
            ProtocolLocator::of(ProtocolTag::ConsensusUpdate),
            self.context.clone(),
        );
        self.install(
            process_id.clone(),
            transition.map(WalletProtocol::ConsensusUpdate),
        );
        Ok(process_id)
    }

    /// Start challenging a stalled channel on chain.
    pub fn launch_challenge(&mut self, channel_id: ChannelId) -> Result<ProcessId, EngineError> {
        let process_id = ProcessId::dispute(&channel_id);
        self.claim(&process_id)?;
        let transition = challenger::initialize(
            process_id.clone(),
            channel_id,
            ProtocolLocator::of(ProtocolTag::Challenger),
            self.context.clone(),
        );
        self.install(
            process_id.clone(),
            transition.map(WalletProtocol::Challenger),
        );
        Ok(process_id)
    }

    /// Start responding to a challenge raised against us.
    pub fn respond_to_challenge(
        &mut self,
        channel_id: ChannelId,
        expiry_time: u64,
        challenge_commitment: SignedCommitment,
    ) -> Result<ProcessId, EngineError> {
        let process_id = ProcessId::dispute(&channel_id);
        self.claim(&process_id)?;
        let transition = responder::initialize(
            process_id.clone(),
            channel_id,
            expiry_time,
            challenge_commitment,
            ProtocolLocator::of(ProtocolTag::Responder),
            self.context.clone(),
        );
        self.install(process_id.clone(), transition.map(WalletProtocol::Responder));
        Ok(process_id)
    }

    /// Start returning a concluded channel's funds.
    pub fn defund_channel(&mut self, channel_id: ChannelId) -> Result<ProcessId, EngineError> {
        let process_id = ProcessId::defunding(&channel_id);
        self.claim(&process_id)?;
        let transition = defunding::initialize(
            process_id.clone(),
            channel_id,
            ProtocolLocator::of(ProtocolTag::Defunding),
            self.context.clone(),
        );
        self.install(process_id.clone(), transition.map(WalletProtocol::Defunding));
        Ok(process_id)
    }

    /// Dispatch one event to the process it addresses. The locator is the
    /// full path from the engine down, starting with the process's own tag.
    pub fn handle_event(
        &mut self,
        process_id: &ProcessId,
        locator: ProtocolLocator,
        event: EngineEvent,
    ) -> Result<(), EngineError> {
        let protocol =
            self.processes
                .remove(process_id)
                .ok_or_else(|| EngineError::ProcessNotFound {
                    process_id: process_id.clone(),
                })?;
        let routed = RoutedEvent::at(locator, event);
        let routed = match routed.for_child(protocol.tag()) {
            Some(inner) => inner,
            None if routed.is_local() => routed,
            None => {
                warn!(%process_id, ?routed, "event locator does not match the process");
                self.processes.insert(process_id.clone(), protocol);
                return Ok(());
            }
        };
        let context = self.context.clone();
        let transition = match protocol {
            WalletProtocol::Funding(state) => {
                funding::update(state, context, &routed).map(WalletProtocol::Funding)
            }
            WalletProtocol::ConsensusUpdate(state) => {
                consensus_update::update(state, context, &routed.event)
                    .map(WalletProtocol::ConsensusUpdate)
            }
            WalletProtocol::Challenger(state) => {
                challenger::update(state, context, &routed).map(WalletProtocol::Challenger)
            }
            WalletProtocol::Responder(state) => {
                responder::update(state, context, &routed).map(WalletProtocol::Responder)
            }
            WalletProtocol::Defunding(state) => {
                defunding::update(state, context, &routed).map(WalletProtocol::Defunding)
            }
        };
        self.install(process_id.clone(), transition);
        Ok(())
    }

    /// Dispatch a relayed wallet-to-wallet message: the commitments become
    /// a `CommitmentsReceived` event for the addressed process.
    pub fn handle_commitments(
        &mut self,
        process_id: ProcessId,
        locator: ProtocolLocator,
        signed_commitments: Vec<SignedCommitment>,
    ) -> Result<(), EngineError> {
        let event = EngineEvent::CommitmentsReceived {
            process_id: process_id.clone(),
            signed_commitments,
        };
        self.handle_event(&process_id, locator, event)
    }

    /// Hand the challenge-response move an application produced to the
    /// responder for the channel.
    pub fn provide_challenge_response(
        &mut self,
        channel_id: &ChannelId,
        commitment: Commitment,
    ) -> Result<(), EngineError> {
        let process_id = ProcessId::dispute(channel_id);
        self.handle_event(
            &process_id,
            ProtocolLocator::of(ProtocolTag::Responder),
            EngineEvent::ChallengeResponseProvided { commitment },
        )
    }

    fn claim(&self, process_id: &ProcessId) -> Result<(), EngineError> {
        if self.processes.contains_key(process_id) {
            return Err(EngineError::ProcessAlreadyRunning {
                process_id: process_id.clone(),
            });
        }
        Ok(())
    }

    fn install(&mut self, process_id: ProcessId, transition: Transition<WalletProtocol>) {
        self.context = transition.context;
        if transition.state.is_terminal() {
            debug!(%process_id, "process reached a terminal state");
            self.context.unregister_all_channels_to_monitor(&process_id);
        } else {
            self.processes.insert(process_id, transition.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::chain::TransactionRequest;
    use weir_testkit::{
        ledger_commitment, ledger_identity, postfund_commitment, prefund_commitment, sign_by_mover,
        Participants,
    };

    fn engine_for(p: &Participants, index: usize) -> WalletEngine {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("weir_protocol=debug")
            .with_test_writer()
            .try_init();
        WalletEngine::new(p.shared_signer(), p.addresses()[index], p.key_ref(index))
    }

    fn seed_open_ledger(engine: &mut WalletEngine, p: &Participants) -> ChannelId {
        let identity = ledger_identity(&p.addresses(), 1);
        let channel_id = identity.channel_id();
        engine
            .context_mut()
            .check_and_initialize(sign_by_mover(p, prefund_commitment(&identity, 0)))
            .unwrap();
        let record = engine
            .context_mut()
            .channel_store
            .get_mut(&channel_id)
            .unwrap();
        record.push_commitment(sign_by_mover(p, prefund_commitment(&identity, 1)));
        record.push_commitment(sign_by_mover(p, postfund_commitment(&identity, 2)));
        record.push_commitment(sign_by_mover(p, postfund_commitment(&identity, 3)));
        record.push_commitment(sign_by_mover(p, ledger_commitment(&identity, 4, &[5, 5])));
        record.funded = true;
        channel_id
    }

    #[test]
    fn starting_the_same_process_twice_is_rejected() {
        let p = Participants::pair();
        let mut engine = engine_for(&p, 0);
        let channel_id = seed_open_ledger(&mut engine, &p);
        engine.launch_challenge(channel_id).unwrap();
        assert!(matches!(
            engine.launch_challenge(channel_id),
            Err(EngineError::ProcessAlreadyRunning { .. })
        ));
    }

    #[test]
    fn events_route_through_the_locator_to_nested_children() {
        let p = Participants::pair();
        let mut engine = engine_for(&p, 0);
        let channel_id = seed_open_ledger(&mut engine, &p);

        // Turn 4's mover was us, so the channel counts as stalled on the
        // counterparty and a challenge can go out.
        let process_id = engine.launch_challenge(channel_id).unwrap();
        engine
            .handle_event(
                &process_id,
                ProtocolLocator::of(ProtocolTag::Challenger),
                EngineEvent::ChallengeApproved,
            )
            .unwrap();
        let outbox = engine.drain_outbox();
        assert!(matches!(
            outbox.transactions[0].request,
            TransactionRequest::ForceMove { .. }
        ));

        // The transaction events carry the nested locator.
        let tx_locator = ProtocolLocator::of(ProtocolTag::Challenger)
            .descend(ProtocolTag::TransactionSubmission);
        engine
            .handle_event(
                &process_id,
                tx_locator.clone(),
                EngineEvent::TransactionSubmitted,
            )
            .unwrap();
        engine
            .handle_event(
                &process_id,
                tx_locator,
                EngineEvent::TransactionConfirmed { observed_at: 100 },
            )
            .unwrap();
        match engine.processes().get(&process_id) {
            Some(WalletProtocol::Challenger(ChallengerState::WaitForResponseOrTimeout(inner))) => {
                assert_eq!(
                    inner.expiry_time,
                    100 + crate::protocols::dispute::CHALLENGE_TIMEOUT_MS
                );
            }
            other => panic!("expected WaitForResponseOrTimeout, got {other:?}"),
        }
    }

    #[test]
    fn terminal_processes_are_dropped() {
        let p = Participants::pair();
        let mut engine = engine_for(&p, 0);
        let channel_id = seed_open_ledger(&mut engine, &p);
        let process_id = engine.launch_challenge(channel_id).unwrap();
        engine
            .handle_event(
                &process_id,
                ProtocolLocator::of(ProtocolTag::Challenger),
                EngineEvent::ChallengeDenied,
            )
            .unwrap();
        engine
            .handle_event(
                &process_id,
                ProtocolLocator::of(ProtocolTag::Challenger),
                EngineEvent::Acknowledged,
            )
            .unwrap();
        assert!(engine.processes().is_empty());
        assert!(engine.context().monitors.is_empty());
        assert!(matches!(
            engine.handle_event(
                &process_id,
                ProtocolLocator::of(ProtocolTag::Challenger),
                EngineEvent::Acknowledged,
            ),
            Err(EngineError::ProcessNotFound { .. })
        ));
    }

    #[test]
    fn relayed_commitments_drive_a_consensus_update_to_success() {
        let p = Participants::pair();
        let mut engine = engine_for(&p, 0);
        let channel_id = seed_open_ledger(&mut engine, &p);

        // Turn 5 is the counterparty's, so our process waits for their
        // proposal and completes the round with the final vote.
        let process_id = engine
            .propose_update(channel_id, vec![2, 8], p.addresses())
            .unwrap();
        let identity = ledger_identity(&p.addresses(), 1);
        let last = ledger_commitment(&identity, 4, &[5, 5]);
        let proposal = weir_core::consensus::propose(&last, vec![2, 8], p.addresses());
        engine
            .handle_commitments(
                process_id.clone(),
                ProtocolLocator::of(ProtocolTag::ConsensusUpdate),
                vec![sign_by_mover(&p, proposal)],
            )
            .unwrap();
        // Success is terminal, so the process is gone and the outcome is
        // installed.
        assert!(engine.processes().is_empty());
        let record = engine.context().get_channel(&channel_id).unwrap();
        assert_eq!(
            record.last_commitment().unwrap().commitment.allocation,
            vec![2, 8]
        );
        assert_eq!(engine.drain_outbox().messages.len(), 1);
    }
}
