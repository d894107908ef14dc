//! The sub-protocol state machines
//!
//! Each protocol is a closed state enum plus pure `initialize` and
//! `update` functions. Composites hold child states and forward routed
//! events; leaves consume bare engine events.

/// Agree a new allocation through one ordered commitment round
pub mod consensus_update;

/// Submit-confirm-retry loop for chain transactions
pub mod transaction_submission;

/// Challenger and responder state charts
pub mod dispute;

/// Withdraw direct funds or unwind a ledger allocation
pub mod defunding;

/// Funding strategy selection and its sub-flows
pub mod funding;

use tracing::warn;
use weir_core::commitment::SignedCommitment;
use weir_store::SharedContext;

/// Store the commitments from a relayed batch that advance our view.
///
/// Relay windows overlap, so a batch usually repeats a commitment we
/// already hold; those are skipped rather than re-validated. A commitment
/// that fails validation is logged and dropped; the batch's later entries
/// are still attempted, since they cannot validate without it anyway.
pub(crate) fn store_new_commitments(
    context: &mut SharedContext,
    signed_commitments: &[SignedCommitment],
) {
    for signed in signed_commitments {
        let channel_id = signed.commitment.channel_id();
        let known_turn = context.get_channel(&channel_id).map(|record| record.turn_num);
        let is_new = match known_turn {
            Some(turn_num) => signed.commitment.turn_num > turn_num,
            None => true,
        };
        if !is_new {
            continue;
        }
        if let Err(error) = context.check_and_store(signed.clone()) {
            warn!(%error, %channel_id, "rejected relayed commitment");
        }
    }
}
