//! Dispute protocols
//!
//! The challenger forces a stalled counterparty to move on chain; the
//! responder answers a challenge raised against us. Both hand the actual
//! transactions to transaction submission and, after a timeout closes the
//! channel, hand fund recovery to defunding.

pub mod challenger;
pub mod responder;

/// Fallback challenge window, used to arm the timeout race before the
/// adjudicator reports the real expiry.
pub const CHALLENGE_TIMEOUT_MS: u64 = 5 * 60_000;
