//! Outbound payout plumbing: gas pricing, nonce slots, per-signer queues,
//! retries, threshold signing and the send pipeline

mod gas;
mod nonce;
mod queue;
mod retry;
mod sender;
mod signing;

pub use gas::GasEstimator;
pub use nonce::{signer_key, NonceGuard, SignerNonces};
pub use queue::SignerQueues;
pub use retry::RetryPolicy;
pub use sender::{Outbound, OutboundFailure, OutboundStep, SwapSender};
pub use signing::{sign_with_coordinator, RpcSigningCoordinator, SignStatus, SigningCoordinator};

#[cfg(test)]
pub use signing::MockSigningCoordinator;
