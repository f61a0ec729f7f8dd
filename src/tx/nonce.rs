//! Nonce allocation per payout signer
//!
//! Each (chain, signer) pair has one slot guarded by an async mutex. The
//! swap stage holds the slot from allocation until the send outcome is
//! known, so two payouts from the same signer never race for a nonce.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Local view of one signer's nonce
#[derive(Debug, Default)]
pub struct NonceSlot {
    /// Next nonce to use, once known
    next: Option<u64>,
}

/// Exclusive access to one signer's nonce slot
pub struct NonceGuard {
    key: String,
    slot: OwnedMutexGuard<NonceSlot>,
}

impl NonceGuard {
    /// Nonce for the next payout: the larger of the local counter and the
    /// node's pending count
    pub fn allocate(&self, pool_nonce: u64) -> u64 {
        match self.slot.next {
            Some(next) if next > pool_nonce => {
                debug!(
                    "Nonce for {}: local {} ahead of pool {}",
                    self.key, next, pool_nonce
                );
                next
            }
            Some(next) if next < pool_nonce => {
                warn!(
                    "Nonce gap detected for {}: expected {}, got {}",
                    self.key, next, pool_nonce
                );
                pool_nonce
            }
            _ => pool_nonce,
        }
    }

    /// Record that `nonce` was used by a broadcast payout
    pub fn commit(&mut self, nonce: u64) {
        let next = nonce + 1;
        if self.slot.next.map_or(true, |n| n < next) {
            self.slot.next = Some(next);
        }
        debug!("Committed nonce {} for {}", nonce, self.key);
    }

    pub fn next(&self) -> Option<u64> {
        self.slot.next
    }
}

/// Manages nonce slots across chains and signers
#[derive(Default)]
pub struct SignerNonces {
    slots: DashMap<String, Arc<Mutex<NonceSlot>>>,
}

impl SignerNonces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot of `signer` on `chain`, creating it on first use
    pub async fn lock(&self, chain: &str, signer: &str) -> NonceGuard {
        let key = signer_key(chain, signer);
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(NonceSlot::default())))
            .clone();

        NonceGuard {
            key,
            slot: slot.lock_owned().await,
        }
    }
}

/// Queue/slot key of a payout signer
pub fn signer_key(chain: &str, signer: &str) -> String {
    format!("{}:{}", chain, signer.to_ascii_lowercase())
}
