//! Swap ledger: durable intent and match records
//!
//! The [`SwapLedger`] trait is the raw storage contract. [`Ledger`] wraps a
//! backend and is what the rest of the router talks to; it refuses status
//! changes that are not edges of the intent or match state machine.

mod api;
mod memory;
mod pg;
mod types;

pub use api::SwapLedger;
pub use memory::MemoryLedger;
pub use pg::PgLedger;
pub use types::{
    AddressListing, BigValueRelease, IntentStatus, MatchStatus, MatchUpdate, OldSwap,
    SwapDirection, SwapIntent, SwapKey, SwapMatch, SwapType, TxType,
};

use crate::config::DatabaseConfig;
use crate::error::{SwapError, SwapResult};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Database URL selecting the in-memory backend
pub const MEMORY_URL: &str = "memory://";

/// Lowercase 0x-prefixed hex addresses so listings and lookups are
/// case-insensitive. Other address formats are left untouched.
pub fn normalize_address(address: &str) -> String {
    if address.starts_with("0x") || address.starts_with("0X") {
        address.to_ascii_lowercase()
    } else {
        address.to_string()
    }
}

/// Validating handle to a swap ledger backend
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<dyn SwapLedger>,
}

impl Ledger {
    pub fn new(inner: Arc<dyn SwapLedger>) -> Self {
        Self { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedger::new()))
    }

    /// Open the configured backend and run its migrations
    pub async fn connect(config: &DatabaseConfig) -> SwapResult<Self> {
        if config.url == MEMORY_URL {
            info!("Using in-memory swap ledger");
            return Ok(Self::in_memory());
        }

        let ledger = PgLedger::new(config).await?;
        ledger.run_migrations().await?;
        Ok(Self::new(Arc::new(ledger)))
    }

    /// Insert a new intent; returns false when the key is already known
    pub async fn register_intent(&self, intent: &SwapIntent) -> SwapResult<bool> {
        let created = self.inner.add_intent(intent).await?;
        if created {
            info!("Registered intent {}", intent.key);
            crate::metrics::record_intent_registered(intent.key.direction);
        } else {
            debug!("Intent {} already registered", intent.key);
        }
        Ok(created)
    }

    pub async fn find_intent(&self, key: &SwapKey) -> SwapResult<Option<SwapIntent>> {
        self.inner.find_intent(key).await
    }

    /// Fetch an intent that must exist
    pub async fn get_intent(&self, key: &SwapKey) -> SwapResult<SwapIntent> {
        self.inner
            .find_intent(key)
            .await?
            .ok_or_else(|| SwapError::RecordNotFound {
                key: key.to_string(),
            })
    }

    pub async fn find_intents_by_status(
        &self,
        direction: SwapDirection,
        status: IntentStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapIntent>> {
        self.inner
            .find_intents_by_status(direction, status, since)
            .await
    }

    /// Move an intent along one edge of its state machine
    pub async fn transition_intent(
        &self,
        key: &SwapKey,
        to: IntentStatus,
        memo: &str,
        now: DateTime<Utc>,
    ) -> SwapResult<SwapIntent> {
        let mut intent = self.get_intent(key).await?;
        let from = intent.status;
        if !from.can_transition_to(to) {
            return Err(SwapError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.inner.update_intent_status(key, to, now, memo).await?;
        info!("Intent {}: {} -> {}", key, from, to);
        crate::metrics::record_intent_transition(from, to);

        intent.status = to;
        intent.timestamp = now;
        intent.memo = memo.to_string();
        Ok(intent)
    }

    /// Seed the match of an actionable intent; returns false if it exists
    pub async fn add_match(&self, swap: &SwapMatch) -> SwapResult<bool> {
        let intent = self.get_intent(&swap.key).await?;
        if !matches!(
            intent.status,
            IntentStatus::NotSwapped | IntentStatus::CanRecall | IntentStatus::ToBeRecalled
        ) {
            return Err(SwapError::InvalidStateTransition {
                from: intent.status.to_string(),
                to: "match created".to_string(),
            });
        }

        let created = self.inner.add_match(swap).await?;
        if created {
            debug!("Created match {}", swap.key);
        }
        Ok(created)
    }

    pub async fn find_match(&self, key: &SwapKey) -> SwapResult<Option<SwapMatch>> {
        self.inner.find_match(key).await
    }

    /// Fetch a match that must exist
    pub async fn get_match(&self, key: &SwapKey) -> SwapResult<SwapMatch> {
        self.inner
            .find_match(key)
            .await?
            .ok_or_else(|| SwapError::RecordNotFound {
                key: key.to_string(),
            })
    }

    pub async fn find_matches_by_status(
        &self,
        direction: SwapDirection,
        status: MatchStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapMatch>> {
        self.inner
            .find_matches_by_status(direction, status, since)
            .await
    }

    /// Apply a partial match update, checking the status edge when the
    /// update changes the status
    pub async fn update_match(
        &self,
        key: &SwapKey,
        update: &MatchUpdate,
        now: DateTime<Utc>,
    ) -> SwapResult<()> {
        let current = self
            .inner
            .find_match(key)
            .await?
            .ok_or_else(|| SwapError::RecordNotFound {
                key: key.to_string(),
            })?;

        if let Some(to) = update.status {
            if to != current.status && !current.status.can_transition_to(to) {
                return Err(SwapError::InvalidStateTransition {
                    from: current.status.to_string(),
                    to: to.to_string(),
                });
            }
        }

        self.inner.update_match(key, update, now).await?;
        if let Some(to) = update.status {
            if to != current.status {
                info!("Match {}: {} -> {}", key, current.status, to);
            }
        }
        Ok(())
    }

    /// The one backward transition: put a failed intent back in front of
    /// the swap stage and move its outbound attempt into the match history.
    ///
    /// Callers must have established that the previous outbound transaction
    /// never reached the destination mempool or chain.
    pub async fn reset_for_retry(
        &self,
        key: &SwapKey,
        memo: &str,
        now: DateTime<Utc>,
    ) -> SwapResult<IntentStatus> {
        let intent = self.get_intent(key).await?;
        let target = intent
            .status
            .retry_target()
            .ok_or_else(|| SwapError::InvalidStateTransition {
                from: intent.status.to_string(),
                to: "retry".to_string(),
            })?;

        if let Some(swap) = self.inner.find_match(key).await? {
            if matches!(swap.status, MatchStatus::Stable | MatchStatus::FailedFinal) {
                return Err(SwapError::InvalidStateTransition {
                    from: swap.status.to_string(),
                    to: MatchStatus::Empty.to_string(),
                });
            }
            self.inner.reset_match(key, now).await?;
        }

        self.inner
            .update_intent_status(key, target, now, memo)
            .await?;
        info!("Intent {} reset for retry: {} -> {}", key, intent.status, target);
        crate::metrics::record_intent_transition(intent.status, target);
        Ok(target)
    }

    /// Record that the payout of a processed intent was mined but reverted.
    ///
    /// The intent drops back to the failed status of its payout type and the
    /// match becomes `Failed`, so retry and audit pick the swap up again.
    /// The intent is written first; repeating the call after a crash between
    /// the two writes only finishes the match.
    pub async fn record_reverted_payout(
        &self,
        key: &SwapKey,
        update: &MatchUpdate,
        memo: &str,
        now: DateTime<Utc>,
    ) -> SwapResult<IntentStatus> {
        let swap = self
            .inner
            .find_match(key)
            .await?
            .ok_or_else(|| SwapError::RecordNotFound {
                key: key.to_string(),
            })?;
        let failed = match swap.swap_type {
            SwapType::Recall => IntentStatus::RecallFailed,
            SwapType::SwapIn | SwapType::SwapOut => IntentStatus::SwapFailed,
        };

        let intent = self.get_intent(key).await?;
        if intent.status == IntentStatus::Processed {
            self.inner
                .update_intent_status(key, failed, now, memo)
                .await?;
            info!("Intent {}: {} -> {} ({})", key, intent.status, failed, memo);
            crate::metrics::record_intent_transition(intent.status, failed);
        } else if intent.status != failed {
            return Err(SwapError::InvalidStateTransition {
                from: intent.status.to_string(),
                to: failed.to_string(),
            });
        }

        let update = MatchUpdate {
            status: Some(MatchStatus::Failed),
            ..update.clone()
        };
        self.update_match(key, &update, now).await?;
        Ok(failed)
    }

    pub async fn find_history(
        &self,
        direction: SwapDirection,
        address: &str,
        limit: usize,
    ) -> SwapResult<Vec<SwapMatch>> {
        self.inner.find_history(direction, address, limit).await
    }

    pub async fn count_intents(&self) -> SwapResult<Vec<(IntentStatus, u64)>> {
        self.inner.count_intents().await
    }

    /// Record an administrative release; idempotent
    pub async fn release_big_value(
        &self,
        key: &SwapKey,
        approved_by: &str,
        now: DateTime<Utc>,
    ) -> SwapResult<bool> {
        let release = BigValueRelease {
            key: key.clone(),
            approved_by: approved_by.to_string(),
            approved_at: now,
        };
        self.inner.add_big_value_release(&release).await
    }

    pub async fn find_big_value_release(
        &self,
        key: &SwapKey,
    ) -> SwapResult<Option<BigValueRelease>> {
        self.inner.find_big_value_release(key).await
    }

    pub async fn set_address_listing(
        &self,
        address: &str,
        listing: AddressListing,
        now: DateTime<Utc>,
    ) -> SwapResult<()> {
        let address = normalize_address(address);
        self.inner.set_address_listing(&address, listing, now).await?;
        info!("Address {} is now {}", address, listing.as_str());
        Ok(())
    }

    pub async fn get_address_listing(&self, address: &str) -> SwapResult<Option<AddressListing>> {
        self.inner
            .get_address_listing(&normalize_address(address))
            .await
    }

    pub async fn health_check(&self) -> SwapResult<()> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> SwapKey {
        SwapKey::new(SwapDirection::SwapIn, "tx123", "P", "0xbind")
    }

    fn seeded_match(now: DateTime<Utc>) -> SwapMatch {
        SwapMatch {
            key: key(),
            height: 100,
            time: now,
            from: "0xfrom".into(),
            to: "0xdeposit".into(),
            value: 1_000,
            swap_tx: String::new(),
            old_swap_txs: vec![],
            old_swap_vals: vec![],
            swap_height: 0,
            swap_time: None,
            swap_value: 0,
            swap_type: SwapType::SwapIn,
            swap_nonce: None,
            status: MatchStatus::Empty,
            timestamp: now,
        }
    }

    async fn ledger_with_intent(status: IntentStatus) -> (Ledger, DateTime<Utc>) {
        let ledger = Ledger::in_memory();
        let now = Utc::now();
        ledger
            .register_intent(&SwapIntent::new(key(), TxType::Plain, now))
            .await
            .unwrap();
        if status != IntentStatus::NotStable {
            ledger
                .inner
                .update_intent_status(&key(), status, now, "")
                .await
                .unwrap();
        }
        (ledger, now)
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_noop() {
        let ledger = Ledger::in_memory();
        let now = Utc::now();
        let intent = SwapIntent::new(key(), TxType::Plain, now);

        assert!(ledger.register_intent(&intent).await.unwrap());
        assert!(!ledger.register_intent(&intent).await.unwrap());

        let counts = ledger.count_intents().await.unwrap();
        assert_eq!(counts, vec![(IntentStatus::NotStable, 1)]);
    }

    #[tokio::test]
    async fn rejects_transition_off_the_state_machine() {
        let (ledger, now) = ledger_with_intent(IntentStatus::WithBigValue).await;

        let err = ledger
            .transition_intent(&key(), IntentStatus::Processed, "", now)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));

        let intent = ledger
            .transition_intent(&key(), IntentStatus::NotSwapped, "released", now)
            .await
            .unwrap();
        assert_eq!(intent.status, IntentStatus::NotSwapped);
        assert_eq!(intent.memo, "released");
    }

    #[tokio::test]
    async fn match_requires_actionable_intent() {
        let (ledger, now) = ledger_with_intent(IntentStatus::NotStable).await;
        assert!(ledger.add_match(&seeded_match(now)).await.is_err());

        ledger
            .transition_intent(&key(), IntentStatus::NotSwapped, "", now)
            .await
            .unwrap();
        assert!(ledger.add_match(&seeded_match(now)).await.unwrap());
        assert!(!ledger.add_match(&seeded_match(now)).await.unwrap());
    }

    #[tokio::test]
    async fn reserved_nonce_cannot_change() {
        let (ledger, now) = ledger_with_intent(IntentStatus::NotSwapped).await;
        ledger.add_match(&seeded_match(now)).await.unwrap();

        let sent = MatchUpdate {
            status: Some(MatchStatus::NotStable),
            swap_tx: Some("out456".into()),
            swap_nonce: Some(7),
            ..Default::default()
        };
        ledger.update_match(&key(), &sent, now).await.unwrap();

        let clobber = MatchUpdate {
            swap_nonce: Some(8),
            ..Default::default()
        };
        let err = ledger.update_match(&key(), &clobber, now).await.unwrap_err();
        assert!(matches!(
            err,
            SwapError::NonceAlreadyReserved { have: 7, got: 8, .. }
        ));
    }

    #[tokio::test]
    async fn stable_match_is_terminal() {
        let (ledger, now) = ledger_with_intent(IntentStatus::NotSwapped).await;
        ledger.add_match(&seeded_match(now)).await.unwrap();
        ledger
            .update_match(&key(), &MatchUpdate::status(MatchStatus::NotStable), now)
            .await
            .unwrap();
        ledger
            .update_match(&key(), &MatchUpdate::status(MatchStatus::Stable), now)
            .await
            .unwrap();

        let err = ledger
            .update_match(&key(), &MatchUpdate::status(MatchStatus::Failed), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn retry_reset_clears_attempt_but_keeps_history() {
        let (ledger, now) = ledger_with_intent(IntentStatus::NotSwapped).await;
        ledger.add_match(&seeded_match(now)).await.unwrap();
        ledger
            .update_match(
                &key(),
                &MatchUpdate {
                    status: Some(MatchStatus::Failed),
                    swap_tx: Some("outA".into()),
                    swap_value: Some(985),
                    push_old_swap: Some(OldSwap {
                        tx_hash: "outZ".into(),
                        value: 990,
                    }),
                    swap_nonce: Some(10),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        ledger
            .transition_intent(&key(), IntentStatus::SwapFailed, "send", now)
            .await
            .unwrap();

        let later = now + Duration::minutes(10);
        let target = ledger
            .reset_for_retry(&key(), "retry after outA", later)
            .await
            .unwrap();
        assert_eq!(target, IntentStatus::NotSwapped);

        let swap = ledger.find_match(&key()).await.unwrap().unwrap();
        assert_eq!(swap.status, MatchStatus::Empty);
        assert!(swap.swap_tx.is_empty());
        assert_eq!(swap.swap_nonce, None);
        assert_eq!(swap.swap_value, 0);
        // The abandoned attempt can still land, so it stays on record
        assert_eq!(swap.old_swap_txs, vec!["outZ".to_string(), "outA".to_string()]);
        assert_eq!(swap.old_swap_vals, vec![990, 985]);

        // Not a failed intent any more
        assert!(ledger.reset_for_retry(&key(), "", later).await.is_err());
    }

    #[tokio::test]
    async fn reverted_payout_reopens_processed_intent() {
        let (ledger, now) = ledger_with_intent(IntentStatus::NotSwapped).await;
        ledger.add_match(&seeded_match(now)).await.unwrap();
        let sent = MatchUpdate {
            status: Some(MatchStatus::NotStable),
            swap_tx: Some("outA".into()),
            swap_nonce: Some(4),
            ..Default::default()
        };
        ledger.update_match(&key(), &sent, now).await.unwrap();
        ledger
            .transition_intent(&key(), IntentStatus::Processed, "", now)
            .await
            .unwrap();

        let mined = MatchUpdate {
            swap_height: Some(120),
            ..Default::default()
        };
        let status = ledger
            .record_reverted_payout(&key(), &mined, "outA reverted", now)
            .await
            .unwrap();
        assert_eq!(status, IntentStatus::SwapFailed);

        let intent = ledger.get_intent(&key()).await.unwrap();
        assert_eq!(intent.status, IntentStatus::SwapFailed);
        assert_eq!(intent.memo, "outA reverted");
        let swap = ledger.find_match(&key()).await.unwrap().unwrap();
        assert_eq!(swap.status, MatchStatus::Failed);
        assert_eq!(swap.swap_height, 120);

        // Repeating it is harmless
        ledger
            .record_reverted_payout(&key(), &mined, "outA reverted", now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reverted_payout_needs_a_sent_intent() {
        let (ledger, now) = ledger_with_intent(IntentStatus::NotSwapped).await;
        ledger.add_match(&seeded_match(now)).await.unwrap();

        let err = ledger
            .record_reverted_payout(&key(), &MatchUpdate::default(), "", now)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn listings_ignore_hex_case() {
        let ledger = Ledger::in_memory();
        ledger
            .set_address_listing("0xABCdef", AddressListing::Denied, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            ledger.get_address_listing("0xabcDEF").await.unwrap(),
            Some(AddressListing::Denied)
        );
        assert_eq!(normalize_address("bc1QXY"), "bc1QXY");
    }
}
