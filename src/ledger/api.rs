//! Swap ledger storage contract

use super::types::{
    AddressListing, BigValueRelease, IntentStatus, MatchStatus, MatchUpdate, SwapDirection,
    SwapIntent, SwapKey, SwapMatch,
};
use crate::error::SwapResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable store for intent and match records.
///
/// Every mutation touches a single record and is atomic on its own.
/// `add_*` never overwrites: it reports whether a new record was created.
#[async_trait]
pub trait SwapLedger: Send + Sync {
    /// Insert an intent unless one with the same key exists
    async fn add_intent(&self, intent: &SwapIntent) -> SwapResult<bool>;

    async fn find_intent(&self, key: &SwapKey) -> SwapResult<Option<SwapIntent>>;

    /// Intents in `status` created at or after `since`
    async fn find_intents_by_status(
        &self,
        direction: SwapDirection,
        status: IntentStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapIntent>>;

    async fn update_intent_status(
        &self,
        key: &SwapKey,
        status: IntentStatus,
        timestamp: DateTime<Utc>,
        memo: &str,
    ) -> SwapResult<()>;

    /// Insert a match unless one with the same key exists
    async fn add_match(&self, swap: &SwapMatch) -> SwapResult<bool>;

    async fn find_match(&self, key: &SwapKey) -> SwapResult<Option<SwapMatch>>;

    /// Matches in `status` whose deposit time is at or after `since`
    async fn find_matches_by_status(
        &self,
        direction: SwapDirection,
        status: MatchStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapMatch>>;

    /// Apply a partial update. Fails with `NonceAlreadyReserved` when the
    /// update carries a nonce different from the one already stored.
    async fn update_match(
        &self,
        key: &SwapKey,
        update: &MatchUpdate,
        timestamp: DateTime<Utc>,
    ) -> SwapResult<()>;

    /// Clear the outbound attempt of a match, moving it into the match history
    async fn reset_match(&self, key: &SwapKey, timestamp: DateTime<Utc>) -> SwapResult<()>;

    /// Matches whose bind address or deposit sender is `address`, newest first
    async fn find_history(
        &self,
        direction: SwapDirection,
        address: &str,
        limit: usize,
    ) -> SwapResult<Vec<SwapMatch>>;

    /// Number of intents per status
    async fn count_intents(&self) -> SwapResult<Vec<(IntentStatus, u64)>>;

    async fn add_big_value_release(&self, release: &BigValueRelease) -> SwapResult<bool>;

    async fn find_big_value_release(&self, key: &SwapKey)
        -> SwapResult<Option<BigValueRelease>>;

    async fn set_address_listing(
        &self,
        address: &str,
        listing: AddressListing,
        timestamp: DateTime<Utc>,
    ) -> SwapResult<()>;

    async fn get_address_listing(&self, address: &str) -> SwapResult<Option<AddressListing>>;

    async fn health_check(&self) -> SwapResult<()>;
}
