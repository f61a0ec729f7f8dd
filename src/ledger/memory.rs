//! Swap ledger kept in memory. Used for tests and throwaway deployments.

use super::api::SwapLedger;
use super::types::{
    AddressListing, BigValueRelease, IntentStatus, MatchStatus, MatchUpdate, SwapDirection,
    SwapIntent, SwapKey, SwapMatch,
};
use crate::error::{SwapError, SwapResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;

/// [`SwapLedger`] backed by concurrent hash maps
#[derive(Debug, Default)]
pub struct MemoryLedger {
    intents: DashMap<SwapKey, SwapIntent>,
    matches: DashMap<SwapKey, SwapMatch>,
    releases: DashMap<SwapKey, BigValueRelease>,
    listings: DashMap<String, AddressListing>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SwapLedger for MemoryLedger {
    async fn add_intent(&self, intent: &SwapIntent) -> SwapResult<bool> {
        match self.intents.entry(intent.key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(intent.clone());
                Ok(true)
            }
        }
    }

    async fn find_intent(&self, key: &SwapKey) -> SwapResult<Option<SwapIntent>> {
        Ok(self.intents.get(key).map(|i| i.clone()))
    }

    async fn find_intents_by_status(
        &self,
        direction: SwapDirection,
        status: IntentStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapIntent>> {
        let mut found: Vec<SwapIntent> = self
            .intents
            .iter()
            .filter(|i| {
                i.key.direction == direction && i.status == status && i.init_time >= since
            })
            .map(|i| i.clone())
            .collect();
        found.sort_by_key(|i| i.init_time);
        Ok(found)
    }

    async fn update_intent_status(
        &self,
        key: &SwapKey,
        status: IntentStatus,
        timestamp: DateTime<Utc>,
        memo: &str,
    ) -> SwapResult<()> {
        let mut intent = self.intents.get_mut(key).ok_or(SwapError::RecordNotFound {
            key: key.to_string(),
        })?;
        intent.status = status;
        intent.timestamp = timestamp;
        intent.memo = memo.to_string();
        Ok(())
    }

    async fn add_match(&self, swap: &SwapMatch) -> SwapResult<bool> {
        match self.matches.entry(swap.key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(swap.clone());
                Ok(true)
            }
        }
    }

    async fn find_match(&self, key: &SwapKey) -> SwapResult<Option<SwapMatch>> {
        Ok(self.matches.get(key).map(|m| m.clone()))
    }

    async fn find_matches_by_status(
        &self,
        direction: SwapDirection,
        status: MatchStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapMatch>> {
        let mut found: Vec<SwapMatch> = self
            .matches
            .iter()
            .filter(|m| m.key.direction == direction && m.status == status && m.time >= since)
            .map(|m| m.clone())
            .collect();
        found.sort_by_key(|m| m.time);
        Ok(found)
    }

    async fn update_match(
        &self,
        key: &SwapKey,
        update: &MatchUpdate,
        timestamp: DateTime<Utc>,
    ) -> SwapResult<()> {
        let mut swap = self.matches.get_mut(key).ok_or(SwapError::RecordNotFound {
            key: key.to_string(),
        })?;

        if let (Some(have), Some(got)) = (swap.swap_nonce, update.swap_nonce) {
            if have != got {
                return Err(SwapError::NonceAlreadyReserved {
                    key: key.to_string(),
                    have,
                    got,
                });
            }
        }

        if let Some(status) = update.status {
            swap.status = status;
        }
        if let Some(old) = &update.push_old_swap {
            swap.old_swap_txs.push(old.tx_hash.clone());
            swap.old_swap_vals.push(old.value);
        }
        if let Some(tx) = &update.swap_tx {
            swap.swap_tx = tx.clone();
        }
        if let Some(height) = update.swap_height {
            swap.swap_height = height;
        }
        if let Some(time) = update.swap_time {
            swap.swap_time = Some(time);
        }
        if let Some(value) = update.swap_value {
            swap.swap_value = value;
        }
        if let Some(swap_type) = update.swap_type {
            swap.swap_type = swap_type;
        }
        if update.swap_nonce.is_some() {
            swap.swap_nonce = update.swap_nonce;
        }
        swap.timestamp = timestamp;
        Ok(())
    }

    async fn reset_match(&self, key: &SwapKey, timestamp: DateTime<Utc>) -> SwapResult<()> {
        let mut swap = self.matches.get_mut(key).ok_or(SwapError::RecordNotFound {
            key: key.to_string(),
        })?;
        if !swap.swap_tx.is_empty() {
            let tx_hash = std::mem::take(&mut swap.swap_tx);
            let value = swap.swap_value;
            swap.old_swap_txs.push(tx_hash);
            swap.old_swap_vals.push(value);
        }
        swap.status = MatchStatus::Empty;
        swap.swap_height = 0;
        swap.swap_time = None;
        swap.swap_value = 0;
        swap.swap_nonce = None;
        swap.timestamp = timestamp;
        Ok(())
    }

    async fn find_history(
        &self,
        direction: SwapDirection,
        address: &str,
        limit: usize,
    ) -> SwapResult<Vec<SwapMatch>> {
        let mut found: Vec<SwapMatch> = self
            .matches
            .iter()
            .filter(|m| {
                m.key.direction == direction
                    && (m.key.bind.eq_ignore_ascii_case(address)
                        || m.from.eq_ignore_ascii_case(address))
            })
            .map(|m| m.clone())
            .collect();
        found.sort_by(|a, b| b.time.cmp(&a.time));
        found.truncate(limit);
        Ok(found)
    }

    async fn count_intents(&self) -> SwapResult<Vec<(IntentStatus, u64)>> {
        let mut counts: HashMap<IntentStatus, u64> = HashMap::new();
        for intent in self.intents.iter() {
            *counts.entry(intent.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn add_big_value_release(&self, release: &BigValueRelease) -> SwapResult<bool> {
        match self.releases.entry(release.key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(release.clone());
                Ok(true)
            }
        }
    }

    async fn find_big_value_release(
        &self,
        key: &SwapKey,
    ) -> SwapResult<Option<BigValueRelease>> {
        Ok(self.releases.get(key).map(|r| r.clone()))
    }

    async fn set_address_listing(
        &self,
        address: &str,
        listing: AddressListing,
        _timestamp: DateTime<Utc>,
    ) -> SwapResult<()> {
        self.listings.insert(address.to_string(), listing);
        Ok(())
    }

    async fn get_address_listing(&self, address: &str) -> SwapResult<Option<AddressListing>> {
        Ok(self.listings.get(address).map(|l| *l))
    }

    async fn health_check(&self) -> SwapResult<()> {
        Ok(())
    }
}
