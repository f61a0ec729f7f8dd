//! Chain module - the adapter contract between the router and each chain
//!
//! This module provides:
//! - The [`ChainAdapter`] contract every supported chain implements
//! - The optional [`NonceAware`] capability for account/nonce chains
//! - A registry resolving chain names to adapters
//! - An EVM adapter over a multi-RPC failover provider

pub mod evm;
pub mod finality;
pub mod provider;
#[cfg(test)]
pub mod testing;

pub use evm::EvmAdapter;
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{SwapError, SwapResult};
use crate::ledger::{SwapType, TxType};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Facts about a verified deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositFacts {
    pub txid: String,
    pub from: String,
    /// Deposit address the value was sent to
    pub to: String,
    pub value: u128,
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    /// Payout address carried by the deposit, if any
    pub bind: Option<String>,
    pub tx_type: TxType,
}

/// Everything an adapter needs to build one payout
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTxArgs {
    pub pair_id: String,
    pub swap_type: SwapType,
    /// Deposit transaction being paid out, carried as the payout memo
    pub origin_txid: String,
    /// Signer address the payout is sent from
    pub from: String,
    /// Receiver of the payout
    pub to: String,
    /// Amount after fees
    pub value: u128,
    /// Pinned nonce; the adapter picks one when absent
    pub nonce: Option<u64>,
    /// Fee increase over the current network price, in percent
    pub fee_bump_percent: Option<u64>,
}

/// An unsigned payout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub chain: String,
    pub from: String,
    pub to: String,
    pub value: u128,
    pub nonce: Option<u64>,
    /// Chain specific encoding
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx_hash: String,
    pub raw: Vec<u8>,
}

/// A transaction as seen by a node, in the mempool or mined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    pub tx_hash: String,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    pub confirmations: u64,
    pub block_height: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxBlockInfo {
    pub block_height: u64,
    pub block_time: Option<DateTime<Utc>>,
}

/// Operations the router needs from one chain.
///
/// Verification failures are reported as [`SwapError::Verify`]; any other
/// error is treated as transient.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Check that `txid` is a well-formed deposit for `pair_id`
    async fn verify_transaction(
        &self,
        pair_id: &str,
        txid: &str,
        allow_unstable: bool,
    ) -> SwapResult<DepositFacts>;

    async fn build_raw_transaction(&self, args: &BuildTxArgs) -> SwapResult<RawTransaction>;

    /// Whether payouts from `address` can be signed locally
    fn has_local_key(&self, address: &str) -> bool;

    /// Sign with a locally configured key
    async fn sign_transaction(
        &self,
        raw: &RawTransaction,
        pair_id: &str,
    ) -> SwapResult<SignedTransaction>;

    /// Digest handed to the signing coordinator
    fn signing_message(&self, raw: &RawTransaction) -> SwapResult<[u8; 32]>;

    /// Combine a raw payout with a coordinator signature
    fn attach_signature(
        &self,
        raw: &RawTransaction,
        signature: &[u8],
    ) -> SwapResult<SignedTransaction>;

    async fn send_transaction(&self, signed: &SignedTransaction) -> SwapResult<String>;

    /// Look a transaction up in the mempool or chain
    async fn get_transaction(&self, tx_hash: &str) -> SwapResult<Option<TxInfo>>;

    /// Confirmation status of a mined transaction
    async fn get_transaction_status(&self, tx_hash: &str) -> SwapResult<Option<TxStatus>>;

    /// Confirmations this chain requires before a payout is stable
    fn required_confirmations(&self) -> u64;

    /// Nonce capability, for chains where payouts can be replaced
    fn nonce_aware(&self) -> Option<&dyn NonceAware> {
        None
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Account chains whose transactions are ordered by a per-sender nonce
#[async_trait]
pub trait NonceAware: Send + Sync {
    /// Next nonce including pending transactions
    async fn get_pool_nonce(&self, address: &str) -> SwapResult<u64>;

    /// Next nonce counting mined transactions only
    async fn get_latest_nonce(&self, address: &str) -> SwapResult<u64>;

    async fn get_tx_block_info(&self, tx_hash: &str) -> SwapResult<Option<TxBlockInfo>>;
}

/// Adapters indexed by chain name
#[derive(Default)]
pub struct ChainRegistry {
    adapters: DashMap<String, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect an EVM adapter for every configured chain
    pub async fn from_settings(settings: &Settings) -> SwapResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in &settings.chains {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );

            let tokens: HashMap<_, _> = settings
                .pairs
                .iter()
                .flat_map(|(id, pair)| {
                    [&pair.source, &pair.destination]
                        .into_iter()
                        .filter(|t| &t.chain == name)
                        .map(move |t| (id.clone(), t.clone()))
                })
                .collect();

            let provider = ChainProvider::new(name, chain_config.clone()).await?;
            let adapter = EvmAdapter::new(name, Arc::new(provider), tokens)?;
            registry.insert(name, Arc::new(adapter));

            info!("Chain {} initialized successfully", name);
        }

        Ok(registry)
    }

    pub fn insert(&self, name: &str, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(name.to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> SwapResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(name)
            .map(|a| a.clone())
            .ok_or_else(|| SwapError::ChainNotFound {
                chain: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let adapters: Vec<_> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (name, adapter) in adapters {
            let healthy = adapter.health_check().await;
            crate::metrics::record_chain_health(&name, healthy);
            results.push((name, healthy));
        }
        results
    }
}
