//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{SwapError, SwapResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, RpcError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain name from configuration
    name: String,
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(name: &str, config: ChainConfig) -> SwapResult<Self> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SwapError::ChainConnection {
                chain: name.to_string(),
                message: "No valid RPC providers".to_string(),
            });
        }

        let provider = Self {
            name: name.to_string(),
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        };

        // Refuse to start against a node of the wrong network
        let remote_chain_id = provider
            .with_failover("get chain id", |p| async move { p.get_chainid().await })
            .await?;
        if remote_chain_id.as_u64() != provider.config.chain_id {
            return Err(SwapError::ChainConnection {
                chain: provider.name.clone(),
                message: format!(
                    "RPC reports chain id {}, configured {}",
                    remote_chain_id, provider.config.chain_id
                ),
            });
        }

        Ok(provider)
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Run a request against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, what: &str, request: F) -> SwapResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match request(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to {} on chain {}: {}", what, self.name, e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(SwapError::ChainConnection {
            chain: self.name.clone(),
            message: format!("All providers failed to {}: {}", what, last_error),
        })
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SwapResult<u64> {
        let block = self
            .with_failover("get block number", |p| async move {
                p.get_block_number().await
            })
            .await?;
        Ok(block.as_u64())
    }

    /// Get block header by number
    pub async fn get_block(&self, block_number: u64) -> SwapResult<Option<Block<H256>>> {
        self.with_failover("get block", |p| async move { p.get_block(block_number).await })
            .await
    }

    /// Get a transaction from the mempool or chain
    pub async fn get_transaction(&self, tx_hash: H256) -> SwapResult<Option<Transaction>> {
        self.with_failover("get transaction", |p| async move {
            p.get_transaction(tx_hash).await
        })
        .await
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> SwapResult<Option<TransactionReceipt>> {
        self.with_failover("get transaction receipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Get the nonce of an account at the pending or latest block
    pub async fn get_transaction_count(
        &self,
        address: Address,
        block: BlockNumber,
    ) -> SwapResult<u64> {
        let count = self
            .with_failover("get transaction count", |p| async move {
                p.get_transaction_count(address, Some(block.into())).await
            })
            .await?;
        Ok(count.as_u64())
    }

    /// Broadcast a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> SwapResult<H256> {
        // Node rejections are final; only transport failures fail over
        match self.http().send_raw_transaction(raw.clone()).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) if RpcError::as_error_response(&e).is_some() => Err(SwapError::Broadcast(e.to_string())),
            Err(e) => {
                warn!("Failed to send transaction on chain {}: {}", self.name, e);
                self.failover();
                self.with_failover("send transaction", |p| {
                    let raw = raw.clone();
                    async move { p.send_raw_transaction(raw).await.map(|tx| tx.tx_hash()) }
                })
                .await
            }
        }
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> SwapResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .with_failover("get gas price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> SwapResult<(U256, U256)> {
        let block = self
            .with_failover("get latest block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| SwapError::Build("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| SwapError::Build("No base fee in block".to_string()))?;

        // Priority fee estimation (can be improved with fee history)
        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok((max_fee, priority_fee))
    }

    /// Highest gas price a payout may use, in wei
    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.name, e);
                false
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
