//! Polling stages that drive intents and matches to a terminal status
//!
//! Every stage is an independent [`Stage`] with its own interval. A tick
//! selects records by status from the ledger, handles each one on its own and
//! never lets one record's failure stop the others.

mod audit;
mod bigvalue;
mod recall;
mod replace;
mod retry;
mod stabilize;
mod swap;
mod verify;

pub use audit::AuditStage;
pub use bigvalue::BigValueStage;
pub use recall::{request_recall, RecallStage};
pub use replace::ReplaceStage;
pub use retry::RetryStage;
pub use stabilize::StabilizeStage;
pub use swap::SwapStage;
pub use verify::VerifyStage;

use crate::chain::{ChainAdapter, ChainRegistry, DepositFacts, TxStatus};
use crate::config::{PairConfig, Settings, TokenConfig};
use crate::error::{SwapError, SwapResult};
use crate::ledger::{Ledger, MatchStatus, MatchUpdate, OldSwap, SwapKey, SwapMatch, SwapType};
use crate::tx::{SignerNonces, SignerQueues, SwapSender};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Outcome counters of one stage tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Records selected by the tick
    pub examined: usize,
    /// Records that changed state
    pub advanced: usize,
    /// Records left alone because of an error
    pub failed: usize,
}

impl StageReport {
    /// Fold the outcome of handling one record into the report
    pub fn absorb(&mut self, stage: &str, key: &SwapKey, outcome: SwapResult<bool>) {
        self.examined += 1;
        match outcome {
            Ok(true) => self.advanced += 1,
            Ok(false) => {}
            Err(e) => {
                self.failed += 1;
                warn!("{} stage: {} left for next cycle: {}", stage, key, e);
            }
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Run one polling iteration as of `now`
    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport>;
}

/// Shared collaborators of all stages
pub struct StageContext {
    pub settings: Arc<Settings>,
    pub ledger: Ledger,
    pub chains: Arc<ChainRegistry>,
    pub sender: Arc<SwapSender>,
    pub nonces: SignerNonces,
    pub queues: SignerQueues,
}

impl StageContext {
    pub fn new(
        settings: Arc<Settings>,
        ledger: Ledger,
        chains: Arc<ChainRegistry>,
        sender: Arc<SwapSender>,
    ) -> Self {
        let capacity = settings.router.signer_queue_capacity;
        Self {
            settings,
            ledger,
            chains,
            sender,
            nonces: SignerNonces::new(),
            queues: SignerQueues::new(capacity),
        }
    }

    pub fn pair(&self, pair_id: &str) -> SwapResult<&PairConfig> {
        self.settings
            .pair(pair_id)
            .ok_or_else(|| SwapError::PairNotFound {
                pair_id: pair_id.to_string(),
            })
    }

    /// Token and adapter of the chain the deposit was made on
    pub fn deposit_side(
        &self,
        key: &SwapKey,
    ) -> SwapResult<(&TokenConfig, Arc<dyn ChainAdapter>)> {
        let token = self.pair(&key.pair_id)?.route(key.direction).from;
        Ok((token, self.chains.get(&token.chain)?))
    }

    /// Token and adapter of the chain a payout of `swap_type` is made on.
    /// A recall pays back on the deposit chain.
    pub fn payout_side(
        &self,
        key: &SwapKey,
        swap_type: SwapType,
    ) -> SwapResult<(&TokenConfig, Arc<dyn ChainAdapter>)> {
        let route = self.pair(&key.pair_id)?.route(key.direction);
        let token = match swap_type {
            SwapType::Recall => route.from,
            SwapType::SwapIn | SwapType::SwapOut => route.to,
        };
        Ok((token, self.chains.get(&token.chain)?))
    }

    /// Create the match of an intent that just became actionable
    pub async fn seed_match(
        &self,
        key: &SwapKey,
        facts: &DepositFacts,
        now: DateTime<Utc>,
    ) -> SwapResult<bool> {
        let swap = SwapMatch {
            key: key.clone(),
            height: facts.height,
            time: facts.timestamp,
            from: facts.from.clone(),
            to: facts.to.clone(),
            value: facts.value,
            swap_tx: String::new(),
            old_swap_txs: Vec::new(),
            old_swap_vals: Vec::new(),
            swap_height: 0,
            swap_time: None,
            swap_value: 0,
            swap_type: SwapType::forward(key.direction),
            swap_nonce: None,
            status: MatchStatus::Empty,
            timestamp: now,
        };
        self.ledger.add_match(&swap).await
    }
}

/// Amount paid out for a deposit of `value`, after the payout side's fee.
///
/// The fee is `fee_rate_bps` of the value, raised to `min_fee` and capped
/// at `max_fee` (no cap when `max_fee` is zero).
pub fn payout_value(token: &TokenConfig, value: u128) -> u128 {
    let mut fee = value.saturating_mul(token.fee_rate_bps as u128) / 10_000;
    fee = fee.max(token.min_fee);
    if token.max_fee > 0 {
        fee = fee.min(token.max_fee);
    }
    value.saturating_sub(fee)
}

/// Receiver of a payout: the bound address, or the depositor for a recall
pub fn payout_receiver(swap: &SwapMatch, swap_type: SwapType) -> String {
    match swap_type {
        SwapType::Recall => swap.from.clone(),
        SwapType::SwapIn | SwapType::SwapOut => swap.key.bind.clone(),
    }
}

/// Confirmations a payout on `token`'s side needs: the pair's own setting,
/// else the chain default
pub fn required_confirmations(token: &TokenConfig, adapter: &dyn ChainAdapter) -> u64 {
    token
        .confirmations
        .unwrap_or_else(|| adapter.required_confirmations())
}

/// The outbound transaction of `swap` that is mined, current one first.
/// A successful receipt wins over a reverted one.
pub async fn find_mined(
    adapter: &dyn ChainAdapter,
    swap: &SwapMatch,
) -> SwapResult<Option<(String, TxStatus)>> {
    let mut reverted = None;
    for tx_hash in swap.all_swap_txs() {
        if let Some(status) = adapter.get_transaction_status(tx_hash).await? {
            if status.success {
                return Ok(Some((tx_hash.clone(), status)));
            }
            if reverted.is_none() {
                reverted = Some((tx_hash.clone(), status));
            }
        }
    }
    Ok(reverted)
}

/// Update recording that `tx_hash` was mined. A superseded transaction that
/// won the race against its replacement becomes the current one again.
pub fn mined_update(
    swap: &SwapMatch,
    tx_hash: &str,
    status: &TxStatus,
    now: DateTime<Utc>,
) -> MatchUpdate {
    let mut update = MatchUpdate {
        swap_height: Some(status.block_height),
        swap_time: Some(swap.swap_time.unwrap_or(now)),
        ..Default::default()
    };

    if tx_hash != swap.swap_tx {
        let value = swap
            .old_swap_txs
            .iter()
            .position(|old| old == tx_hash)
            .and_then(|i| swap.old_swap_vals.get(i).copied())
            .unwrap_or(swap.swap_value);
        update.swap_tx = Some(tx_hash.to_string());
        update.swap_value = Some(value);
        if !swap.swap_tx.is_empty() {
            update.push_old_swap = Some(OldSwap {
                tx_hash: swap.swap_tx.clone(),
                value: swap.swap_value,
            });
        }
    }
    update
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::ledger::{SwapDirection, SwapIntent, TxType};
    use crate::tx::RetryPolicy;

    pub const PAIR: &str = "P";
    /// Payout signer on the destination chain
    pub const SIGNER: &str = "0xsigner";
    /// Payout signer on the source chain, used by recalls
    pub const SOURCE_SIGNER: &str = "0xsrcsigner";
    pub const BIND: &str = "0xbind";
    pub const DEPOSITOR: &str = "0xalice";

    const SETTINGS: &str = r#"
[router]
instance_id = "router-test"
scan_delay_secs = 5
retry_cool_down_secs = 300
big_value_hold_secs = 600

[database]
url = "memory://"
max_connections = 1
min_connections = 1

[api]
host = "127.0.0.1"
port = 0

[metrics]
enabled = false
port = 0

[admin]
address = "0x0000000000000000000000000000000000000001"

[chains.src]
chain_id = 1
rpc_urls = ["http://localhost:8545"]
max_gas_price_gwei = 100

[chains.dst]
chain_id = 56
rpc_urls = ["http://localhost:8546"]
max_gas_price_gwei = 20

[pairs.P]
replace_after_secs = 600
max_replace_count = 2

[pairs.P.source]
chain = "src"
deposit_address = "0xdeposit"
signer_address = "0xsrcsigner"
min_swap = 100
max_swap = 50000
big_value_threshold = 10000
fee_rate_bps = 100
min_fee = 1
max_fee = 1000
allow_script_hash_recall = true

[pairs.P.destination]
chain = "dst"
deposit_address = "0xdstdeposit"
signer_address = "0xsigner"
min_swap = 100
max_swap = 50000
big_value_threshold = 10000
fee_rate_bps = 100
min_fee = 1
max_fee = 1000
"#;

    /// Deposit time used by [`FakeChain::add_deposit`]
    pub fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    pub fn settings() -> Settings {
        toml::from_str(SETTINGS).unwrap()
    }

    /// A context over fake `src` and `dst` chains and an in-memory ledger
    pub struct Harness {
        pub ctx: Arc<StageContext>,
        pub src: Arc<FakeChain>,
        pub dst: Arc<FakeChain>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_settings(settings())
        }

        pub fn with_settings(settings: Settings) -> Self {
            let src = Arc::new(FakeChain::new("src"));
            let dst = Arc::new(FakeChain::new("dst"));
            let chains = ChainRegistry::new();
            chains.insert("src", src.clone());
            chains.insert("dst", dst.clone());

            let fast = RetryPolicy::new(2, Duration::ZERO);
            let sender = SwapSender::new(None, fast, fast, fast);
            let ctx = StageContext::new(
                Arc::new(settings),
                Ledger::in_memory(),
                Arc::new(chains),
                Arc::new(sender),
            );

            Self {
                ctx: Arc::new(ctx),
                src,
                dst,
            }
        }

        pub fn ledger(&self) -> &Ledger {
            &self.ctx.ledger
        }

        /// Register a swap-in intent for a plain deposit at `t0`
        pub async fn register(&self, txid: &str, value: u128) -> SwapKey {
            self.src.add_deposit(PAIR, txid, DEPOSITOR, BIND, value);
            let key = SwapKey::new(SwapDirection::SwapIn, txid, PAIR, BIND);
            self.ledger()
                .register_intent(&SwapIntent::new(key.clone(), TxType::Plain, t0()))
                .await
                .unwrap();
            key
        }

        pub async fn intent(&self, key: &SwapKey) -> SwapIntent {
            self.ledger().get_intent(key).await.unwrap()
        }

        pub async fn swap(&self, key: &SwapKey) -> SwapMatch {
            self.ledger().find_match(key).await.unwrap().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::chain::testing::FakeChain;

    #[test]
    fn fee_is_clamped() {
        let settings = settings();
        let token = &settings.pair(PAIR).unwrap().destination;

        // 1% of 1000
        assert_eq!(payout_value(token, 1_000), 990);
        // Below min fee
        assert_eq!(payout_value(token, 50), 49);
        // Capped at max fee
        assert_eq!(payout_value(token, 200_000), 199_000);
    }

    #[test]
    fn pair_confirmations_override_the_chain() {
        let mut settings = settings();
        let chain = FakeChain::new("dst");
        chain.set_required_confirmations(3);

        let token = &settings.pair(PAIR).unwrap().destination;
        assert_eq!(required_confirmations(token, &chain), 3);

        if let Some(pair) = settings.pairs.get_mut(PAIR) {
            pair.destination.confirmations = Some(20);
        }
        let token = &settings.pair(PAIR).unwrap().destination;
        assert_eq!(required_confirmations(token, &chain), 20);
    }

    #[tokio::test]
    async fn mined_replacement_loser_is_promoted() {
        let swap = SwapMatch {
            key: SwapKey::new(crate::ledger::SwapDirection::SwapIn, "tx1", PAIR, BIND),
            height: 1,
            time: t0(),
            from: DEPOSITOR.into(),
            to: "0xdeposit".into(),
            value: 1_000,
            swap_tx: "outB".into(),
            old_swap_txs: vec!["outA".into()],
            old_swap_vals: vec![980],
            swap_height: 0,
            swap_time: None,
            swap_value: 990,
            swap_type: SwapType::SwapIn,
            swap_nonce: Some(3),
            status: MatchStatus::NotStable,
            timestamp: t0(),
        };

        let chain = FakeChain::new("dst");
        chain.mine("outA", 990);
        chain.revert("outB", 991);
        let (tx_hash, status) = find_mined(&chain, &swap).await.unwrap().unwrap();
        assert_eq!(tx_hash, "outA");
        assert!(status.success);

        let update = mined_update(&swap, &tx_hash, &status, t0());
        assert_eq!(update.swap_tx.as_deref(), Some("outA"));
        assert_eq!(update.swap_value, Some(980));
        assert_eq!(update.swap_height, Some(990));
        assert_eq!(
            update.push_old_swap,
            Some(OldSwap {
                tx_hash: "outB".into(),
                value: 990
            })
        );
    }
}
