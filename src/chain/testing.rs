//! Scriptable in-memory chain used by unit tests

use super::{
    BuildTxArgs, ChainAdapter, DepositFacts, NonceAware, RawTransaction, SignedTransaction,
    TxBlockInfo, TxInfo, TxStatus,
};
use crate::error::{SwapError, SwapResult, VerifyError};
use crate::ledger::TxType;

use async_trait::async_trait;
use chrono::DateTime;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    deposits: HashMap<(String, String), Result<DepositFacts, VerifyError>>,
    pool_nonces: HashMap<String, u64>,
    latest_nonces: HashMap<String, u64>,
    mempool: HashSet<String>,
    /// Mined transactions with their height and receipt status
    mined: HashMap<String, (u64, bool)>,
    height: u64,
    built: Vec<BuildTxArgs>,
    sent: Vec<String>,
    hash_counter: u64,
    local_key: bool,
    fail_sends: bool,
    hide_sends: bool,
    nonce_aware: bool,
    required_confirmations: u64,
}

/// Fake [`ChainAdapter`] whose responses are set up by the test
pub struct FakeChain {
    name: String,
    state: Mutex<State>,
}

impl FakeChain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State {
                local_key: true,
                nonce_aware: true,
                required_confirmations: 3,
                height: 1_000,
                ..Default::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// A deposit of `value` from `from` carrying `bind`
    pub fn add_deposit(&self, pair_id: &str, txid: &str, from: &str, bind: &str, value: u128) {
        self.add_deposit_facts(
            pair_id,
            DepositFacts {
                txid: txid.to_string(),
                from: from.to_string(),
                to: "0xdeposit".to_string(),
                value,
                height: 900,
                timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                bind: Some(bind.to_string()),
                tx_type: TxType::Plain,
            },
        );
    }

    pub fn add_deposit_facts(&self, pair_id: &str, facts: DepositFacts) {
        self.with(|s| {
            s.deposits
                .insert((pair_id.to_string(), facts.txid.clone()), Ok(facts))
        });
    }

    pub fn set_verify_error(&self, pair_id: &str, txid: &str, error: VerifyError) {
        self.with(|s| {
            s.deposits
                .insert((pair_id.to_string(), txid.to_string()), Err(error))
        });
    }

    pub fn set_pool_nonce(&self, address: &str, nonce: u64) {
        self.with(|s| s.pool_nonces.insert(address.to_string(), nonce));
    }

    pub fn set_latest_nonce(&self, address: &str, nonce: u64) {
        self.with(|s| s.latest_nonces.insert(address.to_string(), nonce));
    }

    pub fn set_local_key(&self, local: bool) {
        self.with(|s| s.local_key = local);
    }

    pub fn set_nonce_aware(&self, aware: bool) {
        self.with(|s| s.nonce_aware = aware);
    }

    pub fn set_required_confirmations(&self, confirmations: u64) {
        self.with(|s| s.required_confirmations = confirmations);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.with(|s| s.fail_sends = fail);
    }

    /// Sends succeed but the transaction never shows up
    pub fn hide_sends(&self, hide: bool) {
        self.with(|s| s.hide_sends = hide);
    }

    /// Put an arbitrary transaction in the mempool
    pub fn add_to_mempool(&self, tx_hash: &str) {
        self.with(|s| s.mempool.insert(tx_hash.to_string()));
    }

    /// Forget a transaction, as if it was never propagated
    pub fn drop_tx(&self, tx_hash: &str) {
        self.with(|s| {
            s.mempool.remove(tx_hash);
            s.mined.remove(tx_hash);
        });
    }

    pub fn mine(&self, tx_hash: &str, height: u64) {
        self.mine_with_status(tx_hash, height, true);
    }

    /// Mine a transaction whose execution failed
    pub fn revert(&self, tx_hash: &str, height: u64) {
        self.mine_with_status(tx_hash, height, false);
    }

    fn mine_with_status(&self, tx_hash: &str, height: u64, success: bool) {
        self.with(|s| {
            s.mempool.remove(tx_hash);
            s.mined.insert(tx_hash.to_string(), (height, success));
        });
    }

    pub fn set_height(&self, height: u64) {
        self.with(|s| s.height = height);
    }

    pub fn built(&self) -> Vec<BuildTxArgs> {
        self.with(|s| s.built.clone())
    }

    pub fn sent(&self) -> Vec<String> {
        self.with(|s| s.sent.clone())
    }

    fn next_hash(&self, nonce: Option<u64>) -> String {
        self.with(|s| {
            s.hash_counter += 1;
            format!("0x{}-n{}-{}", self.name, nonce.unwrap_or(0), s.hash_counter)
        })
    }
}

#[async_trait]
impl ChainAdapter for FakeChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify_transaction(
        &self,
        pair_id: &str,
        txid: &str,
        _allow_unstable: bool,
    ) -> SwapResult<DepositFacts> {
        self.with(|s| {
            match s.deposits.get(&(pair_id.to_string(), txid.to_string())) {
                Some(Ok(facts)) => Ok(facts.clone()),
                Some(Err(e)) => Err(SwapError::Verify(e.clone())),
                None => Err(SwapError::Verify(VerifyError::TxNotFound)),
            }
        })
    }

    async fn build_raw_transaction(&self, args: &BuildTxArgs) -> SwapResult<RawTransaction> {
        let nonce = match args.nonce {
            Some(n) => n,
            None => self.with(|s| s.pool_nonces.get(&args.from).copied().unwrap_or(0)),
        };
        self.with(|s| s.built.push(args.clone()));

        Ok(RawTransaction {
            chain: self.name.clone(),
            from: args.from.clone(),
            to: args.to.clone(),
            value: args.value,
            nonce: Some(nonce),
            body: serde_json::json!({
                "nonce": nonce,
                "to": args.to,
                "value": args.value.to_string(),
                "fee_bump": args.fee_bump_percent,
            }),
        })
    }

    fn has_local_key(&self, _address: &str) -> bool {
        self.with(|s| s.local_key)
    }

    async fn sign_transaction(
        &self,
        raw: &RawTransaction,
        _pair_id: &str,
    ) -> SwapResult<SignedTransaction> {
        Ok(SignedTransaction {
            tx_hash: self.next_hash(raw.nonce),
            raw: raw.body.to_string().into_bytes(),
        })
    }

    fn signing_message(&self, raw: &RawTransaction) -> SwapResult<[u8; 32]> {
        Ok([raw.nonce.unwrap_or(0) as u8; 32])
    }

    fn attach_signature(
        &self,
        raw: &RawTransaction,
        signature: &[u8],
    ) -> SwapResult<SignedTransaction> {
        if signature.is_empty() {
            return Err(SwapError::SigningRejected("empty signature".to_string()));
        }
        Ok(SignedTransaction {
            tx_hash: self.next_hash(raw.nonce),
            raw: raw.body.to_string().into_bytes(),
        })
    }

    async fn send_transaction(&self, signed: &SignedTransaction) -> SwapResult<String> {
        self.with(|s| {
            if s.fail_sends {
                return Err(SwapError::Broadcast("nonce too low".to_string()));
            }
            s.sent.push(signed.tx_hash.clone());
            if !s.hide_sends {
                s.mempool.insert(signed.tx_hash.clone());
            }
            Ok(signed.tx_hash.clone())
        })
    }

    async fn get_transaction(&self, tx_hash: &str) -> SwapResult<Option<TxInfo>> {
        self.with(|s| {
            if let Some((height, _)) = s.mined.get(tx_hash) {
                return Ok(Some(TxInfo {
                    tx_hash: tx_hash.to_string(),
                    block_height: Some(*height),
                }));
            }
            Ok(s.mempool.contains(tx_hash).then(|| TxInfo {
                tx_hash: tx_hash.to_string(),
                block_height: None,
            }))
        })
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> SwapResult<Option<TxStatus>> {
        self.with(|s| {
            Ok(s.mined.get(tx_hash).map(|(height, success)| TxStatus {
                confirmations: super::finality::confirmations(s.height, *height),
                block_height: *height,
                success: *success,
            }))
        })
    }

    fn required_confirmations(&self) -> u64 {
        self.with(|s| s.required_confirmations)
    }

    fn nonce_aware(&self) -> Option<&dyn NonceAware> {
        if self.with(|s| s.nonce_aware) {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl NonceAware for FakeChain {
    async fn get_pool_nonce(&self, address: &str) -> SwapResult<u64> {
        Ok(self.with(|s| s.pool_nonces.get(address).copied().unwrap_or(0)))
    }

    async fn get_latest_nonce(&self, address: &str) -> SwapResult<u64> {
        Ok(self.with(|s| s.latest_nonces.get(address).copied().unwrap_or(0)))
    }

    async fn get_tx_block_info(&self, tx_hash: &str) -> SwapResult<Option<TxBlockInfo>> {
        Ok(self.with(|s| {
            s.mined.get(tx_hash).map(|(height, _)| TxBlockInfo {
                block_height: *height,
                block_time: None,
            })
        }))
    }
}
