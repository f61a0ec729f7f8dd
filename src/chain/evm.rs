//! EVM chain adapter
//!
//! Deposits are native-value transfers into the pair's deposit address with
//! the payout address carried as UTF-8 calldata. Payouts are native-value
//! transfers whose calldata names the deposit they pay for.

use super::finality::confirmations;
use super::provider::{ChainProvider, GasPrice};
use super::{
    BuildTxArgs, ChainAdapter, DepositFacts, NonceAware, RawTransaction, SignedTransaction,
    TxBlockInfo, TxInfo, TxStatus,
};
use crate::config::TokenConfig;
use crate::error::{SwapError, SwapResult, VerifyError};
use crate::ledger::TxType;
use crate::tx::GasEstimator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::signers::to_eip155_v;
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Adapter for an EVM chain
pub struct EvmAdapter {
    name: String,
    provider: Arc<ChainProvider>,
    /// Token side living on this chain, per pair
    tokens: HashMap<String, TokenConfig>,
    /// Locally held payout keys
    wallets: HashMap<Address, LocalWallet>,
    gas_estimator: GasEstimator,
}

impl EvmAdapter {
    pub fn new(
        name: &str,
        provider: Arc<ChainProvider>,
        tokens: HashMap<String, TokenConfig>,
    ) -> SwapResult<Self> {
        let mut wallets = HashMap::new();

        for (pair_id, token) in &tokens {
            let Some(env_name) = &token.private_key_env else {
                continue;
            };
            let key = std::env::var(env_name).map_err(|_| {
                SwapError::Config(format!(
                    "Pair {}: environment variable {} is not set",
                    pair_id, env_name
                ))
            })?;
            let wallet = key
                .parse::<LocalWallet>()
                .map_err(|e| SwapError::Config(format!("Invalid private key: {}", e)))?
                .with_chain_id(provider.chain_id());

            let signer = parse_address(&token.signer_address)
                .map_err(|e| SwapError::Config(format!("Pair {}: {}", pair_id, e)))?;
            if wallet.address() != signer {
                return Err(SwapError::Config(format!(
                    "Pair {}: key in {} does not belong to signer {}",
                    pair_id, env_name, token.signer_address
                )));
            }

            info!("Local signer {:?} loaded for chain {}", signer, name);
            wallets.insert(signer, wallet);
        }

        Ok(Self {
            name: name.to_string(),
            provider,
            tokens,
            wallets,
            gas_estimator: GasEstimator::new(),
        })
    }

    fn token(&self, pair_id: &str) -> SwapResult<&TokenConfig> {
        self.tokens.get(pair_id).ok_or_else(|| SwapError::PairNotFound {
            pair_id: pair_id.to_string(),
        })
    }

    async fn block_time(&self, height: u64) -> SwapResult<Option<DateTime<Utc>>> {
        let block = self.provider.get_block(height).await?;
        Ok(block.and_then(|b| DateTime::from_timestamp(b.timestamp.as_u64() as i64, 0)))
    }

    fn build_error(e: impl std::fmt::Display) -> SwapError {
        SwapError::Build(e.to_string())
    }

    fn decode_body(raw: &RawTransaction) -> SwapResult<TypedTransaction> {
        serde_json::from_value(raw.body.clone()).map_err(Self::build_error)
    }
}

fn parse_address(address: &str) -> Result<Address, String> {
    address
        .parse::<Address>()
        .map_err(|e| format!("invalid address {}: {}", address, e))
}

fn parse_hash(tx_hash: &str) -> SwapResult<H256> {
    tx_hash
        .parse::<H256>()
        .map_err(|e| SwapError::Internal(format!("invalid tx hash {}: {}", tx_hash, e)))
}

fn format_hash(hash: H256) -> String {
    format!("{:?}", hash)
}

fn format_address(address: Address) -> String {
    format!("{:?}", address)
}

/// Payout address carried in deposit calldata
fn decode_memo(input: &Bytes) -> Option<String> {
    let memo = std::str::from_utf8(input.as_ref()).ok()?.trim();
    if memo.is_empty() {
        None
    } else {
        Some(memo.to_string())
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify_transaction(
        &self,
        pair_id: &str,
        txid: &str,
        allow_unstable: bool,
    ) -> SwapResult<DepositFacts> {
        let token = self.token(pair_id)?;
        let hash = txid
            .parse::<H256>()
            .map_err(|_| VerifyError::TxNotFound)?;

        let tx = self
            .provider
            .get_transaction(hash)
            .await?
            .ok_or(VerifyError::TxNotFound)?;

        let deposit_address =
            parse_address(&token.deposit_address).map_err(SwapError::Config)?;
        if tx.to != Some(deposit_address) {
            return Err(VerifyError::WrongReceiver(format!(
                "sent to {:?}, expected {}",
                tx.to, token.deposit_address
            ))
            .into());
        }

        let value = u128::try_from(tx.value)
            .map_err(|_| VerifyError::WrongValue(format!("value {} overflows", tx.value)))?;
        if value == 0 {
            return Err(VerifyError::WrongValue("zero value deposit".to_string()).into());
        }

        let bind = decode_memo(&tx.input);

        let Some(block_number) = tx.block_number else {
            if allow_unstable {
                return Ok(DepositFacts {
                    txid: txid.to_string(),
                    from: format_address(tx.from),
                    to: token.deposit_address.clone(),
                    value,
                    height: 0,
                    timestamp: Utc::now(),
                    bind,
                    tx_type: TxType::Plain,
                });
            }
            return Err(VerifyError::TxNotStable.into());
        };
        let height = block_number.as_u64();

        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await?
            .ok_or(VerifyError::TxNotStable)?;
        if receipt.status != Some(1.into()) {
            return Err(VerifyError::WrongReceiver("deposit transaction reverted".to_string()).into());
        }

        let latest = self.provider.get_block_number().await?;
        let confs = confirmations(latest, height);
        if !allow_unstable && confs < self.required_confirmations() {
            debug!(
                "Deposit {} has {} / {} confirmations on chain {}",
                txid,
                confs,
                self.required_confirmations(),
                self.name
            );
            return Err(VerifyError::TxNotStable.into());
        }

        let timestamp = self.block_time(height).await?.unwrap_or_else(Utc::now);

        Ok(DepositFacts {
            txid: txid.to_string(),
            from: format_address(tx.from),
            to: token.deposit_address.clone(),
            value,
            height,
            timestamp,
            bind,
            tx_type: TxType::Plain,
        })
    }

    async fn build_raw_transaction(&self, args: &BuildTxArgs) -> SwapResult<RawTransaction> {
        let from = parse_address(&args.from).map_err(SwapError::Build)?;
        let to = parse_address(&args.to).map_err(SwapError::Build)?;

        let nonce = match args.nonce {
            Some(nonce) => nonce,
            None => {
                self.provider
                    .get_transaction_count(from, BlockNumber::Pending)
                    .await?
            }
        };

        let gas_price = self
            .gas_estimator
            .get_gas_price(&self.provider, args.fee_bump_percent)
            .await?;
        let gas_limit = U256::from(self.provider.config().gas_limit);
        let value = U256::from(args.value);
        let data = Bytes::from(args.origin_txid.clone().into_bytes());
        let chain_id = self.provider.chain_id();

        let tx = match gas_price {
            GasPrice::Legacy(price) => TypedTransaction::Legacy(
                TransactionRequest::new()
                    .from(from)
                    .to(to)
                    .value(value)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(price)
                    .chain_id(chain_id),
            ),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(from)
                    .to(to)
                    .value(value)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .chain_id(chain_id),
            ),
        };

        debug!(
            "Built {} payout on chain {}: nonce {} to {}",
            args.swap_type.as_str(),
            self.name,
            nonce,
            args.to
        );

        Ok(RawTransaction {
            chain: self.name.clone(),
            from: args.from.clone(),
            to: args.to.clone(),
            value: args.value,
            nonce: Some(nonce),
            body: serde_json::to_value(&tx)?,
        })
    }

    fn has_local_key(&self, address: &str) -> bool {
        parse_address(address)
            .map(|a| self.wallets.contains_key(&a))
            .unwrap_or(false)
    }

    async fn sign_transaction(
        &self,
        raw: &RawTransaction,
        pair_id: &str,
    ) -> SwapResult<SignedTransaction> {
        let tx = Self::decode_body(raw)?;
        let from = parse_address(&raw.from).map_err(SwapError::Build)?;
        let wallet = self.wallets.get(&from).ok_or_else(|| {
            SwapError::SigningRejected(format!("no local key for {} (pair {})", raw.from, pair_id))
        })?;

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SwapError::SigningRejected(e.to_string()))?;
        let signed = tx.rlp_signed(&signature);

        Ok(SignedTransaction {
            tx_hash: format_hash(H256::from(keccak256(&signed))),
            raw: signed.to_vec(),
        })
    }

    fn signing_message(&self, raw: &RawTransaction) -> SwapResult<[u8; 32]> {
        let tx = Self::decode_body(raw)?;
        Ok(tx.sighash().0)
    }

    fn attach_signature(
        &self,
        raw: &RawTransaction,
        signature: &[u8],
    ) -> SwapResult<SignedTransaction> {
        if signature.len() != 65 {
            return Err(SwapError::SigningRejected(format!(
                "expected 65 signature bytes, got {}",
                signature.len()
            )));
        }
        let tx = Self::decode_body(raw)?;

        let recovery_id = match signature[64] {
            v @ 0..=1 => v,
            v @ 27..=28 => v - 27,
            v => {
                return Err(SwapError::SigningRejected(format!(
                    "unexpected recovery id {}",
                    v
                )))
            }
        };
        let v = match &tx {
            TypedTransaction::Legacy(_) => to_eip155_v(recovery_id, self.provider.chain_id()),
            _ => recovery_id as u64,
        };
        let signature = Signature {
            r: U256::from_big_endian(&signature[0..32]),
            s: U256::from_big_endian(&signature[32..64]),
            v,
        };

        let from = parse_address(&raw.from).map_err(SwapError::Build)?;
        let recovered = signature
            .recover(tx.sighash())
            .map_err(|e| SwapError::SigningRejected(e.to_string()))?;
        if recovered != from {
            return Err(SwapError::SigningRejected(format!(
                "signature recovers to {:?}, expected {}",
                recovered, raw.from
            )));
        }

        let signed = tx.rlp_signed(&signature);
        Ok(SignedTransaction {
            tx_hash: format_hash(H256::from(keccak256(&signed))),
            raw: signed.to_vec(),
        })
    }

    async fn send_transaction(&self, signed: &SignedTransaction) -> SwapResult<String> {
        let hash = self
            .provider
            .send_raw_transaction(Bytes::from(signed.raw.clone()))
            .await?;
        let hash = format_hash(hash);
        if !hash.eq_ignore_ascii_case(&signed.tx_hash) {
            warn!(
                "Chain {} reported hash {} for payout {}",
                self.name, hash, signed.tx_hash
            );
        }
        Ok(hash)
    }

    async fn get_transaction(&self, tx_hash: &str) -> SwapResult<Option<TxInfo>> {
        let tx = self.provider.get_transaction(parse_hash(tx_hash)?).await?;
        Ok(tx.map(|tx| TxInfo {
            tx_hash: format_hash(tx.hash),
            block_height: tx.block_number.map(|b| b.as_u64()),
        }))
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> SwapResult<Option<TxStatus>> {
        let receipt = self
            .provider
            .get_transaction_receipt(parse_hash(tx_hash)?)
            .await?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let latest = self.provider.get_block_number().await?;
        Ok(Some(TxStatus {
            confirmations: confirmations(latest, block_number.as_u64()),
            block_height: block_number.as_u64(),
            success: receipt.status == Some(1.into()),
        }))
    }

    fn required_confirmations(&self) -> u64 {
        self.provider.config().required_confirmations()
    }

    fn nonce_aware(&self) -> Option<&dyn NonceAware> {
        Some(self)
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}

#[async_trait]
impl NonceAware for EvmAdapter {
    async fn get_pool_nonce(&self, address: &str) -> SwapResult<u64> {
        let address = parse_address(address).map_err(|message| SwapError::Nonce {
            chain: self.name.clone(),
            message,
        })?;
        self.provider
            .get_transaction_count(address, BlockNumber::Pending)
            .await
    }

    async fn get_latest_nonce(&self, address: &str) -> SwapResult<u64> {
        let address = parse_address(address).map_err(|message| SwapError::Nonce {
            chain: self.name.clone(),
            message,
        })?;
        self.provider
            .get_transaction_count(address, BlockNumber::Latest)
            .await
    }

    async fn get_tx_block_info(&self, tx_hash: &str) -> SwapResult<Option<TxBlockInfo>> {
        let receipt = self
            .provider
            .get_transaction_receipt(parse_hash(tx_hash)?)
            .await?;
        let Some(height) = receipt.and_then(|r| r.block_number).map(|b| b.as_u64()) else {
            return Ok(None);
        };

        Ok(Some(TxBlockInfo {
            block_height: height,
            block_time: self.block_time(height).await?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_is_trimmed_utf8() {
        assert_eq!(
            decode_memo(&Bytes::from(b" 0xabc \n".to_vec())),
            Some("0xabc".to_string())
        );
        assert_eq!(decode_memo(&Bytes::from(vec![])), None);
        assert_eq!(decode_memo(&Bytes::from(vec![0xff, 0xfe])), None);
    }

    #[test]
    fn hashes_format_as_full_hex() {
        let hash = H256::repeat_byte(0xab);
        let text = format_hash(hash);
        assert_eq!(text.len(), 66);
        assert_eq!(parse_hash(&text).unwrap(), hash);
    }
}
