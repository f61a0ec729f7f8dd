//! Payout sender: build, sign, broadcast, confirm visible

use super::signing::{sign_with_coordinator, SigningCoordinator};
use super::RetryPolicy;
use crate::chain::{BuildTxArgs, ChainAdapter, RawTransaction, SignedTransaction};
use crate::error::{SwapError, SwapResult};

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Step of the outbound pipeline an attempt failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStep {
    Build,
    Sign,
    Send,
    Confirm,
}

impl OutboundStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStep::Build => "build",
            OutboundStep::Sign => "sign",
            OutboundStep::Send => "send",
            OutboundStep::Confirm => "confirm",
        }
    }
}

impl fmt::Display for OutboundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broadcast payout that the node has acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub tx_hash: String,
    pub nonce: Option<u64>,
    pub value: u128,
}

/// A failed payout attempt
#[derive(Debug)]
pub struct OutboundFailure {
    pub step: OutboundStep,
    pub error: SwapError,
    /// Hash of the signed transaction, when signing got that far
    pub tx_hash: Option<String>,
    /// Nonce the attempt was built with
    pub nonce: Option<u64>,
}

impl OutboundFailure {
    fn new(step: OutboundStep, error: SwapError) -> Self {
        Self {
            step,
            error,
            tx_hash: None,
            nonce: None,
        }
    }

    /// Diagnostic stored in the intent memo
    pub fn memo(&self) -> String {
        format!("{} failed: {}", self.step, self.error)
    }
}

impl fmt::Display for OutboundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.memo())
    }
}

/// Runs the outbound pipeline against one chain adapter
pub struct SwapSender {
    coordinator: Option<Arc<dyn SigningCoordinator>>,
    sign_retry: RetryPolicy,
    send_retry: RetryPolicy,
    rpc_retry: RetryPolicy,
}

impl SwapSender {
    pub fn new(
        coordinator: Option<Arc<dyn SigningCoordinator>>,
        sign_retry: RetryPolicy,
        send_retry: RetryPolicy,
        rpc_retry: RetryPolicy,
    ) -> Self {
        Self {
            coordinator,
            sign_retry,
            send_retry,
            rpc_retry,
        }
    }

    /// Build, sign and broadcast one payout, then wait until a node reports
    /// it in its mempool or chain
    pub async fn send(
        &self,
        adapter: &dyn ChainAdapter,
        args: &BuildTxArgs,
    ) -> Result<Outbound, OutboundFailure> {
        let raw = adapter
            .build_raw_transaction(args)
            .await
            .map_err(|e| OutboundFailure::new(OutboundStep::Build, e))?;
        let nonce = raw.nonce;

        let signed = self.sign(adapter, args, &raw).await.map_err(|e| OutboundFailure {
            nonce,
            ..OutboundFailure::new(OutboundStep::Sign, e)
        })?;
        let tx_hash = signed.tx_hash.clone();
        let fail = |step: OutboundStep, error: SwapError| OutboundFailure {
            step,
            error,
            tx_hash: Some(tx_hash.clone()),
            nonce,
        };

        let sent_hash = self
            .send_retry
            .run("send transaction", |_| adapter.send_transaction(&signed))
            .await
            .map_err(|e| fail(OutboundStep::Send, e))?;
        debug!("Payout {} accepted by chain {}", sent_hash, adapter.name());

        self.rpc_retry
            .run("confirm transaction", |_| async {
                match adapter.get_transaction(&signed.tx_hash).await? {
                    Some(_) => Ok(()),
                    None => Err(SwapError::NotVisible {
                        tx_hash: signed.tx_hash.clone(),
                    }),
                }
            })
            .await
            .map_err(|e| fail(OutboundStep::Confirm, e))?;

        info!(
            "Sent {} payout {} on chain {} (nonce {:?})",
            args.swap_type.as_str(),
            signed.tx_hash,
            adapter.name(),
            nonce
        );

        Ok(Outbound {
            tx_hash: signed.tx_hash,
            nonce,
            value: raw.value,
        })
    }

    async fn sign(
        &self,
        adapter: &dyn ChainAdapter,
        args: &BuildTxArgs,
        raw: &RawTransaction,
    ) -> SwapResult<SignedTransaction> {
        if adapter.has_local_key(&raw.from) {
            return adapter.sign_transaction(raw, &args.pair_id).await;
        }

        let coordinator = self.coordinator.as_ref().ok_or_else(|| {
            SwapError::SigningRejected(format!(
                "no local key for {} and no signing coordinator configured",
                raw.from
            ))
        })?;

        let message = adapter.signing_message(raw)?;
        let context = serde_json::json!({
            "chain": raw.chain,
            "pair_id": args.pair_id,
            "swap_type": args.swap_type.as_str(),
            "origin_txid": args.origin_txid,
            "to": raw.to,
            "value": raw.value.to_string(),
            "nonce": raw.nonce,
        });

        let signature = sign_with_coordinator(
            coordinator.as_ref(),
            &self.sign_retry,
            &raw.from,
            message,
            context,
        )
        .await?;
        adapter.attach_signature(raw, &signature).map_err(|e| {
            warn!("Coordinator signature for {} rejected: {}", raw.from, e);
            e
        })
    }
}
