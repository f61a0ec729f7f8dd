//! Swap stage: build, sign and send the payout of every actionable intent

use super::{payout_receiver, payout_value, Stage, StageContext, StageReport};
use crate::chain::BuildTxArgs;
use crate::error::SwapResult;
use crate::ledger::{
    IntentStatus, MatchStatus, MatchUpdate, SwapDirection, SwapIntent, SwapMatch, SwapType,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct SwapStage {
    ctx: Arc<StageContext>,
}

impl SwapStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    /// The intent's match, creating it from a fresh verification if the
    /// verify stage did not get to it (released big values, crashes)
    async fn load_match(&self, intent: &SwapIntent, now: DateTime<Utc>) -> SwapResult<SwapMatch> {
        let key = &intent.key;
        if let Some(swap) = self.ctx.ledger.find_match(key).await? {
            return Ok(swap);
        }

        let (_, adapter) = self.ctx.deposit_side(key)?;
        let facts = adapter
            .verify_transaction(&key.pair_id, &key.txid, false)
            .await?;
        self.ctx.seed_match(key, &facts, now).await?;
        self.ctx.ledger.get_match(key).await
    }

    async fn process(&self, intent: &SwapIntent, now: DateTime<Utc>) -> SwapResult<bool> {
        let key = &intent.key;
        let (swap_type, failed_status) = match intent.status {
            IntentStatus::ToBeRecalled => (SwapType::Recall, IntentStatus::RecallFailed),
            _ => (SwapType::forward(key.direction), IntentStatus::SwapFailed),
        };

        let swap = self.load_match(intent, now).await?;
        match swap.status {
            MatchStatus::Empty => {}
            MatchStatus::NotStable | MatchStatus::Stable => {
                // Sent before the intent was updated
                self.ctx
                    .ledger
                    .transition_intent(
                        key,
                        IntentStatus::Processed,
                        &format!("already sent {}", swap.swap_tx),
                        now,
                    )
                    .await?;
                return Ok(true);
            }
            MatchStatus::Failed | MatchStatus::FailedFinal => {
                self.ctx
                    .ledger
                    .transition_intent(
                        key,
                        failed_status,
                        &format!("previous attempt {} failed", swap.swap_tx),
                        now,
                    )
                    .await?;
                return Ok(true);
            }
        }

        let (token, adapter) = self.ctx.payout_side(key, swap_type)?;
        let value = match swap_type {
            SwapType::Recall => swap.value,
            SwapType::SwapIn | SwapType::SwapOut => payout_value(token, swap.value),
        };
        let mut args = BuildTxArgs {
            pair_id: key.pair_id.clone(),
            swap_type,
            origin_txid: key.txid.clone(),
            from: token.signer_address.clone(),
            to: payout_receiver(&swap, swap_type),
            value,
            nonce: None,
            fee_bump_percent: None,
        };

        // Hold the signer's nonce slot from allocation until the send outcome
        let mut guard = match adapter.nonce_aware() {
            Some(nonce_aware) => {
                let guard = self
                    .ctx
                    .nonces
                    .lock(adapter.name(), &token.signer_address)
                    .await;
                let pool = nonce_aware.get_pool_nonce(&token.signer_address).await?;
                args.nonce = Some(guard.allocate(pool));
                Some(guard)
            }
            None => None,
        };

        match self.ctx.sender.send(adapter.as_ref(), &args).await {
            Ok(out) => {
                if let (Some(guard), Some(nonce)) = (guard.as_mut(), out.nonce) {
                    guard.commit(nonce);
                }
                crate::metrics::record_outbound_sent(adapter.name(), swap_type);

                let update = MatchUpdate {
                    status: Some(MatchStatus::NotStable),
                    swap_tx: Some(out.tx_hash.clone()),
                    swap_value: Some(out.value),
                    swap_type: Some(swap_type),
                    swap_nonce: out.nonce,
                    ..Default::default()
                };
                self.ctx.ledger.update_match(key, &update, now).await?;
                self.ctx
                    .ledger
                    .transition_intent(key, IntentStatus::Processed, "", now)
                    .await?;
                info!(
                    "Swap {} paid out by {} (nonce {:?})",
                    key, out.tx_hash, out.nonce
                );
            }
            Err(failure) => {
                drop(guard);
                warn!("Swap {} failed: {}", key, failure);
                crate::metrics::record_outbound_failed(adapter.name(), failure.step);

                if let Some(tx_hash) = &failure.tx_hash {
                    let update = MatchUpdate {
                        status: Some(MatchStatus::Failed),
                        swap_tx: Some(tx_hash.clone()),
                        swap_value: Some(value),
                        swap_type: Some(swap_type),
                        swap_nonce: failure.nonce,
                        ..Default::default()
                    };
                    self.ctx.ledger.update_match(key, &update, now).await?;
                }
                self.ctx
                    .ledger
                    .transition_intent(key, failed_status, &failure.memo(), now)
                    .await?;
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl Stage for SwapStage {
    fn name(&self) -> &'static str {
        "swap"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.swap)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let since = now - self.ctx.settings.router.verify_lifetime();
        let mut report = StageReport::default();

        for direction in SwapDirection::ALL {
            for status in [IntentStatus::NotSwapped, IntentStatus::ToBeRecalled] {
                let intents = self
                    .ctx
                    .ledger
                    .find_intents_by_status(direction, status, since)
                    .await?;
                for intent in intents {
                    let outcome = self.process(&intent, now).await;
                    report.absorb(self.name(), &intent.key, outcome);
                }
            }
        }

        Ok(report)
    }
}
