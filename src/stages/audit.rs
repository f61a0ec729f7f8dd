//! Failed-swap auditor: reconcile payouts that looked failed with the chain
//!
//! A send that timed out may still have reached a node, and a replaced
//! payout may be mined instead of its replacement. Before a failure is
//! retried or accepted, the auditor checks every outbound transaction of the
//! match and the signer's nonce on the payout chain.

use super::{
    find_mined, mined_update, required_confirmations, Stage, StageContext, StageReport,
};
use crate::error::SwapResult;
use crate::ledger::{IntentStatus, MatchStatus, MatchUpdate, SwapDirection, SwapIntent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct AuditStage {
    ctx: Arc<StageContext>,
}

impl AuditStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    async fn process(&self, intent: &SwapIntent, now: DateTime<Utc>) -> SwapResult<bool> {
        let key = &intent.key;
        let Some(swap) = self.ctx.ledger.find_match(key).await? else {
            return Ok(false);
        };
        let Some(nonce) = swap.swap_nonce else {
            return Ok(false);
        };
        if swap.status != MatchStatus::Failed || swap.swap_tx.is_empty() {
            return Ok(false);
        }

        let (token, adapter) = self.ctx.payout_side(key, swap.swap_type)?;

        let mined = find_mined(adapter.as_ref(), &swap).await?;
        if let Some((tx_hash, status)) = mined.as_ref().filter(|(_, s)| s.success) {
            let mut update = mined_update(&swap, tx_hash, status, now);
            let required = required_confirmations(token, adapter.as_ref());
            update.status = Some(if status.confirmations >= required {
                MatchStatus::Stable
            } else {
                MatchStatus::NotStable
            });
            self.ctx.ledger.update_match(key, &update, now).await?;
            self.complete(intent, &format!("reconciled: {} mined", tx_hash), now)
                .await?;
            return Ok(true);
        }

        let pending = adapter.get_transaction(&swap.swap_tx).await?;
        if pending.map_or(false, |info| info.block_height.is_none()) {
            self.ctx
                .ledger
                .update_match(key, &MatchUpdate::status(MatchStatus::NotStable), now)
                .await?;
            let memo = format!("reconciled: {} pending", swap.swap_tx);
            self.complete(intent, &memo, now).await?;
            return Ok(true);
        }

        // The nonce went to this payout, which reverted; nothing was paid
        if mined.map_or(false, |(tx_hash, _)| tx_hash == swap.swap_tx) {
            debug!("Payout {} of {} reverted, left for retry", swap.swap_tx, key);
            return Ok(false);
        }

        let Some(nonce_aware) = adapter.nonce_aware() else {
            return Ok(false);
        };
        let latest = nonce_aware.get_latest_nonce(&token.signer_address).await?;
        if latest > nonce {
            warn!(
                "Nonce {} of {} consumed by another transaction (latest {}); failure is final",
                nonce, key, latest
            );
            self.ctx
                .ledger
                .update_match(key, &MatchUpdate::status(MatchStatus::FailedFinal), now)
                .await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn complete(
        &self,
        intent: &SwapIntent,
        memo: &str,
        now: DateTime<Utc>,
    ) -> SwapResult<()> {
        self.ctx
            .ledger
            .transition_intent(&intent.key, IntentStatus::Processed, memo, now)
            .await?;
        info!("Failed swap {} {}", intent.key, memo);
        Ok(())
    }
}

#[async_trait]
impl Stage for AuditStage {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.audit)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let since = now - self.ctx.settings.router.stabilize_lifetime();
        let mut report = StageReport::default();

        for direction in SwapDirection::ALL {
            for status in [IntentStatus::SwapFailed, IntentStatus::RecallFailed] {
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
