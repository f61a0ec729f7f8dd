//! Stabilize stage: wait for broadcast payouts to reach confirmation depth

use super::{find_mined, mined_update, required_confirmations, Stage, StageContext, StageReport};
use crate::error::SwapResult;
use crate::ledger::{MatchStatus, SwapDirection, SwapMatch};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct StabilizeStage {
    ctx: Arc<StageContext>,
}

impl StabilizeStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    async fn process(&self, swap: &SwapMatch, now: DateTime<Utc>) -> SwapResult<bool> {
        let (token, adapter) = self.ctx.payout_side(&swap.key, swap.swap_type)?;

        let Some((tx_hash, status)) = find_mined(adapter.as_ref(), swap).await? else {
            debug!("Payout {} of {} not mined yet", swap.swap_tx, swap.key);
            return Ok(false);
        };

        let required = required_confirmations(token, adapter.as_ref());
        let mut update = mined_update(swap, &tx_hash, &status, now);
        let changed = update.swap_tx.is_some() || swap.swap_height != status.block_height;

        if status.confirmations >= required {
            if !status.success {
                let memo = format!(
                    "payout {} reverted at height {}",
                    tx_hash, status.block_height
                );
                let failed = self
                    .ctx
                    .ledger
                    .record_reverted_payout(&swap.key, &update, &memo, now)
                    .await?;
                warn!("Swap {}: {}, intent back to {}", swap.key, memo, failed);
                return Ok(true);
            }

            update.status = Some(MatchStatus::Stable);
            self.ctx.ledger.update_match(&swap.key, &update, now).await?;
            info!(
                "Payout {} of {} stable with {} confirmations",
                tx_hash, swap.key, status.confirmations
            );
            return Ok(true);
        }

        if changed {
            self.ctx.ledger.update_match(&swap.key, &update, now).await?;
        }
        debug!(
            "Payout {} of {} has {}/{} confirmations (success {})",
            tx_hash, swap.key, status.confirmations, required, status.success
        );
        Ok(false)
    }
}

#[async_trait]
impl Stage for StabilizeStage {
    fn name(&self) -> &'static str {
        "stabilize"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.stabilize)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let since = now - self.ctx.settings.router.stabilize_lifetime();
        let mut report = StageReport::default();

        for direction in SwapDirection::ALL {
            let matches = self
                .ctx
                .ledger
                .find_matches_by_status(direction, MatchStatus::NotStable, since)
                .await?;
            for swap in matches {
                let outcome = self.process(&swap, now).await;
                report.absorb(self.name(), &swap.key, outcome);
            }
        }

        Ok(report)
    }
}
