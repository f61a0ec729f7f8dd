//! Replace stage: re-send payouts stuck unmined, reusing their nonce
//!
//! Replacements go through the per-signer queues, so at most one replacement
//! per payout signer is in flight. Each job also takes the signer's nonce slot,
//! which keeps it from interleaving with a fresh payout of the swap stage.

use super::{payout_receiver, Stage, StageContext, StageReport};
use crate::chain::BuildTxArgs;
use crate::error::{SwapError, SwapResult};
use crate::ledger::{MatchStatus, MatchUpdate, OldSwap, SwapDirection, SwapMatch};
use crate::tx::signer_key;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ReplaceStage {
    ctx: Arc<StageContext>,
}

impl ReplaceStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    fn is_due(&self, swap: &SwapMatch, now: DateTime<Utc>) -> SwapResult<bool> {
        let pair = self.ctx.pair(&swap.key.pair_id)?;
        Ok(pair.replace_enabled()
            && !swap.swap_tx.is_empty()
            && swap.swap_height == 0
            && swap.swap_nonce.is_some()
            && swap.replace_count() < pair.max_replace_count
            && now - swap.timestamp >= chrono::Duration::seconds(pair.replace_after_secs as i64))
    }
}

/// Replace one stuck payout. Runs on the signer's queue.
async fn replace_one(
    ctx: Arc<StageContext>,
    swap: SwapMatch,
    now: DateTime<Utc>,
) -> SwapResult<bool> {
    let key = &swap.key;
    let (token, adapter) = ctx.payout_side(key, swap.swap_type)?;
    let Some(nonce_aware) = adapter.nonce_aware() else {
        return Ok(false);
    };
    let _slot = ctx.nonces.lock(adapter.name(), &token.signer_address).await;

    // The match may have moved on while the job was queued
    let swap = ctx.ledger.get_match(key).await?;
    let Some(nonce) = swap.swap_nonce else {
        return Ok(false);
    };
    if swap.status != MatchStatus::NotStable || swap.swap_height > 0 {
        return Ok(false);
    }

    if let Some(block) = nonce_aware.get_tx_block_info(&swap.swap_tx).await? {
        debug!(
            "Payout {} of {} mined at {}, not replacing",
            swap.swap_tx, key, block.block_height
        );
        let update = MatchUpdate {
            swap_height: Some(block.block_height),
            swap_time: Some(block.block_time.unwrap_or(now)),
            ..Default::default()
        };
        ctx.ledger.update_match(key, &update, now).await?;
        return Ok(true);
    }

    let latest = nonce_aware.get_latest_nonce(&token.signer_address).await?;
    if latest > nonce {
        warn!(
            "Nonce {} of {} already consumed (latest {}), not replacing",
            nonce, key, latest
        );
        return Ok(false);
    }

    let chain = ctx
        .settings
        .chain(&token.chain)
        .ok_or_else(|| SwapError::ChainNotFound {
            chain: token.chain.clone(),
        })?;
    let bump = chain.replace_fee_bump_percent * (swap.replace_count() as u64 + 1);

    let args = BuildTxArgs {
        pair_id: key.pair_id.clone(),
        swap_type: swap.swap_type,
        origin_txid: key.txid.clone(),
        from: token.signer_address.clone(),
        to: payout_receiver(&swap, swap.swap_type),
        value: swap.swap_value,
        nonce: Some(nonce),
        fee_bump_percent: Some(bump),
    };

    let out = match ctx.sender.send(adapter.as_ref(), &args).await {
        Ok(out) => out,
        Err(failure) => {
            crate::metrics::record_outbound_failed(adapter.name(), failure.step);
            // A signed replacement may have reached a node and evicted the
            // current payout, so it has to be tracked like a sent one
            if let Some(tx_hash) = &failure.tx_hash {
                let update = MatchUpdate {
                    swap_tx: Some(tx_hash.clone()),
                    push_old_swap: Some(OldSwap {
                        tx_hash: swap.swap_tx.clone(),
                        value: swap.swap_value,
                    }),
                    swap_value: Some(args.value),
                    swap_nonce: Some(nonce),
                    ..Default::default()
                };
                ctx.ledger.update_match(key, &update, now).await?;
                warn!(
                    "Replacement {} of {} not confirmed visible, tracking it: {}",
                    tx_hash, key, failure
                );
            }
            return Err(failure.error);
        }
    };

    let update = MatchUpdate {
        swap_tx: Some(out.tx_hash.clone()),
        push_old_swap: Some(OldSwap {
            tx_hash: swap.swap_tx.clone(),
            value: swap.swap_value,
        }),
        swap_value: Some(out.value),
        swap_nonce: Some(nonce),
        ..Default::default()
    };
    ctx.ledger.update_match(key, &update, now).await?;
    crate::metrics::record_replacement(adapter.name());
    info!(
        "Replaced payout {} of {} with {} (nonce {}, +{}% fee)",
        swap.swap_tx, key, out.tx_hash, nonce, bump
    );
    Ok(true)
}

#[async_trait]
impl Stage for ReplaceStage {
    fn name(&self) -> &'static str {
        "replace"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.replace)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let since = now - self.ctx.settings.router.replace_lifetime();
        let mut report = StageReport::default();
        let mut jobs = Vec::new();

        for direction in SwapDirection::ALL {
            let matches = self
                .ctx
                .ledger
                .find_matches_by_status(direction, MatchStatus::NotStable, since)
                .await?;

            for swap in matches {
                match self.is_due(&swap, now) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        report.absorb(self.name(), &swap.key, Err(e));
                        continue;
                    }
                }

                let queue = match self.ctx.payout_side(&swap.key, swap.swap_type) {
                    Ok((token, adapter)) => signer_key(adapter.name(), &token.signer_address),
                    Err(e) => {
                        report.absorb(self.name(), &swap.key, Err(e));
                        continue;
                    }
                };

                let key = swap.key.clone();
                let job = replace_one(self.ctx.clone(), swap, now);
                match self.ctx.queues.submit(&queue, job).await {
                    Ok(done) => jobs.push((key, done)),
                    Err(e) => report.absorb(self.name(), &key, Err(e)),
                }
            }
        }

        for (key, done) in jobs {
            let outcome = done
                .await
                .unwrap_or_else(|_| Err(SwapError::Internal("replace job dropped".to_string())));
            report.absorb(self.name(), &key, outcome);
        }

        Ok(report)
    }
}
