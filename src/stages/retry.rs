//! Retry stage: re-queue failed payouts that never left the local node or
//! were mined with a reverted receipt

use super::{Stage, StageContext, StageReport};
use crate::error::SwapResult;
use crate::ledger::{IntentStatus, MatchStatus, SwapDirection, SwapIntent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct RetryStage {
    ctx: Arc<StageContext>,
}

impl RetryStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    async fn process(&self, intent: &SwapIntent, now: DateTime<Utc>) -> SwapResult<bool> {
        let key = &intent.key;
        let swap = self.ctx.ledger.find_match(key).await?;

        let memo = match &swap {
            None => "retry: no outbound attempt".to_string(),
            Some(swap) if !matches!(swap.status, MatchStatus::Empty | MatchStatus::Failed) => {
                debug!("Retry of {} skipped: match is {}", key, swap.status);
                return Ok(false);
            }
            Some(swap) if swap.swap_tx.is_empty() => "retry: no outbound attempt".to_string(),
            Some(swap) => {
                let (token, adapter) = self.ctx.payout_side(key, swap.swap_type)?;

                // Any earlier attempt still around could be mined later.
                // One that was mined and reverted can never pay out.
                let mut reverted = false;
                for tx_hash in swap.all_swap_txs() {
                    if let Some(status) = adapter.get_transaction_status(tx_hash).await? {
                        if !status.success {
                            reverted |= *tx_hash == swap.swap_tx;
                            continue;
                        }
                    }
                    if adapter.get_transaction(tx_hash).await?.is_some() {
                        debug!("Retry of {} skipped: {} is still known", key, tx_hash);
                        return Ok(false);
                    }
                }

                // A consumed nonce slot is for the auditor to settle, unless
                // the current attempt itself reverted in it
                let reserved = (adapter.nonce_aware(), swap.swap_nonce);
                if let (Some(nonce_aware), Some(nonce)) = reserved {
                    let latest = nonce_aware.get_latest_nonce(&token.signer_address).await?;
                    if latest > nonce && !reverted {
                        debug!(
                            "Retry of {} skipped: nonce {} consumed (latest {})",
                            key, nonce, latest
                        );
                        return Ok(false);
                    }
                }

                if reverted {
                    format!("retry: {} reverted", swap.swap_tx)
                } else {
                    format!("retry: {} not found on chain", swap.swap_tx)
                }
            }
        };

        self.ctx.ledger.reset_for_retry(key, &memo, now).await?;
        Ok(true)
    }
}

#[async_trait]
impl Stage for RetryStage {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.retry)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let router = &self.ctx.settings.router;
        let since = now - router.stabilize_lifetime();
        let mut report = StageReport::default();

        for direction in SwapDirection::ALL {
            for status in [IntentStatus::SwapFailed, IntentStatus::RecallFailed] {
                let intents = self
                    .ctx
                    .ledger
                    .find_intents_by_status(direction, status, since)
                    .await?;
                for intent in intents {
                    if now - intent.timestamp < router.retry_cool_down() {
                        continue;
                    }
                    let outcome = self.process(&intent, now).await;
                    report.absorb(self.name(), &intent.key, outcome);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{StabilizeStage, SwapStage, VerifyStage};
    use super::*;
    use crate::ledger::SwapKey;
    use chrono::Duration as ChronoDuration;

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::seconds(secs)
    }

    async fn failed_send(h: &Harness) -> SwapKey {
        h.dst.set_pool_nonce(SIGNER, 10);
        h.dst.fail_sends(true);
        let key = h.register("tx1", 1_000).await;
        VerifyStage::new(h.ctx.clone()).tick(at(30)).await.unwrap();
        SwapStage::new(h.ctx.clone()).tick(at(60)).await.unwrap();
        assert_eq!(h.intent(&key).await.status, IntentStatus::SwapFailed);
        key
    }

    #[tokio::test]
    async fn absent_payout_is_retried_with_fresh_allocation() {
        let h = Harness::new();
        let key = failed_send(&h).await;
        let out_a = h.swap(&key).await.swap_tx;
        let stage = RetryStage::new(h.ctx.clone());

        // Still cooling down
        assert_eq!(stage.tick(at(120)).await.unwrap().examined, 0);

        let report = stage.tick(at(400)).await.unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(h.intent(&key).await.status, IntentStatus::NotSwapped);
        let swap = h.swap(&key).await;
        assert_eq!(swap.status, MatchStatus::Empty);
        assert_eq!(swap.swap_nonce, None);
        assert_eq!(swap.old_swap_txs, vec![out_a.clone()]);

        // Nonce 10 was taken by another transaction meanwhile
        h.dst.fail_sends(false);
        h.dst.set_pool_nonce(SIGNER, 11);
        SwapStage::new(h.ctx.clone()).tick(at(410)).await.unwrap();

        let swap = h.swap(&key).await;
        assert_eq!(swap.status, MatchStatus::NotStable);
        assert_eq!(swap.swap_nonce, Some(11));
        assert_ne!(swap.swap_tx, out_a);
        assert_eq!(h.intent(&key).await.status, IntentStatus::Processed);
    }

    #[tokio::test]
    async fn payout_known_to_chain_is_not_retried() {
        let h = Harness::new();
        let key = failed_send(&h).await;
        h.dst.add_to_mempool(&h.swap(&key).await.swap_tx);

        let report = RetryStage::new(h.ctx.clone()).tick(at(400)).await.unwrap();
        assert_eq!((report.examined, report.advanced), (1, 0));
        assert_eq!(h.intent(&key).await.status, IntentStatus::SwapFailed);
    }

    #[tokio::test]
    async fn reverted_payout_is_retried_with_a_new_nonce() {
        let h = Harness::new();
        h.dst.set_pool_nonce(SIGNER, 4);
        let key = h.register("tx1", 1_000).await;
        VerifyStage::new(h.ctx.clone()).tick(at(30)).await.unwrap();
        SwapStage::new(h.ctx.clone()).tick(at(60)).await.unwrap();
        let out_a = h.swap(&key).await.swap_tx;

        // Mined with a failed receipt, and the nonce is gone
        h.dst.revert(&out_a, 995);
        h.dst.set_latest_nonce(SIGNER, 5);
        h.dst.set_pool_nonce(SIGNER, 5);
        StabilizeStage::new(h.ctx.clone()).tick(at(90)).await.unwrap();
        assert_eq!(h.intent(&key).await.status, IntentStatus::SwapFailed);

        let report = RetryStage::new(h.ctx.clone()).tick(at(400)).await.unwrap();
        assert_eq!(report.advanced, 1);
        let intent = h.intent(&key).await;
        assert_eq!(intent.status, IntentStatus::NotSwapped);
        assert!(intent.memo.ends_with("reverted"));

        SwapStage::new(h.ctx.clone()).tick(at(410)).await.unwrap();
        let swap = h.swap(&key).await;
        assert_eq!(swap.status, MatchStatus::NotStable);
        assert_eq!(swap.swap_nonce, Some(5));
        assert_eq!(swap.old_swap_txs, vec![out_a]);
    }

    #[tokio::test]
    async fn consumed_nonce_is_left_to_the_auditor() {
        let h = Harness::new();
        let key = failed_send(&h).await;
        h.dst.set_latest_nonce(SIGNER, 11);

        let report = RetryStage::new(h.ctx.clone()).tick(at(400)).await.unwrap();
        assert_eq!(report.advanced, 0);
        assert_eq!(h.intent(&key).await.status, IntentStatus::SwapFailed);
    }
}
