//! Recall stage: time-triggered recall of recallable deposits
//!
//! A deposit in "can recall" is either released for a normal payout or
//! marked "to be recalled", by an operator or once the pair's
//! `recall_after_secs` have passed. The swap stage then pays the deposit back
//! to its sender on the deposit chain.

use super::{Stage, StageContext, StageReport};
use crate::error::SwapResult;
use crate::ledger::{IntentStatus, Ledger, SwapDirection, SwapIntent, SwapKey};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Mark a recallable deposit for recall
pub async fn request_recall(
    ledger: &Ledger,
    key: &SwapKey,
    memo: &str,
    now: DateTime<Utc>,
) -> SwapResult<SwapIntent> {
    ledger
        .transition_intent(key, IntentStatus::ToBeRecalled, memo, now)
        .await
}

pub struct RecallStage {
    ctx: Arc<StageContext>,
}

impl RecallStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    async fn process(&self, intent: &SwapIntent, now: DateTime<Utc>) -> SwapResult<bool> {
        let pair = self.ctx.pair(&intent.key.pair_id)?;
        let Some(after) = pair.recall_after_secs else {
            return Ok(false);
        };
        if now - intent.timestamp < chrono::Duration::seconds(after as i64) {
            return Ok(false);
        }

        let memo = format!("recalled after {}s", after);
        request_recall(&self.ctx.ledger, &intent.key, &memo, now).await?;
        Ok(true)
    }
}

#[async_trait]
impl Stage for RecallStage {
    fn name(&self) -> &'static str {
        "recall"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.recall)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let since = now - self.ctx.settings.router.verify_lifetime();
        let mut report = StageReport::default();

        for direction in SwapDirection::ALL {
            let intents = self
                .ctx
                .ledger
                .find_intents_by_status(direction, IntentStatus::CanRecall, since)
                .await?;
            for intent in intents {
                let outcome = self.process(&intent, now).await;
                report.absorb(self.name(), &intent.key, outcome);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{SwapStage, VerifyStage};
    use super::*;
    use crate::chain::DepositFacts;
    use crate::ledger::{MatchStatus, SwapType, TxType};
    use chrono::Duration as ChronoDuration;

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::seconds(secs)
    }

    async fn recallable(h: &Harness) -> SwapKey {
        h.src.add_deposit_facts(
            PAIR,
            DepositFacts {
                txid: "tx777".into(),
                from: DEPOSITOR.into(),
                to: "0xdeposit".into(),
                value: 1_000,
                height: 900,
                timestamp: t0(),
                bind: Some(BIND.into()),
                tx_type: TxType::ScriptHash,
            },
        );
        let key = SwapKey::new(SwapDirection::SwapIn, "tx777", PAIR, BIND);
        h.ledger()
            .register_intent(&SwapIntent::new(key.clone(), TxType::ScriptHash, t0()))
            .await
            .unwrap();
        VerifyStage::new(h.ctx.clone()).tick(at(30)).await.unwrap();
        assert_eq!(h.intent(&key).await.status, IntentStatus::CanRecall);
        key
    }

    #[tokio::test]
    async fn operator_recall_pays_back_the_sender() {
        let h = Harness::new();
        h.src.set_pool_nonce(SOURCE_SIGNER, 4);
        let key = recallable(&h).await;

        // Not picked up by the swap stage while recallable
        SwapStage::new(h.ctx.clone()).tick(at(40)).await.unwrap();
        assert!(h.dst.sent().is_empty());

        request_recall(h.ledger(), &key, "operator", at(50))
            .await
            .unwrap();
        SwapStage::new(h.ctx.clone()).tick(at(60)).await.unwrap();

        let swap = h.swap(&key).await;
        assert_eq!(swap.swap_type, SwapType::Recall);
        assert_eq!(swap.status, MatchStatus::NotStable);
        assert_eq!(swap.swap_value, 1_000);
        assert_eq!(swap.swap_nonce, Some(4));
        assert_eq!(h.intent(&key).await.status, IntentStatus::Processed);

        assert!(h.dst.sent().is_empty());
        let built = h.src.built();
        assert_eq!(built[0].to, DEPOSITOR);
        assert_eq!(built[0].from, SOURCE_SIGNER);
        assert_eq!(built[0].swap_type, SwapType::Recall);
    }

    #[tokio::test]
    async fn failed_recall_is_recall_failed() {
        let h = Harness::new();
        h.src.fail_sends(true);
        let key = recallable(&h).await;
        request_recall(h.ledger(), &key, "operator", at(50))
            .await
            .unwrap();

        SwapStage::new(h.ctx.clone()).tick(at(60)).await.unwrap();
        assert_eq!(h.intent(&key).await.status, IntentStatus::RecallFailed);
    }

    #[tokio::test]
    async fn recall_is_time_triggered_when_configured() {
        let mut settings = settings();
        settings.pairs.get_mut(PAIR).unwrap().recall_after_secs = Some(3_600);
        let h = Harness::with_settings(settings);
        let key = recallable(&h).await;
        let stage = RecallStage::new(h.ctx.clone());

        assert_eq!(stage.tick(at(600)).await.unwrap().advanced, 0);
        assert_eq!(stage.tick(at(3_700)).await.unwrap().advanced, 1);
        assert_eq!(h.intent(&key).await.status, IntentStatus::ToBeRecalled);
    }

    #[tokio::test]
    async fn no_automatic_recall_by_default() {
        let h = Harness::new();
        let key = recallable(&h).await;

        RecallStage::new(h.ctx.clone()).tick(at(86_400)).await.unwrap();
        assert_eq!(h.intent(&key).await.status, IntentStatus::CanRecall);
    }
}
