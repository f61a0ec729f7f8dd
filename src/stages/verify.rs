//! Verify stage: classify freshly registered deposits

use super::{Stage, StageContext, StageReport};
use crate::chain::DepositFacts;
use crate::config::TokenConfig;
use crate::error::{SwapError, SwapResult, VerifyError};
use crate::ledger::{AddressListing, IntentStatus, SwapDirection, SwapIntent, TxType};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct VerifyStage {
    ctx: Arc<StageContext>,
}

impl VerifyStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    /// Verify one intent. Returns whether its status changed.
    async fn process(&self, intent: &SwapIntent, now: DateTime<Utc>) -> SwapResult<bool> {
        let key = &intent.key;
        let (token, adapter) = self.ctx.deposit_side(key)?;

        let facts = match adapter
            .verify_transaction(&key.pair_id, &key.txid, false)
            .await
        {
            Ok(facts) => facts,
            Err(SwapError::Verify(e)) => return self.reject(intent, e, now).await,
            Err(e) => return Err(e),
        };

        let status = match self.classify(key.bind.as_str(), token, &facts).await? {
            Ok(status) => status,
            Err(e) => return self.reject(intent, e, now).await,
        };

        self.ctx
            .ledger
            .transition_intent(key, status, "", now)
            .await?;
        self.ctx.seed_match(key, &facts, now).await?;
        Ok(true)
    }

    /// Apply the fixed verify-error lookup; retryable errors change nothing
    async fn reject(
        &self,
        intent: &SwapIntent,
        error: VerifyError,
        now: DateTime<Utc>,
    ) -> SwapResult<bool> {
        let Some(status) = error.intent_status() else {
            debug!("Deposit {} not ready: {}", intent.key, error);
            return Ok(false);
        };

        if status == IntentStatus::WithBigValue {
            info!("Holding big value deposit {}: {}", intent.key, error);
            crate::metrics::record_big_value_held(&intent.key.pair_id);
        }
        self.ctx
            .ledger
            .transition_intent(&intent.key, status, &error.to_string(), now)
            .await?;
        Ok(true)
    }

    /// Router-side checks on top of the adapter's verification.
    ///
    /// The outer result carries ledger errors, the inner one the verdict.
    async fn classify(
        &self,
        bind: &str,
        token: &TokenConfig,
        facts: &DepositFacts,
    ) -> SwapResult<Result<IntentStatus, VerifyError>> {
        let listing = self.ctx.ledger.get_address_listing(&facts.from).await?;
        if listing == Some(AddressListing::Denied) {
            return Ok(Err(VerifyError::WrongSender(facts.from.clone())));
        }
        if token.require_registered_sender && listing != Some(AddressListing::Allowed) {
            return Ok(Err(VerifyError::SenderNotRegistered(facts.from.clone())));
        }

        match &facts.bind {
            Some(memo) if memo.eq_ignore_ascii_case(bind) => {}
            Some(memo) => {
                return Ok(Err(VerifyError::WrongMemo(format!(
                    "memo {} does not match bind {}",
                    memo, bind
                ))))
            }
            None => return Ok(Err(VerifyError::WrongMemo("no memo".to_string()))),
        }

        if facts.value < token.min_swap || facts.value > token.max_swap {
            return Ok(Err(VerifyError::WrongValue(format!(
                "{} not in [{}, {}]",
                facts.value, token.min_swap, token.max_swap
            ))));
        }
        if facts.value > token.big_value_threshold {
            return Ok(Err(VerifyError::ValueTooLarge {
                value: facts.value,
                threshold: token.big_value_threshold,
            }));
        }

        if facts.tx_type == TxType::ScriptHash && token.allow_script_hash_recall {
            return Ok(Ok(IntentStatus::CanRecall));
        }
        Ok(Ok(IntentStatus::NotSwapped))
    }
}

#[async_trait]
impl Stage for VerifyStage {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.verify)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let router = &self.ctx.settings.router;
        let since = now - router.verify_lifetime();
        let mut report = StageReport::default();

        for direction in SwapDirection::ALL {
            let intents = self
                .ctx
                .ledger
                .find_intents_by_status(direction, IntentStatus::NotStable, since)
                .await?;

            for intent in intents {
                if now - intent.init_time < router.scan_delay() {
                    continue;
                }
                let outcome = self.process(&intent, now).await;
                report.absorb(self.name(), &intent.key, outcome);
            }
        }

        Ok(report)
    }
}
