//! Big-value gate: release held deposits once an operator approved them
//!
//! A held intent only moves on when a release record exists for it and it
//! has been held for at least `big_value_hold_secs`.

use super::{Stage, StageContext, StageReport};
use crate::error::SwapResult;
use crate::ledger::{IntentStatus, SwapDirection, SwapIntent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct BigValueStage {
    ctx: Arc<StageContext>,
}

impl BigValueStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    async fn process(&self, intent: &SwapIntent, now: DateTime<Utc>) -> SwapResult<bool> {
        let key = &intent.key;
        let Some(release) = self.ctx.ledger.find_big_value_release(key).await? else {
            return Ok(false);
        };

        let held = now - intent.timestamp;
        if held < self.ctx.settings.router.big_value_hold() {
            debug!(
                "Big value {} approved by {}, held {}s so far",
                key,
                release.approved_by,
                held.num_seconds()
            );
            return Ok(false);
        }

        let memo = format!("released by {}", release.approved_by);
        self.ctx
            .ledger
            .transition_intent(key, IntentStatus::NotSwapped, &memo, now)
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl Stage for BigValueStage {
    fn name(&self) -> &'static str {
        "big_value"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.router.intervals.big_value)
    }

    async fn tick(&self, now: DateTime<Utc>) -> SwapResult<StageReport> {
        let since = now - self.ctx.settings.router.stabilize_lifetime();
        let mut report = StageReport::default();

        for direction in SwapDirection::ALL {
            let intents = self
                .ctx
                .ledger
                .find_intents_by_status(direction, IntentStatus::WithBigValue, since)
                .await?;
            for intent in intents {
                let outcome = self.process(&intent, now).await;
                report.absorb(self.name(), &intent.key, outcome);
            }
        }

        Ok(report)
    }
}
