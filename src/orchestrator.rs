//! Orchestrator: runs every stage on its own interval until shutdown

use crate::stages::{
    AuditStage, BigValueStage, RecallStage, ReplaceStage, RetryStage, StabilizeStage, Stage,
    StageContext, StageReport, SwapStage, VerifyStage,
};

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Owns the stage set and spawns one task per stage
pub struct Orchestrator {
    stages: Vec<Arc<dyn Stage>>,
}

impl Orchestrator {
    /// All stages over one shared context
    pub fn new(ctx: Arc<StageContext>) -> Self {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(VerifyStage::new(ctx.clone())),
            Arc::new(SwapStage::new(ctx.clone())),
            Arc::new(StabilizeStage::new(ctx.clone())),
            Arc::new(RetryStage::new(ctx.clone())),
            Arc::new(ReplaceStage::new(ctx.clone())),
            Arc::new(RecallStage::new(ctx.clone())),
            Arc::new(BigValueStage::new(ctx.clone())),
            Arc::new(AuditStage::new(ctx)),
        ];
        Self { stages }
    }

    pub fn with_stages(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Start every stage. Tasks finish their current iteration and exit once
    /// `shutdown` turns true or its sender is dropped.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.stages
            .iter()
            .map(|stage| tokio::spawn(run_stage(stage.clone(), shutdown.clone())))
            .collect()
    }
}

async fn run_stage(stage: Arc<dyn Stage>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(stage.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Stage {} started (every {}s)",
        stage.name(),
        stage.interval().as_secs()
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                tick_once(stage.as_ref()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Stage {} stopped", stage.name());
}

/// Run one iteration of `stage` and record its outcome
pub async fn tick_once(stage: &dyn Stage) -> Option<StageReport> {
    let started = Instant::now();
    let result = stage.tick(Utc::now()).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(report) => {
            crate::metrics::record_stage_tick(stage.name(), &report, elapsed);
            if report.examined > 0 {
                debug!(
                    "Stage {}: examined {}, advanced {}, failed {}",
                    stage.name(),
                    report.examined,
                    report.advanced,
                    report.failed
                );
            }
            Some(report)
        }
        Err(e) => {
            crate::metrics::record_stage_error(stage.name());
            error!("Stage {} tick failed: {}", stage.name(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SwapError, SwapResult};
    use crate::stages::testing::Harness;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingStage {
        ticks: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Stage for CountingStage {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn tick(&self, _now: DateTime<Utc>) -> SwapResult<StageReport> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SwapError::Internal("ledger down".into()));
            }
            Ok(StageReport::default())
        }
    }

    #[test]
    fn builds_every_stage() {
        let h = Harness::new();
        let orchestrator = Orchestrator::new(h.ctx.clone());
        let names: Vec<_> = orchestrator.stages().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "verify",
                "swap",
                "stabilize",
                "retry",
                "replace",
                "recall",
                "big_value",
                "audit"
            ]
        );
    }

    #[tokio::test]
    async fn stages_tick_until_shutdown() {
        let stage = Arc::new(CountingStage {
            ticks: AtomicUsize::new(0),
            fail: true,
        });
        let orchestrator = Orchestrator::with_stages(vec![stage.clone() as Arc<dyn Stage>]);
        let (tx, rx) = watch::channel(false);

        let handles = orchestrator.spawn(rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }

        // A failing tick does not stop the stage
        let ticks = stage.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 2, "ticked {} times", ticks);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(stage.ticks.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn tick_once_reports() {
        let stage = CountingStage {
            ticks: AtomicUsize::new(0),
            fail: false,
        };
        assert_eq!(tick_once(&stage).await, Some(StageReport::default()));
    }
}
