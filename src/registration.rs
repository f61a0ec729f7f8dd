//! Intent registration
//!
//! Scanners and the operator API hand detected deposits to the [`Registrar`].
//! Registration is find-then-insert on the swap key, so reporting the same
//! deposit twice leaves exactly one intent behind.

use crate::chain::ChainRegistry;
use crate::config::Settings;
use crate::error::{SwapError, SwapResult};
use crate::ledger::{Ledger, SwapDirection, SwapIntent, SwapKey, TxType};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one registration call
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub intent: SwapIntent,
    /// False when the deposit was already known
    pub created: bool,
}

pub struct Registrar {
    settings: Arc<Settings>,
    ledger: Ledger,
    chains: Arc<ChainRegistry>,
}

impl Registrar {
    pub fn new(settings: Arc<Settings>, ledger: Ledger, chains: Arc<ChainRegistry>) -> Self {
        Self {
            settings,
            ledger,
            chains,
        }
    }

    /// Record a deposit for the verify stage.
    ///
    /// With `fast_register` enabled the deposit is checked against its chain
    /// first, accepting unconfirmed transactions; a deposit that can never
    /// become valid is refused without writing anything.
    pub async fn register(
        &self,
        direction: SwapDirection,
        pair_id: &str,
        txid: &str,
        bind: &str,
        now: DateTime<Utc>,
    ) -> SwapResult<Registration> {
        if txid.is_empty() || bind.is_empty() {
            return Err(SwapError::InvalidRequest(
                "txid and bind address are required".to_string(),
            ));
        }

        let pair = self
            .settings
            .pair(pair_id)
            .ok_or_else(|| SwapError::PairNotFound {
                pair_id: pair_id.to_string(),
            })?;
        let key = SwapKey::new(direction, txid, pair_id, bind);

        if let Some(intent) = self.ledger.find_intent(&key).await? {
            debug!("Deposit {} already registered as {}", key, intent.status);
            return Ok(Registration {
                intent,
                created: false,
            });
        }

        let mut tx_type = TxType::Plain;
        if self.settings.router.fast_register {
            let chain = &pair.route(direction).from.chain;
            let adapter = self.chains.get(chain)?;
            match adapter.verify_transaction(pair_id, txid, true).await {
                Ok(facts) => tx_type = facts.tx_type,
                Err(SwapError::Verify(e)) if !e.is_retryable() => {
                    info!("Refusing registration of {}: {}", key, e);
                    return Err(SwapError::Verify(e));
                }
                Err(e) => debug!("Registering {} unverified: {}", key, e),
            }
        }

        let intent = SwapIntent::new(key.clone(), tx_type, now);
        let created = self.ledger.register_intent(&intent).await?;
        if !created {
            // Lost a race with another registration of the same deposit
            let intent = self.ledger.get_intent(&key).await?;
            return Ok(Registration {
                intent,
                created: false,
            });
        }

        Ok(Registration {
            intent,
            created: true,
        })
    }
}
