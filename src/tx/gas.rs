//! Gas pricing for payouts and their replacements

use crate::chain::{ChainProvider, GasPrice};
use crate::error::SwapResult;

use ethers::types::U256;
use tracing::debug;

/// Gas price policy for outbound transactions
pub struct GasEstimator {
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new() -> Self {
        Self {
            gas_price_buffer_percent: 10,
        }
    }

    /// Get the buffered gas price for a payout, optionally bumped for a
    /// replacement, never above the chain's cap
    pub async fn get_gas_price(
        &self,
        provider: &ChainProvider,
        bump_percent: Option<u64>,
    ) -> SwapResult<GasPrice> {
        let network = provider.get_gas_price().await?;
        let buffered = Self::scale(&network, 100 + self.gas_price_buffer_percent);
        let priced = match bump_percent {
            Some(bump) => Self::scale(&buffered, 100 + bump),
            None => buffered,
        };
        let capped = Self::cap(&priced, provider.max_gas_price());

        debug!("Gas price for chain {}: {:?}", provider.name(), capped);
        Ok(capped)
    }

    /// Multiply every component of a price by `percent` / 100
    pub fn scale(current: &GasPrice, percent: u64) -> GasPrice {
        match current {
            GasPrice::Legacy(price) => GasPrice::Legacy(*price * percent / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas * percent / 100,
                max_priority_fee_per_gas: *max_priority_fee_per_gas * percent / 100,
            },
        }
    }

    /// Clamp a price to `max` wei
    pub fn cap(price: &GasPrice, max: U256) -> GasPrice {
        match price {
            GasPrice::Legacy(p) => GasPrice::Legacy(std::cmp::min(*p, max)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = std::cmp::min(*max_fee_per_gas, max);
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: std::cmp::min(*max_priority_fee_per_gas, max_fee),
                }
            }
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_bump_is_applied_and_capped() {
        let bumped = GasEstimator::scale(&GasPrice::Legacy(U256::from(100)), 125);
        assert_eq!(bumped, GasPrice::Legacy(U256::from(125)));

        let capped = GasEstimator::cap(&bumped, U256::from(110));
        assert_eq!(capped, GasPrice::Legacy(U256::from(110)));
    }

    #[test]
    fn priority_fee_never_exceeds_max_fee() {
        let price = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(300),
            max_priority_fee_per_gas: U256::from(200),
        };
        let capped = GasEstimator::cap(&price, U256::from(150));
        assert_eq!(
            capped,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(150),
                max_priority_fee_per_gas: U256::from(150),
            }
        );
    }
}
