//! Configuration management for the swap router
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::finality::recommended_confirmations;
use crate::ledger::SwapDirection;
use crate::tx::RetryPolicy;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub router: RouterConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub pairs: HashMap<String, PairConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    pub instance_id: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub intervals: StageIntervals,
    /// Age an intent must reach before it is verified
    #[serde(default = "default_scan_delay_secs")]
    pub scan_delay_secs: u64,
    /// Records older than this are no longer polled by verify/swap
    #[serde(default = "default_lifetime_secs")]
    pub max_verify_lifetime_secs: u64,
    #[serde(default = "default_lifetime_secs")]
    pub max_stabilize_lifetime_secs: u64,
    #[serde(default = "default_replace_lifetime_secs")]
    pub max_replace_lifetime_secs: u64,
    #[serde(default = "default_retry_cool_down_secs")]
    pub retry_cool_down_secs: u64,
    #[serde(default = "default_big_value_hold_secs")]
    pub big_value_hold_secs: u64,
    #[serde(default = "default_sign_retry")]
    pub sign_retry: RetryConfig,
    #[serde(default = "default_send_retry")]
    pub send_retry: RetryConfig,
    #[serde(default = "default_rpc_retry")]
    pub rpc_retry: RetryConfig,
    #[serde(default = "default_signer_queue_capacity")]
    pub signer_queue_capacity: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Verify unstable deposits at registration and refuse bad ones early
    #[serde(default)]
    pub fast_register: bool,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl RouterConfig {
    pub fn scan_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scan_delay_secs as i64)
    }

    pub fn verify_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_verify_lifetime_secs as i64)
    }

    pub fn stabilize_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_stabilize_lifetime_secs as i64)
    }

    pub fn replace_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_replace_lifetime_secs as i64)
    }

    pub fn retry_cool_down(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_cool_down_secs as i64)
    }

    pub fn big_value_hold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.big_value_hold_secs as i64)
    }
}

/// Poll interval of every stage, in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageIntervals {
    pub verify: u64,
    pub swap: u64,
    pub stabilize: u64,
    pub retry: u64,
    pub replace: u64,
    pub recall: u64,
    pub big_value: u64,
    pub audit: u64,
}

impl Default for StageIntervals {
    fn default() -> Self {
        Self {
            verify: 10,
            swap: 10,
            stabilize: 30,
            retry: 60,
            replace: 60,
            recall: 30,
            big_value: 60,
            audit: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Address whose signatures are accepted on admin commands
    pub address: String,
    #[serde(default = "default_admin_max_past_secs")]
    pub max_past_secs: i64,
    #[serde(default = "default_admin_max_future_secs")]
    pub max_future_secs: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SigningConfig {
    /// JSON-RPC endpoint of the signing coordinator
    pub rpc_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// Confirmations before a payout counts as stable; defaults per chain id
    #[serde(default)]
    pub confirmations: Option<u64>,
    #[serde(default = "default_gas_price_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    /// Gas price increase applied to a replacement, in percent
    #[serde(default = "default_replace_fee_bump_percent")]
    pub replace_fee_bump_percent: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

impl ChainConfig {
    pub fn required_confirmations(&self) -> u64 {
        self.confirmations
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

/// One side of a pair
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Key into `chains`
    pub chain: String,
    /// Address deposits are sent to on this chain
    pub deposit_address: String,
    /// Address payouts on this chain are sent from
    pub signer_address: String,
    /// Name of the environment variable holding the signer's private key.
    /// Without it payouts are signed by the signing coordinator.
    #[serde(default)]
    pub private_key_env: Option<String>,
    #[serde(deserialize_with = "amount::deserialize")]
    pub min_swap: u128,
    #[serde(deserialize_with = "amount::deserialize")]
    pub max_swap: u128,
    #[serde(deserialize_with = "amount::deserialize")]
    pub big_value_threshold: u128,
    #[serde(default)]
    pub fee_rate_bps: u32,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub min_fee: u128,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub max_fee: u128,
    #[serde(default)]
    pub allow_script_hash_recall: bool,
    #[serde(default)]
    pub require_registered_sender: bool,
    /// Confirmations a payout on this side needs; the chain's when unset
    #[serde(default)]
    pub confirmations: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub source: TokenConfig,
    pub destination: TokenConfig,
    /// Seconds an outbound tx may stay unmined before it is replaced; 0 disables
    #[serde(default = "default_replace_after_secs")]
    pub replace_after_secs: u64,
    #[serde(default = "default_max_replace_count")]
    pub max_replace_count: usize,
    /// Seconds after which a recallable deposit is recalled automatically
    #[serde(default)]
    pub recall_after_secs: Option<u64>,
}

/// Resolved chain sides of a pair for one direction
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    /// Chain the deposit is made on
    pub from: &'a TokenConfig,
    /// Chain the payout is made on
    pub to: &'a TokenConfig,
}

impl PairConfig {
    /// Swap-in moves value from source to destination, swap-out the reverse
    pub fn route(&self, direction: SwapDirection) -> Route<'_> {
        match direction {
            SwapDirection::SwapIn => Route {
                from: &self.source,
                to: &self.destination,
            },
            SwapDirection::SwapOut => Route {
                from: &self.destination,
                to: &self.source,
            },
        }
    }

    pub fn replace_enabled(&self) -> bool {
        self.replace_after_secs > 0
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_ROUTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings = toml::from_str(&config_str)
            .with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            anyhow::bail!("At least one pair must be configured");
        }

        for (name, chain) in &self.chains {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        for (id, pair) in &self.pairs {
            if pair.source.chain == pair.destination.chain {
                anyhow::bail!("Pair {} must bridge two different chains", id);
            }
            for token in [&pair.source, &pair.destination] {
                if !self.chains.contains_key(&token.chain) {
                    anyhow::bail!("Pair {} references unknown chain {}", id, token.chain);
                }
                if token.min_swap > token.max_swap {
                    anyhow::bail!(
                        "Pair {} on chain {}: min_swap exceeds max_swap",
                        id,
                        token.chain
                    );
                }
                if token.big_value_threshold > token.max_swap {
                    anyhow::bail!(
                        "Pair {} on chain {}: big_value_threshold exceeds max_swap",
                        id,
                        token.chain
                    );
                }
                if token.max_fee > 0 && token.min_fee > token.max_fee {
                    anyhow::bail!(
                        "Pair {} on chain {}: min_fee exceeds max_fee",
                        id,
                        token.chain
                    );
                }
            }
            if pair.replace_enabled() && pair.max_replace_count == 0 {
                anyhow::bail!(
                    "Pair {} enables replacement but max_replace_count is 0",
                    id
                );
            }
        }

        if self.admin.max_past_secs <= 0 || self.admin.max_future_secs < 0 {
            anyhow::bail!("Admin command window must be positive");
        }

        Ok(())
    }

    pub fn pair(&self, pair_id: &str) -> Option<&PairConfig> {
        self.pairs.get(pair_id)
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.get(name)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Token amounts in base units. TOML integers stop at i64, so larger
/// amounts are written as decimal strings.
mod amount {
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAmount {
        Int(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        match RawAmount::deserialize(deserializer)? {
            RawAmount::Int(v) => Ok(v as u128),
            RawAmount::Text(s) => s.trim().parse::<u128>().map_err(de::Error::custom),
        }
    }
}

fn default_scan_delay_secs() -> u64 {
    5
}

fn default_lifetime_secs() -> u64 {
    7 * 24 * 3600
}

fn default_replace_lifetime_secs() -> u64 {
    2 * 24 * 3600
}

fn default_retry_cool_down_secs() -> u64 {
    300
}

fn default_big_value_hold_secs() -> u64 {
    600
}

fn default_sign_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 60,
        backoff_ms: 2_000,
    }
}

fn default_send_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        backoff_ms: 1_000,
    }
}

fn default_rpc_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        backoff_ms: 500,
    }
}

fn default_signer_queue_capacity() -> usize {
    16
}

fn default_history_limit() -> usize {
    20
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_admin_max_past_secs() -> i64 {
    120
}

fn default_admin_max_future_secs() -> i64 {
    30
}

fn default_gas_price_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Legacy
}

fn default_replace_fee_bump_percent() -> u64 {
    10
}

fn default_gas_limit() -> u64 {
    90_000
}

fn default_replace_after_secs() -> u64 {
    300
}

fn default_max_replace_count() -> usize {
    20
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
[router]
instance_id = "router-test"

[database]
url = "memory://"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[admin]
address = "0x0000000000000000000000000000000000000001"

[chains.eth]
chain_id = 1
rpc_urls = ["${SWAP_ROUTER_TEST_RPC}"]
confirmations = 12
max_gas_price_gwei = 200

[chains.bsc]
chain_id = 56
rpc_urls = ["http://localhost:8546"]
max_gas_price_gwei = 20

[pairs.USDT]
replace_after_secs = 600
max_replace_count = 3

[pairs.USDT.source]
chain = "eth"
deposit_address = "0x00000000000000000000000000000000000000aa"
signer_address = "0x00000000000000000000000000000000000000bb"
min_swap = 10
max_swap = "1000000000000000000000"
big_value_threshold = 500000
fee_rate_bps = 10
min_fee = 1
max_fee = 100

[pairs.USDT.destination]
chain = "bsc"
deposit_address = "0x00000000000000000000000000000000000000cc"
signer_address = "0x00000000000000000000000000000000000000dd"
min_swap = 10
max_swap = 1000000
big_value_threshold = 500000
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("SWAP_ROUTER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${SWAP_ROUTER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn loads_sample_file() {
        env::set_var("SWAP_ROUTER_TEST_RPC", "http://localhost:8545");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.router.intervals.verify, 10);
        assert_eq!(settings.admin.max_past_secs, 120);
        assert_eq!(settings.admin.max_future_secs, 30);
        assert_eq!(settings.chains["eth"].rpc_urls, vec!["http://localhost:8545"]);
        assert_eq!(settings.chains["eth"].required_confirmations(), 12);
        assert_eq!(settings.chains["bsc"].required_confirmations(), 15);

        let pair = settings.pair("USDT").unwrap();
        assert_eq!(pair.max_replace_count, 3);
        assert_eq!(pair.source.max_swap, 1_000_000_000_000_000_000_000);
        assert_eq!(pair.route(SwapDirection::SwapIn).to.chain, "bsc");
        assert_eq!(pair.route(SwapDirection::SwapOut).to.chain, "eth");
    }

    #[test]
    fn rejects_unknown_chain_and_inverted_limits() {
        let mut settings: Settings = toml::from_str(SAMPLE).unwrap();
        settings.pairs.get_mut("USDT").unwrap().destination.chain = "tron".into();
        assert!(settings.validate().is_err());

        let mut settings: Settings = toml::from_str(SAMPLE).unwrap();
        settings.pairs.get_mut("USDT").unwrap().destination.min_swap = 2_000_000;
        assert!(settings.validate().is_err());

        let mut settings: Settings = toml::from_str(SAMPLE).unwrap();
        settings.pairs.get_mut("USDT").unwrap().max_replace_count = 0;
        assert!(settings.validate().is_err());

        let mut settings: Settings = toml::from_str(SAMPLE).unwrap();
        settings.pairs.clear();
        assert!(settings.validate().is_err());
    }
}
