//! Authenticated administrative commands
//!
//! A command is signed by the configured administrator over the keccak256
//! digest of its canonical JSON form (`method`, `params`, `timestamp`, keys
//! sorted). Commands outside the timestamp window and digests already seen
//! inside the window are refused.

use crate::config::AdminConfig;
use crate::error::{SwapError, SwapResult};
use crate::ledger::{AddressListing, IntentStatus, Ledger, SwapKey};
use crate::stages::request_recall;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, Signature};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Operations the administrator can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminMethod {
    AllowAddress,
    DenyAddress,
    ReleaseBigValue,
    ReleaseRecallable,
    Recall,
}

impl AdminMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminMethod::AllowAddress => "allow_address",
            AdminMethod::DenyAddress => "deny_address",
            AdminMethod::ReleaseBigValue => "release_big_value",
            AdminMethod::ReleaseRecallable => "release_recallable",
            AdminMethod::Recall => "recall",
        }
    }
}

impl fmt::Display for AdminMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdminMethod {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow_address" => Ok(AdminMethod::AllowAddress),
            "deny_address" => Ok(AdminMethod::DenyAddress),
            "release_big_value" => Ok(AdminMethod::ReleaseBigValue),
            "release_recallable" => Ok(AdminMethod::ReleaseRecallable),
            "recall" => Ok(AdminMethod::Recall),
            other => Err(SwapError::Admin(format!("unknown method {}", other))),
        }
    }
}

/// A signed administrative command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCommand {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Unix seconds
    pub timestamp: i64,
    /// 65-byte recoverable signature, hex encoded
    pub signature: String,
}

impl AdminCommand {
    /// keccak256 of the canonical JSON the administrator signs
    pub fn digest(&self) -> SwapResult<[u8; 32]> {
        let canonical = serde_json::json!({
            "method": self.method,
            "params": self.params,
            "timestamp": self.timestamp,
        });
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Keccak256::digest(&bytes).into())
    }
}

#[derive(Debug, Deserialize)]
struct AddressParams {
    address: String,
}

/// Result of an accepted command
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdminOutcome {
    pub method: String,
    pub message: String,
}

pub struct AdminService {
    admin: Address,
    max_past_secs: i64,
    max_future_secs: i64,
    ledger: Ledger,
    /// Accepted digests and their command timestamps
    seen: DashMap<[u8; 32], i64>,
}

impl AdminService {
    pub fn new(config: &AdminConfig, ledger: Ledger) -> SwapResult<Self> {
        let admin = Address::from_str(&config.address).map_err(|e| {
            SwapError::Config(format!("invalid admin address {}: {}", config.address, e))
        })?;

        Ok(Self {
            admin,
            max_past_secs: config.max_past_secs,
            max_future_secs: config.max_future_secs,
            ledger,
            seen: DashMap::new(),
        })
    }

    /// Authenticate and run one command
    pub async fn execute(
        &self,
        command: &AdminCommand,
        now: DateTime<Utc>,
    ) -> SwapResult<AdminOutcome> {
        let result = match self.authenticate(command, now) {
            Ok(method) => self.dispatch(method, &command.params, now).await,
            Err(e) => Err(e),
        };

        crate::metrics::record_admin_command(&command.method, result.is_ok());
        match &result {
            Ok(outcome) => info!("Admin {}: {}", outcome.method, outcome.message),
            Err(e) => warn!("Admin command {} refused: {}", command.method, e),
        }
        result
    }

    fn authenticate(&self, command: &AdminCommand, now: DateTime<Utc>) -> SwapResult<AdminMethod> {
        let method = AdminMethod::from_str(&command.method)?;

        let age = now
            .timestamp()
            .checked_sub(command.timestamp)
            .ok_or_else(|| SwapError::Admin(format!("bad timestamp {}", command.timestamp)))?;
        if age > self.max_past_secs {
            return Err(SwapError::Admin(format!("command is {}s old", age)));
        }
        let ahead = age.saturating_neg();
        if ahead > self.max_future_secs {
            return Err(SwapError::Admin(format!(
                "command is {}s in the future",
                ahead
            )));
        }

        let digest = command.digest()?;
        let signature = Signature::from_str(&command.signature)
            .map_err(|e| SwapError::Admin(format!("malformed signature: {}", e)))?;
        let signer = signature
            .recover(digest.to_vec())
            .map_err(|e| SwapError::Admin(format!("unrecoverable signature: {}", e)))?;
        if signer != self.admin {
            return Err(SwapError::Admin(format!(
                "{:?} is not the administrator",
                signer
            )));
        }

        let oldest = now.timestamp().saturating_sub(self.max_past_secs);
        self.seen.retain(|_, timestamp| *timestamp >= oldest);
        match self.seen.entry(digest) {
            Entry::Occupied(_) => Err(SwapError::Admin("command replayed".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(command.timestamp);
                Ok(method)
            }
        }
    }

    async fn dispatch(
        &self,
        method: AdminMethod,
        params: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> SwapResult<AdminOutcome> {
        let approved_by = format!("{:?}", self.admin);

        let message = match method {
            AdminMethod::AllowAddress | AdminMethod::DenyAddress => {
                let params: AddressParams = parse_params(method, params)?;
                let listing = if method == AdminMethod::AllowAddress {
                    AddressListing::Allowed
                } else {
                    AddressListing::Denied
                };
                self.ledger
                    .set_address_listing(&params.address, listing, now)
                    .await?;
                format!("{} {}", params.address, listing.as_str())
            }
            AdminMethod::ReleaseBigValue => {
                let key: SwapKey = parse_params(method, params)?;
                let intent = self.ledger.get_intent(&key).await?;
                if intent.status != IntentStatus::WithBigValue {
                    return Err(SwapError::InvalidStateTransition {
                        from: intent.status.to_string(),
                        to: "big value release".to_string(),
                    });
                }
                if self.ledger.release_big_value(&key, &approved_by, now).await? {
                    format!("{} released", key)
                } else {
                    format!("{} already released", key)
                }
            }
            AdminMethod::ReleaseRecallable => {
                let key: SwapKey = parse_params(method, params)?;
                let memo = format!("released by {}", approved_by);
                self.ledger
                    .transition_intent(&key, IntentStatus::NotSwapped, &memo, now)
                    .await?;
                format!("{} released for swap", key)
            }
            AdminMethod::Recall => {
                let key: SwapKey = parse_params(method, params)?;
                let memo = format!("recall requested by {}", approved_by);
                request_recall(&self.ledger, &key, &memo, now).await?;
                format!("{} marked for recall", key)
            }
        };

        Ok(AdminOutcome {
            method: method.to_string(),
            message,
        })
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    method: AdminMethod,
    params: &serde_json::Value,
) -> SwapResult<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| SwapError::Admin(format!("bad params for {}: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SwapDirection, SwapIntent, TxType};
    use ethers::signers::{LocalWallet, Signer};

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const OTHER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn wallet() -> LocalWallet {
        KEY.parse().unwrap()
    }

    fn service(ledger: Ledger) -> AdminService {
        let config = AdminConfig {
            address: format!("{:?}", wallet().address()),
            max_past_secs: 120,
            max_future_secs: 30,
        };
        AdminService::new(&config, ledger).unwrap()
    }

    async fn signed(
        wallet: &LocalWallet,
        method: &str,
        params: serde_json::Value,
        timestamp: i64,
    ) -> AdminCommand {
        let mut command = AdminCommand {
            method: method.to_string(),
            params,
            timestamp,
            signature: String::new(),
        };
        let digest = command.digest().unwrap();
        let signature = wallet.sign_message(digest).await.unwrap();
        command.signature = signature.to_string();
        command
    }

    fn key() -> SwapKey {
        SwapKey::new(SwapDirection::SwapIn, "tx999", "P", "0xbind")
    }

    fn key_params() -> serde_json::Value {
        serde_json::to_value(key()).unwrap()
    }

    #[tokio::test]
    async fn deny_address_is_recorded() {
        let ledger = Ledger::in_memory();
        let admin = service(ledger.clone());
        let now = Utc::now();

        let command = signed(
            &wallet(),
            "deny_address",
            serde_json::json!({ "address": "0xABCD" }),
            now.timestamp(),
        )
        .await;
        admin.execute(&command, now).await.unwrap();

        assert_eq!(
            ledger.get_address_listing("0xabcd").await.unwrap(),
            Some(AddressListing::Denied)
        );
    }

    #[tokio::test]
    async fn replayed_command_is_refused() {
        let admin = service(Ledger::in_memory());
        let now = Utc::now();
        let command = signed(
            &wallet(),
            "allow_address",
            serde_json::json!({ "address": "0x01" }),
            now.timestamp(),
        )
        .await;

        admin.execute(&command, now).await.unwrap();
        let err = admin.execute(&command, now).await.unwrap_err();
        assert!(matches!(err, SwapError::Admin(_)));
    }

    #[tokio::test]
    async fn stale_and_future_commands_are_refused() {
        let admin = service(Ledger::in_memory());
        let now = Utc::now();
        let params = serde_json::json!({ "address": "0x01" });

        let ts = now.timestamp();

        let stale = signed(&wallet(), "allow_address", params.clone(), ts - 121).await;
        assert!(admin.execute(&stale, now).await.is_err());

        let future = signed(&wallet(), "allow_address", params.clone(), ts + 31).await;
        assert!(admin.execute(&future, now).await.is_err());

        let edge = signed(&wallet(), "allow_address", params, ts - 120).await;
        assert!(admin.execute(&edge, now).await.is_ok());
    }

    #[tokio::test]
    async fn extreme_timestamps_are_refused() {
        let admin = service(Ledger::in_memory());
        let now = Utc::now();
        let params = serde_json::json!({ "address": "0x01" });

        for ts in [i64::MIN, i64::MAX] {
            let command = signed(&wallet(), "allow_address", params.clone(), ts).await;
            let err = admin.execute(&command, now).await.unwrap_err();
            assert_eq!(err.status(), "unauthorized", "timestamp {}", ts);
        }
    }

    #[tokio::test]
    async fn other_signers_are_refused() {
        let admin = service(Ledger::in_memory());
        let now = Utc::now();
        let intruder: LocalWallet = OTHER_KEY.parse().unwrap();

        let command = signed(
            &intruder,
            "allow_address",
            serde_json::json!({ "address": "0x01" }),
            now.timestamp(),
        )
        .await;
        let err = admin.execute(&command, now).await.unwrap_err();
        assert_eq!(err.status(), "unauthorized");
    }

    #[tokio::test]
    async fn tampered_params_fail_authentication() {
        let ledger = Ledger::in_memory();
        let admin = service(ledger.clone());
        let now = Utc::now();

        let mut command = signed(
            &wallet(),
            "allow_address",
            serde_json::json!({ "address": "0x01" }),
            now.timestamp(),
        )
        .await;
        command.params = serde_json::json!({ "address": "0x02" });

        assert!(admin.execute(&command, now).await.is_err());
        assert_eq!(ledger.get_address_listing("0x02").await.unwrap(), None);
    }

    #[tokio::test]
    async fn big_value_release_requires_held_intent() {
        let ledger = Ledger::in_memory();
        let admin = service(ledger.clone());
        let now = Utc::now();
        ledger
            .register_intent(&SwapIntent::new(key(), TxType::Plain, now))
            .await
            .unwrap();

        let ts = now.timestamp();
        let command = signed(&wallet(), "release_big_value", key_params(), ts).await;
        let err = admin.execute(&command, now).await.unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));
        assert!(ledger.find_big_value_release(&key()).await.unwrap().is_none());

        ledger
            .transition_intent(&key(), IntentStatus::WithBigValue, "", now)
            .await
            .unwrap();
        let command = signed(
            &wallet(),
            "release_big_value",
            key_params(),
            now.timestamp() - 1,
        )
        .await;
        admin.execute(&command, now).await.unwrap();

        let release = ledger.find_big_value_release(&key()).await.unwrap().unwrap();
        assert_eq!(release.approved_by, format!("{:?}", wallet().address()));
        // Release alone does not move the intent
        assert_eq!(
            ledger.get_intent(&key()).await.unwrap().status,
            IntentStatus::WithBigValue
        );
    }

    #[tokio::test]
    async fn recallable_deposit_can_be_recalled_or_released() {
        let ledger = Ledger::in_memory();
        let admin = service(ledger.clone());
        let now = Utc::now();
        ledger
            .register_intent(&SwapIntent::new(key(), TxType::ScriptHash, now))
            .await
            .unwrap();
        ledger
            .transition_intent(&key(), IntentStatus::CanRecall, "", now)
            .await
            .unwrap();

        let command = signed(&wallet(), "recall", key_params(), now.timestamp()).await;
        let outcome = admin.execute(&command, now).await.unwrap();
        assert_eq!(outcome.method, "recall");
        assert_eq!(
            ledger.get_intent(&key()).await.unwrap().status,
            IntentStatus::ToBeRecalled
        );

        // No longer recallable
        let command = signed(
            &wallet(),
            "release_recallable",
            key_params(),
            now.timestamp(),
        )
        .await;
        assert!(admin.execute(&command, now).await.is_err());
    }

    #[tokio::test]
    async fn unknown_method_is_refused() {
        let admin = service(Ledger::in_memory());
        let now = Utc::now();
        let params = serde_json::json!({});
        let command = signed(&wallet(), "drain", params, now.timestamp()).await;
        assert!(admin.execute(&command, now).await.is_err());
    }
}
