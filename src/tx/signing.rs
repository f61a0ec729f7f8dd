//! Signing coordinator client
//!
//! The coordinator is an external threshold-signing service. A payout digest
//! is submitted once, then its status is polled until the signature is
//! ready, the request is rejected, or the retry policy runs out.

use super::RetryPolicy;
use crate::error::{SwapError, SwapResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use serde::Deserialize;
use tracing::{debug, info};

/// State of one signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignStatus {
    Pending,
    Signed(Vec<u8>),
    Rejected(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SigningCoordinator: Send + Sync {
    /// Submit a digest for `signer`; returns the request key
    async fn submit(
        &self,
        signer: &str,
        message: [u8; 32],
        context: serde_json::Value,
    ) -> SwapResult<String>;

    async fn status(&self, key_id: &str) -> SwapResult<SignStatus>;
}

/// Coordinator reached over JSON-RPC
pub struct RpcSigningCoordinator {
    provider: Provider<Http>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct SignStatusResponse {
    status: String,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl RpcSigningCoordinator {
    pub fn new(url: &str) -> SwapResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| SwapError::Config(format!("Invalid signing coordinator URL: {}", e)))?;
        info!("Signing coordinator at {}", url);
        Ok(Self { provider })
    }

    fn rpc_error(e: impl std::fmt::Display) -> SwapError {
        SwapError::ChainConnection {
            chain: "signing-coordinator".to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl SigningCoordinator for RpcSigningCoordinator {
    async fn submit(
        &self,
        signer: &str,
        message: [u8; 32],
        context: serde_json::Value,
    ) -> SwapResult<String> {
        let params = (
            signer.to_string(),
            format!("0x{}", hex::encode(message)),
            context,
        );
        self.provider
            .request::<_, String>("dcrm_sign", params)
            .await
            .map_err(Self::rpc_error)
    }

    async fn status(&self, key_id: &str) -> SwapResult<SignStatus> {
        let response: SignStatusResponse = self
            .provider
            .request("dcrm_getSignStatus", [key_id.to_string()])
            .await
            .map_err(Self::rpc_error)?;

        match response.status.as_str() {
            "pending" => Ok(SignStatus::Pending),
            "success" => {
                let signature = response.signature.ok_or_else(|| {
                    SwapError::SigningRejected("coordinator returned no signature".to_string())
                })?;
                let bytes = hex::decode(signature.trim_start_matches("0x"))
                    .map_err(|e| SwapError::SigningRejected(e.to_string()))?;
                Ok(SignStatus::Signed(bytes))
            }
            "failure" | "timeout" => Ok(SignStatus::Rejected(
                response.error.unwrap_or(response.status),
            )),
            other => Err(SwapError::SigningRejected(format!(
                "unknown sign status {}",
                other
            ))),
        }
    }
}

/// Submit a digest and wait for its signature
pub async fn sign_with_coordinator(
    coordinator: &dyn SigningCoordinator,
    policy: &RetryPolicy,
    signer: &str,
    message: [u8; 32],
    context: serde_json::Value,
) -> SwapResult<Vec<u8>> {
    let key_id = coordinator.submit(signer, message, context).await?;
    debug!("Submitted signing request {} for {}", key_id, signer);

    let result = policy
        .poll("signature", || async {
            match coordinator.status(&key_id).await? {
                SignStatus::Pending => Ok(None),
                SignStatus::Signed(signature) => Ok(Some(signature)),
                SignStatus::Rejected(reason) => Err(SwapError::SigningRejected(reason)),
            }
        })
        .await;

    match result {
        Err(SwapError::Timeout { .. }) => Err(SwapError::SigningTimeout {
            attempts: policy.max_attempts,
        }),
        other => other,
    }
}
