//! Error types for the swap router

use crate::ledger::IntentStatus;

use thiserror::Error;

/// Classified outcome of verifying a deposit on its source chain.
///
/// Every variant maps to exactly one intent status, except the two
/// "try again later" variants which leave the intent untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("deposit was not sent to the deposit address: {0}")]
    WrongReceiver(String),

    #[error("deposit value is out of range: {0}")]
    WrongValue(String),

    #[error("deposit sender is not acceptable: {0}")]
    WrongSender(String),

    #[error("deposit memo is wrong or missing: {0}")]
    WrongMemo(String),

    #[error("deposit sender {0} is not registered")]
    SenderNotRegistered(String),

    #[error("deposit value {value} exceeds big value threshold {threshold}")]
    ValueTooLarge { value: u128, threshold: u128 },

    #[error("transaction is not stable yet")]
    TxNotStable,

    #[error("transaction not found")]
    TxNotFound,
}

impl VerifyError {
    /// Whether the intent should simply be polled again next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, VerifyError::TxNotStable | VerifyError::TxNotFound)
    }

    /// Fixed lookup from verify failure to intent status
    pub fn intent_status(&self) -> Option<IntentStatus> {
        match self {
            VerifyError::WrongReceiver(_) => Some(IntentStatus::VerifyFailed),
            VerifyError::WrongValue(_) => Some(IntentStatus::WithWrongValue),
            VerifyError::WrongSender(_) => Some(IntentStatus::WithWrongSender),
            VerifyError::WrongMemo(_) => Some(IntentStatus::WithWrongMemo),
            VerifyError::SenderNotRegistered(_) => Some(IntentStatus::SenderNotRegistered),
            VerifyError::ValueTooLarge { .. } => Some(IntentStatus::WithBigValue),
            VerifyError::TxNotStable | VerifyError::TxNotFound => None,
        }
    }
}

/// Main error type for the router
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Chain {chain} not found")]
    ChainNotFound { chain: String },

    #[error("Pair {pair_id} not found")]
    PairNotFound { pair_id: String },

    #[error("Verify error: {0}")]
    Verify(#[from] VerifyError),

    #[error("Build transaction error: {0}")]
    Build(String),

    #[error("Signing timed out after {attempts} attempts")]
    SigningTimeout { attempts: u32 },

    #[error("Signing rejected: {0}")]
    SigningRejected(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Transaction {tx_hash} accepted but not visible")]
    NotVisible { tx_hash: String },

    #[error("Nonce error for chain {chain}: {message}")]
    Nonce { chain: String, message: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Nonce already reserved for {key}: have {have}, got {got}")]
    NonceAlreadyReserved { key: String, have: u64, got: u64 },

    #[error("Record {key} not found")]
    RecordNotFound { key: String },

    #[error("Admin command rejected: {0}")]
    Admin(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SwapError::ChainConnection { .. } | SwapError::Timeout { .. } => true,
            SwapError::Verify(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short status string for the operator API
    pub fn status(&self) -> &'static str {
        match self {
            SwapError::Verify(_) => "verify_failed",
            SwapError::PairNotFound { .. } | SwapError::ChainNotFound { .. } => "not_supported",
            SwapError::RecordNotFound { .. } => "not_found",
            SwapError::Admin(_) => "unauthorized",
            SwapError::InvalidRequest(_) => "bad_request",
            SwapError::InvalidStateTransition { .. } => "invalid_state",
            _ => "error",
        }
    }
}

impl From<serde_json::Error> for SwapError {
    fn from(e: serde_json::Error) -> Self {
        SwapError::Internal(e.to_string())
    }
}

/// Result type for router operations
pub type SwapResult<T> = Result<T, SwapError>;
