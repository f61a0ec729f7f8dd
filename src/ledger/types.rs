//! Record types stored in the swap ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of value movement relative to the pair's source chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapDirection {
    SwapIn,
    SwapOut,
}

impl SwapDirection {
    pub const ALL: [SwapDirection; 2] = [SwapDirection::SwapIn, SwapDirection::SwapOut];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapDirection::SwapIn => "swapin",
            SwapDirection::SwapOut => "swapout",
        }
    }
}

impl fmt::Display for SwapDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swapin" => Ok(SwapDirection::SwapIn),
            "swapout" => Ok(SwapDirection::SwapOut),
            other => Err(format!("unknown swap direction {}", other)),
        }
    }
}

/// Kind of deposit transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Plain,
    ScriptHash,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Plain => "plain",
            TxType::ScriptHash => "script_hash",
        }
    }
}

impl FromStr for TxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(TxType::Plain),
            "script_hash" => Ok(TxType::ScriptHash),
            other => Err(format!("unknown tx type {}", other)),
        }
    }
}

/// Processing status of an intent record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    NotStable,
    VerifyFailed,
    WithWrongValue,
    WithWrongSender,
    WithWrongMemo,
    SenderNotRegistered,
    WithBigValue,
    NotSwapped,
    CanRecall,
    ToBeRecalled,
    SwapFailed,
    RecallFailed,
    Processed,
}

impl IntentStatus {
    pub const ALL: [IntentStatus; 13] = [
        IntentStatus::NotStable,
        IntentStatus::VerifyFailed,
        IntentStatus::WithWrongValue,
        IntentStatus::WithWrongSender,
        IntentStatus::WithWrongMemo,
        IntentStatus::SenderNotRegistered,
        IntentStatus::WithBigValue,
        IntentStatus::NotSwapped,
        IntentStatus::CanRecall,
        IntentStatus::ToBeRecalled,
        IntentStatus::SwapFailed,
        IntentStatus::RecallFailed,
        IntentStatus::Processed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::NotStable => "not_stable",
            IntentStatus::VerifyFailed => "verify_failed",
            IntentStatus::WithWrongValue => "with_wrong_value",
            IntentStatus::WithWrongSender => "with_wrong_sender",
            IntentStatus::WithWrongMemo => "with_wrong_memo",
            IntentStatus::SenderNotRegistered => "sender_not_registered",
            IntentStatus::WithBigValue => "with_big_value",
            IntentStatus::NotSwapped => "not_swapped",
            IntentStatus::CanRecall => "can_recall",
            IntentStatus::ToBeRecalled => "to_be_recalled",
            IntentStatus::SwapFailed => "swap_failed",
            IntentStatus::RecallFailed => "recall_failed",
            IntentStatus::Processed => "processed",
        }
    }

    /// Forward edges of the intent state machine.
    ///
    /// The retry reset (swap failed -> not swapped, recall failed -> to be
    /// recalled) is absent; it only happens through
    /// [`super::Ledger::reset_for_retry`]. A processed intent whose payout
    /// reverted is reopened only by [`super::Ledger::record_reverted_payout`].
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        match self {
            NotStable => matches!(
                next,
                VerifyFailed
                    | WithWrongValue
                    | WithWrongSender
                    | WithWrongMemo
                    | SenderNotRegistered
                    | WithBigValue
                    | NotSwapped
                    | CanRecall
            ),
            WithBigValue => next == NotSwapped,
            CanRecall => matches!(next, ToBeRecalled | NotSwapped),
            NotSwapped => matches!(next, Processed | SwapFailed),
            ToBeRecalled => matches!(next, Processed | RecallFailed),
            SwapFailed | RecallFailed => next == Processed,
            VerifyFailed | WithWrongValue | WithWrongSender | WithWrongMemo
            | SenderNotRegistered | Processed => false,
        }
    }

    /// Status an intent returns to when a failed attempt is retried
    pub fn retry_target(&self) -> Option<IntentStatus> {
        match self {
            IntentStatus::SwapFailed => Some(IntentStatus::NotSwapped),
            IntentStatus::RecallFailed => Some(IntentStatus::ToBeRecalled),
            _ => None,
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntentStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown intent status {}", s))
    }
}

/// Status of the outbound (match) record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// No outbound transaction yet
    Empty,
    /// Outbound transaction broadcast, not yet confirmed
    NotStable,
    /// Outbound transaction confirmed
    Stable,
    /// Last outbound attempt failed; may be retried
    Failed,
    /// Reserved nonce was consumed by another transaction; never retried
    FailedFinal,
}

impl MatchStatus {
    pub const ALL: [MatchStatus; 5] = [
        MatchStatus::Empty,
        MatchStatus::NotStable,
        MatchStatus::Stable,
        MatchStatus::Failed,
        MatchStatus::FailedFinal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Empty => "empty",
            MatchStatus::NotStable => "not_stable",
            MatchStatus::Stable => "stable",
            MatchStatus::Failed => "failed",
            MatchStatus::FailedFinal => "failed_final",
        }
    }

    /// Forward edges of the match state machine (retry reset excluded)
    pub fn can_transition_to(&self, next: MatchStatus) -> bool {
        use MatchStatus::*;
        match self {
            Empty => matches!(next, NotStable | Failed),
            // Failed only for a payout mined with a reverted receipt
            NotStable => matches!(next, NotStable | Stable | Failed),
            Failed => matches!(next, Failed | FailedFinal | NotStable | Stable),
            Stable | FailedFinal => false,
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown match status {}", s))
    }
}

/// Kind of outbound payout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapType {
    SwapIn,
    SwapOut,
    Recall,
}

impl SwapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapType::SwapIn => "swapin",
            SwapType::SwapOut => "swapout",
            SwapType::Recall => "recall",
        }
    }

    /// Forward payout type for a direction
    pub fn forward(direction: SwapDirection) -> Self {
        match direction {
            SwapDirection::SwapIn => SwapType::SwapIn,
            SwapDirection::SwapOut => SwapType::SwapOut,
        }
    }
}

impl FromStr for SwapType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swapin" => Ok(SwapType::SwapIn),
            "swapout" => Ok(SwapType::SwapOut),
            "recall" => Ok(SwapType::Recall),
            other => Err(format!("unknown swap type {}", other)),
        }
    }
}

/// Unique key of an intent and its match
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapKey {
    pub direction: SwapDirection,
    pub txid: String,
    pub pair_id: String,
    pub bind: String,
}

impl SwapKey {
    pub fn new(
        direction: SwapDirection,
        txid: impl Into<String>,
        pair_id: impl Into<String>,
        bind: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            txid: txid.into(),
            pair_id: pair_id.into(),
            bind: bind.into(),
        }
    }
}

impl fmt::Display for SwapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.direction, self.pair_id, self.txid, self.bind
        )
    }
}

/// One detected deposit and its processing status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapIntent {
    pub key: SwapKey,
    pub tx_type: TxType,
    pub status: IntentStatus,
    pub init_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub memo: String,
}

impl SwapIntent {
    /// A freshly detected deposit
    pub fn new(key: SwapKey, tx_type: TxType, now: DateTime<Utc>) -> Self {
        Self {
            key,
            tx_type,
            status: IntentStatus::NotStable,
            init_time: now,
            timestamp: now,
            memo: String::new(),
        }
    }
}

/// A superseded outbound transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldSwap {
    pub tx_hash: String,
    pub value: u128,
}

/// The outbound payout attempt(s) linked to one intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapMatch {
    pub key: SwapKey,
    pub height: u64,
    pub time: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub value: u128,
    pub swap_tx: String,
    pub old_swap_txs: Vec<String>,
    pub old_swap_vals: Vec<u128>,
    pub swap_height: u64,
    pub swap_time: Option<DateTime<Utc>>,
    pub swap_value: u128,
    pub swap_type: SwapType,
    pub swap_nonce: Option<u64>,
    pub status: MatchStatus,
    pub timestamp: DateTime<Utc>,
}

impl SwapMatch {
    /// Number of times the outbound transaction has been replaced
    pub fn replace_count(&self) -> usize {
        self.old_swap_txs.len()
    }

    /// Current and superseded outbound transaction hashes
    pub fn all_swap_txs(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.swap_tx)
            .filter(|tx| !tx.is_empty())
            .chain(self.old_swap_txs.iter())
    }
}

/// Partial update of a match record.
///
/// `push_old_swap` appends to the replacement history; there is no way to
/// remove entries from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchUpdate {
    pub status: Option<MatchStatus>,
    pub swap_tx: Option<String>,
    pub push_old_swap: Option<OldSwap>,
    pub swap_height: Option<u64>,
    pub swap_time: Option<DateTime<Utc>>,
    pub swap_value: Option<u128>,
    pub swap_type: Option<SwapType>,
    pub swap_nonce: Option<u64>,
}

impl MatchUpdate {
    pub fn status(status: MatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Recorded administrative release of a held big-value intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigValueRelease {
    pub key: SwapKey,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

/// Administrative listing of a source address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressListing {
    Allowed,
    Denied,
}

impl AddressListing {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressListing::Allowed => "allowed",
            AddressListing::Denied => "denied",
        }
    }
}

impl FromStr for AddressListing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(AddressListing::Allowed),
            "denied" => Ok(AddressListing::Denied),
            other => Err(format!("unknown address listing {}", other)),
        }
    }
}
