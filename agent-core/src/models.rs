//! The data model, described in spec §3: entities are modeled as plain
//! `Clone`-able structs moved around by value between components and the
//! repository, the same way the teacher's `Payment` / `BasicPayment` types
//! are passed between `PaymentsManager` and its persister.

use serde::{Deserialize, Serialize};

use crate::{amount::Amount, clock::TimestampMs};

// --- PremiumRequest --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    PaymentRequired,
    Paid,
    Fulfilled,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Fulfilled | RequestStatus::Failed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PremiumRequest {
    pub id: String,
    pub endpoint: String,
    pub status: RequestStatus,
    pub amount: Amount,
    pub currency: String,
    pub facilitator_url: String,
    /// The confirmed chain signature, once the request has been paid.
    /// Immutable once set.
    pub payment_hash: Option<String>,
    /// The opaque premium payload, attached once the request is fulfilled.
    pub data_payload: Option<serde_json::Value>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    /// Optimistic-concurrency version, bumped on every update. Mirrors the
    /// version counter a relational repository would enforce via a
    /// conditional `WHERE version = ?` update.
    pub version: u64,
}

// --- Payment --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub request_id: String,
    pub tx_hash: String,
    pub amount: Amount,
    pub currency: String,
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub confirmed_at: Option<TimestampMs>,
    pub created_at: TimestampMs,
    pub version: u64,
}

// --- SessionCapability --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Expired,
    Exhausted,
    Revoked,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionCapability {
    pub id: String,
    pub wallet_key: String,
    pub session_key: String,
    pub nonce: u64,
    pub max_signatures: u32,
    pub signatures_used: u32,
    pub status: SessionStatus,
    pub expires_at: TimestampMs,
    pub version: u64,
}

impl SessionCapability {
    pub fn is_usable(&self, now: TimestampMs) -> bool {
        self.status == SessionStatus::Active
            && now < self.expires_at
            && self.signatures_used < self.max_signatures
    }
}

// --- AutonomyTask --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Idle,
    Running,
    Backoff,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutonomyTask {
    pub endpoint: String,
    pub value_score: f64,
    pub cost: f64,
    pub freshness_window_secs: u64,
    pub base_backoff_secs: u64,
    pub status: TaskStatus,
    pub last_run_at: Option<TimestampMs>,
    pub last_success_at: Option<TimestampMs>,
    pub failure_count: u32,
    pub next_eligible_at: TimestampMs,
    pub locked_at: Option<TimestampMs>,
    pub last_error: Option<String>,
    pub last_score: Option<f64>,
    pub version: u64,
}

// --- BalanceSnapshot --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceStatus {
    Ok,
    Low,
    Error,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub id: String,
    pub balance: Amount,
    pub threshold: Amount,
    pub status: BalanceStatus,
    /// Where this sample came from: `"poll"` or `"payment"`.
    pub source: String,
    pub sampled_at: TimestampMs,
}

impl BalanceSnapshot {
    pub fn derive_status(balance: Amount, threshold: Amount) -> BalanceStatus {
        if balance.as_decimal() < threshold.as_decimal() {
            BalanceStatus::Low
        } else {
            BalanceStatus::Ok
        }
    }
}

// --- SystemState --- //

use crate::error::PauseReason;

#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub payments_paused: bool,
    pub pause_reason: Option<PauseReason>,
}

// --- LedgerEntry --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerCategory {
    Request,
    Payment,
    Balance,
    System,
    Autonomy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub timestamp: TimestampMs,
    pub category: LedgerCategory,
    pub event: String,
    pub request_id: Option<String>,
    pub payment_id: Option<String>,
    pub tx_hash: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
