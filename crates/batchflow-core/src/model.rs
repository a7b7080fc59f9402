//! Row shapes for the entities persisted by `batchflow-store` (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryConfig;
use crate::state::{BatchState, RequestState, StateMachine};

/// A provider-submission unit grouping requests for one `(model, endpoint)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub model: String,
    pub endpoint: String,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub provider_input_file_id: Option<String>,
    pub provider_batch_id: Option<String>,
    pub provider_output_file_id: Option<String>,
    pub provider_error_file_id: Option<String>,

    pub request_count: i64,
    pub size_bytes: i64,
    pub estimated_input_tokens_total: i64,

    pub provider_requests_total: i64,
    pub provider_requests_completed: i64,
    pub provider_requests_failed: i64,

    pub input_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub output_tokens: Option<i64>,

    pub waiting_since_at: Option<DateTime<Utc>>,
    pub wait_reason: Option<WaitReason>,
    pub token_limit_retry_attempts: i32,
    pub token_limit_retry_next_at: Option<DateTime<Utc>>,
    pub token_limit_retry_last_error: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,

    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// True once no further transition (other than an operator redeliver)
    /// is possible.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    InsufficientHeadroom,
    TokenLimitBackoff,
}

impl WaitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientHeadroom => "insufficient_headroom",
            Self::TokenLimitBackoff => "token_limit_backoff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insufficient_headroom" => Some(Self::InsufficientHeadroom),
            "token_limit_backoff" => Some(Self::TokenLimitBackoff),
            _ => None,
        }
    }
}

/// One inference unit, owned by exactly one `Batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub batch_id: i64,
    pub custom_id: String,
    pub endpoint: String,
    pub model: String,
    pub state: RequestState,
    pub request_payload_bytes: Vec<u8>,
    pub request_payload_size: i64,
    pub estimated_input_tokens: i64,
    pub delivery_config: DeliveryConfig,
    pub response_payload: Option<String>,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One executed attempt of pushing a request's response to its sink,
/// recorded immutably even on failure (spec glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub request_id: i64,
    pub attempt_number: i32,
    pub outcome: DeliveryOutcome,
    pub error_msg: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    HttpStatusNot2xx,
    ConnectionError,
    Timeout,
    QueueNotFound,
    ExchangeNotFound,
    Other,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpStatusNot2xx => "http_status_not_2xx",
            Self::ConnectionError => "connection_error",
            Self::Timeout => "timeout",
            Self::QueueNotFound => "queue_not_found",
            Self::ExchangeNotFound => "exchange_not_found",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => Self::Success,
            "http_status_not_2xx" => Self::HttpStatusNot2xx,
            "connection_error" => Self::ConnectionError,
            "timeout" => Self::Timeout,
            "queue_not_found" => Self::QueueNotFound,
            "exchange_not_found" => Self::ExchangeNotFound,
            "other" => Self::Other,
            _ => return None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// An audit row written for every successful state change (spec §3).
/// `from_state = None` records creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: i64,
    pub entity_kind: String,
    pub entity_id: i64,
    pub from_state: Option<String>,
    pub to_state: String,
    pub at: DateTime<Utc>,
}
