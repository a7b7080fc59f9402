//! `FromRow` shapes mirroring the `batches`/`requests`/... tables, and their
//! conversion into the typed `batchflow_core` model.

use batchflow_core::{
    Batch, DeliveryAttempt, DeliveryConfig, DeliveryOutcome, Request, RequestState, Transition, WaitReason,
};
use batchflow_core::BatchState;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::{Result, StoreError};

#[derive(Debug, FromRow)]
pub(crate) struct BatchRow {
    pub id: i64,
    pub model: String,
    pub endpoint: String,
    pub state: String,
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
    pub wait_reason: Option<String>,
    pub token_limit_retry_attempts: i32,
    pub token_limit_retry_next_at: Option<DateTime<Utc>>,
    pub token_limit_retry_last_error: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl BatchRow {
    pub(crate) fn into_model(self) -> Result<Batch> {
        let state = BatchState::parse(&self.state).ok_or_else(|| StoreError::InvalidDeliveryConfig(format!("unknown batch state {}", self.state)))?;
        let wait_reason = match self.wait_reason {
            Some(s) => Some(WaitReason::parse(&s).ok_or_else(|| StoreError::InvalidDeliveryConfig(format!("unknown wait_reason {s}")))?),
            None => None,
        };
        Ok(Batch {
            id: self.id,
            model: self.model,
            endpoint: self.endpoint,
            state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            provider_input_file_id: self.provider_input_file_id,
            provider_batch_id: self.provider_batch_id,
            provider_output_file_id: self.provider_output_file_id,
            provider_error_file_id: self.provider_error_file_id,
            request_count: self.request_count,
            size_bytes: self.size_bytes,
            estimated_input_tokens_total: self.estimated_input_tokens_total,
            provider_requests_total: self.provider_requests_total,
            provider_requests_completed: self.provider_requests_completed,
            provider_requests_failed: self.provider_requests_failed,
            input_tokens: self.input_tokens,
            cached_tokens: self.cached_tokens,
            reasoning_tokens: self.reasoning_tokens,
            output_tokens: self.output_tokens,
            waiting_since_at: self.waiting_since_at,
            wait_reason,
            token_limit_retry_attempts: self.token_limit_retry_attempts,
            token_limit_retry_next_at: self.token_limit_retry_next_at,
            token_limit_retry_last_error: self.token_limit_retry_last_error,
            expires_at: self.expires_at,
            error_msg: self.error_msg,
            last_checked_at: self.last_checked_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RequestRow {
    pub id: i64,
    pub batch_id: i64,
    pub custom_id: String,
    pub endpoint: String,
    pub model: String,
    pub state: String,
    pub request_payload_bytes: Vec<u8>,
    pub request_payload_size: i64,
    pub estimated_input_tokens: i64,
    pub delivery_config: serde_json::Value,
    pub response_payload: Option<String>,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRow {
    pub(crate) fn into_model(self) -> Result<Request> {
        let state = RequestState::parse(&self.state)
            .ok_or_else(|| StoreError::InvalidDeliveryConfig(format!("unknown request state {}", self.state)))?;
        let delivery_config = DeliveryConfig::from_value(&self.delivery_config)?;
        Ok(Request {
            id: self.id,
            batch_id: self.batch_id,
            custom_id: self.custom_id,
            endpoint: self.endpoint,
            model: self.model,
            state,
            request_payload_bytes: self.request_payload_bytes,
            request_payload_size: self.request_payload_size,
            estimated_input_tokens: self.estimated_input_tokens,
            delivery_config,
            response_payload: self.response_payload,
            error_msg: self.error_msg,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DeliveryAttemptRow {
    pub id: i64,
    pub request_id: i64,
    pub attempt_number: i32,
    pub outcome: String,
    pub error_msg: Option<String>,
    pub at: DateTime<Utc>,
}

impl DeliveryAttemptRow {
    pub(crate) fn into_model(self) -> Result<DeliveryAttempt> {
        let outcome = DeliveryOutcome::parse(&self.outcome)
            .ok_or_else(|| StoreError::InvalidDeliveryConfig(format!("unknown delivery outcome {}", self.outcome)))?;
        Ok(DeliveryAttempt {
            id: self.id,
            request_id: self.request_id,
            attempt_number: self.attempt_number,
            outcome,
            error_msg: self.error_msg,
            at: self.at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TransitionRow {
    pub id: i64,
    pub entity_kind: String,
    pub entity_id: i64,
    pub from_state: Option<String>,
    pub to_state: String,
    pub at: DateTime<Utc>,
}

impl From<TransitionRow> for Transition {
    fn from(r: TransitionRow) -> Self {
        Transition {
            id: r.id,
            entity_kind: r.entity_kind,
            entity_id: r.entity_id,
            from_state: r.from_state,
            to_state: r.to_state,
            at: r.at,
        }
    }
}
