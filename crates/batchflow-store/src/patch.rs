//! Field updates applied alongside a state transition (the `attrs` argument
//! of `Store::transition`, spec §4.2). Each field is `Option<Option<T>>` so
//! a patch can distinguish "leave unchanged" from "set to NULL".

use batchflow_core::{Batch, Request, WaitReason};
use chrono::{DateTime, Utc};

#[derive(Debug, Default, Clone)]
pub struct BatchPatch {
    pub provider_input_file_id: Option<Option<String>>,
    pub provider_batch_id: Option<Option<String>>,
    pub provider_output_file_id: Option<Option<String>>,
    pub provider_error_file_id: Option<Option<String>>,
    pub provider_requests_total: Option<i64>,
    pub provider_requests_completed: Option<i64>,
    pub provider_requests_failed: Option<i64>,
    pub input_tokens: Option<Option<i64>>,
    pub cached_tokens: Option<Option<i64>>,
    pub reasoning_tokens: Option<Option<i64>>,
    pub output_tokens: Option<Option<i64>>,
    pub waiting_since_at: Option<Option<DateTime<Utc>>>,
    pub wait_reason: Option<Option<WaitReason>>,
    pub token_limit_retry_attempts: Option<i32>,
    pub token_limit_retry_next_at: Option<Option<DateTime<Utc>>>,
    pub token_limit_retry_last_error: Option<Option<String>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub error_msg: Option<Option<String>>,
    pub last_checked_at: Option<Option<DateTime<Utc>>>,
}

impl BatchPatch {
    pub(crate) fn apply(self, batch: &mut Batch) {
        if let Some(v) = self.provider_input_file_id {
            batch.provider_input_file_id = v;
        }
        if let Some(v) = self.provider_batch_id {
            batch.provider_batch_id = v;
        }
        if let Some(v) = self.provider_output_file_id {
            batch.provider_output_file_id = v;
        }
        if let Some(v) = self.provider_error_file_id {
            batch.provider_error_file_id = v;
        }
        if let Some(v) = self.provider_requests_total {
            batch.provider_requests_total = v;
        }
        if let Some(v) = self.provider_requests_completed {
            batch.provider_requests_completed = v;
        }
        if let Some(v) = self.provider_requests_failed {
            batch.provider_requests_failed = v;
        }
        if let Some(v) = self.input_tokens {
            batch.input_tokens = v;
        }
        if let Some(v) = self.cached_tokens {
            batch.cached_tokens = v;
        }
        if let Some(v) = self.reasoning_tokens {
            batch.reasoning_tokens = v;
        }
        if let Some(v) = self.output_tokens {
            batch.output_tokens = v;
        }
        if let Some(v) = self.waiting_since_at {
            batch.waiting_since_at = v;
        }
        if let Some(v) = self.wait_reason {
            batch.wait_reason = v;
        }
        if let Some(v) = self.token_limit_retry_attempts {
            batch.token_limit_retry_attempts = v;
        }
        if let Some(v) = self.token_limit_retry_next_at {
            batch.token_limit_retry_next_at = v;
        }
        if let Some(v) = self.token_limit_retry_last_error {
            batch.token_limit_retry_last_error = v;
        }
        if let Some(v) = self.expires_at {
            batch.expires_at = v;
        }
        if let Some(v) = self.error_msg {
            batch.error_msg = v;
        }
        if let Some(v) = self.last_checked_at {
            batch.last_checked_at = v;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RequestPatch {
    pub response_payload: Option<Option<String>>,
    pub error_msg: Option<Option<String>>,
}

impl RequestPatch {
    pub(crate) fn apply(self, request: &mut Request) {
        if let Some(v) = self.response_payload {
            request.response_payload = v;
        }
        if let Some(v) = self.error_msg {
            request.error_msg = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::{BatchState, DeliveryConfig};
    use chrono::Utc;

    fn sample_batch() -> Batch {
        Batch {
            id: 1,
            model: "gpt-4o".into(),
            endpoint: "/v1/responses".into(),
            state: BatchState::Building,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            provider_input_file_id: None,
            provider_batch_id: None,
            provider_output_file_id: None,
            provider_error_file_id: None,
            request_count: 0,
            size_bytes: 0,
            estimated_input_tokens_total: 0,
            provider_requests_total: 0,
            provider_requests_completed: 0,
            provider_requests_failed: 0,
            input_tokens: None,
            cached_tokens: None,
            reasoning_tokens: None,
            output_tokens: None,
            waiting_since_at: None,
            wait_reason: None,
            token_limit_retry_attempts: 0,
            token_limit_retry_next_at: None,
            token_limit_retry_last_error: None,
            expires_at: None,
            error_msg: None,
            last_checked_at: None,
        }
    }

    #[test]
    fn untouched_fields_are_left_alone() {
        let mut b = sample_batch();
        b.provider_batch_id = Some("existing".into());
        let patch = BatchPatch { error_msg: Some(Some("boom".into())), ..Default::default() };
        patch.apply(&mut b);
        assert_eq!(b.provider_batch_id.as_deref(), Some("existing"));
        assert_eq!(b.error_msg.as_deref(), Some("boom"));
    }

    #[test]
    fn explicit_none_clears_a_field() {
        let mut b = sample_batch();
        b.error_msg = Some("stale".into());
        let patch = BatchPatch { error_msg: Some(None), ..Default::default() };
        patch.apply(&mut b);
        assert_eq!(b.error_msg, None);
    }

    #[test]
    fn request_patch_updates_only_named_fields() {
        let mut r = Request {
            id: 1,
            batch_id: 1,
            custom_id: "r1".into(),
            endpoint: "/v1/responses".into(),
            model: "gpt-4o".into(),
            state: batchflow_core::RequestState::Pending,
            request_payload_bytes: vec![],
            request_payload_size: 0,
            estimated_input_tokens: 1,
            delivery_config: DeliveryConfig::from_value(&serde_json::json!({"type":"webhook","webhook_url":"https://x/y"})).unwrap(),
            response_payload: None,
            error_msg: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let patch = RequestPatch { response_payload: Some(Some("{}".into())), ..Default::default() };
        patch.apply(&mut r);
        assert_eq!(r.response_payload.as_deref(), Some("{}"));
        assert_eq!(r.error_msg, None);
    }
}
