//! The workflow actions invoked by the JobQueue (spec §4.7). Each method
//! re-reads its subject inside a transaction and is a no-op when the entity
//! has already moved past the state the action expects — so a job that is
//! re-delivered after a crash, or raced by a duplicate enqueue, never
//! double-applies its effect.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use batchflow_capacity::{Admission, CapacityControl};
use batchflow_config::Settings;
use batchflow_core::{BatchState, DeliveryOutcome, RequestState, StateMachine, WaitReason};
use batchflow_filestore::BatchFileStore;
use batchflow_provider::{ProviderBatchState, ProviderClient, ProviderError, MessagePublisher};
use batchflow_queue::JobQueue;
use batchflow_store::{BatchPatch, OutboxEvent, RequestPatch, Store};

use crate::error::{ActionsError, Result};
use crate::eventing::Event;

const DOWNLOAD_CHUNK_SIZE: usize = 100;
const POLL_BACKOFF_SECS: i64 = 10;

#[derive(Clone)]
pub struct WorkflowActions {
    pub store: Store,
    pub files: BatchFileStore,
    pub provider: Arc<dyn ProviderClient>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub queue: JobQueue,
}

/// `{entity_kind, id, from, to, timestamp}` on a per-entity topic (spec
/// §4.8). Folded into the same outbox write as the transition itself, so
/// it reaches subscribers only once the transition has actually committed.
fn transition_event(entity_kind: &str, id: i64, from: Option<&str>, to: &str) -> OutboxEvent {
    let event = Event::Transition {
        entity_kind: entity_kind.to_string(),
        id,
        from: from.map(str::to_string),
        to: to.to_string(),
        at: Utc::now(),
    };
    OutboxEvent::Publish {
        topic: format!("{entity_kind}:{id}"),
        payload: serde_json::to_value(&event).expect("Event always serializes"),
    }
}

fn enqueue_job_event(job_kind: &str, subject_id: i64, args: Value) -> OutboxEvent {
    OutboxEvent::EnqueueJob {
        job_kind: job_kind.to_string(),
        subject_id: subject_id.to_string(),
        args,
        run_at: None,
        singleton: true,
        max_attempts: batchflow_queue::default_max_attempts(job_kind),
    }
}

fn enqueue_job_event_at(job_kind: &str, subject_id: i64, args: Value, run_at: chrono::DateTime<Utc>) -> OutboxEvent {
    OutboxEvent::EnqueueJob {
        job_kind: job_kind.to_string(),
        subject_id: subject_id.to_string(),
        args,
        run_at: Some(run_at),
        singleton: true,
        max_attempts: batchflow_queue::default_max_attempts(job_kind),
    }
}

/// A model's token reservation frees up whenever a batch leaves
/// `{uploaded, waiting_for_capacity, provider_processing}` for anything
/// else (spec §4.5, `reserved_tokens_for_model`'s state list). Every such
/// exit re-triggers a drain so any other batch parked on that model gets a
/// chance at the capacity that was just released.
fn drain_capacity_event(model: &str) -> OutboxEvent {
    OutboxEvent::EnqueueJob {
        job_kind: "drain_capacity".to_string(),
        subject_id: model.to_string(),
        args: serde_json::json!({ "model": model }),
        run_at: None,
        singleton: true,
        max_attempts: batchflow_queue::default_max_attempts("drain_capacity"),
    }
}

impl WorkflowActions {
    /// **upload(batch)** (spec §4.7): rebuild the NDJSON file straight from
    /// `Store` rather than trusting whatever `BatchBuilder` wrote earlier,
    /// so a crash between insert and append is always recoverable.
    #[tracing::instrument(skip(self))]
    pub async fn upload(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.state != BatchState::Uploading {
            return Ok(());
        }

        let pending = self.store.list_requests_for_batch(batch_id, Some(RequestState::Pending)).await?;
        if pending.is_empty() {
            return Err(ActionsError::Other(format!("batch {batch_id} has no pending requests to upload")));
        }

        self.files.create(batch_id).await?;
        for request in &pending {
            self.files.append_line(batch_id, &request.request_payload_bytes).await?;
        }
        let ndjson: Vec<u8> = pending.iter().flat_map(|r| r.request_payload_bytes.clone()).collect();

        match self.provider.upload_file(ndjson).await {
            Ok(file_id) => {
                self.files.delete(batch_id).await?;
                let patch = BatchPatch { provider_input_file_id: Some(Some(file_id)), ..Default::default() };
                let side_effects = vec![
                    transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Uploaded.as_str()),
                    enqueue_job_event("create_provider_batch", batch_id, serde_json::json!({ "batch_id": batch_id })),
                ];
                self.store.transition_batch(batch_id, BatchState::Uploaded, patch, side_effects).await?;
                Ok(())
            }
            Err(e) => {
                self.files.delete(batch_id).await?;
                Err(e.into())
            }
        }
    }

    /// **create_provider_batch(batch)** (spec §4.7, §4.5).
    #[tracing::instrument(skip(self, settings))]
    pub async fn create_provider_batch(&self, settings: &Settings, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if !matches!(batch.state, BatchState::Uploaded | BatchState::WaitingForCapacity) {
            return Ok(());
        }

        match CapacityControl::decide(&self.store, settings, &batch).await? {
            Admission::Wait { reason, .. } => {
                if batch.state == BatchState::WaitingForCapacity {
                    return Ok(()); // already parked, nothing changed
                }
                let patch = BatchPatch {
                    waiting_since_at: Some(Some(Utc::now())),
                    wait_reason: Some(Some(reason)),
                    ..Default::default()
                };
                let side_effects = vec![transition_event(
                    "batch",
                    batch_id,
                    Some(batch.state.as_str()),
                    BatchState::WaitingForCapacity.as_str(),
                )];
                self.store.transition_batch(batch_id, BatchState::WaitingForCapacity, patch, side_effects).await?;
                Ok(())
            }
            Admission::Admit => {
                let input_file_id = batch
                    .provider_input_file_id
                    .clone()
                    .ok_or_else(|| ActionsError::Other(format!("batch {batch_id} admitted with no input file id")))?;
                match self.provider.create_batch(&input_file_id, &batch.endpoint).await {
                    Ok(provider_batch_id) => {
                        let patch = BatchPatch {
                            provider_batch_id: Some(Some(provider_batch_id)),
                            waiting_since_at: Some(None),
                            wait_reason: Some(None),
                            token_limit_retry_attempts: Some(0),
                            token_limit_retry_next_at: Some(None),
                            ..Default::default()
                        };
                        let side_effects = vec![
                            transition_event(
                                "batch",
                                batch_id,
                                Some(batch.state.as_str()),
                                BatchState::ProviderProcessing.as_str(),
                            ),
                            enqueue_job_event("poll_batch_status", batch_id, serde_json::json!({ "batch_id": batch_id })),
                        ];
                        self.store.transition_batch(batch_id, BatchState::ProviderProcessing, patch, side_effects).await?;
                        self.store.bulk_admit_requests(batch_id).await?;
                        Ok(())
                    }
                    Err(ProviderError::TokenLimitExceeded(msg)) => {
                        self.apply_token_limit_backoff(settings, batch_id, &batch, msg).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn apply_token_limit_backoff(
        &self,
        settings: &Settings,
        batch_id: i64,
        batch: &batchflow_core::Batch,
        error: String,
    ) -> Result<()> {
        let attempts = batch.token_limit_retry_attempts as u32 + 1;
        if CapacityControl::token_limit_retries_exhausted(settings, attempts) {
            let patch = BatchPatch {
                token_limit_retry_attempts: Some(attempts as i32),
                token_limit_retry_last_error: Some(Some(error.clone())),
                error_msg: Some(Some(error)),
                ..Default::default()
            };
            let side_effects = vec![
                transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Failed.as_str()),
                drain_capacity_event(&batch.model),
            ];
            self.store.transition_batch(batch_id, BatchState::Failed, patch, side_effects).await?;
            return Ok(());
        }

        let next_at = CapacityControl::token_limit_backoff_next_at(settings, attempts);
        let patch = BatchPatch {
            waiting_since_at: Some(Some(Utc::now())),
            wait_reason: Some(Some(WaitReason::TokenLimitBackoff)),
            token_limit_retry_attempts: Some(attempts as i32),
            token_limit_retry_next_at: Some(Some(next_at)),
            token_limit_retry_last_error: Some(Some(error)),
            ..Default::default()
        };
        let side_effects = vec![
            transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::WaitingForCapacity.as_str()),
            enqueue_job_event_at("create_provider_batch", batch_id, serde_json::json!({ "batch_id": batch_id }), next_at),
        ];
        self.store.transition_batch(batch_id, BatchState::WaitingForCapacity, patch, side_effects).await?;
        Ok(())
    }

    /// **poll_batch_status(batch)** (spec §4.7).
    #[tracing::instrument(skip(self, settings))]
    pub async fn poll_batch_status(&self, settings: &Settings, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.state != BatchState::ProviderProcessing {
            return Ok(());
        }
        let provider_batch_id = batch
            .provider_batch_id
            .clone()
            .ok_or_else(|| ActionsError::Other(format!("batch {batch_id} has no provider_batch_id")))?;

        let status = match self.provider.retrieve_batch(&provider_batch_id).await {
            Ok(s) => s,
            Err(ProviderError::NotFound(msg)) => {
                let patch = BatchPatch { error_msg: Some(Some(msg)), ..Default::default() };
                let side_effects = vec![
                    transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Failed.as_str()),
                    drain_capacity_event(&batch.model),
                ];
                self.store.transition_batch(batch_id, BatchState::Failed, patch, side_effects).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match status.status {
            ProviderBatchState::Completed => {
                let usage = status.usage.unwrap_or(batchflow_provider::Usage {
                    input_tokens: None,
                    cached_tokens: None,
                    reasoning_tokens: None,
                    output_tokens: None,
                });
                let counts = status.request_counts.unwrap_or_default();
                let patch = BatchPatch {
                    provider_output_file_id: Some(status.output_file_id),
                    provider_error_file_id: Some(status.error_file_id),
                    provider_requests_total: Some(counts.total),
                    provider_requests_completed: Some(counts.completed),
                    provider_requests_failed: Some(counts.failed),
                    input_tokens: Some(usage.input_tokens),
                    cached_tokens: Some(usage.cached_tokens),
                    reasoning_tokens: Some(usage.reasoning_tokens),
                    output_tokens: Some(usage.output_tokens),
                    last_checked_at: Some(Some(Utc::now())),
                    ..Default::default()
                };
                let side_effects = vec![
                    transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::ProviderCompleted.as_str()),
                    enqueue_job_event("download_and_parse", batch_id, serde_json::json!({ "batch_id": batch_id })),
                    drain_capacity_event(&batch.model),
                ];
                self.store.transition_batch(batch_id, BatchState::ProviderCompleted, patch, side_effects).await?;
            }
            ProviderBatchState::Failed => {
                let message = status.error_message.unwrap_or_default();
                if message.to_lowercase().contains("token") {
                    self.apply_token_limit_backoff(settings, batch_id, &batch, message).await?;
                } else {
                    let patch = BatchPatch { error_msg: Some(Some(message)), ..Default::default() };
                    let side_effects = vec![
                        transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Failed.as_str()),
                        drain_capacity_event(&batch.model),
                    ];
                    self.store.transition_batch(batch_id, BatchState::Failed, patch, side_effects).await?;
                }
            }
            ProviderBatchState::Expired => {
                let has_files = status.output_file_id.is_some() || status.error_file_id.is_some();
                let patch = BatchPatch {
                    provider_output_file_id: Some(status.output_file_id),
                    provider_error_file_id: Some(status.error_file_id),
                    ..Default::default()
                };
                let side_effects =
                    vec![transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Expired.as_str())];
                self.store.transition_batch(batch_id, BatchState::Expired, patch, side_effects).await?;

                if has_files {
                    let side_effects = vec![
                        transition_event("batch", batch_id, Some(BatchState::Expired.as_str()), BatchState::Downloading.as_str()),
                        enqueue_job_event("download_and_parse", batch_id, serde_json::json!({ "batch_id": batch_id })),
                        drain_capacity_event(&batch.model),
                    ];
                    self.store
                        .transition_batch(batch_id, BatchState::Downloading, Default::default(), side_effects)
                        .await?;
                } else {
                    self.reset_in_flight_requests_to_pending(batch_id).await?;
                    // WaitingToRetry has no declared edge back into Uploading; the
                    // retry resubmits against the existing input file rather than
                    // literally re-running `upload`.
                    let side_effects = vec![transition_event(
                        "batch",
                        batch_id,
                        Some(BatchState::Expired.as_str()),
                        BatchState::WaitingToRetry.as_str(),
                    )];
                    self.store
                        .transition_batch(batch_id, BatchState::WaitingToRetry, Default::default(), side_effects)
                        .await?;
                    let side_effects = vec![
                        transition_event("batch", batch_id, Some(BatchState::WaitingToRetry.as_str()), BatchState::Uploaded.as_str()),
                        enqueue_job_event("create_provider_batch", batch_id, serde_json::json!({ "batch_id": batch_id })),
                    ];
                    self.store.transition_batch(batch_id, BatchState::Uploaded, Default::default(), side_effects).await?;
                }
            }
            _ => {
                let counts_changed = status
                    .request_counts
                    .as_ref()
                    .is_some_and(|c| c.completed != batch.provider_requests_completed || c.failed != batch.provider_requests_failed);
                let mut patch = BatchPatch { last_checked_at: Some(Some(Utc::now())), ..Default::default() };
                let mut side_effects = Vec::new();
                if let Some(counts) = status.request_counts {
                    patch.provider_requests_total = Some(counts.total);
                    patch.provider_requests_completed = Some(counts.completed);
                    patch.provider_requests_failed = Some(counts.failed);
                    if counts_changed {
                        let event = Event::MetricsDelta {
                            batch_id,
                            request_count: batch.request_count,
                            size_bytes: batch.size_bytes,
                            estimated_input_tokens_total: batch.estimated_input_tokens_total,
                            at: Utc::now(),
                        };
                        side_effects.push(OutboxEvent::Publish {
                            topic: format!("batch:{batch_id}"),
                            payload: serde_json::to_value(&event).expect("Event always serializes"),
                        });
                    }
                }
                side_effects.push(enqueue_job_event_at(
                    "poll_batch_status",
                    batch_id,
                    serde_json::json!({ "batch_id": batch_id }),
                    Utc::now() + chrono::Duration::seconds(POLL_BACKOFF_SECS),
                ));
                self.store.patch_batch(batch_id, patch, side_effects).await?;
            }
        }
        Ok(())
    }

    async fn reset_in_flight_requests_to_pending(&self, batch_id: i64) -> Result<()> {
        let in_flight = self.store.list_requests_for_batch(batch_id, Some(RequestState::ProviderProcessing)).await?;
        for request in in_flight {
            self.store.transition_request(request.id, RequestState::Pending, Default::default(), Vec::new()).await?;
        }
        Ok(())
    }

    /// **download_and_parse(batch)** (spec §4.7).
    #[tracing::instrument(skip(self))]
    pub async fn download_and_parse(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if !matches!(batch.state, BatchState::ProviderCompleted | BatchState::Downloading | BatchState::Downloaded) {
            return Ok(());
        }

        if batch.state == BatchState::ProviderCompleted {
            let side_effects =
                vec![transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Downloading.as_str())];
            self.store.transition_batch(batch_id, BatchState::Downloading, Default::default(), side_effects).await?;
        }

        if batch.state != BatchState::Downloaded {
            if let Some(file_id) = &batch.provider_output_file_id {
                let bytes = self.provider.download_file(file_id).await?;
                self.apply_result_lines(batch_id, &bytes, false).await?;
            }
            if let Some(file_id) = &batch.provider_error_file_id {
                let bytes = self.provider.download_file(file_id).await?;
                self.apply_result_lines(batch_id, &bytes, true).await?;
            }

            let side_effects =
                vec![transition_event("batch", batch_id, Some(BatchState::Downloading.as_str()), BatchState::Downloaded.as_str())];
            self.store.transition_batch(batch_id, BatchState::Downloaded, Default::default(), side_effects).await?;
        }

        self.finalize_after_download(batch_id).await
    }

    async fn apply_result_lines(&self, batch_id: i64, bytes: &[u8], is_error_file: bool) -> Result<()> {
        let text = String::from_utf8_lossy(bytes);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        for chunk in lines.chunks(DOWNLOAD_CHUNK_SIZE) {
            self.apply_result_chunk(batch_id, chunk, is_error_file).await?;
        }
        Ok(())
    }

    async fn apply_result_chunk(&self, batch_id: i64, lines: &[&str], is_error_file: bool) -> Result<()> {
        let mut parsed: Vec<(String, Value)> = Vec::with_capacity(lines.len());
        for line in lines {
            match serde_json::from_str::<Value>(line) {
                Ok(v) => match v.get("custom_id").and_then(Value::as_str) {
                    Some(custom_id) => parsed.push((custom_id.to_string(), v)),
                    None => tracing::warn!(batch_id, "result line missing custom_id, skipping"),
                },
                Err(e) => tracing::warn!(batch_id, error = %e, "result line is not valid JSON, skipping"),
            }
        }
        if parsed.is_empty() {
            return Ok(());
        }

        let custom_ids: Vec<String> = parsed.iter().map(|(id, _)| id.clone()).collect();
        let mut tx = self.store.begin().await?;
        let requests = self.store.lock_requests_by_custom_ids(&mut tx, batch_id, &custom_ids).await?;
        let by_custom_id: HashMap<&str, &batchflow_core::Request> =
            requests.iter().map(|r| (r.custom_id.as_str(), r)).collect();

        for (custom_id, line) in &parsed {
            let Some(request) = by_custom_id.get(custom_id.as_str()) else {
                tracing::warn!(batch_id, custom_id, "result line references unknown custom_id, skipping");
                continue;
            };
            if request.state.is_terminal() {
                continue;
            }

            let raw = line.to_string();
            let failed = is_error_file
                || line.get("error").is_some_and(|e| !e.is_null())
                || line
                    .get("response")
                    .is_some_and(|r| r.get("status_code").and_then(Value::as_i64) != Some(200) || r.get("body").and_then(|b| b.get("error")).is_some_and(|e| !e.is_null()));

            if failed {
                let patch = RequestPatch { error_msg: Some(Some(raw)), ..Default::default() };
                self.store.transition_request_in_tx(&mut tx, request.id, RequestState::Failed, patch).await?;
            } else {
                let patch = RequestPatch { response_payload: Some(Some(raw)), ..Default::default() };
                self.store.transition_request_in_tx(&mut tx, request.id, RequestState::ProviderProcessed, patch).await?;
            }
        }
        tx.commit().await.map_err(batchflow_store::StoreError::Database)?;
        Ok(())
    }

    /// After both result files are applied: either fan out delivery, or —
    /// if nothing reached `provider_processed` — close the batch directly
    /// (spec §4.7 download_and_parse, final paragraph).
    async fn finalize_after_download(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.state != BatchState::Downloaded {
            return Ok(());
        }

        let counts = self.store.count_requests_by_state(batch_id).await?;
        let processed = counts.get(&RequestState::ProviderProcessed).copied().unwrap_or(0);

        if processed > 0 || batch.request_count == 0 {
            let side_effects = vec![transition_event(
                "batch",
                batch_id,
                Some(batch.state.as_str()),
                BatchState::ReadyToDeliver.as_str(),
            )];
            self.store.transition_batch(batch_id, BatchState::ReadyToDeliver, Default::default(), side_effects).await?;

            let requests = self.store.list_requests_for_batch(batch_id, Some(RequestState::ProviderProcessed)).await?;
            for request in requests {
                self.queue
                    .enqueue("deliver", &request.id.to_string(), serde_json::json!({ "request_id": request.id }), None, 1, true)
                    .await?;
            }
            return Ok(());
        }

        let delivered = counts.get(&RequestState::Delivered).copied().unwrap_or(0);
        let target = if delivered > 0 { BatchState::Delivered } else { BatchState::Failed };
        let side_effects = vec![transition_event("batch", batch_id, Some(batch.state.as_str()), target.as_str())];
        self.store.transition_batch(batch_id, target, Default::default(), side_effects).await?;
        Ok(())
    }

    /// **deliver(request)** (spec §4.7).
    #[tracing::instrument(skip(self, settings))]
    pub async fn deliver(&self, settings: &Settings, request_id: i64) -> Result<()> {
        let request = self.store.get_request(request_id).await?;
        if !matches!(request.state, RequestState::ProviderProcessed | RequestState::Delivering) {
            return Ok(());
        }

        if request.state == RequestState::ProviderProcessed {
            let side_effects = vec![transition_event(
                "request",
                request_id,
                Some(request.state.as_str()),
                RequestState::Delivering.as_str(),
            )];
            self.store.transition_request(request_id, RequestState::Delivering, Default::default(), side_effects).await?;
            self.maybe_start_batch_delivery(request.batch_id).await?;
        }

        let _ = settings; // webhook/amqp timeouts are baked into the publisher's client at construction

        let payload: Value = match &request.response_payload {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "raw": raw })),
            None => Value::Null,
        };
        let result = self.publisher.deliver(&request.delivery_config, &payload).await;
        self.store.record_delivery_attempt(request_id, result.outcome, result.error_msg).await?;

        let to = if result.outcome.is_success() { RequestState::Delivered } else { RequestState::DeliveryFailed };
        let side_effects =
            vec![transition_event("request", request_id, Some(RequestState::Delivering.as_str()), to.as_str())];
        self.store.transition_request(request_id, to, Default::default(), side_effects).await?;

        self.finalize_batch_delivery(request.batch_id).await
    }

    async fn maybe_start_batch_delivery(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.state == BatchState::ReadyToDeliver {
            let side_effects = vec![transition_event(
                "batch",
                batch_id,
                Some(batch.state.as_str()),
                BatchState::Delivering.as_str(),
            )];
            self.store.transition_batch(batch_id, BatchState::Delivering, Default::default(), side_effects).await?;
        }
        Ok(())
    }

    /// **finalize_batch_delivery(batch)** (spec §4.7).
    #[tracing::instrument(skip(self))]
    pub async fn finalize_batch_delivery(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.state != BatchState::Delivering {
            return Ok(());
        }

        let counts = self.store.count_requests_by_state(batch_id).await?;
        let terminal: i64 = counts.iter().filter(|(s, _)| s.is_terminal()).map(|(_, n)| n).sum();
        if terminal < batch.request_count {
            return Ok(()); // still in flight
        }

        let delivered = counts.get(&RequestState::Delivered).copied().unwrap_or(0);
        let failed = terminal - delivered;

        let target = match (delivered > 0, failed > 0) {
            (true, false) => BatchState::Delivered,
            (false, true) => BatchState::DeliveryFailed,
            (true, true) => BatchState::PartiallyDelivered,
            (false, false) => BatchState::Delivered, // empty batch
        };
        let side_effects = vec![transition_event("batch", batch_id, Some(batch.state.as_str()), target.as_str())];
        self.store.transition_batch(batch_id, target, Default::default(), side_effects).await?;
        Ok(())
    }

    /// **redeliver(batch)** (spec §4.7): operator-triggered, valid only from
    /// a delivery-terminal state.
    #[tracing::instrument(skip(self))]
    pub async fn redeliver(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if !matches!(batch.state, BatchState::PartiallyDelivered | BatchState::DeliveryFailed) {
            return Err(ActionsError::Other(format!("batch {batch_id} is not redeliverable from {}", batch.state)));
        }

        let side_effects =
            vec![transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Delivering.as_str())];
        self.store.transition_batch(batch_id, BatchState::Delivering, Default::default(), side_effects).await?;

        let failed_requests = self.store.list_requests_for_batch(batch_id, Some(RequestState::DeliveryFailed)).await?;
        for request in failed_requests {
            let side_effects = vec![transition_event(
                "request",
                request.id,
                Some(RequestState::DeliveryFailed.as_str()),
                RequestState::Delivering.as_str(),
            )];
            self.store.transition_request(request.id, RequestState::Delivering, Default::default(), side_effects).await?;
            self.queue
                .enqueue("deliver", &request.id.to_string(), serde_json::json!({ "request_id": request.id }), None, 1, true)
                .await?;
        }
        Ok(())
    }

    /// **cancel(batch)** (spec §4.7): best-effort everywhere outside the
    /// committed state transition itself.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.is_terminal() {
            return Ok(());
        }

        if let Some(provider_batch_id) = &batch.provider_batch_id {
            if let Err(e) = self.provider.cancel_batch(provider_batch_id).await {
                tracing::warn!(batch_id, error = %e, "best-effort provider cancel failed");
            }
        }

        for request in self.store.list_requests_for_batch(batch_id, None).await? {
            if request.state.is_terminal() {
                continue;
            }
            if RequestState::can_transition(request.state, RequestState::Cancelled) {
                self.store.transition_request(request.id, RequestState::Cancelled, Default::default(), Vec::new()).await?;
            }
        }

        let reserved = matches!(
            batch.state,
            BatchState::Uploaded | BatchState::WaitingForCapacity | BatchState::ProviderProcessing
        );
        let mut side_effects =
            vec![transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Cancelled.as_str())];
        if reserved {
            side_effects.push(drain_capacity_event(&batch.model));
        }
        self.store.transition_batch(batch_id, BatchState::Cancelled, Default::default(), side_effects).await?;
        Ok(())
    }

    /// **delete_expired(batch)** (spec §4.7): the provider's own retention
    /// deadline, not the webhook/amqp delivery result.
    #[tracing::instrument(skip(self))]
    pub async fn delete_expired(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        let Some(expires_at) = batch.expires_at else { return Ok(()) };
        if !batch.is_terminal() || expires_at > Utc::now() {
            return Ok(());
        }
        self.files.delete(batch_id).await?;
        self.store.delete_batch(batch_id).await?;
        Ok(())
    }

    /// **expire_stale_building_batches(batch)** (spec §4.6 final paragraph):
    /// scheduled with a 1-hour delay the moment a `building` batch is
    /// created, so a `(model, endpoint)` pair with too little traffic to
    /// ever hit the count/size cap still closes instead of sitting in
    /// `building` forever. A no-op once the batch has already closed by
    /// some other path.
    #[tracing::instrument(skip(self))]
    pub async fn expire_stale_building_batches(&self, batch_id: i64) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.state != BatchState::Building {
            return Ok(());
        }
        if batch.request_count == 0 {
            self.files.delete(batch_id).await?;
            self.store.delete_batch(batch_id).await?;
            return Ok(());
        }
        let side_effects = vec![
            transition_event("batch", batch_id, Some(batch.state.as_str()), BatchState::Uploading.as_str()),
            enqueue_job_event("upload", batch_id, serde_json::json!({ "batch_id": batch_id })),
        ];
        self.store.transition_batch(batch_id, BatchState::Uploading, Default::default(), side_effects).await?;
        Ok(())
    }

    /// Per-model drain triggered whenever capacity frees up (spec §4.5).
    #[tracing::instrument(skip(self, settings))]
    pub async fn drain_capacity(&self, settings: &Settings, model: &str) -> Result<()> {
        let eligible = CapacityControl::plan_drain(&self.store, settings, model).await?;
        for batch in eligible {
            let patch = BatchPatch { waiting_since_at: Some(None), wait_reason: Some(None), ..Default::default() };
            let side_effects = vec![
                transition_event("batch", batch.id, Some(batch.state.as_str()), BatchState::Uploaded.as_str()),
                enqueue_job_event("create_provider_batch", batch.id, serde_json::json!({ "batch_id": batch.id })),
            ];
            self.store.transition_batch(batch.id, BatchState::Uploaded, patch, side_effects).await?;
        }
        Ok(())
    }
}
