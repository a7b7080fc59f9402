//! `enqueue_request` ingress path (spec §4.6, §6, §7): canonicalize the
//! caller's payload, append it to the batch's upload file, insert the
//! `Request` row, and enqueue `upload` once a closing condition is hit.
//! The count/size close happens inside `Store::enqueue_request` itself,
//! right after the insert; `expire_stale_building_batches` covers the
//! remaining age-based close for a batch that never fills up.

use batchflow_config::Settings;
use batchflow_core::{canonicalize_payload, canonical::estimate_input_tokens, DeliveryConfig};
use batchflow_filestore::BatchFileStore;
use batchflow_store::{NewRequestInput, Store};

use crate::error::{ActionsError, Result};

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub custom_id: String,
    pub model: String,
    pub endpoint: String,
    pub body: serde_json::Value,
    pub delivery: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub custom_id: String,
}

/// Mirrors the ingress API's structured error kinds (spec §6, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    Invalid(String),
    DuplicateCustomId,
    BatchSizeWouldExceed,
}

pub struct BatchBuilder {
    store: Store,
    files: BatchFileStore,
}

impl BatchBuilder {
    pub fn new(store: Store, files: BatchFileStore) -> Self {
        Self { store, files }
    }

    /// Spec §4.6 steps 1-7. Step 3's "retry at most once" is handled inside
    /// `Store::enqueue_request`. The file append can't commit atomically
    /// with the database insert, so it happens just after; a crash between
    /// the two is recovered by `upload` re-materializing the file from
    /// `Store` before it ever calls the provider (spec §4.7 upload).
    #[tracing::instrument(skip(self, settings, new), fields(custom_id = %new.custom_id, model = %new.model))]
    pub async fn submit(&self, settings: &Settings, new: NewRequest) -> Result<std::result::Result<Accepted, SubmitError>> {
        if !VALID_ENDPOINTS.contains(&new.endpoint.as_str()) {
            return Ok(Err(SubmitError::Invalid(format!("unsupported endpoint {:?}", new.endpoint))));
        }

        let delivery_config = match DeliveryConfig::from_value(&new.delivery) {
            Ok(c) => c,
            Err(e) => return Ok(Err(SubmitError::Invalid(e.to_string()))),
        };

        let wire_body = serde_json::json!({
            "custom_id": new.custom_id,
            "method": "POST",
            "url": new.endpoint,
            "body": new.body,
        });
        let canonical_body = canonicalize_payload(&wire_body);
        let estimated_input_tokens = estimate_input_tokens(&new.body);

        let input = NewRequestInput {
            custom_id: new.custom_id.clone(),
            model: new.model,
            endpoint: new.endpoint,
            delivery_config,
            canonical_body: canonical_body.clone(),
            estimated_input_tokens,
            max_requests_per_batch: settings.max_requests_per_batch,
            max_batch_size_bytes: settings.max_batch_size_bytes,
        };

        let outcome = match self.store.enqueue_request(input).await {
            Ok(outcome) => outcome,
            Err(batchflow_store::StoreError::Database(e)) if is_unique_violation(&e) => {
                return Ok(Err(SubmitError::DuplicateCustomId));
            }
            Err(batchflow_store::StoreError::Conflict { .. }) => {
                return Ok(Err(SubmitError::BatchSizeWouldExceed));
            }
            Err(e) => return Err(ActionsError::Store(e)),
        };

        // `append_line` creates the file on first write; `upload` re-materializes
        // it from Store if it's ever missing, so no explicit `create` here.
        self.files.append_line(outcome.batch.id, &canonical_body).await?;

        Ok(Ok(Accepted { custom_id: new.custom_id }))
    }
}

const VALID_ENDPOINTS: &[&str] =
    &["/v1/responses", "/v1/chat/completions", "/v1/completions", "/v1/embeddings", "/v1/moderations"];

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
