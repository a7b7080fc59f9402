//! Transactional persistence for batches, requests, and their audit trail
//! (spec §4.2). Mutations are transactional; admission and building-batch
//! selection use `SELECT ... FOR UPDATE [SKIP LOCKED]` row locks, grounded
//! in the corpus's Postgres storage module
//! (`dataset_transform_pending_batch.rs`).

use batchflow_core::{Batch, BatchState, DeliveryAttempt, DeliveryConfig, DeliveryOutcome, Request, RequestState, StateMachine};
use chrono::Utc;
use sqlx::error::DatabaseError;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Result, StoreError};
use crate::outbox::{write_outbox_events, OutboxEvent};
use crate::patch::{BatchPatch, RequestPatch};
use crate::rows::{BatchRow, DeliveryAttemptRow, RequestRow};

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

/// Input to `enqueue_request`, already canonicalized by the caller
/// (`batchflow-core::canonicalize_payload` + `estimate_input_tokens`).
#[derive(Debug, Clone)]
pub struct NewRequestInput {
    pub custom_id: String,
    pub model: String,
    pub endpoint: String,
    pub delivery_config: DeliveryConfig,
    pub canonical_body: Vec<u8>,
    pub estimated_input_tokens: i64,
    pub max_requests_per_batch: i64,
    pub max_batch_size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub request: Request,
    pub batch: Batch,
    /// True if the insert pushed the batch over `MAX_REQUESTS_PER_BATCH` or
    /// `MAX_BATCH_SIZE_BYTES`; `enqueue_request` already closed the batch
    /// and enqueued `upload` in that case, so `batch` reflects `uploading`.
    pub should_close: bool,
}

const SELECT_BUILDING_BATCH: &str =
    "SELECT * FROM batches WHERE model = $1 AND endpoint = $2 AND state = 'building' FOR UPDATE SKIP LOCKED";

const INSERT_BUILDING_BATCH: &str =
    "INSERT INTO batches (model, endpoint, state) VALUES ($1, $2, 'building') RETURNING *";

const INSERT_REQUEST: &str = r#"
    INSERT INTO requests (batch_id, custom_id, endpoint, model, state, request_payload_bytes, request_payload_size, estimated_input_tokens, delivery_config)
    VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8)
    RETURNING *
"#;

const BUMP_BATCH_COUNTERS: &str = r#"
    UPDATE batches
    SET request_count = request_count + $2,
        size_bytes = size_bytes + $3,
        estimated_input_tokens_total = estimated_input_tokens_total + $4,
        updated_at = now()
    WHERE id = $1
    RETURNING *
"#;

/// Spec §4.6 final paragraph: a new `building` batch gets a
/// `expire_stale_building_batches` job scheduled this far out, so it still
/// closes even if it never hits the count/size cap.
const STALE_BUILDING_BATCH_DELAY_SECS: i64 = 3600;

const MARK_BATCH_UPLOADING: &str =
    "UPDATE batches SET state = 'uploading', updated_at = now() WHERE id = $1 AND state = 'building' RETURNING *";

const SELECT_BATCH_FOR_UPDATE: &str = "SELECT * FROM batches WHERE id = $1 FOR UPDATE";
const SELECT_REQUEST_FOR_UPDATE: &str = "SELECT * FROM requests WHERE id = $1 FOR UPDATE";
const SELECT_BATCH: &str = "SELECT * FROM batches WHERE id = $1";
const SELECT_REQUEST: &str = "SELECT * FROM requests WHERE id = $1";

const UPDATE_BATCH: &str = r#"
    UPDATE batches SET
        model = $1, endpoint = $2, state = $3, updated_at = $4,
        provider_input_file_id = $5, provider_batch_id = $6, provider_output_file_id = $7, provider_error_file_id = $8,
        request_count = $9, size_bytes = $10, estimated_input_tokens_total = $11,
        provider_requests_total = $12, provider_requests_completed = $13, provider_requests_failed = $14,
        input_tokens = $15, cached_tokens = $16, reasoning_tokens = $17, output_tokens = $18,
        waiting_since_at = $19, wait_reason = $20,
        token_limit_retry_attempts = $21, token_limit_retry_next_at = $22, token_limit_retry_last_error = $23,
        expires_at = $24, error_msg = $25, last_checked_at = $26
    WHERE id = $27 AND updated_at = $28
    RETURNING *
"#;

const UPDATE_REQUEST: &str = r#"
    UPDATE requests SET state = $1, response_payload = $2, error_msg = $3, updated_at = $4
    WHERE id = $5 AND updated_at = $6
    RETURNING *
"#;

const INSERT_TRANSITION: &str = r#"
    INSERT INTO transitions (entity_kind, entity_id, from_state, to_state)
    VALUES ($1, $2, $3, $4)
"#;

const INSERT_DELIVERY_ATTEMPT: &str = r#"
    INSERT INTO delivery_attempts (request_id, attempt_number, outcome, error_msg)
    VALUES ($1, $2, $3, $4)
    RETURNING *
"#;

const COUNT_DELIVERY_ATTEMPTS: &str = "SELECT count(*) FROM delivery_attempts WHERE request_id = $1";

const RESERVED_TOKENS_FOR_MODEL: &str = r#"
    SELECT COALESCE(SUM(estimated_input_tokens_total), 0)
    FROM batches
    WHERE model = $1
      AND id != $2
      AND state IN ('uploaded', 'waiting_for_capacity', 'provider_processing')
"#;

const SELECT_WAITING_BATCHES_FOR_MODEL: &str = r#"
    SELECT * FROM batches
    WHERE model = $1
      AND state = 'waiting_for_capacity'
      AND (token_limit_retry_next_at IS NULL OR token_limit_retry_next_at <= now())
    ORDER BY waiting_since_at ASC, id ASC
    FOR UPDATE SKIP LOCKED
"#;

const SELECT_REQUESTS_FOR_BATCH_BY_STATE: &str = "SELECT * FROM requests WHERE batch_id = $1 AND state = $2 ORDER BY id ASC";
const SELECT_REQUESTS_FOR_BATCH: &str = "SELECT * FROM requests WHERE batch_id = $1 ORDER BY id ASC";

const SELECT_REQUESTS_BY_CUSTOM_IDS: &str =
    "SELECT * FROM requests WHERE batch_id = $1 AND custom_id = ANY($2) FOR UPDATE";

const SELECT_REQUEST_STATE_COUNTS: &str = "SELECT state, count(*) FROM requests WHERE batch_id = $1 GROUP BY state";

const SELECT_NON_TERMINAL_BATCHES: &str = r#"
    SELECT * FROM batches
    WHERE state NOT IN ('delivered', 'partially_delivered', 'delivery_failed', 'failed', 'cancelled')
    ORDER BY id ASC
"#;

const SELECT_UNPROCESSED_OUTBOX_EVENTS: &str =
    "SELECT id, payload FROM outbox_events WHERE processed_at IS NULL ORDER BY id ASC LIMIT $1";

const MARK_OUTBOX_EVENT_PROCESSED: &str = "UPDATE outbox_events SET processed_at = now() WHERE id = $1";

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| StoreError::Database(sqlx::Error::Configuration(e.into())))
    }

    /// BatchBuilder's transactional core (spec §4.6 steps 1-5): find or
    /// create the building batch for `(model, endpoint)`, validate size/
    /// count headroom, retrying once against a fresh batch if the current
    /// one is already full, then insert the request and bump counters.
    #[tracing::instrument(skip(self, input), fields(custom_id = %input.custom_id, model = %input.model))]
    pub async fn enqueue_request(&self, input: NewRequestInput) -> Result<EnqueueOutcome> {
        match self.try_enqueue_request(&input, true).await {
            Err(StoreError::Conflict { .. }) => self.try_enqueue_request(&input, false).await,
            other => other,
        }
    }

    async fn try_enqueue_request(&self, input: &NewRequestInput, allow_retry: bool) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut batch = self.select_or_create_building_batch(&mut tx, &input.model, &input.endpoint).await?;

        let incoming_size = input.canonical_body.len() as i64;
        let fits = batch.request_count < input.max_requests_per_batch
            && batch.size_bytes + incoming_size <= input.max_batch_size_bytes;

        if !fits {
            if !allow_retry {
                return Err(StoreError::Conflict { entity_kind: "batch", entity_id: batch.id });
            }
            let row: BatchRow = sqlx::query_as(MARK_BATCH_UPLOADING).bind(batch.id).fetch_one(&mut *tx).await?;
            let closing = row.into_model()?;
            sqlx::query(INSERT_TRANSITION)
                .bind("batch")
                .bind(closing.id)
                .bind(BatchState::Building.as_str())
                .bind(BatchState::Uploading.as_str())
                .execute(&mut *tx)
                .await?;
            write_outbox_events(
                &mut tx,
                &[OutboxEvent::EnqueueJob {
                    job_kind: "upload".into(),
                    subject_id: closing.id.to_string(),
                    args: serde_json::json!({ "batch_id": closing.id }),
                    run_at: None,
                    singleton: true,
                    max_attempts: 20,
                }],
            )
            .await?;
            batch = self.select_or_create_building_batch(&mut tx, &input.model, &input.endpoint).await?;
        }

        let request_row: RequestRow = sqlx::query_as(INSERT_REQUEST)
            .bind(batch.id)
            .bind(&input.custom_id)
            .bind(&input.endpoint)
            .bind(&input.model)
            .bind(input.canonical_body.as_slice())
            .bind(incoming_size)
            .bind(input.estimated_input_tokens)
            .bind(input.delivery_config.to_value())
            .fetch_one(&mut *tx)
            .await?;
        let request = request_row.into_model()?;

        let batch_row: BatchRow = sqlx::query_as(BUMP_BATCH_COUNTERS)
            .bind(batch.id)
            .bind(1_i64)
            .bind(incoming_size)
            .bind(input.estimated_input_tokens)
            .fetch_one(&mut *tx)
            .await?;
        let batch = batch_row.into_model()?;

        sqlx::query(INSERT_TRANSITION)
            .bind("request")
            .bind(request.id)
            .bind(Option::<&str>::None)
            .bind(RequestState::Pending.as_str())
            .execute(&mut *tx)
            .await?;

        let should_close =
            batch.request_count >= input.max_requests_per_batch || batch.size_bytes >= input.max_batch_size_bytes;

        let batch = if should_close {
            let row: BatchRow = sqlx::query_as(MARK_BATCH_UPLOADING).bind(batch.id).fetch_one(&mut *tx).await?;
            let closed = row.into_model()?;
            sqlx::query(INSERT_TRANSITION)
                .bind("batch")
                .bind(closed.id)
                .bind(BatchState::Building.as_str())
                .bind(BatchState::Uploading.as_str())
                .execute(&mut *tx)
                .await?;
            write_outbox_events(
                &mut tx,
                &[OutboxEvent::EnqueueJob {
                    job_kind: "upload".into(),
                    subject_id: closed.id.to_string(),
                    args: serde_json::json!({ "batch_id": closed.id }),
                    run_at: None,
                    singleton: true,
                    max_attempts: 20,
                }],
            )
            .await?;
            closed
        } else {
            batch
        };

        tx.commit().await?;
        Ok(EnqueueOutcome { request, batch, should_close })
    }

    async fn select_or_create_building_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        model: &str,
        endpoint: &str,
    ) -> Result<Batch> {
        loop {
            if let Some(row) = sqlx::query_as::<_, BatchRow>(SELECT_BUILDING_BATCH)
                .bind(model)
                .bind(endpoint)
                .fetch_optional(&mut **tx)
                .await?
            {
                return row.into_model();
            }
            match sqlx::query_as::<_, BatchRow>(INSERT_BUILDING_BATCH).bind(model).bind(endpoint).fetch_one(&mut **tx).await {
                Ok(row) => {
                    let batch = row.into_model()?;
                    write_outbox_events(
                        tx,
                        &[OutboxEvent::EnqueueJob {
                            job_kind: "expire_stale_building_batches".into(),
                            subject_id: batch.id.to_string(),
                            args: serde_json::json!({ "batch_id": batch.id }),
                            run_at: Some(Utc::now() + chrono::Duration::seconds(STALE_BUILDING_BATCH_DELAY_SECS)),
                            singleton: true,
                            max_attempts: 20,
                        }],
                    )
                    .await?;
                    return Ok(batch);
                }
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get_batch(&self, id: i64) -> Result<Batch> {
        let row: BatchRow = sqlx::query_as(SELECT_BATCH)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity_kind: "batch", entity_id: id })?;
        row.into_model()
    }

    pub async fn get_request(&self, id: i64) -> Result<Request> {
        let row: RequestRow = sqlx::query_as(SELECT_REQUEST)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity_kind: "request", entity_id: id })?;
        row.into_model()
    }

    /// Applies a guarded batch transition with accompanying field patch,
    /// writing the `Transition` audit row and any outbox side effects in
    /// the same transaction (spec §4.1, §9).
    #[tracing::instrument(skip(self, patch, side_effects))]
    pub async fn transition_batch(
        &self,
        id: i64,
        to: BatchState,
        patch: BatchPatch,
        side_effects: Vec<OutboxEvent>,
    ) -> Result<Batch> {
        let mut tx = self.pool.begin().await?;
        let row: BatchRow = sqlx::query_as(SELECT_BATCH_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound { entity_kind: "batch", entity_id: id })?;
        let mut batch = row.into_model()?;
        let from = batch.state;

        if from == to {
            return Ok(batch); // idempotent no-op, spec P1
        }
        if !BatchState::can_transition(from, to) {
            return Err(StoreError::NoMatchingTransition {
                entity_kind: "batch",
                entity_id: id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let prior_updated_at = batch.updated_at;
        patch.apply(&mut batch);
        batch.state = to;
        batch.updated_at = Utc::now();

        let updated: BatchRow = sqlx::query_as(UPDATE_BATCH)
            .bind(&batch.model)
            .bind(&batch.endpoint)
            .bind(batch.state.as_str())
            .bind(batch.updated_at)
            .bind(&batch.provider_input_file_id)
            .bind(&batch.provider_batch_id)
            .bind(&batch.provider_output_file_id)
            .bind(&batch.provider_error_file_id)
            .bind(batch.request_count)
            .bind(batch.size_bytes)
            .bind(batch.estimated_input_tokens_total)
            .bind(batch.provider_requests_total)
            .bind(batch.provider_requests_completed)
            .bind(batch.provider_requests_failed)
            .bind(batch.input_tokens)
            .bind(batch.cached_tokens)
            .bind(batch.reasoning_tokens)
            .bind(batch.output_tokens)
            .bind(batch.waiting_since_at)
            .bind(batch.wait_reason.map(|w| w.as_str()))
            .bind(batch.token_limit_retry_attempts)
            .bind(batch.token_limit_retry_next_at)
            .bind(&batch.token_limit_retry_last_error)
            .bind(batch.expires_at)
            .bind(&batch.error_msg)
            .bind(batch.last_checked_at)
            .bind(id)
            .bind(prior_updated_at)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::Conflict { entity_kind: "batch", entity_id: id })?;
        let batch = updated.into_model()?;

        sqlx::query(INSERT_TRANSITION)
            .bind("batch")
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&mut *tx)
            .await?;
        write_outbox_events(&mut tx, &side_effects).await?;

        tx.commit().await?;
        Ok(batch)
    }

    #[tracing::instrument(skip(self, patch, side_effects))]
    pub async fn transition_request(
        &self,
        id: i64,
        to: RequestState,
        patch: RequestPatch,
        side_effects: Vec<OutboxEvent>,
    ) -> Result<Request> {
        let mut tx = self.pool.begin().await?;
        let row: RequestRow = sqlx::query_as(SELECT_REQUEST_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound { entity_kind: "request", entity_id: id })?;
        let mut request = row.into_model()?;
        let from = request.state;

        if from == to {
            return Ok(request);
        }
        if !RequestState::can_transition(from, to) {
            return Err(StoreError::NoMatchingTransition {
                entity_kind: "request",
                entity_id: id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let prior_updated_at = request.updated_at;
        patch.apply(&mut request);
        request.state = to;
        request.updated_at = Utc::now();

        let updated: RequestRow = sqlx::query_as(UPDATE_REQUEST)
            .bind(request.state.as_str())
            .bind(&request.response_payload)
            .bind(&request.error_msg)
            .bind(request.updated_at)
            .bind(id)
            .bind(prior_updated_at)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::Conflict { entity_kind: "request", entity_id: id })?;
        let request = updated.into_model()?;

        sqlx::query(INSERT_TRANSITION)
            .bind("request")
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&mut *tx)
            .await?;
        write_outbox_events(&mut tx, &side_effects).await?;

        tx.commit().await?;
        Ok(request)
    }

    /// Applies a field patch without a state transition — for updates like
    /// `poll_batch_status`'s `last_checked_at` bump that happen while the
    /// batch stays in the same state (so `transition_batch`'s `from == to`
    /// no-op guard would otherwise swallow them).
    #[tracing::instrument(skip(self, patch, side_effects))]
    pub async fn patch_batch(&self, id: i64, patch: BatchPatch, side_effects: Vec<OutboxEvent>) -> Result<Batch> {
        let mut tx = self.pool.begin().await?;
        let row: BatchRow = sqlx::query_as(SELECT_BATCH_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound { entity_kind: "batch", entity_id: id })?;
        let mut batch = row.into_model()?;
        let prior_updated_at = batch.updated_at;
        patch.apply(&mut batch);
        batch.updated_at = Utc::now();

        let updated: BatchRow = sqlx::query_as(UPDATE_BATCH)
            .bind(&batch.model)
            .bind(&batch.endpoint)
            .bind(batch.state.as_str())
            .bind(batch.updated_at)
            .bind(&batch.provider_input_file_id)
            .bind(&batch.provider_batch_id)
            .bind(&batch.provider_output_file_id)
            .bind(&batch.provider_error_file_id)
            .bind(batch.request_count)
            .bind(batch.size_bytes)
            .bind(batch.estimated_input_tokens_total)
            .bind(batch.provider_requests_total)
            .bind(batch.provider_requests_completed)
            .bind(batch.provider_requests_failed)
            .bind(batch.input_tokens)
            .bind(batch.cached_tokens)
            .bind(batch.reasoning_tokens)
            .bind(batch.output_tokens)
            .bind(batch.waiting_since_at)
            .bind(batch.wait_reason.map(|w| w.as_str()))
            .bind(batch.token_limit_retry_attempts)
            .bind(batch.token_limit_retry_next_at)
            .bind(&batch.token_limit_retry_last_error)
            .bind(batch.expires_at)
            .bind(&batch.error_msg)
            .bind(batch.last_checked_at)
            .bind(id)
            .bind(prior_updated_at)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::Conflict { entity_kind: "batch", entity_id: id })?;
        let batch = updated.into_model()?;

        write_outbox_events(&mut tx, &side_effects).await?;
        tx.commit().await?;
        Ok(batch)
    }

    /// Bulk-transition every `pending` request of a batch to
    /// `provider_processing` on admission (spec §4.7 create_provider_batch).
    #[tracing::instrument(skip(self))]
    pub async fn bulk_admit_requests(&self, batch_id: i64) -> Result<u64> {
        let requests = self.list_requests_for_batch(batch_id, Some(RequestState::Pending)).await?;
        let mut n = 0;
        for r in requests {
            self.transition_request(r.id, RequestState::ProviderProcessing, Default::default(), Vec::new()).await?;
            n += 1;
        }
        Ok(n)
    }

    /// Grouped request-state counts for a batch, used by
    /// `finalize_batch_delivery` and `download_and_parse`'s
    /// all-requests-terminal check.
    pub async fn count_requests_by_state(&self, batch_id: i64) -> Result<std::collections::HashMap<RequestState, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(SELECT_REQUEST_STATE_COUNTS).bind(batch_id).fetch_all(&self.pool).await?;
        use serde::de::Error as _;
        rows.into_iter()
            .map(|(s, n)| {
                RequestState::parse(&s)
                    .map(|state| (state, n))
                    .ok_or_else(|| StoreError::Serialization(serde_json::Error::custom(format!("unknown request state {s:?}"))))
            })
            .collect()
    }

    pub async fn list_requests_for_batch(&self, batch_id: i64, state: Option<RequestState>) -> Result<Vec<Request>> {
        let rows: Vec<RequestRow> = match state {
            Some(s) => {
                sqlx::query_as(SELECT_REQUESTS_FOR_BATCH_BY_STATE).bind(batch_id).bind(s.as_str()).fetch_all(&self.pool).await?
            }
            None => sqlx::query_as(SELECT_REQUESTS_FOR_BATCH).bind(batch_id).fetch_all(&self.pool).await?,
        };
        rows.into_iter().map(RequestRow::into_model).collect()
    }

    /// Row-locks the requests matching a chunk of provider-file `custom_id`s
    /// within a batch, for `download_and_parse` (spec §4.7).
    pub async fn lock_requests_by_custom_ids(&self, tx: &mut Transaction<'_, Postgres>, batch_id: i64, custom_ids: &[String]) -> Result<Vec<Request>> {
        let rows: Vec<RequestRow> = sqlx::query_as(SELECT_REQUESTS_BY_CUSTOM_IDS).bind(batch_id).bind(custom_ids).fetch_all(&mut **tx).await?;
        rows.into_iter().map(RequestRow::into_model).collect()
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Applies a request transition already inside a caller-managed
    /// transaction (used by `download_and_parse`'s per-chunk batch update).
    pub async fn transition_request_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        to: RequestState,
        patch: RequestPatch,
    ) -> Result<Request> {
        let row: RequestRow = sqlx::query_as(SELECT_REQUEST_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound { entity_kind: "request", entity_id: id })?;
        let mut request = row.into_model()?;
        let from = request.state;

        if from == to {
            return Ok(request);
        }
        if !RequestState::can_transition(from, to) {
            return Err(StoreError::NoMatchingTransition {
                entity_kind: "request",
                entity_id: id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let prior_updated_at = request.updated_at;
        patch.apply(&mut request);
        request.state = to;
        request.updated_at = Utc::now();

        let updated: RequestRow = sqlx::query_as(UPDATE_REQUEST)
            .bind(request.state.as_str())
            .bind(&request.response_payload)
            .bind(&request.error_msg)
            .bind(request.updated_at)
            .bind(id)
            .bind(prior_updated_at)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::Conflict { entity_kind: "request", entity_id: id })?;
        let request = updated.into_model()?;

        sqlx::query(INSERT_TRANSITION).bind("request").bind(id).bind(from.as_str()).bind(to.as_str()).execute(&mut **tx).await?;
        Ok(request)
    }

    pub async fn record_delivery_attempt(
        &self,
        request_id: i64,
        outcome: DeliveryOutcome,
        error_msg: Option<String>,
    ) -> Result<DeliveryAttempt> {
        let attempt_number: i64 = sqlx::query_scalar(COUNT_DELIVERY_ATTEMPTS).bind(request_id).fetch_one(&self.pool).await?;
        let row: DeliveryAttemptRow = sqlx::query_as(INSERT_DELIVERY_ATTEMPT)
            .bind(request_id)
            .bind(attempt_number as i32 + 1)
            .bind(outcome.as_str())
            .bind(error_msg)
            .fetch_one(&self.pool)
            .await?;
        row.into_model()
    }

    pub async fn list_delivery_attempts(&self, request_id: i64) -> Result<Vec<DeliveryAttempt>> {
        let rows: Vec<DeliveryAttemptRow> =
            sqlx::query_as("SELECT * FROM delivery_attempts WHERE request_id = $1 ORDER BY attempt_number ASC")
                .bind(request_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(DeliveryAttemptRow::into_model).collect()
    }

    /// `reserved_other` of CapacityControl's admission algorithm (spec §4.5
    /// step 2).
    pub async fn reserved_tokens_for_model(&self, model: &str, excluding_batch_id: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(RESERVED_TOKENS_FOR_MODEL).bind(model).bind(excluding_batch_id).fetch_one(&self.pool).await?;
        Ok(total)
    }

    /// Waiting batches for a model, FIFO-ordered and row-locked, skipping
    /// any still inside its token-limit backoff window (spec §4.5 drain).
    pub async fn lock_waiting_batches_for_model(&self, tx: &mut Transaction<'_, Postgres>, model: &str) -> Result<Vec<Batch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(SELECT_WAITING_BATCHES_FOR_MODEL).bind(model).fetch_all(&mut **tx).await?;
        rows.into_iter().map(BatchRow::into_model).collect()
    }

    pub async fn get_batch_in_tx(&self, tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<Batch> {
        let row: BatchRow = sqlx::query_as(SELECT_BATCH_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound { entity_kind: "batch", entity_id: id })?;
        row.into_model()
    }

    pub async fn non_terminal_batches(&self) -> Result<Vec<Batch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(SELECT_NON_TERMINAL_BATCHES).fetch_all(&self.pool).await?;
        rows.into_iter().map(BatchRow::into_model).collect()
    }

    /// Polled by the outbox pump (spec §9 REDESIGN FLAGS): unprocessed
    /// side effects written alongside a transition, oldest first.
    pub async fn fetch_unprocessed_outbox_events(&self, limit: i64) -> Result<Vec<(i64, OutboxEvent)>> {
        let rows: Vec<(i64, serde_json::Value)> =
            sqlx::query_as(SELECT_UNPROCESSED_OUTBOX_EVENTS).bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(id, payload)| Ok((id, serde_json::from_value(payload)?)))
            .collect()
    }

    pub async fn mark_outbox_event_processed(&self, id: i64) -> Result<()> {
        sqlx::query(MARK_OUTBOX_EVENT_PROCESSED).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_batch(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM delivery_attempts WHERE request_id IN (SELECT id FROM requests WHERE batch_id = $1)")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM requests WHERE batch_id = $1").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM batches WHERE id = $1").bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
