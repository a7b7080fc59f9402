//! End-to-end workflow scenarios against a real Postgres database, the way
//! the corpus's daemon tests drive a `PostgresRequestManager` with
//! `#[sqlx::test]` and a mock HTTP client instead of stubbing the database.

use std::sync::Arc;

use batchflow_actions::{BatchBuilder, NewRequest, WorkflowActions};
use batchflow_config::Settings;
use batchflow_core::{BatchState, RequestState};
use batchflow_filestore::BatchFileStore;
use batchflow_provider::{
    DeliveryResult, MockMessagePublisher, MockProviderClient, ProviderBatchState, ProviderBatchStatus, RequestCounts,
};
use batchflow_queue::JobQueue;
use batchflow_store::Store;
use serde_json::json;

fn test_settings() -> Settings {
    Settings { default_token_cap: 1_000_000, max_requests_per_batch: 3, max_batch_size_bytes: 1 << 20, ..Default::default() }
}

struct Harness {
    store: Store,
    queue: JobQueue,
    actions: WorkflowActions,
    builder: BatchBuilder,
    provider: Arc<MockProviderClient>,
    publisher: Arc<MockMessagePublisher>,
    _tmp: tempfile::TempDir,
}

fn harness(pool: sqlx::PgPool) -> Harness {
    let store = Store::new(pool.clone());
    let queue = JobQueue::new(pool);
    let tmp = tempfile::tempdir().unwrap();
    let files = BatchFileStore::new(tmp.path(), 0);
    let provider = Arc::new(MockProviderClient::new());
    let publisher = Arc::new(MockMessagePublisher::new());

    let actions = WorkflowActions {
        store: store.clone(),
        files: files.clone(),
        provider: provider.clone(),
        publisher: publisher.clone(),
        queue: queue.clone(),
    };
    let builder = BatchBuilder::new(store.clone(), files);

    Harness { store, queue, actions, builder, provider, publisher, _tmp: tmp }
}

fn new_request(custom_id: &str) -> NewRequest {
    NewRequest {
        custom_id: custom_id.to_string(),
        model: "gpt-5".to_string(),
        endpoint: "/v1/chat/completions".to_string(),
        body: json!({ "messages": [{ "role": "user", "content": "hi" }] }),
        delivery: json!({ "type": "webhook", "webhook_url": "https://example.com/hook" }),
    }
}

fn completed_status(output_file_id: &str, total: i64) -> ProviderBatchStatus {
    ProviderBatchStatus {
        status: ProviderBatchState::Completed,
        output_file_id: Some(output_file_id.to_string()),
        error_file_id: None,
        request_counts: Some(RequestCounts { total, completed: total, failed: 0 }),
        usage: None,
        error_message: None,
    }
}

/// S1: a single request, submitted, uploaded, completed, delivered.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn happy_path_single_request_delivers(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    let accepted = h.builder.submit(&settings, new_request("req-1")).await.unwrap().unwrap();
    assert_eq!(accepted.custom_id, "req-1");

    let batches = h.store.non_terminal_batches().await.unwrap();
    assert_eq!(batches.len(), 1);
    let batch_id = batches[0].id;
    assert_eq!(batches[0].state, BatchState::Building);

    // A single request never hits the count/size cap and the age-based
    // close hasn't fired, so drive the uploading transition directly here.
    h.store
        .transition_batch(batch_id, BatchState::Uploading, Default::default(), Vec::new())
        .await
        .unwrap();

    h.provider.push_upload_file(Ok("file-in-1".to_string()));
    h.actions.upload(batch_id).await.unwrap();
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Uploaded);
    assert_eq!(batch.provider_input_file_id.as_deref(), Some("file-in-1"));

    h.provider.push_create_batch(Ok("provider-batch-1".to_string()));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::ProviderProcessing);

    h.provider.push_retrieve_batch(Ok(completed_status("file-out-1", 1)));
    h.actions.poll_batch_status(&settings, batch_id).await.unwrap();
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::ProviderCompleted);

    let result_line = json!({ "custom_id": "req-1", "response": { "status_code": 200, "body": {} } });
    h.provider.push_download_file(Ok(format!("{result_line}\n").into_bytes()));
    h.actions.download_and_parse(batch_id).await.unwrap();
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::ReadyToDeliver);

    let requests = h.store.list_requests_for_batch(batch_id, None).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].state, RequestState::ProviderProcessed);

    h.publisher.push_result(DeliveryResult::success());
    h.actions.deliver(&settings, requests[0].id).await.unwrap();

    let request = h.store.get_request(requests[0].id).await.unwrap();
    assert_eq!(request.state, RequestState::Delivered);
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Delivered);
    assert_eq!(h.publisher.call_count(), 1);
}

/// S2: one request succeeds, one comes back in the error file — the batch
/// ends up `partially_delivered`.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn mixed_success_and_failure_partially_delivers(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    let ok = h.builder.submit(&settings, new_request("ok-1")).await.unwrap().unwrap();
    let bad = h.builder.submit(&settings, new_request("bad-1")).await.unwrap().unwrap();
    assert_eq!(ok.custom_id, "ok-1");
    assert_eq!(bad.custom_id, "bad-1");

    let batches = h.store.non_terminal_batches().await.unwrap();
    let batch_id = batches[0].id;

    h.store.transition_batch(batch_id, BatchState::Uploading, Default::default(), Vec::new()).await.unwrap();
    h.provider.push_upload_file(Ok("file-in-2".to_string()));
    h.actions.upload(batch_id).await.unwrap();

    h.provider.push_create_batch(Ok("provider-batch-2".to_string()));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();

    h.provider.push_retrieve_batch(Ok(ProviderBatchStatus {
        status: ProviderBatchState::Completed,
        output_file_id: Some("file-out-2".to_string()),
        error_file_id: Some("file-err-2".to_string()),
        request_counts: Some(RequestCounts { total: 2, completed: 1, failed: 1 }),
        usage: None,
        error_message: None,
    }));
    h.actions.poll_batch_status(&settings, batch_id).await.unwrap();

    let ok_line = json!({ "custom_id": "ok-1", "response": { "status_code": 200, "body": {} } });
    h.provider.push_download_file(Ok(format!("{ok_line}\n").into_bytes()));
    let err_line = json!({ "custom_id": "bad-1", "error": { "message": "boom" } });
    h.provider.push_download_file(Ok(format!("{err_line}\n").into_bytes()));
    h.actions.download_and_parse(batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::ReadyToDeliver);

    let requests = h.store.list_requests_for_batch(batch_id, None).await.unwrap();
    let failed_req = requests.iter().find(|r| r.custom_id == "bad-1").unwrap();
    assert_eq!(failed_req.state, RequestState::Failed);
    let ok_req = requests.iter().find(|r| r.custom_id == "ok-1").unwrap();
    assert_eq!(ok_req.state, RequestState::ProviderProcessed);

    h.publisher.push_result(DeliveryResult::success());
    h.actions.deliver(&settings, ok_req.id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::PartiallyDelivered);
}

/// S3: provider expires the batch with both result files already produced;
/// download proceeds against what exists rather than failing outright.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn expiration_with_partial_files_downloads_what_exists(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("exp-1")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;

    h.store.transition_batch(batch_id, BatchState::Uploading, Default::default(), Vec::new()).await.unwrap();
    h.provider.push_upload_file(Ok("file-in-3".to_string()));
    h.actions.upload(batch_id).await.unwrap();
    h.provider.push_create_batch(Ok("provider-batch-3".to_string()));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();

    h.provider.push_retrieve_batch(Ok(ProviderBatchStatus {
        status: ProviderBatchState::Expired,
        output_file_id: Some("file-out-3".to_string()),
        error_file_id: None,
        request_counts: None,
        usage: None,
        error_message: None,
    }));
    h.actions.poll_batch_status(&settings, batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Downloading);

    let line = json!({ "custom_id": "exp-1", "response": { "status_code": 200, "body": {} } });
    h.provider.push_download_file(Ok(format!("{line}\n").into_bytes()));
    h.actions.download_and_parse(batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::ReadyToDeliver);
}

/// S3b: expired with neither file present — in-flight requests reset to
/// `pending` and the batch is resubmitted against the existing input file.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn expiration_with_no_files_resubmits(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("retry-1")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;

    h.store.transition_batch(batch_id, BatchState::Uploading, Default::default(), Vec::new()).await.unwrap();
    h.provider.push_upload_file(Ok("file-in-4".to_string()));
    h.actions.upload(batch_id).await.unwrap();
    h.provider.push_create_batch(Ok("provider-batch-4".to_string()));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();

    h.provider.push_retrieve_batch(Ok(ProviderBatchStatus {
        status: ProviderBatchState::Expired,
        output_file_id: None,
        error_file_id: None,
        request_counts: None,
        usage: None,
        error_message: None,
    }));
    h.actions.poll_batch_status(&settings, batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Uploaded);
    assert_eq!(batch.provider_input_file_id.as_deref(), Some("file-in-4"));

    let requests = h.store.list_requests_for_batch(batch_id, None).await.unwrap();
    assert_eq!(requests[0].state, RequestState::Pending);

    // Resubmission goes through create_provider_batch again against the
    // untouched input file id, without a second upload.
    h.provider.push_create_batch(Ok("provider-batch-4b".to_string()));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::ProviderProcessing);
    assert_eq!(batch.provider_batch_id.as_deref(), Some("provider-batch-4b"));
}

/// S5: a token-limit error on batch creation parks the batch for capacity
/// and increments the retry counter rather than failing outright.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn token_limit_exceeded_backs_off(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("tok-1")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;
    h.store.transition_batch(batch_id, BatchState::Uploading, Default::default(), Vec::new()).await.unwrap();
    h.provider.push_upload_file(Ok("file-in-5".to_string()));
    h.actions.upload(batch_id).await.unwrap();

    h.provider.push_create_batch(Err(batchflow_provider::ProviderError::TokenLimitExceeded(
        "enqueued token limit reached for gpt-5".to_string(),
    )));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::WaitingForCapacity);
    assert_eq!(batch.token_limit_retry_attempts, 1);
    assert!(batch.token_limit_retry_next_at.is_some());
}

/// S5b: once retries are exhausted the batch fails outright.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn token_limit_exhausted_fails_batch(pool: sqlx::PgPool) {
    let h = harness(pool);
    let mut settings = test_settings();
    settings.max_token_limit_retries = 1;

    h.builder.submit(&settings, new_request("tok-2")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;
    h.store.transition_batch(batch_id, BatchState::Uploading, Default::default(), Vec::new()).await.unwrap();
    h.provider.push_upload_file(Ok("file-in-6".to_string()));
    h.actions.upload(batch_id).await.unwrap();

    h.provider.push_create_batch(Err(batchflow_provider::ProviderError::TokenLimitExceeded("limit".to_string())));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Failed);
    assert!(batch.error_msg.is_some());
}

/// S6: an operator redeliver retries every `delivery_failed` request and
/// parks the batch back in `delivering` until they resolve.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn redeliver_retries_failed_deliveries(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("redeliv-1")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;
    h.store.transition_batch(batch_id, BatchState::Uploading, Default::default(), Vec::new()).await.unwrap();
    h.provider.push_upload_file(Ok("file-in-7".to_string()));
    h.actions.upload(batch_id).await.unwrap();
    h.provider.push_create_batch(Ok("provider-batch-7".to_string()));
    h.actions.create_provider_batch(&settings, batch_id).await.unwrap();
    h.provider.push_retrieve_batch(Ok(completed_status("file-out-7", 1)));
    h.actions.poll_batch_status(&settings, batch_id).await.unwrap();
    let line = json!({ "custom_id": "redeliv-1", "response": { "status_code": 200, "body": {} } });
    h.provider.push_download_file(Ok(format!("{line}\n").into_bytes()));
    h.actions.download_and_parse(batch_id).await.unwrap();

    let request = h.store.list_requests_for_batch(batch_id, None).await.unwrap().remove(0);

    h.publisher.push_result(DeliveryResult::failure(
        batchflow_core::DeliveryOutcome::ConnectionError,
        "connection refused",
    ));
    h.actions.deliver(&settings, request.id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::DeliveryFailed);

    h.actions.redeliver(batch_id).await.unwrap();
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Delivering);
    let request = h.store.get_request(request.id).await.unwrap();
    assert_eq!(request.state, RequestState::Delivering);

    let jobs = h.queue.claim_one("deliver", "test-worker").await.unwrap();
    assert!(jobs.is_some());

    h.publisher.push_result(DeliveryResult::success());
    h.actions.deliver(&settings, request.id).await.unwrap();
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Delivered);
}

/// Duplicate `custom_id` within the same `(model, endpoint)` is rejected at
/// submission rather than silently accepted twice.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn duplicate_custom_id_is_rejected(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("dup-1")).await.unwrap().unwrap();
    let result = h.builder.submit(&settings, new_request("dup-1")).await.unwrap();
    assert_eq!(result, Err(batchflow_actions::SubmitError::DuplicateCustomId));
}

/// Filling a batch to `max_requests_per_batch` closes it into `uploading`
/// immediately, without waiting on a later request to overflow it.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn batch_closes_on_reaching_request_cap(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("cap-1")).await.unwrap().unwrap();
    h.builder.submit(&settings, new_request("cap-2")).await.unwrap().unwrap();
    let outcome = h.builder.submit(&settings, new_request("cap-3")).await.unwrap().unwrap();
    assert_eq!(outcome.custom_id, "cap-3");

    let batches = h.store.non_terminal_batches().await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].state, BatchState::Uploading);
    assert_eq!(batches[0].request_count, 3);

    let requests = h.store.list_requests_for_batch(batches[0].id, None).await.unwrap();
    assert_eq!(requests.len(), 3);

    let job = h.queue.claim_one("upload", "test-worker").await.unwrap();
    assert!(job.is_some());
}

/// A `building` batch that never fills up still closes once its
/// `expire_stale_building_batches` job fires.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn stale_building_batch_with_requests_closes_on_expiry(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("stale-1")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;
    assert_eq!(h.store.get_batch(batch_id).await.unwrap().state, BatchState::Building);

    h.actions.expire_stale_building_batches(batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Uploading);

    let job = h.queue.claim_one("upload", "test-worker").await.unwrap();
    assert!(job.is_some());
}

/// An empty `building` batch is deleted outright once its
/// `expire_stale_building_batches` job fires. `request_count` only reaches
/// zero here by reproducing the state directly against the pool, since
/// nothing in the public API leaves a `building` batch with no requests.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn stale_empty_building_batch_is_deleted_on_expiry(pool: sqlx::PgPool) {
    let h = harness(pool.clone());

    let settings = test_settings();
    h.builder.submit(&settings, new_request("empty-1")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;
    sqlx::query("UPDATE batches SET request_count = 0 WHERE id = $1")
        .bind(batch_id)
        .execute(&pool)
        .await
        .unwrap();

    h.actions.expire_stale_building_batches(batch_id).await.unwrap();

    let err = h.store.get_batch(batch_id).await.unwrap_err();
    assert!(matches!(err, batchflow_store::StoreError::NotFound { .. }));
}

/// Cancelling a non-terminal batch cancels every in-flight request and
/// moves the batch itself to `cancelled`.
#[sqlx::test(migrations = "../batchflow-store/migrations")]
async fn cancel_moves_batch_and_requests_to_cancelled(pool: sqlx::PgPool) {
    let h = harness(pool);
    let settings = test_settings();

    h.builder.submit(&settings, new_request("cancel-1")).await.unwrap().unwrap();
    let batch_id = h.store.non_terminal_batches().await.unwrap()[0].id;

    h.actions.cancel(batch_id).await.unwrap();

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Cancelled);
    let requests = h.store.list_requests_for_batch(batch_id, None).await.unwrap();
    assert_eq!(requests[0].state, RequestState::Cancelled);
}
