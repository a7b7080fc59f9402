//! Startup recovery (spec §4.7 C8): re-arm the job queue for every
//! non-terminal batch so a crash never leaves work stranded mid-pipeline.

use batchflow_core::{BatchState, StateMachine};
use batchflow_queue::JobQueue;
use batchflow_store::Store;

use crate::error::Result;

pub struct Recovery;

impl Recovery {
    #[tracing::instrument(skip(store, queue))]
    pub async fn recover_stale_work(store: &Store, queue: &JobQueue) -> Result<u64> {
        let batches = store.non_terminal_batches().await?;
        let mut enqueued = 0u64;

        for batch in batches {
            let kinds: &[&str] = match batch.state {
                BatchState::Building => &[],
                BatchState::Uploading => &["upload"],
                BatchState::Uploaded | BatchState::WaitingForCapacity => &["create_provider_batch"],
                BatchState::ProviderProcessing => &["poll_batch_status"],
                BatchState::ProviderCompleted | BatchState::Downloading | BatchState::Downloaded => {
                    &["download_and_parse"]
                }
                // Expired/waiting_to_retry are transient: the poll_batch_status
                // handler that put a batch there also enqueues its own
                // follow-up job in the same transaction (spec §4.7 poll).
                BatchState::Expired | BatchState::WaitingToRetry => &[],
                BatchState::ReadyToDeliver | BatchState::Delivering => &["check_delivery_completion"],
                _ => &[],
            };

            for kind in kinds {
                let args = serde_json::json!({ "batch_id": batch.id });
                let max_attempts = batchflow_queue::default_max_attempts(kind);
                if queue.enqueue(kind, &batch.id.to_string(), args, None, max_attempts, true).await?.is_some() {
                    enqueued += 1;
                }
            }

            if matches!(batch.state, BatchState::ReadyToDeliver | BatchState::Delivering) {
                let requests = store.list_requests_for_batch(batch.id, None).await?;
                for request in requests {
                    if request.state.is_terminal() {
                        continue;
                    }
                    let args = serde_json::json!({ "request_id": request.id });
                    if queue
                        .enqueue("deliver", &request.id.to_string(), args, None, 1, true)
                        .await?
                        .is_some()
                    {
                        enqueued += 1;
                    }
                }
            }
        }

        tracing::info!(enqueued, "recovered stale work");
        Ok(enqueued)
    }
}
