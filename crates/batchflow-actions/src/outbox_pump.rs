//! Drains `outbox_events` into the job queue and the event bus (spec §9
//! REDESIGN FLAGS). Runs as its own long-lived task alongside the
//! `WorkerPool`, polling the way `WorkerPool`'s per-kind pollers do.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use batchflow_queue::JobQueue;
use batchflow_store::{OutboxEvent, Store};

use crate::eventing::{Event, Eventing};
use crate::error::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const BATCH_LIMIT: i64 = 100;

pub struct OutboxPump {
    store: Store,
    queue: JobQueue,
    eventing: Arc<Eventing>,
}

impl OutboxPump {
    pub fn new(store: Store, queue: JobQueue, eventing: Arc<Eventing>) -> Self {
        Self { store, queue, eventing }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.drain_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "outbox pump failed to drain a batch");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn drain_once(&self) -> Result<usize> {
        let events = self.store.fetch_unprocessed_outbox_events(BATCH_LIMIT).await?;
        let n = events.len();
        for (id, event) in events {
            self.dispatch(event).await?;
            self.store.mark_outbox_event_processed(id).await?;
        }
        Ok(n)
    }

    async fn dispatch(&self, event: OutboxEvent) -> Result<()> {
        match event {
            OutboxEvent::EnqueueJob { job_kind, subject_id, args, run_at, singleton, max_attempts } => {
                self.queue.enqueue(&job_kind, &subject_id, args, run_at, max_attempts, singleton).await?;
            }
            OutboxEvent::Publish { payload, .. } => match serde_json::from_value::<Event>(payload) {
                Ok(event) => self.eventing.publish(event),
                Err(e) => tracing::warn!(error = %e, "dropping outbox publish event with unrecognized payload"),
            },
        }
        Ok(())
    }
}
