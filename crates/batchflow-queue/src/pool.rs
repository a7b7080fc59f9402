//! Bounded worker pool pulled from the durable queue (spec §5: "many
//! short-lived worker tasks executed by a bounded worker pool pulled from a
//! durable job queue"). One poller task per registered kind, each gated by
//! a `Semaphore` sized from `Settings.queue_concurrency`, spawning a
//! `tokio::task` per claimed job the way the teacher's standalone runtime
//! spawns one task per accepted connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};

use crate::handler::Handler;
use crate::job::Job;
use crate::queue::JobQueue;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct WorkerPool {
    queue: JobQueue,
    worker_id: String,
    handlers: HashMap<String, Arc<dyn Handler>>,
    concurrency: HashMap<String, usize>,
    default_concurrency: usize,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, worker_id: impl Into<String>, default_concurrency: usize) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            handlers: HashMap::new(),
            concurrency: HashMap::new(),
            default_concurrency,
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, concurrency: usize, handler: Arc<dyn Handler>) {
        let kind = kind.into();
        self.concurrency.insert(kind.clone(), concurrency);
        self.handlers.insert(kind, handler);
    }

    /// Runs every registered kind's poller until `shutdown` reports `true`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut tasks = Vec::new();
        for (kind, handler) in &self.handlers {
            let kind = kind.clone();
            let handler = Arc::clone(handler);
            let concurrency = *self.concurrency.get(&kind).unwrap_or(&self.default_concurrency);
            let queue = self.queue.clone();
            let worker_id = self.worker_id.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                run_kind_poller(queue, worker_id, kind, handler, concurrency, &mut shutdown).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn run_kind_poller(
    queue: JobQueue,
    worker_id: String,
    kind: String,
    handler: Arc<dyn Handler>,
    concurrency: usize,
    shutdown: &mut watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    loop {
        if *shutdown.borrow() {
            return;
        }
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                    _ = shutdown.changed() => continue,
                }
            }
        };

        match queue.claim_one(&kind, &worker_id).await {
            Ok(Some(job)) => {
                let queue = queue.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    run_one(queue, handler, job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::error!(kind = %kind, error = %e, "failed to claim job");
                drop(permit);
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

async fn run_one(queue: JobQueue, handler: Arc<dyn Handler>, job: Job) {
    let job_id = job.id;
    match handler.handle(&job).await {
        Ok(()) => {
            if let Err(e) = queue.complete(job_id).await {
                tracing::error!(job_id, error = %e, "failed to mark job complete");
            }
        }
        Err(e) => {
            tracing::warn!(job_id, kind = %job.kind, error = %e, "job handler failed");
            if let Err(e) = queue.fail(&job, &e.to_string()).await {
                tracing::error!(job_id, error = %e, "failed to reschedule failed job");
            }
        }
    }
}
