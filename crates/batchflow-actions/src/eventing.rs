//! Named event bus decoupled from the transaction that raises an event
//! (spec §4.8, §9 REDESIGN FLAGS: "pub/sub coupled to ORM callbacks → a
//! named event bus behind an interface"). Publishing never blocks the
//! transaction that caused it — events reach this module only via the
//! outbox pump, after the commit that produced them has already landed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Transition { entity_kind: String, id: i64, from: Option<String>, to: String, at: DateTime<Utc> },
    MetricsDelta {
        batch_id: i64,
        request_count: i64,
        size_bytes: i64,
        estimated_input_tokens_total: i64,
        at: DateTime<Utc>,
    },
}

/// An untrusted external collaborator (spec §4.8: "the web UI") that wants
/// a copy of every event. Best-effort: a slow or failing sink never holds
/// up publication to others.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: Event);
}

#[derive(Clone)]
pub struct Eventing {
    sender: broadcast::Sender<Event>,
}

impl Eventing {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Fire-and-forget: a channel with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Spawns a task that forwards every broadcast event to `sink` until
    /// the channel is closed.
    pub fn spawn_sink(&self, sink: Arc<dyn EventSink>) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => sink.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event sink fell behind, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

impl Default for Eventing {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl EventSink for CountingSink {
        async fn handle(&self, _event: Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_sink() {
        let eventing = Eventing::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let handle = eventing.spawn_sink(Arc::new(CountingSink(count.clone())));

        eventing.publish(Event::Transition {
            entity_kind: "batch".into(),
            id: 1,
            from: Some("building".into()),
            to: "uploading".into(),
            at: Utc::now(),
        });

        // give the spawned task a turn to run
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.abort();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let eventing = Eventing::new(16);
        eventing.publish(Event::Transition {
            entity_kind: "batch".into(),
            id: 1,
            from: None,
            to: "building".into(),
            at: Utc::now(),
        });
    }
}
