//! Delivery sinks: push one request's response payload to its configured
//! webhook or AMQP destination and classify the outcome (spec §4.7 `deliver`,
//! §7). Grounded on the corpus's `HttpClient` trait/mock split for the
//! webhook side and `wtaylor-vector-contrib`'s `lapin` usage for AMQP.

use std::sync::Mutex;

use async_trait::async_trait;
use batchflow_core::{DeliveryConfig, DeliveryOutcome};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub outcome: DeliveryOutcome,
    pub error_msg: Option<String>,
}

impl DeliveryResult {
    pub fn success() -> Self {
        Self { outcome: DeliveryOutcome::Success, error_msg: None }
    }

    pub fn failure(outcome: DeliveryOutcome, error_msg: impl Into<String>) -> Self {
        Self { outcome, error_msg: Some(error_msg.into()) }
    }
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn deliver(&self, config: &DeliveryConfig, payload: &Value) -> DeliveryResult;
}

/// Webhook delivery over `reqwest`, AMQP delivery over a long-lived `lapin`
/// connection (channels are cheap, connections are not — one channel is
/// opened per publish).
pub struct HttpAmqpPublisher {
    http: reqwest::Client,
    amqp: Option<lapin::Connection>,
}

impl HttpAmqpPublisher {
    pub fn new(http: reqwest::Client, amqp: Option<lapin::Connection>) -> Self {
        Self { http, amqp }
    }

    pub async fn connect(http: reqwest::Client, amqp_url: Option<&str>) -> Result<Self, lapin::Error> {
        let amqp = match amqp_url {
            Some(url) => Some(lapin::Connection::connect(url, lapin::ConnectionProperties::default()).await?),
            None => None,
        };
        Ok(Self::new(http, amqp))
    }

    async fn deliver_webhook(&self, webhook_url: &str, payload: &Value) -> DeliveryResult {
        match self.http.post(webhook_url).json(payload).send().await {
            Ok(response) if response.status().is_success() => DeliveryResult::success(),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                DeliveryResult::failure(DeliveryOutcome::HttpStatusNot2xx, format!("{status}: {body}"))
            }
            Err(e) if e.is_timeout() => DeliveryResult::failure(DeliveryOutcome::Timeout, e.to_string()),
            Err(e) if e.is_connect() => DeliveryResult::failure(DeliveryOutcome::ConnectionError, e.to_string()),
            Err(e) => DeliveryResult::failure(DeliveryOutcome::Other, e.to_string()),
        }
    }

    async fn deliver_amqp(
        &self,
        rabbitmq_queue: &Option<String>,
        rabbitmq_exchange: &Option<String>,
        rabbitmq_routing_key: &Option<String>,
        payload: &Value,
    ) -> DeliveryResult {
        let Some(connection) = &self.amqp else {
            return DeliveryResult::failure(DeliveryOutcome::Other, "no amqp connection configured");
        };

        let (exchange, routing_key) = match rabbitmq_queue {
            Some(queue) => ("", queue.as_str()),
            None => (
                rabbitmq_exchange.as_deref().unwrap_or_default(),
                rabbitmq_routing_key.as_deref().unwrap_or_default(),
            ),
        };

        let body = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => return DeliveryResult::failure(DeliveryOutcome::Other, e.to_string()),
        };

        let channel = match connection.create_channel().await {
            Ok(c) => c,
            Err(e) => return DeliveryResult::failure(DeliveryOutcome::ConnectionError, e.to_string()),
        };

        let publish = channel
            .basic_publish(
                exchange,
                routing_key,
                lapin::options::BasicPublishOptions::default(),
                &body,
                lapin::BasicProperties::default(),
            )
            .await;

        match publish {
            Ok(confirm) => match confirm.await {
                Ok(_) => DeliveryResult::success(),
                Err(e) => classify_amqp_error(e),
            },
            Err(e) => classify_amqp_error(e),
        }
    }
}

fn classify_amqp_error(e: lapin::Error) -> DeliveryResult {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("no queue") || lower.contains("not_found") && lower.contains("queue") {
        DeliveryResult::failure(DeliveryOutcome::QueueNotFound, message)
    } else if lower.contains("no exchange") || lower.contains("not_found") && lower.contains("exchange") {
        DeliveryResult::failure(DeliveryOutcome::ExchangeNotFound, message)
    } else {
        DeliveryResult::failure(DeliveryOutcome::Other, message)
    }
}

#[async_trait]
impl MessagePublisher for HttpAmqpPublisher {
    async fn deliver(&self, config: &DeliveryConfig, payload: &Value) -> DeliveryResult {
        match config {
            DeliveryConfig::Webhook { webhook_url } => self.deliver_webhook(webhook_url, payload).await,
            DeliveryConfig::Amqp { rabbitmq_queue, rabbitmq_exchange, rabbitmq_routing_key } => {
                self.deliver_amqp(rabbitmq_queue, rabbitmq_exchange, rabbitmq_routing_key, payload).await
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockDelivery {
    pub config: DeliveryConfig,
    pub payload: Value,
}

/// Records every delivery attempt and replays one canned result per call,
/// in order.
#[derive(Default)]
pub struct MockMessagePublisher {
    results: Mutex<Vec<DeliveryResult>>,
    pub calls: Mutex<Vec<MockDelivery>>,
}

impl MockMessagePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: DeliveryResult) {
        self.results.lock().unwrap().push(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MessagePublisher for MockMessagePublisher {
    async fn deliver(&self, config: &DeliveryConfig, payload: &Value) -> DeliveryResult {
        self.calls.lock().unwrap().push(MockDelivery { config: config.clone(), payload: payload.clone() });
        let mut results = self.results.lock().unwrap();
        if results.is_empty() {
            return DeliveryResult::failure(DeliveryOutcome::Other, "no mock delivery result queued");
        }
        results.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_publisher_replays_queued_results_in_order() {
        let publisher = MockMessagePublisher::new();
        publisher.push_result(DeliveryResult::success());
        publisher.push_result(DeliveryResult::failure(DeliveryOutcome::HttpStatusNot2xx, "500"));

        let config = DeliveryConfig::Webhook { webhook_url: "https://example.com/hook".to_string() };
        let first = publisher.deliver(&config, &serde_json::json!({"a": 1})).await;
        let second = publisher.deliver(&config, &serde_json::json!({"a": 2})).await;

        assert_eq!(first.outcome, DeliveryOutcome::Success);
        assert_eq!(second.outcome, DeliveryOutcome::HttpStatusNot2xx);
        assert_eq!(publisher.call_count(), 2);
    }
}
