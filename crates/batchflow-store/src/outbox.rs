//! Transactional outbox (spec §9 REDESIGN FLAGS): every side effect a
//! transition wants to trigger is written to `outbox_events` in the same
//! transaction as the state change itself, instead of firing from an
//! in-process after-commit hook that could run without the write having
//! actually landed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Postgres;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxEvent {
    EnqueueJob {
        job_kind: String,
        subject_id: String,
        args: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
        singleton: bool,
        max_attempts: i32,
    },
    Publish {
        topic: String,
        payload: serde_json::Value,
    },
}

const INSERT_OUTBOX_EVENT: &str = "INSERT INTO outbox_events (kind, payload) VALUES ($1, $2)";

pub(crate) async fn write_outbox_events(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    events: &[OutboxEvent],
) -> Result<(), sqlx::Error> {
    for event in events {
        let (kind, payload) = match event {
            OutboxEvent::EnqueueJob { .. } => ("enqueue_job", serde_json::to_value(event).expect("outbox event serializes")),
            OutboxEvent::Publish { .. } => ("publish", serde_json::to_value(event).expect("outbox event serializes")),
        };
        sqlx::query(INSERT_OUTBOX_EVENT).bind(kind).bind(payload).execute(&mut **tx).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_job_round_trips_through_json() {
        let event = OutboxEvent::EnqueueJob {
            job_kind: "poll_batch_status".into(),
            subject_id: "42".into(),
            args: serde_json::json!({ "batch_id": 42 }),
            run_at: None,
            singleton: true,
            max_attempts: 20,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "enqueue_job");
        let back: OutboxEvent = serde_json::from_value(value).unwrap();
        match back {
            OutboxEvent::EnqueueJob { job_kind, .. } => assert_eq!(job_kind, "poll_batch_status"),
            _ => panic!("wrong variant"),
        }
    }
}
