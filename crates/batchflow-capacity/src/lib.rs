//! Per-model token budget admission control (spec §4.5), grounded in the
//! corpus's exponential-backoff retry SQL (`increment_retry` in
//! `dataset_transform_pending_batch.rs`) for the token-limit-backoff shape.

use batchflow_config::Settings;
use batchflow_core::{Batch, WaitReason};
use batchflow_store::{Result, Store};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Wait { reason: WaitReason, headroom: i64 },
}

pub struct CapacityControl;

impl CapacityControl {
    /// Spec §4.5 admission algorithm, steps 1-5.
    #[tracing::instrument(skip(store, settings), fields(batch_id = batch.id, model = %batch.model))]
    pub async fn decide(store: &Store, settings: &Settings, batch: &Batch) -> Result<Admission> {
        let cap = settings.token_limit_for(&batch.model);
        let reserved_other = store.reserved_tokens_for_model(&batch.model, batch.id).await?;
        let need = batch.estimated_input_tokens_total;

        if reserved_other + need <= cap {
            Ok(Admission::Admit)
        } else {
            let headroom = (cap - reserved_other).max(0);
            tracing::debug!(cap, reserved_other, need, headroom, "insufficient headroom, batch will wait");
            Ok(Admission::Wait { reason: WaitReason::InsufficientHeadroom, headroom })
        }
    }

    /// Drains the waiting queue for a model in strict FIFO order
    /// (`waiting_since_at ASC, id ASC`), stopping at the first batch that
    /// still cannot fit — never skipping ahead to a smaller one that would
    /// (spec §4.5: "strict FIFO ordering is a correctness requirement to
    /// prevent starvation"). Returns the batches now eligible for
    /// `create_provider_batch`, in order.
    #[tracing::instrument(skip(store, settings))]
    pub async fn plan_drain(store: &Store, settings: &Settings, model: &str) -> Result<Vec<Batch>> {
        let mut tx = store.begin().await?;
        let waiting = store.lock_waiting_batches_for_model(&mut tx, model).await?;
        tx.rollback().await.ok(); // the lock only needed to snapshot a stable FIFO order

        let cap = settings.token_limit_for(model);
        let mut eligible = Vec::new();
        for batch in waiting {
            let reserved_other = store.reserved_tokens_for_model(model, batch.id).await?;
            if reserved_other + batch.estimated_input_tokens_total <= cap {
                eligible.push(batch);
            } else {
                break;
            }
        }
        Ok(eligible)
    }

    /// `next_at = now + base * 2^(attempts-1)`, capped (spec §4.5
    /// token-limit backoff).
    pub fn token_limit_backoff_next_at(settings: &Settings, attempts: u32) -> DateTime<Utc> {
        let exp = attempts.saturating_sub(1);
        let secs = settings
            .token_limit_backoff_base_secs
            .saturating_mul(2_u64.saturating_pow(exp))
            .min(settings.token_limit_backoff_cap_secs);
        Utc::now() + chrono::Duration::seconds(secs as i64)
    }

    pub fn token_limit_retries_exhausted(settings: &Settings, attempts: u32) -> bool {
        attempts >= settings.max_token_limit_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_config::Settings;

    fn settings_with_cap(cap: i64) -> Settings {
        let mut s = Settings::default();
        s.default_token_cap = cap;
        s
    }

    #[test]
    fn backoff_grows_monotonically_and_caps() {
        let settings = Settings::default();
        let mut last = Utc::now();
        for attempt in 1..=8 {
            let next = CapacityControl::token_limit_backoff_next_at(&settings, attempt);
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn retries_exhaust_after_max() {
        let settings = settings_with_cap(2_000_000);
        assert!(!CapacityControl::token_limit_retries_exhausted(&settings, settings.max_token_limit_retries - 1));
        assert!(CapacityControl::token_limit_retries_exhausted(&settings, settings.max_token_limit_retries));
    }
}
