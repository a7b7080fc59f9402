//! One `Handler` per job `kind`, each re-reading `Settings` fresh so a
//! config change takes effect on the very next job rather than requiring a
//! restart (spec §4.9).

use async_trait::async_trait;
use batchflow_queue::{Handler, Job};

use crate::actions::WorkflowActions;

fn arg_i64(job: &Job, field: &str) -> anyhow::Result<i64> {
    job.args
        .get(field)
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("job {} missing integer arg {field:?}", job.id))
}

fn arg_str<'a>(job: &'a Job, field: &str) -> anyhow::Result<&'a str> {
    job.args
        .get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("job {} missing string arg {field:?}", job.id))
}

pub struct UploadHandler(pub WorkflowActions);

#[async_trait]
impl Handler for UploadHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.0.upload(arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct CreateProviderBatchHandler(pub WorkflowActions);

#[async_trait]
impl Handler for CreateProviderBatchHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let settings = batchflow_config::load_settings()?;
        self.0.create_provider_batch(&settings, arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct PollBatchStatusHandler(pub WorkflowActions);

#[async_trait]
impl Handler for PollBatchStatusHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let settings = batchflow_config::load_settings()?;
        self.0.poll_batch_status(&settings, arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct DownloadAndParseHandler(pub WorkflowActions);

#[async_trait]
impl Handler for DownloadAndParseHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.0.download_and_parse(arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct DeliverHandler(pub WorkflowActions);

#[async_trait]
impl Handler for DeliverHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let settings = batchflow_config::load_settings()?;
        self.0.deliver(&settings, arg_i64(job, "request_id")?).await?;
        Ok(())
    }
}

pub struct CheckDeliveryCompletionHandler(pub WorkflowActions);

#[async_trait]
impl Handler for CheckDeliveryCompletionHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.0.finalize_batch_delivery(arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct RedeliverHandler(pub WorkflowActions);

#[async_trait]
impl Handler for RedeliverHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.0.redeliver(arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct CancelHandler(pub WorkflowActions);

#[async_trait]
impl Handler for CancelHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.0.cancel(arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct DeleteExpiredHandler(pub WorkflowActions);

#[async_trait]
impl Handler for DeleteExpiredHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.0.delete_expired(arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct ExpireStaleBuildingBatchesHandler(pub WorkflowActions);

#[async_trait]
impl Handler for ExpireStaleBuildingBatchesHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.0.expire_stale_building_batches(arg_i64(job, "batch_id")?).await?;
        Ok(())
    }
}

pub struct DrainCapacityHandler(pub WorkflowActions);

#[async_trait]
impl Handler for DrainCapacityHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let settings = batchflow_config::load_settings()?;
        self.0.drain_capacity(&settings, arg_str(job, "model")?).await?;
        Ok(())
    }
}
