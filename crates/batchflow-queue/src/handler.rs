use async_trait::async_trait;

use crate::job::Job;

/// A job handler for one `kind`. Implementations re-read the subject entity
/// under lock and must be safe to re-execute (spec §4.4: "handlers ... must
/// be idempotent").
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}
