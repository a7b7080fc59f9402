//! Workflow orchestration: the ingress builder, the per-state-transition
//! actions a job executes, startup recovery, and the outbox-to-event-bus
//! pump (spec §4.6, §4.7, §4.8).

mod actions;
mod builder;
mod error;
mod eventing;
mod handlers;
mod outbox_pump;
mod recovery;

pub use actions::WorkflowActions;
pub use builder::{Accepted, BatchBuilder, NewRequest, SubmitError};
pub use error::{ActionsError, Result};
pub use eventing::{Event, EventSink, Eventing};
pub use handlers::{
    CancelHandler, CheckDeliveryCompletionHandler, CreateProviderBatchHandler, DeleteExpiredHandler, DeliverHandler,
    DownloadAndParseHandler, DrainCapacityHandler, ExpireStaleBuildingBatchesHandler, PollBatchStatusHandler,
    RedeliverHandler, UploadHandler,
};
pub use outbox_pump::OutboxPump;
pub use recovery::Recovery;
