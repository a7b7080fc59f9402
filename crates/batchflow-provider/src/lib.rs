//! External-system clients: the batch-inference provider (spec §4.7) and
//! the webhook/AMQP delivery sinks (spec §4.7 `deliver`). Kept as thin
//! trait-bound interfaces so `batchflow-actions` can be tested end-to-end
//! against a mock instead of a live provider and broker.

mod error;
mod provider_client;
mod publisher;

pub use error::{ProviderError, Result};
pub use provider_client::{
    MockCall, MockProviderClient, ProviderBatchState, ProviderBatchStatus, ProviderClient, ReqwestProviderClient,
    RequestCounts, Usage,
};
pub use publisher::{DeliveryResult, HttpAmqpPublisher, MessagePublisher, MockDelivery, MockMessagePublisher};
