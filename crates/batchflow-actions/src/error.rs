use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionsError {
    #[error(transparent)]
    Store(#[from] batchflow_store::StoreError),

    #[error(transparent)]
    FileStore(#[from] batchflow_filestore::FileStoreError),

    #[error(transparent)]
    Queue(#[from] batchflow_queue::QueueError),

    #[error(transparent)]
    Provider(#[from] batchflow_provider::ProviderError),

    #[error(transparent)]
    Core(#[from] batchflow_core::CoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("job args missing field {0:?}")]
    MissingArg(&'static str),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ActionsError>;
