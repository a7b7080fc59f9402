use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no transition {from:?} -> {to} declared for {entity_kind} {entity_id}")]
    NoMatchingTransition {
        entity_kind: &'static str,
        entity_id: i64,
        from: String,
        to: String,
    },

    #[error("{entity_kind} {entity_id} is in terminal state {state} and accepts no transition")]
    TerminalState {
        entity_kind: &'static str,
        entity_id: i64,
        state: String,
    },

    #[error("{entity_kind} {entity_id} not found")]
    NotFound { entity_kind: &'static str, entity_id: i64 },

    #[error("invalid delivery config: {0}")]
    InvalidDeliveryConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("optimistic lock conflict on {entity_kind} {entity_id}: row changed since it was read")]
    Conflict { entity_kind: &'static str, entity_id: i64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<batchflow_core::CoreError> for StoreError {
    fn from(e: batchflow_core::CoreError) -> Self {
        match e {
            batchflow_core::CoreError::NoMatchingTransition { entity_kind, entity_id, from, to } => {
                StoreError::NoMatchingTransition { entity_kind, entity_id, from, to }
            }
            batchflow_core::CoreError::TerminalState { entity_kind, entity_id, state } => {
                StoreError::TerminalState { entity_kind, entity_id, state }
            }
            batchflow_core::CoreError::InvalidDeliveryConfig(msg) => StoreError::InvalidDeliveryConfig(msg),
        }
    }
}
