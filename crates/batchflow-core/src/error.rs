//! Core error types.

use thiserror::Error;

use crate::state::{BatchState, RequestState};

/// Errors that the domain model itself can raise, independent of any
/// particular storage backend.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A transition was attempted that is not a declared edge of the
    /// entity's state machine (spec §4.1).
    #[error("no matching transition for {entity_kind} {entity_id}: {from:?} -> {to:?}")]
    NoMatchingTransition {
        entity_kind: &'static str,
        entity_id: i64,
        from: String,
        to: String,
    },

    /// A transition was attempted on an entity already in a terminal state.
    #[error("{entity_kind} {entity_id} is terminal in state {state}, no further transitions allowed")]
    TerminalState {
        entity_kind: &'static str,
        entity_id: i64,
        state: String,
    },

    /// The delivery_config payload did not match either known variant.
    #[error("invalid delivery config: {0}")]
    InvalidDeliveryConfig(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn no_matching_batch_transition(id: i64, from: BatchState, to: BatchState) -> Self {
        Self::NoMatchingTransition {
            entity_kind: "batch",
            entity_id: id,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    pub fn no_matching_request_transition(id: i64, from: RequestState, to: RequestState) -> Self {
        Self::NoMatchingTransition {
            entity_kind: "request",
            entity_id: id,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}
