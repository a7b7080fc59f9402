//! Declared state machines for `Batch` and `Request` (spec §4.1).
//!
//! Both enums implement the same small [`StateMachine`] trait so the guard
//! logic in `batchflow-store::transition` is written once against the trait
//! rather than duplicated per entity, the way `otlp2parquet-core` shares one
//! trait across its signal-type enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A generic state-machine contract: an entity enumerates its own declared
/// edges and which of its states are terminal.
pub trait StateMachine: Sized + Copy + Eq + fmt::Debug + 'static {
    /// All declared `(from, to)` edges, including the special operator-only
    /// "redeliver" edges out of states that are otherwise terminal.
    fn declared_edges() -> &'static [(Self, Self)];

    /// True if no ordinary transition may leave this state. Terminal states
    /// may still have a declared edge used exclusively by an explicit
    /// operator action (redeliver) — `can_transition` still honors it.
    fn is_terminal(&self) -> bool;

    fn can_transition(from: Self, to: Self) -> bool {
        Self::declared_edges().iter().any(|(f, t)| *f == from && *t == to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Building,
    Uploading,
    Uploaded,
    WaitingForCapacity,
    ProviderProcessing,
    ProviderCompleted,
    Downloading,
    Downloaded,
    Expired,
    WaitingToRetry,
    ReadyToDeliver,
    Delivering,
    Delivered,
    PartiallyDelivered,
    DeliveryFailed,
    Failed,
    Cancelled,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::WaitingForCapacity => "waiting_for_capacity",
            Self::ProviderProcessing => "provider_processing",
            Self::ProviderCompleted => "provider_completed",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Expired => "expired",
            Self::WaitingToRetry => "waiting_to_retry",
            Self::ReadyToDeliver => "ready_to_deliver",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::PartiallyDelivered => "partially_delivered",
            Self::DeliveryFailed => "delivery_failed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "building" => Self::Building,
            "uploading" => Self::Uploading,
            "uploaded" => Self::Uploaded,
            "waiting_for_capacity" => Self::WaitingForCapacity,
            "provider_processing" => Self::ProviderProcessing,
            "provider_completed" => Self::ProviderCompleted,
            "downloading" => Self::Downloading,
            "downloaded" => Self::Downloaded,
            "expired" => Self::Expired,
            "waiting_to_retry" => Self::WaitingToRetry,
            "ready_to_deliver" => Self::ReadyToDeliver,
            "delivering" => Self::Delivering,
            "delivered" => Self::Delivered,
            "partially_delivered" => Self::PartiallyDelivered,
            "delivery_failed" => Self::DeliveryFailed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

const BATCH_EDGES: &[(BatchState, BatchState)] = {
    use BatchState::*;
    &[
        (Building, Uploading),
        (Building, Cancelled),
        (Uploading, Uploaded),
        (Uploading, Cancelled),
        (Uploading, Failed),
        (Uploaded, WaitingForCapacity),
        (Uploaded, ProviderProcessing),
        (Uploaded, Cancelled),
        (Uploaded, Failed),
        (WaitingForCapacity, Uploaded),
        (WaitingForCapacity, Failed),
        (WaitingForCapacity, Cancelled),
        (ProviderProcessing, ProviderCompleted),
        (ProviderProcessing, WaitingForCapacity),
        (ProviderProcessing, Expired),
        (ProviderProcessing, Failed),
        (ProviderProcessing, Cancelled),
        (ProviderCompleted, Downloading),
        (ProviderCompleted, Cancelled),
        (Downloading, Downloaded),
        (Downloading, Failed),
        (Downloading, Cancelled),
        (Expired, Downloading),
        (Expired, WaitingToRetry),
        (Expired, Cancelled),
        (WaitingToRetry, Uploaded),
        (WaitingToRetry, Cancelled),
        (Downloaded, ReadyToDeliver),
        (Downloaded, Delivered),
        (Downloaded, Failed),
        (Downloaded, Cancelled),
        (ReadyToDeliver, Delivering),
        (ReadyToDeliver, Cancelled),
        (Delivering, Delivered),
        (Delivering, PartiallyDelivered),
        (Delivering, DeliveryFailed),
        (Delivering, Cancelled),
        // Operator-only redeliver edges out of otherwise-terminal states.
        (DeliveryFailed, Delivering),
        (PartiallyDelivered, Delivering),
    ]
};

impl StateMachine for BatchState {
    fn declared_edges() -> &'static [(Self, Self)] {
        BATCH_EDGES
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Delivered | Self::PartiallyDelivered | Self::DeliveryFailed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    ProviderProcessing,
    ProviderProcessed,
    Delivering,
    Delivered,
    Failed,
    DeliveryFailed,
    Cancelled,
    Expired,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ProviderProcessing => "provider_processing",
            Self::ProviderProcessed => "provider_processed",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::DeliveryFailed => "delivery_failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "provider_processing" => Self::ProviderProcessing,
            "provider_processed" => Self::ProviderProcessed,
            "delivering" => Self::Delivering,
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            "delivery_failed" => Self::DeliveryFailed,
            "cancelled" => Self::Cancelled,
            "expired" => Self::Expired,
            _ => return None,
        })
    }
}

const REQUEST_EDGES: &[(RequestState, RequestState)] = {
    use RequestState::*;
    &[
        (Pending, ProviderProcessing),
        (Pending, Cancelled),
        (Pending, Expired),
        (Pending, Failed),
        (ProviderProcessing, ProviderProcessed),
        (ProviderProcessing, Pending), // reset on (partial) expiration, spec §4.7 poll_batch_status
        (ProviderProcessing, Failed),
        (ProviderProcessing, Cancelled),
        (ProviderProcessing, Expired),
        (ProviderProcessed, Delivering),
        (ProviderProcessed, Cancelled),
        (Delivering, Delivered),
        (Delivering, DeliveryFailed),
        (Delivering, Cancelled),
        // Operator-only redeliver edge out of an otherwise-terminal state.
        (DeliveryFailed, Delivering),
    ]
};

impl StateMachine for RequestState {
    fn declared_edges() -> &'static [(Self, Self)] {
        REQUEST_EDGES
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::DeliveryFailed | Self::Cancelled | Self::Expired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_ordinary_outgoing_edge_except_redeliver() {
        for state in [BatchState::Delivered, BatchState::Failed, BatchState::Cancelled] {
            assert!(state.is_terminal());
            assert!(BATCH_EDGES.iter().all(|(f, _)| *f != state));
        }
        // delivery_failed/partially_delivered are terminal but keep the redeliver edge
        assert!(BatchState::can_transition(BatchState::DeliveryFailed, BatchState::Delivering));
        assert!(BatchState::can_transition(BatchState::PartiallyDelivered, BatchState::Delivering));
    }

    #[test]
    fn undeclared_transition_is_rejected() {
        assert!(!BatchState::can_transition(BatchState::Building, BatchState::Delivered));
        assert!(!RequestState::can_transition(RequestState::Delivered, RequestState::Pending));
    }

    #[test]
    fn round_trips_through_string_form() {
        for s in [
            BatchState::Building,
            BatchState::WaitingForCapacity,
            BatchState::PartiallyDelivered,
        ] {
            assert_eq!(BatchState::parse(s.as_str()), Some(s));
        }
    }
}
