//! Domain model and state machine shared by every batchflow crate.
//!
//! This crate has no I/O dependencies: it defines the shapes that flow
//! through the Store, the FileStore, the JobQueue and the workflow actions,
//! plus the generic state-machine contract they all implement.

pub mod canonical;
pub mod delivery;
pub mod error;
pub mod model;
pub mod state;

pub use canonical::canonicalize_payload;
pub use delivery::DeliveryConfig;
pub use error::{CoreError, Result};
pub use model::{Batch, DeliveryAttempt, DeliveryOutcome, Request, Transition, WaitReason};
pub use state::{BatchState, RequestState, StateMachine};
