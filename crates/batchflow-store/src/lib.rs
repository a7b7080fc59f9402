//! Transactional persistence and transactional outbox (spec §4.2, §9).
//!
//! Backed by Postgres via `sqlx`, using runtime-checked `query_as` against
//! bound `const &str` SQL (no `DATABASE_URL` at build time), the way the
//! corpus's Postgres storage modules are written.

mod error;
mod outbox;
mod patch;
mod rows;
mod settings_kv;
mod store;

pub use error::{Result, StoreError};
pub use outbox::OutboxEvent;
pub use patch::{BatchPatch, RequestPatch};
pub use settings_kv::{get_setting, set_setting};
pub use store::{EnqueueOutcome, NewRequestInput, Store};
