//! The `StateStore` trait (§4.A) plus its two implementations: an
//! in-memory store for tests and small single-process deployments, and
//! a Postgres-backed store for production. Both satisfy the same
//! trait and the same invariants (§8) — nothing above this layer knows
//! or cares which one it is talking to.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use store::{Advance, ClaimedQueueItem, FanOutChild, StateStore, StoreError, SuccessorSpec};
