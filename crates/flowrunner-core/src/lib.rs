//! # Durable workflow execution core
//!
//! The part of the agent-automation platform that survives process crashes
//! and operator restarts: runs, steps, a lease-based work queue, the node
//! execution contract, and the engine that drives a run from `pending` to a
//! terminal state one step at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   StartRun    ┌───────────────┐   Claim    ┌─────────────┐
//! │  Trigger   │ ────────────► │ ExecutionEngine│ ◄───────── │ WorkerPool  │
//! │  Ingress   │               │  + WorkQueue   │ ─────────► │  (N procs)  │
//! └────────────┘               └───────┬────────┘  dispatch  └─────────────┘
//!                                       │
//!                                       ▼
//!                               ┌───────────────┐
//!                               │  StateStore   │
//!                               │ (runs, steps, │
//!                               │  queue, ...)  │
//!                               └───────────────┘
//! ```
//!
//! `model` holds the pure data types (§3); `node` is the execution contract
//! nodes implement (§4.C); `persistence` is the `StateStore` trait plus its
//! in-memory and Postgres implementations (§4.A); `queue` is the logical
//! work-queue layer over the store (§4.B); `engine` drives runs through the
//! state machine (§4.D); `worker` is the claim/heartbeat/execute loop run by
//! each worker process (§4.E); `trigger` turns external events into runs
//! (§4.F); `reliability` holds general-purpose resilience primitives used by
//! node platform implementations, independent of the run/step model.

pub mod config;
pub mod engine;
pub mod model;
pub mod node;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod trigger;
pub mod worker;

pub use config::Config;
pub use engine::{ClaimPrepOutcome, EngineError, ExecutionEngine, PreparedStep, StartRunSpec, StepOutcome};
pub use model::*;
pub use node::{ExecutionContext, NodeError, NodeMeta, NodeOutput, NodeRegistry, NodeRuntime, Platform};
pub use persistence::{InMemoryStateStore, PostgresStateStore, StateStore, StoreError};
pub use queue::{WorkQueue, QueueError};
pub use trigger::{TriggerGuard, TriggerIngress, TriggerKind};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
