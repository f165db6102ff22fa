//! In-process worker pool (§4.E): [`WorkerPool`] runs a poll loop, a
//! heartbeat loop, and a stale-reclaim loop around a bounded semaphore,
//! dispatching every claimed queue item straight through
//! [`crate::engine::ExecutionEngine::process`]. This is the embedded
//! alternative to a remote worker process speaking the HTTP
//! claim-work/complete-work protocol — useful for running the engine and
//! its workers in a single process (tests, small deployments).
//!
//! ```ignore
//! let config = WorkerPoolConfig::default().with_worker_id("worker-1").with_max_concurrency(20);
//! let pool = WorkerPool::new(engine, config);
//! pool.start().await?;
//! // ... later
//! pool.shutdown().await?;
//! ```

mod backpressure;
mod poller;
mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use poller::{AdaptivePoller, PollerConfig, PollerError, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
