//! In-process worker pool (§4.E).
//!
//! An alternative to the HTTP claim-work/complete-work protocol a remote
//! worker process speaks (`flowrunner-api::workers`): this pool runs its
//! own poll, heartbeat, and stale-reclaim loops inside the same process as
//! the engine and dispatches every claimed item straight through
//! [`ExecutionEngine::process`], so node execution goes through the same
//! in-process `NodeRegistry` the engine's own tests use.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::poller::{PollerConfig, PollerError, TaskPoller};
use crate::engine::ExecutionEngine;
use crate::model::{QueueType, WorkerRecord, WorkerStatus};
use crate::persistence::StateStore;

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker id (defaults to `hostname-pid` when unset).
    pub worker_id: String,

    pub hostname: String,
    pub version: String,

    /// Queue types this worker claims.
    pub capabilities: Vec<QueueType>,

    /// Maximum concurrent step executions.
    pub max_concurrency: usize,

    pub backpressure: BackpressureConfig,
    pub poller: PollerConfig,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,

    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let pid = std::process::id();
        Self {
            worker_id: format!("worker-{pid}-{}", Uuid::now_v7()),
            hostname: hostname_or_unknown(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![QueueType::StartRun, QueueType::ExecuteStep, QueueType::RetryStep, QueueType::RecoverRun],
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

impl WorkerPoolConfig {
    pub fn new(capabilities: Vec<QueueType>) -> Self {
        Self { capabilities, ..Default::default() }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error(transparent)]
    Store(#[from] crate::persistence::StoreError),

    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// A pool of one worker process claiming and executing work in-process.
///
/// ```ignore
/// let pool = WorkerPool::new(engine, WorkerPoolConfig::default());
/// pool.start().await?;
/// // ... later
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: StateStore> {
    engine: Arc<ExecutionEngine<S>>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: std::sync::RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: StateStore + 'static> WorkerPool<S> {
    pub fn new(engine: Arc<ExecutionEngine<S>>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(config.backpressure.clone(), config.max_concurrency));

        Self {
            engine,
            config: config.clone(),
            backpressure,
            shutdown_tx,
            shutdown_rx,
            status: std::sync::RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            poll_handle: std::sync::Mutex::new(None),
            heartbeat_handle: std::sync::Mutex::new(None),
            reclaim_handle: std::sync::Mutex::new(None),
        }
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            capabilities = ?self.config.capabilities,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        self.register_worker().await?;
        *self.status.write().unwrap() = WorkerPoolStatus::Running;

        self.start_poll_loop();
        self.start_heartbeat_loop();
        self.start_reclaim_loop();

        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("all tasks completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.config.max_concurrency - available, "shutdown timeout reached");
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.engine.store().deregister_worker(&self.config.worker_id).await?;
        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn is_accepting(&self) -> bool {
        self.backpressure.is_accepting() && *self.status.read().unwrap() == WorkerPoolStatus::Running
    }

    async fn register_worker(&self) -> Result<(), WorkerPoolError> {
        let now = Utc::now();
        let record = WorkerRecord {
            id: self.config.worker_id.clone(),
            hostname: self.config.hostname.clone(),
            version: self.config.version.clone(),
            capabilities: self.config.capabilities.iter().map(|c| c.to_string()).collect(),
            status: WorkerStatus::Idle,
            last_heartbeat_at: now,
            started_at: now,
            max_concurrent_steps: self.config.max_concurrency as u32,
            current_step_count: 0,
            lifetime_completed: 0,
            lifetime_failed: 0,
        };
        self.engine.store().register_worker(record).await?;
        Ok(())
    }

    fn start_poll_loop(&self) {
        let engine = Arc::clone(&self.engine);
        let config = self.config.clone();
        let backpressure = Arc::clone(&self.backpressure);
        let active_tasks = Arc::clone(&self.active_tasks);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller = TaskPoller::new(
                engine.queue().clone(),
                config.worker_id.clone(),
                config.capabilities.clone(),
                config.poller.clone(),
                shutdown_rx.clone(),
            );

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                if !backpressure.should_accept() {
                    debug!("poll loop: under backpressure, waiting");
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let available_slots = backpressure.available_slots();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(items) => {
                        for item in items {
                            let permit = match active_tasks.clone().try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    debug!("no permits available");
                                    break;
                                }
                            };
                            backpressure.task_started();

                            let engine = Arc::clone(&engine);
                            let bp = Arc::clone(&backpressure);
                            let worker_id = config.worker_id.clone();

                            tokio::spawn(async move {
                                let item_id = item.item.id;
                                if let Err(err) = engine.process(&item, &worker_id).await {
                                    error!(%item_id, error = %err, "step processing failed");
                                }
                                bp.task_completed();
                                drop(permit);
                            });
                        }
                    }
                    Err(err) => error!(error = %err, "poll error"),
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock().unwrap() = Some(handle);
    }

    fn start_heartbeat_loop(&self) {
        let engine = Arc::clone(&self.engine);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        let backpressure = Arc::clone(&self.backpressure);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let load = backpressure.current_load() as u32;
                        if let Err(err) = engine.store().heartbeat_worker(&worker_id, load).await {
                            error!(error = %err, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("heartbeat loop exited");
        });

        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }

    fn start_reclaim_loop(&self) {
        let engine = Arc::clone(&self.engine);
        let interval = self.config.stale_reclaim_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.queue().recover_orphaned().await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "reclaimed orphaned queue items");
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "stale item reclamation failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("reclaim loop exited");
        });

        *self.reclaim_handle.lock().unwrap() = Some(handle);
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_all_queue_capabilities() {
        let config = WorkerPoolConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.capabilities.len(), 4);
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn config_builder_overrides_defaults() {
        let config = WorkerPoolConfig::new(vec![QueueType::ExecuteStep])
            .with_worker_id("test-worker")
            .with_max_concurrency(20)
            .with_heartbeat_interval(Duration::from_secs(10));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.capabilities, vec![QueueType::ExecuteStep]);
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn worker_pool_status_variants_are_distinct() {
        assert_ne!(WorkerPoolStatus::Running, WorkerPoolStatus::Stopped);
        assert_ne!(WorkerPoolStatus::Draining, WorkerPoolStatus::Running);
    }
}
