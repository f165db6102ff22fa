//! Execution context and the `Platform` capability object handed to
//! every node at execution time (§4.C).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Handle to cancel an in-flight node execution — held by the engine,
/// polled or awaited by the node.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Error from a platform capability call (HTTP, storage, secrets, ...).
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("secret {0:?} not found")]
    SecretNotFound(String),
    #[error("credential {0:?} could not be resolved: {1}")]
    CredentialResolution(String, String),
}

/// An HTTP request a node asks the platform to perform on its behalf
/// (§4.C "nodes never hold network clients directly; all egress is
/// routed through `Platform::http` so the host can apply shared
/// timeouts, credential injection, and egress policy").
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Capabilities a node may use; implemented once by the host process
/// and shared across all node executions (§4.C). Kept as a trait
/// object (not generics) so the registry can stay non-generic — nodes
/// depend on `&dyn Platform`, never on a concrete host type.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn http(&self, request: HttpRequest) -> Result<HttpResponse, PlatformError>;

    async fn storage_get(&self, key: &str) -> Result<Option<Vec<u8>>, PlatformError>;
    async fn storage_put(&self, key: &str, value: Vec<u8>) -> Result<(), PlatformError>;

    /// Resolve a named secret reference (never the raw value logged).
    async fn resolve_secret(&self, name: &str) -> Result<String, PlatformError>;

    /// Resolve a named credential (e.g. an OAuth token) for a connected
    /// integration, refreshing it if the platform's credential store
    /// supports refresh.
    async fn resolve_credential(&self, name: &str) -> Result<String, PlatformError>;

    /// Emit a structured log line attributed to the running node.
    fn log(&self, level: tracing::Level, message: &str, fields: Value);

    /// Emit a side-channel event visible to the run's event stream
    /// (distinct from the node's primary output envelope).
    fn emit(&self, event: &str, payload: Value);

    async fn sleep(&self, duration: Duration);
}

/// Wraps the host's shared `Arc<dyn Platform>` with a per-execution
/// mutation log so a node can call `ctx.platform.set_variable(k, v)`
/// (§5) without the `Platform` trait itself — implemented once per host
/// process, shared across every execution — needing to know anything
/// about runs or steps. Delegates every other capability straight to
/// the wrapped platform.
pub struct ScopedPlatform {
    inner: Arc<dyn Platform>,
    mutations: Mutex<Vec<(String, Value)>>,
}

impl ScopedPlatform {
    fn new(inner: Arc<dyn Platform>) -> Self {
        Self { inner, mutations: Mutex::new(Vec::new()) }
    }

    /// Records a durable run-variable write (§3, §5). Last call wins
    /// among mutations recorded by this same execution; the engine
    /// applies the drained log to the run's `variables` in the same
    /// transaction as step completion.
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.mutations.lock().unwrap().push((key.into(), value));
    }

    /// Drains every `set_variable` call made so far into a patch map,
    /// last call for a given key winning. Called by the engine once a
    /// node's execution has returned.
    pub fn take_mutations(&self) -> serde_json::Map<String, Value> {
        let mut patch = serde_json::Map::new();
        for (key, value) in self.mutations.lock().unwrap().drain(..) {
            patch.insert(key, value);
        }
        patch
    }
}

#[async_trait]
impl Platform for ScopedPlatform {
    async fn http(&self, request: HttpRequest) -> Result<HttpResponse, PlatformError> {
        self.inner.http(request).await
    }

    async fn storage_get(&self, key: &str) -> Result<Option<Vec<u8>>, PlatformError> {
        self.inner.storage_get(key).await
    }

    async fn storage_put(&self, key: &str, value: Vec<u8>) -> Result<(), PlatformError> {
        self.inner.storage_put(key, value).await
    }

    async fn resolve_secret(&self, name: &str) -> Result<String, PlatformError> {
        self.inner.resolve_secret(name).await
    }

    async fn resolve_credential(&self, name: &str) -> Result<String, PlatformError> {
        self.inner.resolve_credential(name).await
    }

    fn log(&self, level: tracing::Level, message: &str, fields: Value) {
        self.inner.log(level, message, fields)
    }

    fn emit(&self, event: &str, payload: Value) {
        self.inner.emit(event, payload)
    }

    async fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration).await
    }
}

/// Per-execution state handed to a node's `execute` call (§4.C,
/// the Node Runtime contract's `ExecuteEnvelope(ctx, config, input)`).
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Run-scoped variables visible to every node (§4.D). A snapshot
    /// taken when this step started — to write a variable back
    /// durably, go through `platform.set_variable` instead of mutating
    /// this map.
    pub variables: serde_json::Map<String, Value>,
    pub platform: Arc<ScopedPlatform>,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        step_id: Uuid,
        node_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        variables: serde_json::Map<String, Value>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            run_id,
            step_id,
            node_id: node_id.into(),
            attempt,
            max_attempts,
            variables,
            platform: Arc::new(ScopedPlatform::new(platform)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("node_id", &self.node_id)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPlatform;

    #[async_trait]
    impl Platform for NoopPlatform {
        async fn http(&self, _request: HttpRequest) -> Result<HttpResponse, PlatformError> {
            Err(PlatformError::Http("not implemented in test".into()))
        }
        async fn storage_get(&self, _key: &str) -> Result<Option<Vec<u8>>, PlatformError> {
            Ok(None)
        }
        async fn storage_put(&self, _key: &str, _value: Vec<u8>) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn resolve_secret(&self, name: &str) -> Result<String, PlatformError> {
            Err(PlatformError::SecretNotFound(name.to_string()))
        }
        async fn resolve_credential(&self, name: &str) -> Result<String, PlatformError> {
            Err(PlatformError::SecretNotFound(name.to_string()))
        }
        fn log(&self, _level: tracing::Level, _message: &str, _fields: Value) {}
        fn emit(&self, _event: &str, _payload: Value) {}
        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }
    }

    #[test]
    fn is_last_attempt_respects_max() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "n1",
            3,
            3,
            serde_json::Map::new(),
            Arc::new(NoopPlatform),
        );
        assert!(ctx.is_last_attempt());
    }

    #[test]
    fn cancellation_handle_propagates() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "n1",
            1,
            3,
            serde_json::Map::new(),
            Arc::new(NoopPlatform),
        );
        let handle = ctx.cancellation_handle();
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
    }
}
