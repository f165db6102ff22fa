//! The host's implementation of the `Platform` capability object
//! (§4.C): outbound HTTP via `reqwest`, secrets from the process
//! environment, and an in-memory blob store and credential table
//! suitable for tests and small deployments. A production host can
//! swap in a different `Platform` without touching node code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::Level;

use super::context::{HttpRequest, HttpResponse, Platform, PlatformError};

/// `Platform` backed by a real HTTP client and process-local state.
/// Secrets are read from `FLOWRUNNER_SECRET_<NAME>` environment
/// variables (upper-cased, non-alphanumeric replaced with `_`) so a
/// node author never needs direct `std::env` access; credentials are
/// held in an in-memory map seeded at construction (a production host
/// would back this with its own credential vault instead).
pub struct DefaultPlatform {
    http: reqwest::Client,
    storage: DashMap<String, Vec<u8>>,
    credentials: DashMap<String, String>,
}

impl DefaultPlatform {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with default TLS backend"),
            storage: DashMap::new(),
            credentials: DashMap::new(),
        }
    }

    pub fn with_credentials(credentials: HashMap<String, String>) -> Self {
        let platform = Self::new();
        for (k, v) in credentials {
            platform.credentials.insert(k, v);
        }
        platform
    }

    fn secret_env_var(name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("FLOWRUNNER_SECRET_{normalized}")
    }
}

impl Default for DefaultPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for DefaultPlatform {
    async fn http(&self, request: HttpRequest) -> Result<HttpResponse, PlatformError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| PlatformError::Http(format!("invalid method {:?}: {e}", request.method)))?;
        let mut builder = self.http.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(|e| PlatformError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response.bytes().await.map_err(|e| PlatformError::Http(e.to_string()))?.to_vec();
        Ok(HttpResponse { status, headers, body })
    }

    async fn storage_get(&self, key: &str) -> Result<Option<Vec<u8>>, PlatformError> {
        Ok(self.storage.get(key).map(|entry| entry.clone()))
    }

    async fn storage_put(&self, key: &str, value: Vec<u8>) -> Result<(), PlatformError> {
        self.storage.insert(key.to_string(), value);
        Ok(())
    }

    async fn resolve_secret(&self, name: &str) -> Result<String, PlatformError> {
        std::env::var(Self::secret_env_var(name)).map_err(|_| PlatformError::SecretNotFound(name.to_string()))
    }

    async fn resolve_credential(&self, name: &str) -> Result<String, PlatformError> {
        self.credentials
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| PlatformError::CredentialResolution(name.to_string(), "not configured".to_string()))
    }

    fn log(&self, level: Level, message: &str, fields: Value) {
        match level {
            Level::ERROR => tracing::error!(?fields, "{message}"),
            Level::WARN => tracing::warn!(?fields, "{message}"),
            Level::INFO => tracing::info!(?fields, "{message}"),
            Level::DEBUG => tracing::debug!(?fields, "{message}"),
            Level::TRACE => tracing::trace!(?fields, "{message}"),
        }
    }

    fn emit(&self, event: &str, payload: Value) {
        tracing::info!(event, ?payload, "node event");
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A `Platform` that records every emitted event and side-channel call
/// in memory instead of performing real I/O; used by engine and node
/// tests that need to assert on what a node emitted without standing up
/// a network stack.
pub struct RecordingPlatform {
    pub storage: DashMap<String, Vec<u8>>,
    pub emitted: std::sync::Mutex<Vec<(String, Value)>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self { storage: DashMap::new(), emitted: std::sync::Mutex::new(Vec::new()) }
    }
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for RecordingPlatform {
    async fn http(&self, _request: HttpRequest) -> Result<HttpResponse, PlatformError> {
        Err(PlatformError::Http("RecordingPlatform performs no real HTTP calls".to_string()))
    }

    async fn storage_get(&self, key: &str) -> Result<Option<Vec<u8>>, PlatformError> {
        Ok(self.storage.get(key).map(|entry| entry.clone()))
    }

    async fn storage_put(&self, key: &str, value: Vec<u8>) -> Result<(), PlatformError> {
        self.storage.insert(key.to_string(), value);
        Ok(())
    }

    async fn resolve_secret(&self, name: &str) -> Result<String, PlatformError> {
        Err(PlatformError::SecretNotFound(name.to_string()))
    }

    async fn resolve_credential(&self, name: &str) -> Result<String, PlatformError> {
        Err(PlatformError::CredentialResolution(name.to_string(), "not configured".to_string()))
    }

    fn log(&self, _level: Level, _message: &str, _fields: Value) {}

    fn emit(&self, event: &str, payload: Value) {
        self.emitted.lock().unwrap().push((event.to_string(), payload));
    }

    async fn sleep(&self, _duration: Duration) {}
}

pub fn default_platform() -> Arc<dyn Platform> {
    Arc::new(DefaultPlatform::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_env_var_normalizes_name() {
        assert_eq!(DefaultPlatform::secret_env_var("api-key"), "FLOWRUNNER_SECRET_API_KEY");
    }

    #[tokio::test]
    async fn storage_round_trips() {
        let platform = DefaultPlatform::new();
        platform.storage_put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(platform.storage_get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn recording_platform_captures_emits() {
        let platform = RecordingPlatform::new();
        platform.emit("did_thing", serde_json::json!({"n": 1}));
        assert_eq!(platform.emitted.lock().unwrap().len(), 1);
    }
}
