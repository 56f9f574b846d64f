use std::time::Duration;

use async_trait::async_trait;

use crate::error::LabVmResult;
use crate::types::{SandboxFilter, SandboxInfo, SandboxSpec, SandboxStats, SandboxSummary};

/// Capability boundary around the external container engine.
///
/// Implementations hold no business state. Every call may fail with
/// `RuntimeUnavailable`; `NotFound` is reserved for confirmed absence.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Human-readable runtime name (e.g., "docker").
    fn name(&self) -> &str;

    /// Create (but do not start) a sandbox. Returns its runtime id.
    async fn create(&self, spec: &SandboxSpec) -> LabVmResult<String>;

    async fn start(&self, id: &str) -> LabVmResult<()>;

    /// Stop, giving the sandbox `timeout` to shut down gracefully.
    async fn stop(&self, id: &str, timeout: Duration) -> LabVmResult<()>;

    async fn pause(&self, id: &str) -> LabVmResult<()>;

    async fn unpause(&self, id: &str) -> LabVmResult<()>;

    async fn remove(&self, id: &str, force: bool) -> LabVmResult<()>;

    /// Current state and actual host-port bindings.
    async fn inspect(&self, id: &str) -> LabVmResult<SandboxInfo>;

    async fn stats(&self, id: &str) -> LabVmResult<SandboxStats>;

    async fn list(&self, filter: &SandboxFilter) -> LabVmResult<Vec<SandboxSummary>>;
}

/// Key-value store with per-entry TTL, backing the session registry.
///
/// Failures are reported as `RegistryUnavailable`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> LabVmResult<Option<String>>;

    /// Atomically overwrite `key`, resetting its TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> LabVmResult<()>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> LabVmResult<bool>;

    /// All live `(key, value)` pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> LabVmResult<Vec<(String, String)>>;
}
