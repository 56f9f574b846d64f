//! In-process sandbox runtime.
//!
//! Implements the same state machine as the container engine, plus hooks to
//! inject failures and simulate drift (external removal, port reassignment).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use labvm_core::{
    LabVmError, LabVmResult, PortMap, SandboxFilter, SandboxInfo, SandboxRuntime, SandboxSpec,
    SandboxState, SandboxStats, SandboxSummary,
};

/// Runtime operations, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Create,
    Start,
    Stop,
    Pause,
    Unpause,
    Remove,
    Inspect,
    Stats,
    List,
}

#[derive(Debug, Clone)]
struct Entry {
    info: SandboxInfo,
    spec: SandboxSpec,
}

#[derive(Default)]
struct Inner {
    sandboxes: HashMap<String, Entry>,
    next_id: u64,
    unavailable: bool,
    poisoned: HashSet<String>,
    queued_failures: HashMap<RuntimeOp, VecDeque<LabVmError>>,
    missing_images: HashSet<String>,
    calls: Vec<(RuntimeOp, String)>,
    latency: Duration,
}

#[derive(Default)]
pub struct InMemoryRuntime {
    inner: Mutex<Inner>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call fail with `RuntimeUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make every call addressed to `id` fail with `RuntimeUnavailable`.
    pub fn poison(&self, id: &str) {
        self.lock().poisoned.insert(id.to_string());
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: RuntimeOp, err: LabVmError) {
        self.lock().queued_failures.entry(op).or_default().push_back(err);
    }

    pub fn mark_image_missing(&self, image: &str) {
        self.lock().missing_images.insert(image.to_string());
    }

    /// Delay every call, to widen race windows in concurrency tests.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Remove a sandbox behind the manager's back.
    pub fn vanish(&self, id: &str) -> bool {
        self.lock().sandboxes.remove(id).is_some()
    }

    /// Rebind a container port to a different host port, as an engine might
    /// after a restart.
    pub fn reassign_port(&self, id: &str, container_port: u16, host_port: u16) {
        if let Some(entry) = self.lock().sandboxes.get_mut(id) {
            entry.info.ports.insert(container_port, host_port);
        }
    }

    /// Force a state without going through the transitions (e.g. a crash).
    pub fn force_state(&self, id: &str, state: SandboxState) {
        if let Some(entry) = self.lock().sandboxes.get_mut(id) {
            entry.info.state = state;
        }
    }

    pub fn state_of(&self, id: &str) -> Option<SandboxState> {
        self.lock().sandboxes.get(id).map(|e| e.info.state)
    }

    pub fn spec_of(&self, id: &str) -> Option<SandboxSpec> {
        self.lock().sandboxes.get(id).map(|e| e.spec.clone())
    }

    pub fn sandbox_count(&self) -> usize {
        self.lock().sandboxes.len()
    }

    /// How many times `op` has been called.
    pub fn call_count(&self, op: RuntimeOp) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    async fn enter(&self, op: RuntimeOp, target: &str) -> LabVmResult<()> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        inner.calls.push((op, target.to_string()));
        if inner.unavailable {
            return Err(LabVmError::RuntimeUnavailable("runtime offline".into()));
        }
        if inner.poisoned.contains(target) {
            return Err(LabVmError::RuntimeUnavailable(format!(
                "call to {target} timed out"
            )));
        }
        if let Some(err) = inner.queued_failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    /// Resolve an id or name to the canonical id.
    fn resolve(inner: &Inner, id_or_name: &str) -> LabVmResult<String> {
        if inner.sandboxes.contains_key(id_or_name) {
            return Ok(id_or_name.to_string());
        }
        inner
            .sandboxes
            .values()
            .find(|e| e.info.name == id_or_name || e.info.id.starts_with(id_or_name))
            .map(|e| e.info.id.clone())
            .ok_or_else(|| LabVmError::NotFound(format!("no such container: {id_or_name}")))
    }

    fn transition(
        &self,
        id: &str,
        apply: impl FnOnce(&mut SandboxInfo) -> LabVmResult<()>,
    ) -> LabVmResult<()> {
        let mut inner = self.lock();
        let id = Self::resolve(&inner, id)?;
        let entry = inner
            .sandboxes
            .get_mut(&id)
            .ok_or_else(|| LabVmError::NotFound(format!("no such container: {id}")))?;
        apply(&mut entry.info)
    }
}

#[async_trait]
impl SandboxRuntime for InMemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, spec: &SandboxSpec) -> LabVmResult<String> {
        self.enter(RuntimeOp::Create, &spec.name).await?;
        let mut inner = self.lock();
        if inner.missing_images.contains(&spec.image) {
            return Err(LabVmError::ImageNotFound(spec.image.clone()));
        }
        if inner.sandboxes.values().any(|e| e.info.name == spec.name) {
            return Err(LabVmError::Conflict(format!(
                "container name {} is already in use",
                spec.name
            )));
        }

        inner.next_id += 1;
        let id = format!("{:012x}{}", inner.next_id, "0".repeat(52));
        let ports: PortMap = spec
            .ports
            .iter()
            .map(|p| (p.container_port, p.host_port))
            .collect();
        let info = SandboxInfo {
            id: id.clone(),
            name: spec.name.clone(),
            state: SandboxState::Created,
            ports,
            created_at: Some(Utc::now()),
            labels: spec.labels.clone(),
        };
        inner.sandboxes.insert(id.clone(), Entry { info, spec: spec.clone() });
        debug!(id = %id, name = %spec.name, "in-memory sandbox created");
        Ok(id)
    }

    async fn start(&self, id: &str) -> LabVmResult<()> {
        self.enter(RuntimeOp::Start, id).await?;
        self.transition(id, |info| match info.state {
            SandboxState::Created | SandboxState::Exited | SandboxState::Running => {
                info.state = SandboxState::Running;
                Ok(())
            }
            other => Err(LabVmError::InvalidState(format!("cannot start a {other} sandbox"))),
        })
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> LabVmResult<()> {
        self.enter(RuntimeOp::Stop, id).await?;
        self.transition(id, |info| {
            if matches!(info.state, SandboxState::Running | SandboxState::Paused) {
                info.state = SandboxState::Exited;
            }
            Ok(())
        })
    }

    async fn pause(&self, id: &str) -> LabVmResult<()> {
        self.enter(RuntimeOp::Pause, id).await?;
        self.transition(id, |info| match info.state {
            SandboxState::Running => {
                info.state = SandboxState::Paused;
                Ok(())
            }
            SandboxState::Paused => Err(LabVmError::InvalidState("container is already paused".into())),
            other => Err(LabVmError::InvalidState(format!("container is {other}, not running"))),
        })
    }

    async fn unpause(&self, id: &str) -> LabVmResult<()> {
        self.enter(RuntimeOp::Unpause, id).await?;
        self.transition(id, |info| match info.state {
            SandboxState::Paused => {
                info.state = SandboxState::Running;
                Ok(())
            }
            other => Err(LabVmError::InvalidState(format!("container is {other}, not paused"))),
        })
    }

    async fn remove(&self, id: &str, force: bool) -> LabVmResult<()> {
        self.enter(RuntimeOp::Remove, id).await?;
        let mut inner = self.lock();
        let id = Self::resolve(&inner, id)?;
        let running = inner
            .sandboxes
            .get(&id)
            .map(|e| e.info.state.is_live())
            .unwrap_or(false);
        if running && !force {
            return Err(LabVmError::Conflict(format!(
                "cannot remove live container {id} without force"
            )));
        }
        inner.sandboxes.remove(&id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> LabVmResult<SandboxInfo> {
        self.enter(RuntimeOp::Inspect, id).await?;
        let inner = self.lock();
        let id = Self::resolve(&inner, id)?;
        inner
            .sandboxes
            .get(&id)
            .map(|e| e.info.clone())
            .ok_or_else(|| LabVmError::NotFound(format!("no such container: {id}")))
    }

    async fn stats(&self, id: &str) -> LabVmResult<SandboxStats> {
        self.enter(RuntimeOp::Stats, id).await?;
        let inner = self.lock();
        let id = Self::resolve(&inner, id)?;
        let entry = inner
            .sandboxes
            .get(&id)
            .ok_or_else(|| LabVmError::NotFound(format!("no such container: {id}")))?;
        let running = entry.info.state == SandboxState::Running;
        let mem_limit = 2 * 1024 * 1024 * 1024;
        let mem_used = if entry.info.state.is_live() { 256 * 1024 * 1024 } else { 0 };
        Ok(SandboxStats {
            cpu_percent: if running { 3.5 } else { 0.0 },
            mem_used,
            mem_limit,
            mem_percent: mem_used as f64 / mem_limit as f64 * 100.0,
            net_rx: 0,
            net_tx: 0,
        })
    }

    async fn list(&self, filter: &SandboxFilter) -> LabVmResult<Vec<SandboxSummary>> {
        self.enter(RuntimeOp::List, "").await?;
        let inner = self.lock();
        let mut rows: Vec<SandboxSummary> = inner
            .sandboxes
            .values()
            // Like `docker ps`: without `all`, paused sandboxes still list.
            .filter(|e| filter.all || e.info.state.is_live())
            .filter(|e| filter.matches(&e.info.name, &e.info.labels))
            .map(|e| SandboxSummary {
                id: e.info.id.clone(),
                name: e.info.name.clone(),
                state: e.info.state,
                labels: e.info.labels.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}
