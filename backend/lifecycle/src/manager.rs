//! Lifecycle Manager
//!
//! Owns every state transition of a lab session. The registry says who owns
//! what; the runtime says what actually exists. Whenever the runtime confirms
//! a sandbox is gone, the registry entry goes with it before returning.
//!
//! Every operation on a `(user, lab)` key runs under that key's lock, so a
//! user request and the optimizer never interleave on the same session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use labvm_core::{
    LabVmError, LabVmResult, SandboxFilter, SandboxRuntime, SandboxState, SandboxStats,
    SandboxSummary, Session, SessionKey,
};
use labvm_logging::{EventLogger, LifecycleEvent};

use crate::activity::ActivityTracker;
use crate::keyed_lock::KeyedLocks;
use crate::outcome::{
    ActivityAck, CleanupReport, PauseOutcome, PauseStatus, ReclaimOutcome, SessionView,
    StartOutcome, StartStatus, StatusReport, StopOutcome,
};
use crate::ports::PortAllocator;
use crate::registry::SessionRegistry;
use crate::template::{SandboxTemplate, StartRequest};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LifecycleManager {
    runtime: Arc<dyn SandboxRuntime>,
    registry: SessionRegistry,
    activity: Arc<ActivityTracker>,
    locks: KeyedLocks<SessionKey>,
    ports: PortAllocator,
    template: SandboxTemplate,
    stop_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        registry: SessionRegistry,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            runtime,
            registry,
            activity,
            locks: KeyedLocks::new(),
            ports: PortAllocator::default(),
            template: SandboxTemplate::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_template(mut self, template: SandboxTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    // ------------------------------------------------------------------
    // User-facing operations
    // ------------------------------------------------------------------

    /// Return the live session for `key`, creating a sandbox if there is none.
    pub async fn ensure_started(
        &self,
        key: &SessionKey,
        request: &StartRequest,
    ) -> LabVmResult<StartOutcome> {
        let _guard = self.locks.lock(key).await;

        match self.registry.get(key).await {
            Ok(Some(session)) => match self.runtime.inspect(&session.sandbox_id).await {
                Ok(info) if info.state.is_live() => {
                    debug!(session = %key, state = %info.state, "Session already running");
                    self.activity.record(&session.sandbox_id).await;
                    self.refresh(&session).await;
                    return Ok(StartOutcome {
                        status: StartStatus::AlreadyRunning,
                        session,
                    });
                }
                Ok(info) => {
                    info!(session = %key, state = %info.state, "Replacing dead sandbox");
                    self.evict(key, &session, "sandbox not running").await;
                }
                Err(e) if e.is_not_found() => {
                    self.evict(key, &session, "sandbox missing").await;
                }
                Err(e) => return Err(e),
            },
            Ok(None) => {}
            Err(LabVmError::RegistryUnavailable(reason)) => {
                warn!(session = %key, %reason, "Registry unreadable, assuming no session");
            }
            Err(e) => return Err(e),
        }

        let session = self.create_session(key, request).await?;
        Ok(StartOutcome {
            status: StartStatus::Started,
            session,
        })
    }

    pub async fn stop(&self, key: &SessionKey) -> LabVmResult<StopOutcome> {
        let _guard = self.locks.lock(key).await;

        let Some(session) = self.registry.get(key).await? else {
            return Ok(StopOutcome::NotRunning);
        };

        match self.runtime.stop(&session.sandbox_id, self.stop_timeout).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.evict(key, &session, "sandbox missing").await;
                return Ok(StopOutcome::NotFound);
            }
            Err(e) => {
                self.log_failure(key, "stop", &e);
                return Err(e);
            }
        }

        self.discard(&session.sandbox_id).await;
        self.activity.forget(&session.sandbox_id).await;
        if let Err(e) = self.registry.delete(key).await {
            // The next status or start sees the sandbox missing and evicts.
            warn!(session = %key, error = %e, "Sandbox removed but registry entry remains");
            return Err(e);
        }
        EventLogger::log_event(
            &key.to_string(),
            LifecycleEvent::Stopped {
                sandbox_ref: session.sandbox_ref(),
                idle_secs: None,
            },
        );
        Ok(StopOutcome::Stopped)
    }

    pub async fn pause(&self, key: &SessionKey) -> LabVmResult<PauseOutcome> {
        let _guard = self.locks.lock(key).await;

        let session = self.require_session(key).await?;
        let info = self
            .on_session(key, &session, self.runtime.inspect(&session.sandbox_id).await)
            .await?;

        match info.state {
            SandboxState::Paused => Ok(PauseOutcome {
                status: PauseStatus::AlreadyPaused,
                session,
            }),
            SandboxState::Running => {
                self.on_session(key, &session, self.runtime.pause(&session.sandbox_id).await)
                    .await
                    .inspect_err(|e| self.log_failure(key, "pause", e))?;
                EventLogger::log_event(
                    &key.to_string(),
                    LifecycleEvent::Paused {
                        sandbox_ref: session.sandbox_ref(),
                        idle_secs: None,
                    },
                );
                Ok(PauseOutcome {
                    status: PauseStatus::Paused,
                    session,
                })
            }
            other => Err(LabVmError::InvalidState(format!(
                "sandbox is {other}; only a running sandbox can be paused"
            ))),
        }
    }

    /// Bring a paused or exited session back to running.
    pub async fn resume(&self, key: &SessionKey) -> LabVmResult<Session> {
        let _guard = self.locks.lock(key).await;

        let mut session = self.require_session(key).await?;
        let id = session.sandbox_id.clone();
        let info = self
            .on_session(key, &session, self.runtime.inspect(&id).await)
            .await?;

        let woke = match info.state {
            SandboxState::Paused => self.runtime.unpause(&id).await,
            SandboxState::Exited | SandboxState::Created => self.runtime.start(&id).await,
            SandboxState::Running => Ok(()),
            SandboxState::Missing => Err(LabVmError::NotFound(id.clone())),
        };
        self.on_session(key, &session, woke)
            .await
            .inspect_err(|e| self.log_failure(key, "resume", e))?;

        let info = self
            .on_session(key, &session, self.runtime.inspect(&id).await)
            .await?;
        if session.reconcile_ports(&info.ports) {
            info!(
                session = %key,
                display_port = session.display_port,
                proxy_port = session.proxy_port,
                "Runtime reassigned ports"
            );
            self.registry.put(&session).await?;
        }

        self.activity.record(&id).await;
        EventLogger::log_event(
            &key.to_string(),
            LifecycleEvent::Resumed {
                sandbox_ref: session.sandbox_ref(),
            },
        );
        Ok(session)
    }

    /// Current state, with registry ports reconciled against the runtime.
    pub async fn status(&self, key: &SessionKey) -> LabVmResult<StatusReport> {
        let _guard = self.locks.lock(key).await;

        let mut session = match self.registry.get(key).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(StatusReport::NotRunning),
            Err(LabVmError::RegistryUnavailable(reason)) => {
                warn!(session = %key, %reason, "Registry unreadable, reporting no session");
                return Ok(StatusReport::NotRunning);
            }
            Err(e) => return Err(e),
        };

        let info = match self.runtime.inspect(&session.sandbox_id).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                self.evict(key, &session, "sandbox missing").await;
                return Ok(StatusReport::NotFound);
            }
            Err(e) => return Err(e),
        };

        if session.reconcile_ports(&info.ports) {
            info!(
                session = %key,
                display_port = session.display_port,
                proxy_port = session.proxy_port,
                "Runtime reassigned ports"
            );
        }
        // Also pushes the entry's expiry out while the session is in use.
        self.refresh(&session).await;

        Ok(StatusReport::Present {
            state: info.state,
            session,
        })
    }

    /// Mark a sandbox as in use. Unknown ids are registered.
    pub async fn record_activity(&self, sandbox_id: &str) {
        self.activity.record(sandbox_id).await;
    }

    /// Mark the session's sandbox as in use and extend its registry entry.
    /// Never fails.
    pub async fn record_activity_for(&self, key: &SessionKey) -> ActivityAck {
        let _guard = self.locks.lock(key).await;

        match self.registry.get(key).await {
            Ok(Some(session)) => {
                self.activity.record(&session.sandbox_id).await;
                self.refresh(&session).await;
                ActivityAck::ActivityRecorded
            }
            Ok(None) => ActivityAck::NotFound,
            Err(e) => {
                debug!(session = %key, error = %e, "Activity dropped");
                ActivityAck::NotFound
            }
        }
    }

    /// Resource snapshot. Looking at stats counts as activity.
    pub async fn stats(&self, key: &SessionKey) -> LabVmResult<(Session, SandboxStats)> {
        let _guard = self.locks.lock(key).await;

        let session = self.require_session(key).await?;
        let stats = self
            .on_session(key, &session, self.runtime.stats(&session.sandbox_id).await)
            .await?;
        self.activity.record(&session.sandbox_id).await;
        Ok((session, stats))
    }

    pub async fn list_for_user(&self, user_id: &str) -> LabVmResult<Vec<SessionView>> {
        let sessions = match self.registry.list_for_user(user_id).await {
            Ok(sessions) => sessions,
            Err(LabVmError::RegistryUnavailable(reason)) => {
                warn!(user = %user_id, %reason, "Registry unreadable, listing nothing");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(self.views(sessions).await)
    }

    pub async fn list_all(&self) -> LabVmResult<Vec<SessionView>> {
        let sessions = match self.registry.list_all().await {
            Ok(sessions) => sessions,
            Err(LabVmError::RegistryUnavailable(reason)) => {
                warn!(%reason, "Registry unreadable, listing nothing");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(self.views(sessions).await)
    }

    // ------------------------------------------------------------------
    // Admin and reclamation
    // ------------------------------------------------------------------

    /// Drop dead sessions, then remove stopped managed sandboxes nobody owns.
    pub async fn cleanup(&self) -> LabVmResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let mut tracked = HashSet::new();

        for listed in self.registry.list_all().await? {
            let key = listed.key();
            let _guard = self.locks.lock(&key).await;
            let Some(session) = self.current(&key, &listed.sandbox_id).await else {
                continue;
            };

            match self.runtime.inspect(&session.sandbox_id).await {
                Err(e) if e.is_not_found() => {
                    self.evict(&key, &session, "cleanup: sandbox missing").await;
                    report.cleaned += 1;
                }
                Ok(info) if !info.state.is_live() => {
                    self.discard(&session.sandbox_id).await;
                    self.evict(&key, &session, "cleanup: sandbox not running").await;
                    report.cleaned += 1;
                }
                Ok(_) => {
                    tracked.insert(session.sandbox_id.clone());
                }
                Err(e) => {
                    warn!(session = %key, error = %e, "Cleanup skipped session");
                    tracked.insert(session.sandbox_id.clone());
                }
            }
        }

        let listed = match self.runtime.list(&SandboxFilter::managed(true)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Orphan audit skipped");
                return Ok(report);
            }
        };

        for sandbox in listed.into_iter().filter(|s| !tracked.contains(&s.id)) {
            let owner = sandbox.owner();
            let _guard = match owner.as_ref() {
                Some(key) => Some(self.locks.lock(key).await),
                None => None,
            };
            if let Some(key) = owner.as_ref() {
                if self.current(key, &sandbox.id).await.is_some() {
                    // Registered since the first pass.
                    continue;
                }
            }

            if sandbox.state.is_live() {
                warn!(name = %sandbox.name, state = %sandbox.state, "Live sandbox has no session");
                report.untracked += 1;
                continue;
            }
            match self.runtime.remove(&sandbox.id, true).await {
                Ok(()) => {
                    info!(name = %sandbox.name, "Removed orphaned sandbox");
                    self.activity.forget(&sandbox.id).await;
                    report.orphans_removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(name = %sandbox.name, error = %e, "Failed to remove orphan"),
            }
        }

        info!(
            cleaned = report.cleaned,
            orphans_removed = report.orphans_removed,
            untracked = report.untracked,
            "Cleanup finished"
        );
        Ok(report)
    }

    /// Pause a running sandbox found by the optimizer, provided it is still
    /// idle for at least `min_idle` once the session lock is held.
    pub async fn pause_sandbox(
        &self,
        sandbox: &SandboxSummary,
        min_idle: chrono::Duration,
    ) -> LabVmResult<ReclaimOutcome> {
        let owner = sandbox.owner();
        let _guard = match owner.as_ref() {
            Some(key) => Some(self.locks.lock(key).await),
            None => None,
        };

        let idle = self.activity.idle_for(&sandbox.id).await;
        if idle.is_some_and(|idle| idle < min_idle) {
            return Ok(ReclaimOutcome::Skipped);
        }

        match self.runtime.inspect(&sandbox.id).await {
            Ok(info) if info.state == SandboxState::Running => {}
            Ok(_) => return Ok(ReclaimOutcome::Skipped),
            Err(e) if e.is_not_found() => {
                self.forget_sandbox(owner.as_ref(), &sandbox.id).await;
                return Ok(ReclaimOutcome::Gone);
            }
            Err(e) => return Err(e),
        }

        match self.runtime.pause(&sandbox.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.forget_sandbox(owner.as_ref(), &sandbox.id).await;
                return Ok(ReclaimOutcome::Gone);
            }
            Err(e) => return Err(e),
        }

        EventLogger::log_event(
            &session_label(owner.as_ref(), &sandbox.name),
            LifecycleEvent::Paused {
                sandbox_ref: labvm_core::sandbox_ref(&sandbox.id),
                idle_secs: idle.map(|d| d.num_seconds()),
            },
        );
        Ok(ReclaimOutcome::Paused)
    }

    /// Stop and remove an idle sandbox found by the optimizer, dropping its
    /// registry entry.
    pub async fn stop_sandbox(
        &self,
        sandbox: &SandboxSummary,
        min_idle: chrono::Duration,
    ) -> LabVmResult<ReclaimOutcome> {
        let owner = sandbox.owner();
        let _guard = match owner.as_ref() {
            Some(key) => Some(self.locks.lock(key).await),
            None => None,
        };

        let idle = self.activity.idle_for(&sandbox.id).await;
        if idle.is_some_and(|idle| idle < min_idle) {
            return Ok(ReclaimOutcome::Skipped);
        }

        match self.runtime.stop(&sandbox.id, self.stop_timeout).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.forget_sandbox(owner.as_ref(), &sandbox.id).await;
                return Ok(ReclaimOutcome::Gone);
            }
            Err(e) => return Err(e),
        }
        self.discard(&sandbox.id).await;

        if let Some(key) = owner.as_ref() {
            if self.current(key, &sandbox.id).await.is_some() {
                self.registry.delete(key).await?;
            }
        }
        self.activity.forget(&sandbox.id).await;

        EventLogger::log_event(
            &session_label(owner.as_ref(), &sandbox.name),
            LifecycleEvent::Stopped {
                sandbox_ref: labvm_core::sandbox_ref(&sandbox.id),
                idle_secs: idle.map(|d| d.num_seconds()),
            },
        );
        Ok(ReclaimOutcome::Stopped)
    }

    // ------------------------------------------------------------------
    // Internals. Callers hold the key's lock.
    // ------------------------------------------------------------------

    async fn create_session(&self, key: &SessionKey, request: &StartRequest) -> LabVmResult<Session> {
        let name = key.sandbox_name();
        match self.runtime.inspect(&name).await {
            Ok(leftover) if leftover.labelled_for(key) => {
                match self.runtime.remove(&leftover.id, true).await {
                    Ok(()) => info!(name = %name, "Removed leftover sandbox"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(leftover) => {
                warn!(session = %key, name = %name, owner = ?leftover.owner(), "Sandbox name held by another owner");
                return Err(LabVmError::Conflict(format!(
                    "sandbox name {name} belongs to another session"
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let in_use = self.ports_in_use().await;
        let (display_port, proxy_port) = self.ports.allocate(&in_use)?;
        let spec = self.template.build(key, request, display_port, proxy_port);
        info!(session = %key, name = %name, display_port, proxy_port, "Creating sandbox");

        let sandbox_id = self
            .runtime
            .create(&spec)
            .await
            .map_err(lost_during_start)
            .inspect_err(|e| self.log_failure(key, "create", e))?;

        let mut session = Session {
            sandbox_id: sandbox_id.clone(),
            sandbox_name: name,
            user_id: key.user_id.clone(),
            lab_id: key.lab_id.clone(),
            display_port,
            proxy_port,
            created_at: self.activity.now(),
        };

        if let Err(e) = self.boot(&mut session).await {
            self.log_failure(key, "start", &e);
            self.discard(&sandbox_id).await;
            return Err(e);
        }

        EventLogger::log_event(
            &key.to_string(),
            LifecycleEvent::Started {
                sandbox_ref: session.sandbox_ref(),
                display_port: session.display_port,
                proxy_port: session.proxy_port,
            },
        );
        Ok(session)
    }

    /// Start, learn the real bindings, persist. The runtime's ports win.
    async fn boot(&self, session: &mut Session) -> LabVmResult<()> {
        self.runtime
            .start(&session.sandbox_id)
            .await
            .map_err(lost_during_start)?;
        let info = self
            .runtime
            .inspect(&session.sandbox_id)
            .await
            .map_err(lost_during_start)?;
        if let Some(created) = info.created_at {
            session.created_at = created;
        }
        session.reconcile_ports(&info.ports);
        self.registry.put(session).await?;
        self.activity.record(&session.sandbox_id).await;
        Ok(())
    }

    async fn require_session(&self, key: &SessionKey) -> LabVmResult<Session> {
        self.registry
            .get(key)
            .await?
            .ok_or_else(|| LabVmError::session_not_found(&key.user_id, &key.lab_id))
    }

    /// Rewrite the entry, which restarts its TTL. Best-effort.
    async fn refresh(&self, session: &Session) {
        if let Err(e) = self.registry.put(session).await {
            warn!(session = %session.key(), error = %e, "Failed to refresh registry entry");
        }
    }

    /// The registry entry for `key`, if it still points at `sandbox_id`.
    async fn current(&self, key: &SessionKey, sandbox_id: &str) -> Option<Session> {
        match self.registry.get(key).await {
            Ok(Some(session)) if session.sandbox_id == sandbox_id => Some(session),
            _ => None,
        }
    }

    /// Runtime `NotFound` for a session's sandbox: evict and report the
    /// session as gone.
    async fn on_session<T>(
        &self,
        key: &SessionKey,
        session: &Session,
        result: LabVmResult<T>,
    ) -> LabVmResult<T> {
        match result {
            Err(e) if e.is_not_found() => {
                self.evict(key, session, "sandbox missing").await;
                Err(LabVmError::session_not_found(&key.user_id, &key.lab_id))
            }
            other => other,
        }
    }

    async fn evict(&self, key: &SessionKey, session: &Session, reason: &str) {
        if let Err(e) = self.registry.delete(key).await {
            warn!(session = %key, error = %e, "Failed to evict registry entry");
        }
        self.activity.forget(&session.sandbox_id).await;
        EventLogger::log_event(
            &key.to_string(),
            LifecycleEvent::Evicted {
                sandbox_ref: session.sandbox_ref(),
                reason: reason.to_string(),
            },
        );
    }

    async fn forget_sandbox(&self, owner: Option<&SessionKey>, sandbox_id: &str) {
        if let Some(key) = owner {
            if let Some(session) = self.current(key, sandbox_id).await {
                self.evict(key, &session, "sandbox missing").await;
                return;
            }
        }
        self.activity.forget(sandbox_id).await;
    }

    /// Best-effort force removal.
    async fn discard(&self, sandbox_id: &str) {
        match self.runtime.remove(sandbox_id, true).await {
            Ok(()) => debug!(sandbox = %sandbox_id, "Sandbox removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(sandbox = %sandbox_id, error = %e, "Failed to remove sandbox"),
        }
    }

    async fn ports_in_use(&self) -> HashSet<u16> {
        match self.registry.list_all().await {
            Ok(sessions) => sessions
                .iter()
                .flat_map(|s| [s.display_port, s.proxy_port])
                .collect(),
            Err(e) => {
                debug!(error = %e, "Allocating ports without registry view");
                HashSet::new()
            }
        }
    }

    async fn views(&self, sessions: Vec<Session>) -> Vec<SessionView> {
        let mut views = Vec::with_capacity(sessions.len());
        for listed in sessions {
            let key = listed.key();
            let _guard = self.locks.lock(&key).await;
            let Some(session) = self.current(&key, &listed.sandbox_id).await else {
                continue;
            };
            let state = match self.runtime.inspect(&session.sandbox_id).await {
                Ok(info) => Some(info.state),
                Err(e) if e.is_not_found() => {
                    self.evict(&key, &session, "sandbox missing").await;
                    continue;
                }
                Err(e) => {
                    debug!(session = %key, error = %e, "State unknown");
                    None
                }
            };
            views.push(self.view(session, state).await);
        }
        views
    }

    async fn view(&self, session: Session, state: Option<SandboxState>) -> SessionView {
        let last_active_at = self.activity.last_active(&session.sandbox_id).await;
        let now = self.activity.now();
        SessionView {
            sandbox_ref: session.sandbox_ref(),
            user_id: session.user_id,
            lab_id: session.lab_id,
            sandbox_name: session.sandbox_name,
            state,
            display_port: session.display_port,
            proxy_port: session.proxy_port,
            created_at: session.created_at,
            last_active_at,
            idle_minutes: last_active_at.map(|t| (now - t).num_minutes().max(0)),
        }
    }

    fn log_failure(&self, key: &SessionKey, operation: &str, error: &LabVmError) {
        EventLogger::log_event(
            &key.to_string(),
            LifecycleEvent::Failed {
                operation: operation.to_string(),
                error: error.to_string(),
            },
        );
    }
}

/// A sandbox vanishing while being brought up is a runtime fault, not a
/// missing session.
fn lost_during_start(e: LabVmError) -> LabVmError {
    match e {
        LabVmError::NotFound(detail) => {
            LabVmError::RuntimeUnavailable(format!("sandbox vanished during start: {detail}"))
        }
        other => other,
    }
}

fn session_label(owner: Option<&SessionKey>, name: &str) -> String {
    owner.map(ToString::to_string).unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use labvm_core::ManualClock;
    use labvm_sandbox::{InMemoryRuntime, RuntimeOp};
    use labvm_store::InMemoryKvStore;

    use super::*;
    use crate::registry::DEFAULT_SESSION_TTL;

    struct Harness {
        runtime: Arc<InMemoryRuntime>,
        store: Arc<InMemoryKvStore>,
        clock: Arc<ManualClock>,
        manager: Arc<LifecycleManager>,
    }

    fn harness() -> Harness {
        let runtime = Arc::new(InMemoryRuntime::new());
        let store = Arc::new(InMemoryKvStore::new());
        let clock = Arc::new(ManualClock::default());
        let manager = LifecycleManager::new(
            runtime.clone(),
            SessionRegistry::new(store.clone(), DEFAULT_SESSION_TTL),
            Arc::new(ActivityTracker::new(clock.clone())),
        );
        Harness {
            runtime,
            store,
            clock,
            manager: Arc::new(manager),
        }
    }

    fn key(user: &str, lab: &str) -> SessionKey {
        SessionKey::new(user, lab).unwrap()
    }

    async fn start(h: &Harness, k: &SessionKey) -> Session {
        h.manager
            .ensure_started(k, &StartRequest::default())
            .await
            .unwrap()
            .session
    }

    fn summary_of(h: &Harness, id: &str) -> SandboxSummary {
        let spec = h.runtime.spec_of(id).unwrap();
        SandboxSummary {
            id: id.to_string(),
            name: spec.name,
            state: h.runtime.state_of(id).unwrap(),
            labels: spec.labels,
        }
    }

    #[tokio::test]
    async fn start_twice_returns_same_sandbox() {
        let h = harness();
        let k = key("u1", "sqli");

        let first = h.manager.ensure_started(&k, &StartRequest::default()).await.unwrap();
        let second = h.manager.ensure_started(&k, &StartRequest::default()).await.unwrap();

        assert_eq!(first.status, StartStatus::Started);
        assert_eq!(second.status, StartStatus::AlreadyRunning);
        assert_eq!(first.session.sandbox_ref(), second.session.sandbox_ref());
        assert_eq!(h.runtime.call_count(RuntimeOp::Create), 1);
        assert_eq!(h.runtime.sandbox_count(), 1);
    }

    #[tokio::test]
    async fn started_session_is_persisted_with_runtime_ports() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;

        assert!((6000..=6999).contains(&session.display_port));
        assert!((7000..=7999).contains(&session.proxy_port));
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), Some(session.clone()));
        assert_eq!(
            h.runtime.state_of(&session.sandbox_id),
            Some(SandboxState::Running)
        );
        assert!(h.manager.activity().last_active(&session.sandbox_id).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_starts_create_one_sandbox() {
        let h = harness();
        h.runtime.set_latency(std::time::Duration::from_millis(5));
        let k = key("u1", "sqli");

        let request = StartRequest::default();

        let (a, b) = tokio::join!(
            h.manager.ensure_started(&k, &request),
            h.manager.ensure_started(&k, &request),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.session.sandbox_id, b.session.sandbox_id);
        assert_eq!(h.runtime.call_count(RuntimeOp::Create), 1);
    }

    #[tokio::test]
    async fn status_evicts_entry_for_vanished_sandbox() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.runtime.vanish(&session.sandbox_id);

        assert_eq!(h.manager.status(&k).await.unwrap(), StatusReport::NotFound);
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);
        assert_eq!(h.manager.status(&k).await.unwrap(), StatusReport::NotRunning);
    }

    #[tokio::test]
    async fn start_replaces_vanished_sandbox() {
        let h = harness();
        let k = key("u1", "sqli");
        let old = start(&h, &k).await;
        h.runtime.vanish(&old.sandbox_id);

        let fresh = h.manager.ensure_started(&k, &StartRequest::default()).await.unwrap();
        assert_eq!(fresh.status, StartStatus::Started);
        assert_ne!(fresh.session.sandbox_id, old.sandbox_id);
        assert_eq!(
            h.manager.registry().get(&k).await.unwrap().map(|s| s.sandbox_id),
            Some(fresh.session.sandbox_id)
        );
    }

    #[tokio::test]
    async fn start_replaces_exited_sandbox_with_same_name() {
        let h = harness();
        let k = key("u1", "sqli");
        let old = start(&h, &k).await;
        h.runtime.force_state(&old.sandbox_id, SandboxState::Exited);

        let fresh = h.manager.ensure_started(&k, &StartRequest::default()).await.unwrap();
        assert_eq!(fresh.status, StartStatus::Started);
        assert!(h.runtime.state_of(&old.sandbox_id).is_none());
        assert_eq!(h.runtime.sandbox_count(), 1);
    }

    #[tokio::test]
    async fn leftover_with_deterministic_name_is_cleared() {
        let h = harness();
        let k = key("u1", "sqli");
        let spec = SandboxTemplate::default().build(&k, &StartRequest::default(), 6001, 7001);
        h.runtime.create(&spec).await.unwrap();

        let outcome = h.manager.ensure_started(&k, &StartRequest::default()).await.unwrap();
        assert_eq!(outcome.status, StartStatus::Started);
        assert_eq!(h.runtime.sandbox_count(), 1);
    }

    #[tokio::test]
    async fn failed_start_leaves_no_sandbox_and_no_entry() {
        let h = harness();
        let k = key("u1", "sqli");
        h.runtime.fail_next(
            RuntimeOp::Start,
            LabVmError::ResourceExhausted("port is already allocated".into()),
        );

        let err = h.manager.ensure_started(&k, &StartRequest::default()).await.unwrap_err();
        assert!(matches!(err, LabVmError::ResourceExhausted(_)));
        assert_eq!(h.runtime.sandbox_count(), 0);
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_image_surfaces_typed_error() {
        let h = harness();
        h.runtime.mark_image_missing("cyberlab-vm:latest");
        let err = h
            .manager
            .ensure_started(&key("u1", "sqli"), &StartRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LabVmError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn registry_write_failure_removes_the_new_sandbox() {
        let h = harness();
        h.store.set_offline(true);

        let err = h
            .manager
            .ensure_started(&key("u1", "sqli"), &StartRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LabVmError::RegistryUnavailable(_)));
        assert_eq!(h.runtime.sandbox_count(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness();
        let k = key("u1", "sqli");
        assert_eq!(h.manager.stop(&k).await.unwrap(), StopOutcome::NotRunning);

        let session = start(&h, &k).await;
        assert_eq!(h.manager.stop(&k).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(h.manager.stop(&k).await.unwrap(), StopOutcome::NotRunning);
        assert!(h.runtime.state_of(&session.sandbox_id).is_none());
        assert!(h.manager.activity().last_active(&session.sandbox_id).await.is_none());
    }

    #[tokio::test]
    async fn stop_after_external_removal_reports_not_found() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.runtime.vanish(&session.sandbox_id);

        assert_eq!(h.manager.stop(&k).await.unwrap(), StopOutcome::NotFound);
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stop_with_unwritable_registry_errors_then_self_heals() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.store.set_read_only(true);

        let err = h.manager.stop(&k).await.unwrap_err();
        assert!(matches!(err, LabVmError::RegistryUnavailable(_)));
        assert!(h.runtime.state_of(&session.sandbox_id).is_none());
        assert!(h.manager.registry().get(&k).await.unwrap().is_some());

        h.store.set_read_only(false);
        assert_eq!(h.manager.status(&k).await.unwrap(), StatusReport::NotFound);
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);
        assert_eq!(h.manager.status(&k).await.unwrap(), StatusReport::NotRunning);
    }

    #[tokio::test]
    async fn failed_eviction_is_retried_on_next_lookup() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.runtime.vanish(&session.sandbox_id);
        h.store.set_read_only(true);

        // Eviction cannot land, but the caller still learns the truth.
        assert_eq!(h.manager.status(&k).await.unwrap(), StatusReport::NotFound);
        assert!(h.manager.registry().get(&k).await.unwrap().is_some());

        h.store.set_read_only(false);
        assert_eq!(h.manager.status(&k).await.unwrap(), StatusReport::NotFound);
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);

        let fresh = h.manager.ensure_started(&k, &StartRequest::default()).await.unwrap();
        assert_eq!(fresh.status, StartStatus::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn active_sessions_outlive_the_registry_ttl() {
        let h = harness();
        let manager = LifecycleManager::new(
            h.runtime.clone(),
            SessionRegistry::new(h.store.clone(), Duration::from_secs(60)),
            Arc::new(ActivityTracker::new(h.clock.clone())),
        );
        let k = key("u1", "sqli");
        let started = manager.ensure_started(&k, &StartRequest::default()).await.unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(40)).await;
            assert_eq!(manager.record_activity_for(&k).await, ActivityAck::ActivityRecorded);
        }
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(manager.status(&k).await.unwrap().is_running());

        tokio::time::advance(Duration::from_secs(40)).await;
        let again = manager.ensure_started(&k, &StartRequest::default()).await.unwrap();
        assert_eq!(again.status, StartStatus::AlreadyRunning);
        assert_eq!(again.session.sandbox_ref(), started.session.sandbox_ref());

        // Left alone, the entry lapses.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.registry().get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn start_refuses_a_name_held_by_another_owner() {
        let h = harness();
        let first = key("b_c", "a");
        let second = key("c", "a_b");
        let mine = start(&h, &first).await;

        // Simulate a name collision: a foreign sandbox already holds the
        // name the second key will ask for.
        let mut squatter = SandboxTemplate::default().build(&first, &StartRequest::default(), 6002, 7002);
        squatter.name = second.sandbox_name();
        h.runtime.create(&squatter).await.unwrap();

        let err = h.manager.ensure_started(&second, &StartRequest::default()).await.unwrap_err();
        assert!(matches!(err, LabVmError::Conflict(_)));
        assert_eq!(h.runtime.sandbox_count(), 2);
        assert_eq!(h.runtime.state_of(&mine.sandbox_id), Some(SandboxState::Running));
    }

    #[tokio::test]
    async fn keys_that_sanitize_alike_get_separate_sandboxes() {
        let h = harness();
        let first = start(&h, &key("b_c", "a")).await;
        let second = start(&h, &key("c", "a_b")).await;

        assert_ne!(first.sandbox_name, second.sandbox_name);
        assert_ne!(first.sandbox_id, second.sandbox_id);
        assert_eq!(h.runtime.state_of(&first.sandbox_id), Some(SandboxState::Running));
        assert_eq!(h.runtime.state_of(&second.sandbox_id), Some(SandboxState::Running));
        assert_eq!(
            h.manager.status(&key("b_c", "a")).await.unwrap().status(),
            "running"
        );
    }

    #[tokio::test]
    async fn runtime_outage_never_evicts() {
        let h = harness();
        let k = key("u1", "sqli");
        start(&h, &k).await;
        h.runtime.set_unavailable(true);

        assert!(matches!(
            h.manager.status(&k).await,
            Err(LabVmError::RuntimeUnavailable(_))
        ));
        assert!(matches!(
            h.manager.stop(&k).await,
            Err(LabVmError::RuntimeUnavailable(_))
        ));
        assert!(h.manager.registry().get(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pause_resume_round_trip_keeps_ref_and_ports() {
        let h = harness();
        let k = key("u1", "sqli");
        let before = start(&h, &k).await;

        let paused = h.manager.pause(&k).await.unwrap();
        assert_eq!(paused.status, PauseStatus::Paused);
        let again = h.manager.pause(&k).await.unwrap();
        assert_eq!(again.status, PauseStatus::AlreadyPaused);

        h.clock.advance(ChronoDuration::minutes(5));
        let after = h.manager.resume(&k).await.unwrap();
        assert_eq!(after.sandbox_ref(), before.sandbox_ref());
        assert_eq!(
            (after.display_port, after.proxy_port),
            (before.display_port, before.proxy_port)
        );
        assert_eq!(
            h.manager.activity().idle_for(&after.sandbox_id).await,
            Some(ChronoDuration::zero())
        );
        assert_eq!(
            h.runtime.state_of(&after.sandbox_id),
            Some(SandboxState::Running)
        );
    }

    #[tokio::test]
    async fn resume_records_reassigned_ports() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.manager.pause(&k).await.unwrap();
        h.runtime.reassign_port(&session.sandbox_id, 5901, 6999);

        let resumed = h.manager.resume(&k).await.unwrap();
        assert_eq!(resumed.display_port, 6999);
        assert_eq!(
            h.manager.registry().get(&k).await.unwrap().map(|s| s.display_port),
            Some(6999)
        );
    }

    #[tokio::test]
    async fn status_persists_port_drift() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.runtime.reassign_port(&session.sandbox_id, 6080, 7999);

        let report = h.manager.status(&k).await.unwrap();
        assert!(report.is_running());
        let StatusReport::Present { session: reported, .. } = report else {
            panic!("expected a present session");
        };
        assert_eq!(reported.proxy_port, 7999);
        assert_eq!(
            h.manager.registry().get(&k).await.unwrap().map(|s| s.proxy_port),
            Some(7999)
        );
    }

    #[tokio::test]
    async fn resume_restarts_exited_sandbox() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.runtime.force_state(&session.sandbox_id, SandboxState::Exited);

        h.manager.resume(&k).await.unwrap();
        assert_eq!(h.runtime.call_count(RuntimeOp::Start), 2);
        assert_eq!(
            h.runtime.state_of(&session.sandbox_id),
            Some(SandboxState::Running)
        );
    }

    #[tokio::test]
    async fn pause_requires_a_running_session() {
        let h = harness();
        let k = key("u1", "sqli");
        assert!(matches!(
            h.manager.pause(&k).await,
            Err(LabVmError::SessionNotFound { .. })
        ));
        assert!(matches!(
            h.manager.resume(&k).await,
            Err(LabVmError::SessionNotFound { .. })
        ));

        let session = start(&h, &k).await;
        h.runtime.force_state(&session.sandbox_id, SandboxState::Exited);
        assert!(matches!(
            h.manager.pause(&k).await,
            Err(LabVmError::InvalidState(_))
        ));
        assert!(h.manager.registry().get(&k).await.unwrap().is_some());

        h.runtime.vanish(&session.sandbox_id);
        assert!(matches!(
            h.manager.pause(&k).await,
            Err(LabVmError::SessionNotFound { .. })
        ));
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn activity_for_unknown_session_is_acknowledged() {
        let h = harness();
        let k = key("u1", "sqli");
        assert_eq!(h.manager.record_activity_for(&k).await, ActivityAck::NotFound);

        let session = start(&h, &k).await;
        h.clock.advance(ChronoDuration::minutes(3));
        assert_eq!(
            h.manager.record_activity_for(&k).await,
            ActivityAck::ActivityRecorded
        );
        assert_eq!(
            h.manager.activity().idle_for(&session.sandbox_id).await,
            Some(ChronoDuration::zero())
        );

        h.manager.record_activity("never-seen").await;
        assert!(h.manager.activity().last_active("never-seen").await.is_some());
    }

    #[tokio::test]
    async fn stats_count_as_activity() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        h.clock.advance(ChronoDuration::minutes(7));

        let (_, stats) = h.manager.stats(&k).await.unwrap();
        assert!(stats.mem_limit > 0);
        assert_eq!(
            h.manager.activity().idle_for(&session.sandbox_id).await,
            Some(ChronoDuration::zero())
        );
    }

    #[tokio::test]
    async fn listing_joins_state_and_evicts_missing() {
        let h = harness();
        let a = start(&h, &key("u1", "a")).await;
        start(&h, &key("u1", "b")).await;
        start(&h, &key("u2", "a")).await;
        h.runtime.vanish(&a.sandbox_id);
        h.clock.advance(ChronoDuration::minutes(4));

        let mine = h.manager.list_for_user("u1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].lab_id, "b");
        assert_eq!(mine[0].state, Some(SandboxState::Running));
        assert_eq!(mine[0].idle_minutes, Some(4));

        assert_eq!(h.manager.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_dead_sessions_and_orphans() {
        let h = harness();
        let live = start(&h, &key("u1", "live")).await;
        let dead = start(&h, &key("u1", "dead")).await;
        let gone = start(&h, &key("u2", "gone")).await;
        h.runtime.force_state(&dead.sandbox_id, SandboxState::Exited);
        h.runtime.vanish(&gone.sandbox_id);

        let orphan_key = key("u3", "orphan");
        let spec =
            SandboxTemplate::default().build(&orphan_key, &StartRequest::default(), 6500, 7500);
        h.runtime.create(&spec).await.unwrap();

        let report = h.manager.cleanup().await.unwrap();
        assert_eq!(report.cleaned, 2);
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.untracked, 0);
        assert_eq!(h.runtime.sandbox_count(), 1);
        assert_eq!(
            h.runtime.state_of(&live.sandbox_id),
            Some(SandboxState::Running)
        );
        assert_eq!(h.manager.registry().list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reclamation_rechecks_idle_under_lock() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        let summary = summary_of(&h, &session.sandbox_id);

        let outcome = h
            .manager
            .pause_sandbox(&summary, ChronoDuration::minutes(10))
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Skipped);

        h.clock.advance(ChronoDuration::minutes(31));
        let outcome = h
            .manager
            .stop_sandbox(&summary, ChronoDuration::minutes(30))
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Stopped);
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);
        assert_eq!(h.runtime.sandbox_count(), 0);
    }

    #[tokio::test]
    async fn reclaiming_a_vanished_sandbox_evicts_it() {
        let h = harness();
        let k = key("u1", "sqli");
        let session = start(&h, &k).await;
        let summary = summary_of(&h, &session.sandbox_id);
        h.runtime.vanish(&session.sandbox_id);

        let outcome = h
            .manager
            .pause_sandbox(&summary, ChronoDuration::zero())
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Gone);
        assert_eq!(h.manager.registry().get(&k).await.unwrap(), None);
        assert!(h.runtime.list(&SandboxFilter::managed(true)).await.unwrap().is_empty());
    }
}
