//! Optimizer loop: periodically pauses or stops idle lab sandboxes.
//!
//! A running sandbox is paused once idle past the pause threshold and stopped
//! past the stop threshold. A paused sandbox keeps aging on the same idle
//! clock and is stopped once it crosses the stop threshold.
//!
//! Runs through the same `LifecycleManager` entry points as user requests,
//! so it takes the same per-session locks. A failing sandbox is counted and
//! skipped; a failing tick is logged and retried on the next interval.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use labvm_core::{LabVmResult, SandboxFilter, SandboxState, SandboxSummary};
use labvm_lifecycle::{LifecycleManager, ReclaimOutcome};

use crate::policy::{ReclamationPolicy, UnobservedPolicy, Verdict};

/// Per-tick counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Running sandboxes left alone.
    pub running: usize,
    pub paused: usize,
    pub stopped: usize,
    /// Not eligible: unobserved, or no longer idle once locked.
    pub skipped: usize,
    pub errors: usize,
}

/// Outcome of the most recent tick, kept for the admin view.
#[derive(Debug, Clone, Serialize)]
pub struct TickRecord {
    pub finished_at: DateTime<Utc>,
    pub report: Option<TickReport>,
    pub error: Option<String>,
}

pub struct Optimizer {
    manager: Arc<LifecycleManager>,
    policy: ReclamationPolicy,
    last: RwLock<Option<TickRecord>>,
}

impl Optimizer {
    pub fn new(manager: Arc<LifecycleManager>, policy: ReclamationPolicy) -> Self {
        Self {
            manager,
            policy,
            last: RwLock::new(None),
        }
    }

    pub fn policy(&self) -> &ReclamationPolicy {
        &self.policy
    }

    pub async fn last_tick(&self) -> Option<TickRecord> {
        self.last.read().await.clone()
    }

    /// One reclamation pass over every running or paused managed sandbox.
    pub async fn run_once(&self) -> LabVmResult<TickReport> {
        let result = self.sweep().await;
        let record = TickRecord {
            finished_at: self.manager.activity().now(),
            report: result.as_ref().ok().copied(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        *self.last.write().await = Some(record);

        match &result {
            Ok(report) => info!(
                running = report.running,
                paused = report.paused,
                stopped = report.stopped,
                skipped = report.skipped,
                errors = report.errors,
                "Optimizer tick complete"
            ),
            Err(e) => error!(error = %e, "Optimizer tick failed"),
        }
        result
    }

    async fn sweep(&self) -> LabVmResult<TickReport> {
        let sandboxes = self
            .manager
            .runtime()
            .list(&SandboxFilter::managed(false))
            .await?;

        let mut report = TickReport::default();
        let candidates = sandboxes
            .iter()
            .filter(|s| matches!(s.state, SandboxState::Running | SandboxState::Paused));
        for sandbox in candidates {
            match self.reclaim(sandbox).await {
                Ok(Some(ReclaimOutcome::Paused)) => report.paused += 1,
                Ok(Some(ReclaimOutcome::Stopped)) => report.stopped += 1,
                Ok(Some(ReclaimOutcome::Skipped)) => report.skipped += 1,
                Ok(Some(ReclaimOutcome::Gone)) => {}
                Ok(None) if sandbox.state == SandboxState::Running => report.running += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(sandbox = %sandbox.name, error = %e, "Reclamation failed, continuing");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// `Ok(None)`: not idle enough, left as it is.
    async fn reclaim(&self, sandbox: &SandboxSummary) -> LabVmResult<Option<ReclaimOutcome>> {
        let activity = self.manager.activity();
        let idle = match activity.idle_for(&sandbox.id).await {
            Some(idle) => idle,
            None => match self.policy.unobserved {
                UnobservedPolicy::Skip => return Ok(Some(ReclaimOutcome::Skipped)),
                UnobservedPolicy::FirstSeen => {
                    activity.seed(&sandbox.id, activity.now()).await;
                    debug!(sandbox = %sandbox.name, "Idle clock started on first sight");
                    return Ok(Some(ReclaimOutcome::Skipped));
                }
                UnobservedPolicy::CreatedAt => {
                    let info = self.manager.runtime().inspect(&sandbox.id).await?;
                    let since = info.created_at.unwrap_or_else(|| activity.now());
                    activity.seed(&sandbox.id, since).await;
                    activity.idle_for(&sandbox.id).await.unwrap_or_default()
                }
            },
        };

        let outcome = match (self.policy.verdict(idle), sandbox.state) {
            (Verdict::Keep, _) | (Verdict::Pause, SandboxState::Paused) => return Ok(None),
            (Verdict::Stop, _) => {
                info!(sandbox = %sandbox.name, idle_mins = idle.num_minutes(), "Stopping idle sandbox");
                self.manager
                    .stop_sandbox(sandbox, self.policy.stop_after())
                    .await?
            }
            (Verdict::Pause, _) => {
                info!(sandbox = %sandbox.name, idle_mins = idle.num_minutes(), "Pausing idle sandbox");
                self.manager
                    .pause_sandbox(sandbox, self.policy.pause_after())
                    .await?
            }
        };
        Ok(Some(outcome))
    }

    /// Run the loop until `cancel` fires: wait out the startup delay, then
    /// tick every interval.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                startup_delay_secs = self.policy.startup_delay.as_secs(),
                interval_secs = self.policy.interval.as_secs(),
                "Optimizer scheduled"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Optimizer cancelled before first tick");
                    return;
                }
                _ = tokio::time::sleep(self.policy.startup_delay) => {}
            }

            let mut ticker = tokio::time::interval(self.policy.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                // Errors are already logged and recorded.
                let _ = self.run_once().await;
            }
            info!("Optimizer stopped");
        })
    }
}
