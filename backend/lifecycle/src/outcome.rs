//! Results of lifecycle operations, shaped for the API layer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use labvm_core::{SandboxState, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub status: StartStatus,
    pub session: Session,
}

impl StartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartStatus::Started => "started",
            StartStatus::AlreadyRunning => "already_running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
    /// The sandbox was already gone; the registry entry has been dropped.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseStatus {
    Paused,
    AlreadyPaused,
}

#[derive(Debug, Clone)]
pub struct PauseOutcome {
    pub status: PauseStatus,
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    NotRunning,
    /// A stale entry was found and evicted.
    NotFound,
    Present { state: SandboxState, session: Session },
}

impl StatusReport {
    pub fn status(&self) -> &'static str {
        match self {
            StatusReport::NotRunning => "not_running",
            StatusReport::NotFound => "not_found",
            StatusReport::Present { state, .. } => state.as_str(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, StatusReport::Present { state: SandboxState::Running, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAck {
    ActivityRecorded,
    NotFound,
}

/// A registry entry joined with what the runtime and tracker know about it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub user_id: String,
    pub lab_id: String,
    pub sandbox_ref: String,
    pub sandbox_name: String,
    /// `None` when the runtime could not be asked.
    pub state: Option<SandboxState>,
    pub display_port: u16,
    pub proxy_port: u16,
    pub created_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub idle_minutes: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Registry entries removed along with their dead sandboxes.
    pub cleaned: usize,
    /// Stopped managed sandboxes that no registry entry referenced.
    pub orphans_removed: usize,
    /// Live managed sandboxes with no registry entry; reported, left alone.
    pub untracked: usize,
}

/// What a reclamation call did to one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimOutcome {
    Paused,
    Stopped,
    /// No longer eligible once the session lock was held.
    Skipped,
    /// Already removed from the runtime.
    Gone,
}
