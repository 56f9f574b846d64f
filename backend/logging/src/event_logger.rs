//! Lifecycle Event Logger
//!
//! Sandbox transitions (started, paused, stopped, reclaimed) emitted on a
//! dedicated `lifecycle_events` target so they can be filtered out of the
//! general log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::redact::redact_sensitive_data;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started { sandbox_ref: String, display_port: u16, proxy_port: u16 },
    Resumed { sandbox_ref: String },
    Paused { sandbox_ref: String, idle_secs: Option<i64> },
    Stopped { sandbox_ref: String, idle_secs: Option<i64> },
    Evicted { sandbox_ref: String, reason: String },
    Failed { operation: String, error: String },
}

#[derive(Debug, Serialize)]
pub struct EventLogEntry {
    pub session: String,
    pub timestamp: DateTime<Utc>,
    pub event: LifecycleEvent,
}

pub struct EventLogger;

impl EventLogger {
    /// Emit a lifecycle event for `session` (a `user/lab` pair).
    pub fn log_event(session: &str, mut event: LifecycleEvent) -> EventLogEntry {
        match &mut event {
            LifecycleEvent::Evicted { reason, .. } => *reason = redact_sensitive_data(reason),
            LifecycleEvent::Failed { error, .. } => *error = redact_sensitive_data(error),
            _ => {}
        }

        let entry = EventLogEntry {
            session: session.into(),
            timestamp: Utc::now(),
            event,
        };

        let payload = serde_json::to_string(&entry.event).unwrap_or_default();
        info!(target: "lifecycle_events", session = %entry.session, event = %payload, "Lifecycle event");
        entry
    }
}
