//! Structured logging for the lab VM manager.
//!
//! Console plus daily-rolled JSON file output, credential redaction, and a
//! dedicated target for sandbox lifecycle events.

pub mod event_logger;
pub mod logger;
pub mod redact;

pub use event_logger::{EventLogEntry, EventLogger, LifecycleEvent};
pub use logger::{LogFormat, init_logger};
pub use redact::redact_sensitive_data;
