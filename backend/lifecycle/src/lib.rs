//! Session lifecycle for lab sandboxes.
//!
//! `LifecycleManager` is the single place where sessions change state. It
//! sits on a `SandboxRuntime` (what exists), a `SessionRegistry` (who owns
//! what) and an `ActivityTracker` (when it was last used).

pub mod activity;
pub mod keyed_lock;
pub mod manager;
pub mod outcome;
pub mod ports;
pub mod registry;
pub mod template;

pub use activity::ActivityTracker;
pub use keyed_lock::KeyedLocks;
pub use manager::{DEFAULT_STOP_TIMEOUT, LifecycleManager};
pub use outcome::{
    ActivityAck, CleanupReport, PauseOutcome, PauseStatus, ReclaimOutcome, SessionView,
    StartOutcome, StartStatus, StatusReport, StopOutcome,
};
pub use ports::PortAllocator;
pub use registry::{DEFAULT_SESSION_TTL, SessionRegistry};
pub use template::{SandboxTemplate, StartRequest};
