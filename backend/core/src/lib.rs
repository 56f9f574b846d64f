pub mod clock;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LabVmError, LabVmResult};
pub use traits::{KvStore, SandboxRuntime};
pub use types::{
    sandbox_ref, PortMap, PortRequest, SandboxFilter, SandboxInfo, SandboxSpec, SandboxState,
    SandboxStats, SandboxSummary, Session, SessionKey, DISPLAY_CONTAINER_PORT, LABEL_LAB,
    LABEL_MANAGED, LABEL_USER, PROXY_CONTAINER_PORT, SANDBOX_NAME_PREFIX,
};
