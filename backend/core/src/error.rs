use thiserror::Error;

/// Error taxonomy for the lab VM lifecycle subsystem.
///
/// `NotFound` means the runtime confirmed the sandbox is absent and is the
/// only variant that licenses evicting registry state. `RuntimeUnavailable`
/// means the outcome is unknown.
#[derive(Debug, Error)]
pub enum LabVmError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("sandbox image not found: {0}")]
    ImageNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no session for user {user_id} and lab {lab_id}")]
    SessionNotFound { user_id: String, lab_id: String },

    #[error("session registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LabVmError {
    /// Short machine-readable code, safe to hand to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            LabVmError::NotFound(_) => "not_found",
            LabVmError::RuntimeUnavailable(_) => "runtime_unavailable",
            LabVmError::InvalidState(_) => "invalid_state",
            LabVmError::ResourceExhausted(_) => "resource_exhausted",
            LabVmError::ImageNotFound(_) => "image_not_found",
            LabVmError::Conflict(_) => "conflict",
            LabVmError::SessionNotFound { .. } => "session_not_found",
            LabVmError::RegistryUnavailable(_) => "registry_unavailable",
            LabVmError::InvalidRequest(_) => "invalid_request",
            LabVmError::Internal(_) => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LabVmError::NotFound(_))
    }

    pub fn session_not_found(user_id: &str, lab_id: &str) -> Self {
        LabVmError::SessionNotFound {
            user_id: user_id.to_string(),
            lab_id: lab_id.to_string(),
        }
    }
}

pub type LabVmResult<T> = std::result::Result<T, LabVmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(LabVmError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            LabVmError::session_not_found("u1", "l1").code(),
            "session_not_found"
        );
        assert_eq!(
            LabVmError::Internal(anyhow::anyhow!("boom")).code(),
            "internal"
        );
    }

    #[test]
    fn timeout_is_not_confirmed_absence() {
        let err = LabVmError::RuntimeUnavailable("docker inspect timed out".into());
        assert!(!err.is_not_found());
        assert!(LabVmError::NotFound("abc".into()).is_not_found());
    }
}
