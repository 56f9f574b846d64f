//! Mapping from lifecycle errors to HTTP responses.
//!
//! Bodies are `{error, message}` with a terse message; runtime detail goes
//! to the log only.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use labvm_core::LabVmError;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    Lifecycle(LabVmError),
}

impl From<LabVmError> for ApiError {
    fn from(e: LabVmError) -> Self {
        ApiError::Lifecycle(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Lifecycle(e) => match e {
                LabVmError::SessionNotFound { .. } | LabVmError::ImageNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                LabVmError::InvalidRequest(_) | LabVmError::InvalidState(_) => {
                    StatusCode::BAD_REQUEST
                }
                LabVmError::Conflict(_) => StatusCode::CONFLICT,
                LabVmError::ResourceExhausted(_)
                | LabVmError::RuntimeUnavailable(_)
                | LabVmError::RegistryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                LabVmError::NotFound(_) | LabVmError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::Lifecycle(e) => e.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized => "caller identity missing".into(),
            ApiError::Forbidden => "admin role required".into(),
            ApiError::Lifecycle(e) => match e {
                LabVmError::SessionNotFound { .. } => "no active session for this lab".into(),
                LabVmError::ImageNotFound(_) => "lab image is not available".into(),
                LabVmError::InvalidRequest(detail) => detail.clone(),
                LabVmError::InvalidState(_) => {
                    "the lab VM is not in a state that allows this".into()
                }
                LabVmError::Conflict(_) => "the lab VM conflicts with an existing sandbox".into(),
                LabVmError::ResourceExhausted(_) => "no capacity for another lab VM right now".into(),
                LabVmError::RuntimeUnavailable(_) => "lab VM service is temporarily unavailable".into(),
                LabVmError::RegistryUnavailable(_) => "session store is temporarily unavailable".into(),
                LabVmError::NotFound(_) | LabVmError::Internal(_) => "internal error".into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Lifecycle(e) = &self {
            if status.is_server_error() {
                error!(code = e.code(), error = %e, "Request failed");
            } else {
                warn!(code = e.code(), error = %e, "Request rejected");
            }
        }
        let body = json!({ "error": self.code(), "message": self.message() });
        (status, Json(body)).into_response()
    }
}
