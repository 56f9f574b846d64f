//! Lab VM Gateway HTTP API Server
//!
//! Session API over axum: caller identity from upstream headers, handlers
//! that delegate to the lifecycle manager, and error-to-status mapping.

pub mod api;
pub mod auth;
pub mod error;
pub mod server;

pub use api::{AppState, build_router};
pub use auth::{CallerIdentity, RequireAdmin};
pub use error::ApiError;
pub use server::start_server;
