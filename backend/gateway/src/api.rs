//! Session API routes.
//!
//! Handlers only translate between HTTP and `LifecycleManager`; all policy
//! lives below.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use labvm_core::{LabVmError, Session, SessionKey};
use labvm_lifecycle::{LifecycleManager, StartRequest, StatusReport};
use labvm_scheduler::Optimizer;

use crate::auth::{CallerIdentity, RequireAdmin};
use crate::error::ApiError;

/// Shared application state for API handlers.
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub optimizer: Arc<Optimizer>,
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Build the Axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/vm/start/:lab_id", post(start_vm))
        .route("/api/vm/stop/:lab_id", post(stop_vm))
        .route("/api/vm/pause/:lab_id", post(pause_vm))
        .route("/api/vm/resume/:lab_id", post(resume_vm))
        .route("/api/vm/status/:lab_id", get(vm_status))
        .route("/api/vm/stats/:lab_id", get(vm_stats))
        .route("/api/vm/activity/:lab_id", post(record_activity))
        .route("/api/vm/list", get(list_vms))
        .route("/api/vm/admin/all-sessions", get(all_sessions))
        .route("/api/vm/admin/optimize", post(optimize_now))
        .route("/api/vm/admin/optimizer", get(optimizer_status))
        .route("/api/vm/admin/cleanup", delete(cleanup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn session_key(caller: &CallerIdentity, lab_id: String) -> Result<SessionKey, ApiError> {
    Ok(SessionKey::new(caller.user_id.clone(), lab_id)?)
}

fn endpoint(status: &str, session: &Session) -> Value {
    json!({
        "status": status,
        "sandbox_ref": session.sandbox_ref(),
        "display_port": session.display_port,
        "proxy_port": session.proxy_port,
    })
}

/// No JSON body means defaults; a JSON body that does not parse is refused
/// rather than silently replaced.
fn start_request(body: Result<Json<StartRequest>, JsonRejection>) -> Result<StartRequest, ApiError> {
    match body {
        Ok(Json(request)) => Ok(request),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(StartRequest::default()),
        Err(rejection) => Err(LabVmError::InvalidRequest(rejection.body_text()).into()),
    }
}

/// Health check endpoint.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "labvm",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn start_vm(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(lab_id): Path<String>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult {
    let key = session_key(&caller, lab_id)?;
    let mut request = start_request(body)?;
    if request.username.is_none() {
        request.username = caller.username.clone();
    }

    let outcome = state.manager.ensure_started(&key, &request).await?;
    Ok(Json(endpoint(outcome.status.as_str(), &outcome.session)))
}

async fn stop_vm(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(lab_id): Path<String>,
) -> ApiResult {
    let key = session_key(&caller, lab_id)?;
    let outcome = state.manager.stop(&key).await?;
    Ok(Json(json!({ "status": outcome })))
}

async fn pause_vm(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(lab_id): Path<String>,
) -> ApiResult {
    let key = session_key(&caller, lab_id)?;
    let outcome = state.manager.pause(&key).await?;
    Ok(Json(json!({
        "status": outcome.status,
        "sandbox_ref": outcome.session.sandbox_ref(),
    })))
}

async fn resume_vm(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(lab_id): Path<String>,
) -> ApiResult {
    let key = session_key(&caller, lab_id)?;
    let session = state.manager.resume(&key).await?;
    Ok(Json(endpoint("running", &session)))
}

async fn vm_status(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(lab_id): Path<String>,
) -> ApiResult {
    let key = session_key(&caller, lab_id)?;
    let report = state.manager.status(&key).await?;
    let body = match &report {
        StatusReport::Present { session, .. } => {
            let mut body = endpoint(report.status(), session);
            body["running"] = Value::Bool(report.is_running());
            body
        }
        _ => json!({ "status": report.status(), "running": false }),
    };
    Ok(Json(body))
}

async fn vm_stats(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(lab_id): Path<String>,
) -> ApiResult {
    let key = session_key(&caller, lab_id)?;
    let (session, stats) = state.manager.stats(&key).await?;
    Ok(Json(json!({
        "sandbox_ref": session.sandbox_ref(),
        "stats": stats,
    })))
}

/// Best-effort heartbeat from the desktop client.
async fn record_activity(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(lab_id): Path<String>,
) -> Json<Value> {
    let ack = match SessionKey::new(caller.user_id, lab_id) {
        Ok(key) => state.manager.record_activity_for(&key).await,
        Err(_) => labvm_lifecycle::ActivityAck::NotFound,
    };
    Json(json!({ "status": ack }))
}

async fn list_vms(State(state): State<Arc<AppState>>, caller: CallerIdentity) -> ApiResult {
    let sessions = state.manager.list_for_user(&caller.user_id).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn all_sessions(State(state): State<Arc<AppState>>, _admin: RequireAdmin) -> ApiResult {
    let sessions = state.manager.list_all().await?;
    Ok(Json(json!({ "total": sessions.len(), "sessions": sessions })))
}

async fn optimize_now(State(state): State<Arc<AppState>>, RequireAdmin(admin): RequireAdmin) -> ApiResult {
    tracing::info!(admin = %admin.user_id, "Manual optimizer run");
    let report = state.optimizer.run_once().await?;
    Ok(Json(json!(report)))
}

async fn optimizer_status(State(state): State<Arc<AppState>>, _admin: RequireAdmin) -> ApiResult {
    Ok(Json(json!({
        "policy": state.optimizer.policy(),
        "last_tick": state.optimizer.last_tick().await,
    })))
}

async fn cleanup(State(state): State<Arc<AppState>>, RequireAdmin(admin): RequireAdmin) -> ApiResult {
    tracing::info!(admin = %admin.user_id, "Manual cleanup");
    let report = state.manager.cleanup().await?;
    Ok(Json(json!(report)))
}
