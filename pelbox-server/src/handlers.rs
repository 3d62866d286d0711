//! HTTP handlers

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};

use pelbox_core::gateway::{CommandReport, DeviceStatus};
use pelbox_core::protocol::{
    CommandResponse, DismantleRequest, DoorRequest, ExpansionRequest, LockRequest,
};
use pelbox_core::DeviceState;

use crate::error::ApiError;
use crate::state::SharedState;

/// Header carrying the member token on state queries
const ACCESS_TOKEN_HEADER: &str = "Access-Token";

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/locking_state", get(state_handler))
        .route("/dismantle_state", get(state_handler))
        .route("/set_locking", put(set_locking))
        .route("/set_dismantle", put(set_dismantle))
        .route("/set_expanding_value", put(set_expanding_value))
        .route("/set_door", put(set_door))
        .with_state(state)
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pelbox-server"
    }))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(req)) => Ok(req),
        Err(rejection) => {
            let reason = rejection.body_text();
            tracing::debug!("rejected request body: {}", reason);
            Err(ApiError::bad_request(format!("JSON is badly formatted: {reason}")))
        }
    }
}

fn reply(report: CommandReport) -> Json<CommandResponse<DeviceState>> {
    let mut response = CommandResponse::ok(report.settings);
    if !report.persisted {
        response.message = Some("Actuation completed but could not be saved".to_string());
    }
    Json(response)
}

/// Device row and connection check. `success` reports whether the box is paired.
pub async fn state_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<CommandResponse<DeviceStatus>>, ApiError> {
    let token = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let status = state.gateway.device_status(token).await?;
    Ok(Json(CommandResponse::with_status(status.connected, status)))
}

pub async fn set_locking(
    State(state): State<SharedState>,
    payload: Result<Json<LockRequest>, JsonRejection>,
) -> Result<Json<CommandResponse<DeviceState>>, ApiError> {
    let req = body(payload)?;
    let report = state.gateway.set_lock(&req.access_token, req.locked).await?;
    Ok(reply(report))
}

pub async fn set_dismantle(
    State(state): State<SharedState>,
    payload: Result<Json<DismantleRequest>, JsonRejection>,
) -> Result<Json<CommandResponse<DeviceState>>, ApiError> {
    let req = body(payload)?;
    let report = state.gateway.set_dismantle(&req.access_token, req.dismantle).await?;
    Ok(reply(report))
}

pub async fn set_expanding_value(
    State(state): State<SharedState>,
    payload: Result<Json<ExpansionRequest>, JsonRejection>,
) -> Result<Json<CommandResponse<DeviceState>>, ApiError> {
    let req = body(payload)?;
    let report = state.gateway.set_expansion(&req.access_token, req.expanding_value).await?;
    Ok(reply(report))
}

pub async fn set_door(
    State(state): State<SharedState>,
    payload: Result<Json<DoorRequest>, JsonRejection>,
) -> Result<Json<CommandResponse<DeviceState>>, ApiError> {
    let req = body(payload)?;
    let report = state.gateway.set_door(&req.access_token, req.door).await?;
    Ok(reply(report))
}
