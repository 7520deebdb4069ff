use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::Json,
};
use relay_core::{DeliveryOutcome, DeviceToken, DispatchSummary, Message, Platform, RelayContext, StorageError};
use relay_delivery::FanoutDispatcher;
use serde::Deserialize;
use serde_json::json;
use tracing;

use crate::identity::AuthenticatedUser;

const MAX_TOKEN_LEN: usize = 4096;

fn storage_failure(e: StorageError) -> StatusCode {
    tracing::error!("Token store error: {}", e);
    match e {
        StorageError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StorageError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Provider-issued tokens are opaque; only emptiness and size are checked.
fn validate_token(token: &str) -> Result<&str, StatusCode> {
    let token = token.trim();
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(token)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub async fn health(Extension(dispatcher): Extension<FanoutDispatcher>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "relay-api",
        "push_enabled": dispatcher.client().is_enabled(),
    }))
}

#[derive(Deserialize)]
pub struct RegisterDeviceTokenRequest {
    pub token: String,
    pub device_id: Option<String>,
    pub platform: Option<String>,
}

pub async fn register_device_token(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<RegisterDeviceTokenRequest>,
) -> Result<Json<DeviceToken>, StatusCode> {
    let token = validate_token(&req.token)?;

    let platform = match non_blank(req.platform.as_deref()) {
        Some(p) => Some(p.parse::<Platform>().map_err(|e| {
            tracing::debug!("Rejected registration: {}", e);
            StatusCode::BAD_REQUEST
        })?),
        None => None,
    };

    let row = ctx
        .token_store
        .register(&user.user_id, token, non_blank(req.device_id.as_deref()), platform)
        .await
        .map_err(storage_failure)?;

    tracing::info!("Registered device token for user {}", user.user_id);
    Ok(Json(row))
}

pub async fn list_device_tokens(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<DeviceToken>>, StatusCode> {
    let devices = ctx
        .token_store
        .list_devices(&user.user_id)
        .await
        .map_err(storage_failure)?;

    Ok(Json(devices))
}

pub async fn remove_device_token(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(token): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let removed = ctx
        .token_store
        .remove_owned_token(&user.user_id, &token)
        .await
        .map_err(storage_failure)?;

    if removed == 0 {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(json!({ "removed": removed })))
}

pub async fn remove_all_device_tokens(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let removed = ctx
        .token_store
        .remove_all_for_user(&user.user_id)
        .await
        .map_err(storage_failure)?;

    tracing::info!("Removed {} device token(s) for user {}", removed, user.user_id);
    Ok(Json(json!({ "removed": removed })))
}

pub async fn remove_device(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let removed = ctx
        .token_store
        .remove_for_device(&user.user_id, &device_id)
        .await
        .map_err(storage_failure)?;

    Ok(Json(json!({ "removed": removed })))
}

#[derive(Deserialize)]
pub struct SendNotificationRequest {
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Pushes to any user, so callers must be internal services. When
/// `INTERNAL_CALLER_IDS` is set only those identities are accepted.
pub async fn send_notification(
    Extension(ctx): Extension<RelayContext>,
    Extension(dispatcher): Extension<FanoutDispatcher>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<SendNotificationRequest>,
) -> Result<Json<DispatchSummary>, StatusCode> {
    if !ctx.config.server.is_internal_caller(&user.user_id) {
        tracing::warn!("Rejected notification send from non-internal caller {}", user.user_id);
        return Err(StatusCode::FORBIDDEN);
    }

    let user_id = non_blank(Some(&req.user_id)).ok_or(StatusCode::BAD_REQUEST)?;
    if req.title.trim().is_empty() || req.body.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let message = Message {
        title: req.title.clone(),
        body: req.body.clone(),
        data: req.data.clone(),
    };

    let summary = dispatcher
        .send_to_user(user_id, &message)
        .await
        .map_err(storage_failure)?;

    Ok(Json(summary))
}

#[derive(Deserialize)]
pub struct TestNotificationRequest {
    pub token: String,
    pub title: Option<String>,
    pub body: Option<String>,
}

pub async fn test_notification(
    Extension(dispatcher): Extension<FanoutDispatcher>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<TestNotificationRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let token = validate_token(&req.token)?;
    let message = Message::new(
        non_blank(req.title.as_deref()).unwrap_or("Test Notification"),
        non_blank(req.body.as_deref()).unwrap_or("This is a test push notification"),
    );

    let outcome = dispatcher
        .send_to_token(&user.user_id, token, &message)
        .await
        .map_err(storage_failure)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(json!({
        "outcome": outcome,
        "delivered": outcome == DeliveryOutcome::Delivered,
    })))
}
