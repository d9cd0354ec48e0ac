//! HTTP request handlers.

use super::AppState;
use crate::db::{ChannelConfig, DbError, ProbeAuth, Target, TargetKind, TargetStore};
use crate::heartbeat::{HeartbeatError, SignalPayload};
use crate::notify::{Channel, NotifyError};
use crate::probe::{ProbeRequest, VantagePoint};
use crate::sla::{default_catalog, evaluate_target, SlaPolicy};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Header naming the caller of a test notification.
pub const CALLER_HEADER: &str = "x-caller-id";

/// Longest probe a remote caller may ask for.
const MAX_REMOTE_PROBE: Duration = Duration::from_secs(60);

// ============================================================================
// Heartbeat ingress
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub target_id: i64,
    pub result: String,
}

pub async fn handle_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> impl IntoResponse {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        SignalPayload::default()
    } else {
        match serde_json::from_slice::<SignalPayload>(&body) {
            Ok(payload) => payload,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid heartbeat body: {}", e)).into_response(),
        }
    };

    match state.receiver.receive(id, payload, Utc::now()).await {
        Ok(transition) => Json(HeartbeatResponse {
            target_id: id,
            result: transition.as_str().to_string(),
        })
        .into_response(),
        Err(e @ (HeartbeatError::NotFound(_) | HeartbeatError::NotHeartbeat(_))) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!(target_id = id, "Heartbeat ingress failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// Remote agent
// ============================================================================

/// Run one probe from this process on behalf of a coordinator.
pub async fn handle_probe(
    State(state): State<AppState>,
    Json(req): Json<ProbeRequest>,
) -> impl IntoResponse {
    let timeout = match req.timeout_ms {
        0 => state.config.probe_timeout,
        ms => Duration::from_millis(ms).min(MAX_REMOTE_PROBE),
    };
    let vantage = VantagePoint::local(req.vantage);
    let outcome = state.prober.probe_local(&req.target, &vantage, timeout).await;
    Json(outcome)
}

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_targets() {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub name: String,
    pub kind: TargetKind,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub auth: ProbeAuth,
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default)]
    pub channels: ChannelConfig,
}

impl CreateTargetRequest {
    fn validate(&self) -> Result<(), &'static str> {
        if self.name.trim().is_empty() {
            return Err("Name is required");
        }
        if self.kind.is_probed() && self.address.trim().is_empty() {
            return Err("Address is required");
        }
        if self.kind == TargetKind::TcpPort && self.port.is_none() {
            return Err("tcp-port targets need a port");
        }
        Ok(())
    }
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<CreateTargetRequest>,
) -> impl IntoResponse {
    if let Err(msg) = req.validate() {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let heartbeat_interval_secs = match req.kind {
        TargetKind::Heartbeat => Some(
            req.heartbeat_interval_secs
                .filter(|s| *s > 0)
                .unwrap_or(if req.interval_secs > 0 { req.interval_secs } else { 300 }),
        ),
        _ => None,
    };
    let mut target = Target {
        name: req.name.trim().to_string(),
        kind: req.kind,
        address: req.address.trim().to_string(),
        port: req.port,
        method: req.method.unwrap_or_else(|| "GET".to_string()),
        headers: req.headers,
        body: req.body,
        auth: req.auth,
        interval_secs: req.interval_secs,
        heartbeat_interval_secs,
        channels: req.channels,
        ..Default::default()
    };

    match state.store.add_target(&mut target) {
        Ok(id) => {
            tracing::info!(target_id = id, "Added {} target {}", target.kind, target.name);
            (StatusCode::CREATED, Json(target)).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    // No verdict may land between the delete and dropping the lock.
    let guard = state.locks.lock(id).await;
    let result = state.store.delete_target(id);
    drop(guard);
    state.locks.forget(id);

    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn store_error(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Target not found").into_response(),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_get_incidents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(e) = state.store.get_target(id) {
        return store_error(e);
    }
    match state.store.get_incidents(id) {
        Ok(incidents) => Json(incidents).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn handle_get_sla(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(e) = state.store.get_target(id) {
        return store_error(e);
    }
    let catalog = default_catalog();
    match evaluate_target(state.store.as_ref(), id, &catalog, &SlaPolicy::default(), Utc::now()) {
        Ok(calculations) => Json(calculations).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn handle_get_diagnostics(
    State(state): State<AppState>,
    Path(incident_id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_diagnostic_bundles(incident_id) {
        Ok(bundles) => Json(bundles).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Notifications
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TestNotificationRequest {
    /// Unsaved destinations; the stored ones fill the gaps.
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub enabled: HashMap<Channel, bool>,
}

#[derive(Debug, Serialize)]
struct RateLimitedBody {
    error: String,
    retry_after_secs: u64,
}

pub async fn handle_test_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<TestNotificationRequest>,
) -> impl IntoResponse {
    let target = match state.store.get_target(id) {
        Ok(t) => t,
        Err(e) => return store_error(e),
    };
    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");

    match state
        .fanout
        .dispatch_test(caller, &target, &req.channels, &req.enabled)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(NotifyError::RateLimited { retry_within }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitedBody {
                error: NotifyError::RateLimited { retry_within }.to_string(),
                retry_after_secs: retry_within.as_secs(),
            }),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
