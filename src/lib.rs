//! Core library for chatrelay.  This module wires together the relay
//! coordinator, the webhook wire types and the HTTP handlers.  The model
//! service and the IM callback are reached through the traits in
//! [`upstream`] so tests can substitute them.

pub mod config;
pub mod error;
pub mod relay;
pub mod telemetry;
pub mod upstream;
pub mod util;

pub use config::{AdminCredentials, AppConfig, GroupConfig, GroupConfigs};
pub use error::{ErrorResponse, WebhookError};

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::relay::{parse_mode, Outcome, RequestCoordinator};
use crate::telemetry::{EventSink, RelayMetrics, WebhookEvent};
use crate::upstream::{ImNotifier, KnowledgeBase, ModelClient, Notifier, OpenAiCompatClient};
use crate::util::{basic_credentials, client_ip};

/// Text body of an inbound message.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct TextMsg {
    pub content: Option<String>,
}

/// Payload the IM platform posts to `/webhook`.  Every field is optional at
/// the wire level so that missing fields surface as validation errors rather
/// than opaque decode failures.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub text_msg: Option<TextMsg>,
    pub phone: Option<String>,
    pub group_id: Option<String>,
    pub call_back_url: Option<String>,
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RequestCoordinator>,
    pub groups: Arc<GroupConfigs>,
    pub admin: Option<AdminCredentials>,
    pub events: EventSink,
    pub metrics: Arc<RelayMetrics>,
    pub max_request_bytes: Option<usize>,
}

impl AppState {
    /// Assemble the state from an already-loaded configuration and the two
    /// upstream collaborators.
    pub fn new(
        config: AppConfig,
        groups: GroupConfigs,
        model: Arc<dyn ModelClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let AppConfig {
            relay,
            admin,
            log_file,
            rotation,
            log_stdout,
            max_request_bytes,
            ..
        } = config;

        let metrics = Arc::new(RelayMetrics::default());
        let events = EventSink::from_config(log_file.as_deref(), &rotation, log_stdout, metrics.clone());
        let groups = Arc::new(groups);
        let coordinator = Arc::new(RequestCoordinator::new(
            relay,
            groups.clone(),
            model,
            notifier,
            KnowledgeBase::new(),
            metrics.clone(),
        ));

        Self {
            coordinator,
            groups,
            admin,
            events,
            metrics,
            max_request_bytes,
        }
    }
}

/// Build state from environment variables.  See [`AppConfig::from_env`] for
/// the variables read; the group map comes from `GROUP_CONFIG_FILE`.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    build_state(config).await
}

/// Wire the production model client and notifier around an already
/// parsed configuration.
pub async fn build_state(config: AppConfig) -> Result<AppState, Box<dyn std::error::Error>> {
    let groups = GroupConfigs::load(&config.group_config_file);

    if config.admin.is_none() {
        tracing::warn!("APP_USERNAME/APP_PASSWORD not set; /sessions is disabled");
    }
    if config.log_file.is_none() {
        tracing::info!("Event log disabled: LOG_FILE not set");
    }

    let model = OpenAiCompatClient::new(config.model.clone())
        .map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    let notifier = ImNotifier::new(config.notify_timeout)
        .map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;

    Ok(AppState::new(config, groups, Arc::new(model), Arc::new(notifier)))
}

/// Build the Axum router and attach handlers.  The router holds a copy
/// of the `AppState` for each invocation.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/sessions", get(sessions_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler);

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Handler for `/webhook`.  The HTTP response only acknowledges the call;
/// replies travel back through the callback URL.
async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<WebhookRequest>, JsonRejection>,
) -> axum::response::Response {
    let started = Instant::now();
    let ip = client_ip(&headers);

    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            state
                .metrics
                .record_outcome("bad_request", started.elapsed().as_millis() as u64);
            return handle_json_rejection(&state, rejection, &ip);
        }
    };

    let result = state.coordinator.handle(&req).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let content = req
        .text_msg
        .as_ref()
        .and_then(|m| m.content.as_deref())
        .unwrap_or_default()
        .trim();
    let (outcome, mode, error) = match &result {
        Ok(outcome) => {
            let mode = match outcome {
                Outcome::Processed { .. } | Outcome::Dispatched { .. } => {
                    Some(parse_mode(content).0.as_str())
                }
                Outcome::Busy { .. } | Outcome::Reset => None,
            };
            (outcome.label(), mode, None)
        }
        Err(err) => (err.label(), None, Some(err.to_string())),
    };
    state.metrics.record_outcome(outcome, latency_ms);
    state.events.emit(&WebhookEvent {
        schema_version: 1,
        ts: Utc::now().to_rfc3339(),
        identity: req.phone.as_deref().unwrap_or_default(),
        group_id: req.group_id.as_deref().unwrap_or_default(),
        outcome,
        mode,
        latency_ms,
        error,
    });

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "success" })),
        )
            .into_response(),
        Err(err) => {
            match &err {
                WebhookError::Internal(detail) => {
                    tracing::error!(ip = %ip, error = %detail, "webhook handling failed")
                }
                WebhookError::TooManyRequests { .. } => {
                    tracing::warn!(ip = %ip, identity = ?req.phone, "webhook rate limited")
                }
                other => tracing::warn!(ip = %ip, error = %other, "webhook rejected"),
            }
            err.into_response()
        }
    }
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection, ip: &str) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            let message = match state.max_request_bytes {
                Some(limit) => {
                    tracing::warn!(ip = %ip, limit, "request body exceeded configured limit");
                    format!("Request too large (body exceeded limit {} bytes)", limit)
                }
                None => {
                    tracing::warn!(ip = %ip, "request body exceeded default limit");
                    "Request too large".to_string()
                }
            };
            (StatusCode::PAYLOAD_TOO_LARGE, Json(ErrorResponse::new(message))).into_response()
        }
        JsonRejection::MissingJsonContentType(_) => {
            tracing::warn!(ip = %ip, "non-JSON webhook request");
            WebhookError::BadRequest("请求必须是JSON格式".to_string()).into_response()
        }
        other => {
            tracing::warn!(ip = %ip, error = %other.body_text(), "malformed webhook payload");
            WebhookError::BadRequest(other.body_text()).into_response()
        }
    }
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"Login Required\"")],
        Json(ErrorResponse::new("Unauthorized")),
    )
        .into_response()
}

/// The authenticated admin user name, if the basic-auth header matches the
/// configured credentials.  No credentials configured means no access.
fn admin_user(headers: &HeaderMap, admin: Option<&AdminCredentials>) -> Option<String> {
    let admin = admin?;
    let (username, password) = basic_credentials(headers)?;
    (username == admin.username && password == admin.password).then_some(username)
}

/// Read-only view of the relay stores and group configuration.
async fn sessions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    let ip = client_ip(&headers);
    let username = match admin_user(&headers, state.admin.as_ref()) {
        Some(username) => username,
        None => {
            tracing::warn!(ip = %ip, "rejected admin request");
            return unauthorized();
        }
    };
    tracing::info!(ip = %ip, user = %username, "admin view requested");

    let snapshot = state.coordinator.snapshot(Instant::now());
    let json = serde_json::json!({
        "status": "success",
        "active_sessions": snapshot.active_sessions,
        "active_requests": snapshot.active_requests,
        "sessions": snapshot.sessions,
        "requests": snapshot.requests,
        "group_configs": state.groups.groups(),
        "default_config": state.groups.default_config(),
        "current_time": Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let sizes = state.coordinator.store_sizes();
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sizes.sessions,
        "activeRequests": sizes.active_requests,
        "groupCount": state.groups.len(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let body = state.metrics.render(state.coordinator.store_sizes());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn not_found_handler() -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new("Not Found"))).into_response()
}
