use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chatrelay::error::{ModelError, NotifyError};
use chatrelay::relay::{ReplyTarget, Turn};
use chatrelay::upstream::{ModelClient, Notifier};
use chatrelay::util::Deadline;
use chatrelay::{app, AdminCredentials, AppConfig, AppState, GroupConfig, GroupConfigs};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

struct EchoModel;

#[async_trait::async_trait]
impl ModelClient for EchoModel {
    async fn complete(&self, _model: &str, messages: &[Turn]) -> Result<String, ModelError> {
        let last = messages.last().map(|t| t.content.clone()).unwrap_or_default();
        Ok(format!("echo: {last}"))
    }

    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[Turn],
        _deadline: Deadline,
    ) -> Result<String, ModelError> {
        self.complete(model, messages).await
    }
}

#[derive(Default)]
struct NullNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _target: &ReplyTarget, content: &str) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(content.to_string());
        Ok(())
    }
}

fn state() -> AppState {
    let mut config = AppConfig::default();
    config.admin = Some(AdminCredentials {
        username: "admin".into(),
        password: "s3cret".into(),
    });
    let mut groups = std::collections::HashMap::new();
    groups.insert(
        "grp-1".to_string(),
        GroupConfig {
            model: "qwen-max".into(),
            ..GroupConfig::default()
        },
    );
    AppState::new(
        config,
        GroupConfigs::new(groups),
        Arc::new(EchoModel),
        Arc::new(NullNotifier::default()),
    )
}

fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn sessions_requires_basic_auth() {
    let router = app(state());

    let resp = router
        .clone()
        .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"Login Required\""
    );

    let resp = router
        .oneshot(
            Request::get("/sessions")
                .header(header::AUTHORIZATION, basic("admin", "wrong"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sessions_without_configured_credentials_is_closed() {
    let state = AppState::new(
        AppConfig::default(),
        GroupConfigs::default(),
        Arc::new(EchoModel),
        Arc::new(NullNotifier::default()),
    );
    let resp = app(state)
        .oneshot(
            Request::get("/sessions")
                .header(header::AUTHORIZATION, basic("", ""))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sessions_reports_live_conversations_read_only() {
    let router = app(state());
    let webhook = json!({
        "type": "text",
        "textMsg": {"content": "hello"},
        "phone": "13800000009",
        "groupId": "grp-1",
        "callBackUrl": "https://im.zdxlz.com/callback"
    });
    let resp = router
        .clone()
        .oneshot(
            Request::post("/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(webhook.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    for _ in 0..2 {
        let resp = router
            .clone()
            .oneshot(
                Request::get("/sessions")
                    .header(header::AUTHORIZATION, basic("admin", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["active_sessions"], 1);
        assert_eq!(body["active_requests"], 0);
        let session = &body["sessions"]["13800000009"];
        assert_eq!(session["message_count"], 2);
        assert_eq!(session["has_active_request"], false);
        assert_eq!(session["recent_messages"][1]["content"], "echo: hello");
        assert!(session["last_active"].as_str().is_some());
        assert_eq!(body["group_configs"]["grp-1"]["model"], "qwen-max");
        assert_eq!(body["default_config"]["model"], "qwen-plus-latest");
        assert!(body["current_time"].as_str().is_some());
    }
}

#[tokio::test]
async fn healthz_reports_store_sizes() {
    let resp = app(state())
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["activeRequests"], 0);
    assert_eq!(body["groupCount"], 1);
}
