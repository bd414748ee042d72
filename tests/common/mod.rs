#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

async fn serve(app: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// Mock IM platform callback.  Records every posted message and answers with
/// the configured status.
#[derive(Clone)]
pub struct CallbackSink {
    pub url: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl CallbackSink {
    pub fn contents(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|v| v["textMsg"]["content"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn messages(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        for _ in 0..300 {
            if self.received.lock().unwrap().len() >= count {
                return self.contents();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} callback messages, got {:?}",
            count,
            self.contents()
        );
    }
}

pub async fn spawn_callback_sink(status: StatusCode) -> (CallbackSink, JoinHandle<()>) {
    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    async fn record(
        State((received, status)): State<(Arc<Mutex<Vec<Value>>>, StatusCode)>,
        Json(v): Json<Value>,
    ) -> Response {
        received.lock().unwrap().push(v);
        (status, Json(json!({"code": 0}))).into_response()
    }

    let app = Router::new()
        .route("/callback", post(record))
        .with_state((received.clone(), status));
    let (base, handle) = serve(app).await;
    (
        CallbackSink {
            url: format!("{}/callback", base),
            received,
        },
        handle,
    )
}

/// Behaviour of the mock completion service.
#[derive(Clone)]
pub struct ModelScript {
    pub answer: String,
    pub reasoning: String,
    /// Delay between streamed chunks.
    pub chunk_delay: Duration,
    pub status: StatusCode,
}

impl ModelScript {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            reasoning: "let me think".to_string(),
            chunk_delay: Duration::from_millis(0),
            status: StatusCode::OK,
        }
    }
}

#[derive(Clone)]
pub struct ModelService {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl ModelService {
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

/// Mock OpenAI-compatible `/v1/chat/completions`.  Streaming requests get
/// one reasoning chunk followed by the answer split into two chunks.
pub async fn spawn_model_service(script: ModelScript) -> (ModelService, JoinHandle<()>) {
    let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    async fn completions(
        State((requests, script)): State<(Arc<Mutex<Vec<Value>>>, ModelScript)>,
        Json(v): Json<Value>,
    ) -> Response {
        let streaming = v.get("stream").and_then(Value::as_bool).unwrap_or(false);
        requests.lock().unwrap().push(v);
        if script.status != StatusCode::OK {
            return (script.status, "upstream unavailable").into_response();
        }
        if !streaming {
            return Json(json!({
                "choices": [{"message": {"role": "assistant", "content": script.answer}}]
            }))
            .into_response();
        }

        let split = script
            .answer
            .char_indices()
            .nth(script.answer.chars().count() / 2)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let (head, tail) = script.answer.split_at(split);
        let events = vec![
            json!({"choices": [{"delta": {"reasoning_content": script.reasoning}}]}).to_string(),
            json!({"choices": [{"delta": {"content": head}}]}).to_string(),
            json!({"choices": [{"delta": {"content": tail}}]}).to_string(),
            "[DONE]".to_string(),
        ];
        let delay = script.chunk_delay;
        let stream = futures::stream::iter(events).then(move |data| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, Infallible>(format!("data: {}\n\n", data))
        });
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(stream),
        )
            .into_response()
    }

    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state((requests.clone(), script));
    let (base, handle) = serve(app).await;
    (
        ModelService {
            base_url: format!("{}/v1", base),
            requests,
        },
        handle,
    )
}

pub fn webhook_body(phone: &str, content: &str, callback_url: &str) -> Value {
    json!({
        "type": "text",
        "textMsg": {"content": content},
        "phone": phone,
        "groupId": "grp-1",
        "callBackUrl": callback_url
    })
}
