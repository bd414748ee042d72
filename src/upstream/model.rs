//! Chat-completion client.
//!
//! `ModelClient` is the seam the coordinator talks to; `OpenAiCompatClient`
//! implements it against any OpenAI-compatible `/chat/completions` endpoint
//! (DashScope compatible mode by default).

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::relay::messages::{TIMEOUT_WITHOUT_ANSWER, TRUNCATION_NOTICE};
use crate::relay::Turn;
use crate::util::Deadline;

#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    /// Single-shot completion used in normal mode.
    async fn complete(&self, model: &str, messages: &[Turn]) -> Result<String, ModelError>;

    /// Streaming completion with thinking enabled.  The reasoning trace is
    /// discarded; only answer text is returned.  When `deadline` runs out the
    /// partial answer is returned with a truncation notice instead of an error.
    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[Turn],
        deadline: Deadline,
    ) -> Result<String, ModelError>;
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    /// HTTP timeout for single-shot completions.
    pub timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    enable_thinking: bool,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

pub struct OpenAiCompatClient {
    settings: ModelSettings,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(settings: ModelSettings) -> anyhow::Result<Self> {
        // No client-wide timeout: streaming calls are bounded by their deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        if settings.api_key.is_none() {
            tracing::warn!("DASHSCOPE_API_KEY not set; model requests will be unauthenticated");
        }
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    async fn post(
        &self,
        body: &CompletionRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ModelError> {
        let mut rb = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.settings.api_key {
            rb = rb.bearer_auth(key);
        }
        if let Some(t) = timeout {
            rb = rb.timeout(t);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn complete(&self, model: &str, messages: &[Turn]) -> Result<String, ModelError> {
        let body = CompletionRequest {
            model,
            messages,
            stream: false,
            enable_thinking: false,
        };
        let resp = self.post(&body, Some(self.settings.timeout)).await?;
        let text = resp.text().await?;
        let completion: Completion =
            serde_json::from_str(&text).map_err(|e| ModelError::Decode(e.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)
    }

    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[Turn],
        deadline: Deadline,
    ) -> Result<String, ModelError> {
        let body = CompletionRequest {
            model,
            messages,
            stream: true,
            enable_thinking: true,
        };
        let resp = match tokio::time::timeout(deadline.remaining(), self.post(&body, None)).await {
            Ok(resp) => resp?,
            Err(_) => return Ok(truncate_answer(String::new())),
        };

        let mut stream = resp.bytes_stream().eventsource();
        let mut answer = String::new();
        let mut reasoning_chars = 0usize;
        loop {
            if deadline.exceeded() {
                tracing::warn!(model = %model, budget_secs = deadline.budget().as_secs(), "stream budget exhausted, ending early");
                return Ok(truncate_answer(answer));
            }
            let event = match tokio::time::timeout(deadline.remaining(), stream.next()).await {
                Err(_) => {
                    tracing::warn!(model = %model, budget_secs = deadline.budget().as_secs(), "stream budget exhausted, ending early");
                    return Ok(truncate_answer(answer));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(ModelError::Stream(e.to_string())),
                Ok(Some(Ok(event))) => event,
            };
            if event.data == "[DONE]" {
                break;
            }
            let chunk: StreamChunk = serde_json::from_str(&event.data)
                .map_err(|e| ModelError::Decode(format!("{e}: {}", event.data)))?;
            for choice in chunk.choices {
                if let Some(trace) = choice.delta.reasoning_content {
                    reasoning_chars += trace.chars().count();
                }
                if let Some(content) = choice.delta.content {
                    answer.push_str(&content);
                }
            }
        }
        tracing::debug!(model = %model, reasoning_chars, answer_chars = answer.chars().count(), "stream finished");
        if answer.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(answer)
    }
}

/// Answer to deliver when the reasoning budget ran out.
pub fn truncate_answer(mut partial: String) -> String {
    if partial.is_empty() {
        TIMEOUT_WITHOUT_ANSWER.to_string()
    } else {
        partial.push_str(TRUNCATION_NOTICE);
        partial
    }
}
