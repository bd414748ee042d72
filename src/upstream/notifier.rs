//! Outbound replies to the instant-messaging platform.

use std::time::Duration;

use serde::Serialize;

use crate::error::NotifyError;
use crate::relay::ReplyTarget;

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target: &ReplyTarget, content: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundText<'a> {
    pub content: &'a str,
    pub is_mentioned: bool,
    pub mention_type: u8,
    pub mentioned_mobile_list: [&'a str; 1],
    pub group_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub text_msg: OutboundText<'a>,
}

impl<'a> OutboundMessage<'a> {
    /// A text message that @-mentions the identity that asked.
    pub fn mention(target: &'a ReplyTarget, content: &'a str) -> Self {
        Self {
            msg_type: "text",
            text_msg: OutboundText {
                content,
                is_mentioned: true,
                mention_type: 2,
                mentioned_mobile_list: [target.identity.as_str()],
                group_id: target.group_id.as_str(),
            },
        }
    }
}

/// Posts replies to the callback URL supplied with each webhook call.  Only
/// HTTP 200 counts as delivered; nothing is retried.
pub struct ImNotifier {
    client: reqwest::Client,
}

impl ImNotifier {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Notifier for ImNotifier {
    async fn notify(&self, target: &ReplyTarget, content: &str) -> Result<(), NotifyError> {
        let payload = OutboundMessage::mention(target, content);
        let resp = self
            .client
            .post(&target.callback_url)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status != reqwest::StatusCode::OK {
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        tracing::info!(identity = %target.identity, response = %body, "reply delivered");
        Ok(())
    }
}
