//! Small helpers shared by the handlers and the model client.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Wall-clock budget for a long-running operation.  Calls to `exceeded()`
/// return true once the budget has been used up.
#[derive(Clone, Debug)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Deadline {
            start: Instant::now(),
            budget,
        }
    }

    pub fn exceeded(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// First address of `X-Forwarded-For`, or "unknown".  The service runs behind
/// a reverse proxy; the socket peer is not interesting.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Decode `Authorization: Basic ...` into a username/password pair.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    if raw.len() < 6 || !raw[..5].eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(raw[5..].trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Shorten user content for log lines without splitting a character.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
