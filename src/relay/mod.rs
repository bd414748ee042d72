//! Per-user request lifecycle for the relay.
//!
//! Every inbound message passes through the `RequestCoordinator`, which
//! consults three process-owned stores (rate limiter, sessions, active
//! requests) under one lock, decides what to do with the message and then
//! performs any slow work (model calls, notifier posts) with the lock
//! released.  The `Janitor` trims the stores opportunistically once they
//! grow past configured sizes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod active;
pub mod coordinator;
pub mod janitor;
pub mod messages;
pub mod rate_limit;
pub mod sessions;

pub use self::active::{ActiveRequestRecord, ActiveRequestTracker, Begin, RequestStatus};
pub use self::coordinator::{CoordinatorConfig, InboundMessage, RequestCoordinator};
pub use self::janitor::{Janitor, SweepPolicy, SweepReport};
pub use self::rate_limit::{RateCheck, RateLimiter};
pub use self::sessions::{SessionStore, Touched, UserSession};

/// Stable user key (the sender's phone or account) scoping all per-user state.
pub type Identity = String;

/// Speaker of a conversation turn.  Serialised in the lower-case form the
/// chat-completions API expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation, either stored history or a prompt line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Processing mode selected by the leading marker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Reasoning,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Reasoning => "reasoning",
        }
    }
}

/// Markers that switch a message into reasoning mode.  Both the ASCII and
/// the full-width colon are accepted.
pub const REASONING_PREFIXES: [&str; 2] = ["思考:", "思考："];

/// Commands that clear the caller's session and active request.
pub const RESET_COMMANDS: [&str; 4] = ["重置", "reset", "新对话", "new chat"];

/// Split a trimmed message into its mode and the text that follows the
/// marker.  The returned text is trimmed again after the marker is removed.
pub fn parse_mode(content: &str) -> (Mode, &str) {
    for prefix in REASONING_PREFIXES {
        if let Some(rest) = content.strip_prefix(prefix) {
            return (Mode::Reasoning, rest.trim());
        }
    }
    (Mode::Normal, content)
}

pub fn is_reset_command(content: &str) -> bool {
    let lowered = content.trim().to_lowercase();
    RESET_COMMANDS.iter().any(|cmd| *cmd == lowered)
}

/// Where replies for one inbound message are delivered.  Copied by value into
/// every record and background task; nothing here is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTarget {
    pub identity: Identity,
    pub group_id: String,
    pub callback_url: String,
}

/// Result of handling one accepted webhook call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A request for the same identity is still running; a wait notice was sent.
    Busy { elapsed: Duration },
    /// The reset command cleared the session.
    Reset,
    /// A normal-mode exchange completed on the request path.
    Processed { new_session: bool },
    /// A reasoning-mode exchange was handed to a background worker.
    Dispatched { invocation: u64 },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Busy { .. } => "busy",
            Outcome::Reset => "reset",
            Outcome::Processed { .. } => "processed",
            Outcome::Dispatched { .. } => "dispatched",
        }
    }
}

/// The three stores the coordinator guards with a single lock.  The janitor
/// receives a mutable borrow of this while the lock is held.
#[derive(Debug)]
pub struct RelayStores {
    pub limiter: RateLimiter,
    pub sessions: SessionStore,
    pub active: ActiveRequestTracker,
}

impl RelayStores {
    pub fn new(min_interval: Duration, session_timeout: Duration) -> Self {
        Self {
            limiter: RateLimiter::new(min_interval),
            sessions: SessionStore::new(session_timeout),
            active: ActiveRequestTracker::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_marker_is_stripped() {
        assert_eq!(
            parse_mode("思考:what is 2+2"),
            (Mode::Reasoning, "what is 2+2")
        );
        assert_eq!(parse_mode("思考：  hello "), (Mode::Reasoning, "hello"));
        assert_eq!(parse_mode("hello 思考:"), (Mode::Normal, "hello 思考:"));
    }

    #[test]
    fn reset_vocabulary_is_case_insensitive() {
        assert!(is_reset_command("RESET"));
        assert!(is_reset_command("  New Chat "));
        assert!(is_reset_command("重置"));
        assert!(!is_reset_command("reset please"));
    }

    #[test]
    fn turns_serialise_in_chat_format() {
        let json = serde_json::to_value(Turn::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }
}
