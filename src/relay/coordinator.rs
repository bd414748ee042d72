//! Classification and dispatch of inbound messages.
//!
//! `RequestCoordinator::handle_at` validates a webhook payload, decides under
//! the store lock whether the message is busy, rate limited, a reset or a new
//! exchange, and then runs the exchange with the lock released.  Normal mode
//! runs on the request path; reasoning mode is handed to a bounded pool of
//! background workers and guarded by an active-request record.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;

use super::active::RequestStatus;
use super::messages;
use super::{
    is_reset_command, parse_mode, Begin, Janitor, Mode, Outcome, RelayStores, ReplyTarget,
    SweepPolicy, Turn,
};
use crate::config::{GroupConfig, GroupConfigs};
use crate::error::WebhookError;
use crate::telemetry::{RelayMetrics, StoreSizes};
use crate::upstream::{KnowledgeBase, ModelClient, Notifier};
use crate::util::{preview, Deadline};
use crate::WebhookRequest;

/// Number of trailing turns shown per session by the admin view.
const ADMIN_RECENT_TURNS: usize = 6;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub allowed_callback_prefixes: Vec<String>,
    pub min_interval: Duration,
    pub session_timeout: Duration,
    /// How long an active request counts as busy before a new one may replace it.
    pub max_wait: Duration,
    pub history_limit: usize,
    pub reasoning_workers: usize,
    pub sweep: SweepPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            allowed_callback_prefixes: vec![
                "https://imtwo.zdxlz.com/".to_string(),
                "https://im.zdxlz.com/".to_string(),
            ],
            min_interval: Duration::from_secs(1),
            session_timeout: Duration::from_secs(1800),
            max_wait: Duration::from_secs(600),
            history_limit: 20,
            reasoning_workers: 8,
            sweep: SweepPolicy::default(),
        }
    }
}

/// A structurally valid message.  `content` is the trimmed text as sent;
/// `text` is what remains after the mode marker is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub target: ReplyTarget,
    pub content: String,
    pub mode: Mode,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Busy(Duration),
    Reset,
    Normal,
    Reasoning { invocation: u64 },
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub message_count: usize,
    pub last_active: String,
    pub idle_secs: u64,
    pub has_active_request: bool,
    pub recent_messages: Vec<Turn>,
}

#[derive(Debug, Serialize)]
pub struct RequestView {
    pub started_at: String,
    pub duration_secs: u64,
    pub status: RequestStatus,
    pub group_id: String,
}

/// Read-only copy of the stores for the admin endpoint.
#[derive(Debug, Serialize)]
pub struct RelaySnapshot {
    pub active_sessions: usize,
    pub active_requests: usize,
    pub sessions: BTreeMap<String, SessionView>,
    pub requests: BTreeMap<String, RequestView>,
}

pub struct RequestCoordinator {
    config: CoordinatorConfig,
    stores: Mutex<RelayStores>,
    janitor: Janitor,
    groups: Arc<GroupConfigs>,
    model: Arc<dyn ModelClient>,
    notifier: Arc<dyn Notifier>,
    knowledge: KnowledgeBase,
    workers: Semaphore,
    metrics: Arc<RelayMetrics>,
}

impl RequestCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        groups: Arc<GroupConfigs>,
        model: Arc<dyn ModelClient>,
        notifier: Arc<dyn Notifier>,
        knowledge: KnowledgeBase,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            stores: Mutex::new(RelayStores::new(config.min_interval, config.session_timeout)),
            janitor: Janitor::new(config.sweep.clone()),
            workers: Semaphore::new(config.reasoning_workers.max(1)),
            config,
            groups,
            model,
            notifier,
            knowledge,
            metrics,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RelayStores> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the stores while holding the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&RelayStores) -> R) -> R {
        f(&self.lock())
    }

    pub fn store_sizes(&self) -> StoreSizes {
        self.inspect(|stores| StoreSizes {
            sessions: stores.sessions.len(),
            active_requests: stores.active.len(),
            rate_entries: stores.limiter.len(),
        })
    }

    pub fn validate(&self, req: &WebhookRequest) -> Result<InboundMessage, WebhookError> {
        let msg_type = req
            .msg_type
            .as_deref()
            .ok_or_else(|| WebhookError::BadRequest("missing field: type".to_string()))?;
        if msg_type != "text" {
            return Err(WebhookError::BadRequest(format!(
                "unsupported message type: {msg_type}"
            )));
        }

        let content = req
            .text_msg
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .map(str::trim)
            .unwrap_or_default();
        let identity = req.phone.as_deref().map(str::trim).unwrap_or_default();
        let group_id = req.group_id.as_deref().map(str::trim).unwrap_or_default();
        if identity.is_empty() || group_id.is_empty() || content.is_empty() {
            return Err(WebhookError::BadRequest(
                "phone、groupId 或 content 不能为空".to_string(),
            ));
        }

        let callback_url = req
            .call_back_url
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        if callback_url.is_empty() {
            return Err(WebhookError::BadRequest(
                "missing field: callBackUrl".to_string(),
            ));
        }
        if !self
            .config
            .allowed_callback_prefixes
            .iter()
            .any(|prefix| callback_url.starts_with(prefix.as_str()))
        {
            return Err(WebhookError::Forbidden(format!(
                "无效的回调URL: {callback_url}"
            )));
        }

        let (mode, text) = parse_mode(content);
        if text.is_empty() {
            return Err(WebhookError::BadRequest(
                "思考模式需要提供问题内容".to_string(),
            ));
        }

        Ok(InboundMessage {
            target: ReplyTarget {
                identity: identity.to_string(),
                group_id: group_id.to_string(),
                callback_url: callback_url.to_string(),
            },
            content: content.to_string(),
            mode,
            text: text.to_string(),
        })
    }

    pub async fn handle(self: &Arc<Self>, req: &WebhookRequest) -> Result<Outcome, WebhookError> {
        self.handle_at(req, Instant::now()).await
    }

    /// Handle one webhook call as if it arrived at `now`.
    pub async fn handle_at(
        self: &Arc<Self>,
        req: &WebhookRequest,
        now: Instant,
    ) -> Result<Outcome, WebhookError> {
        let msg = self.validate(req)?;
        tracing::info!(
            identity = %msg.target.identity,
            group_id = %msg.target.group_id,
            mode = msg.mode.as_str(),
            content = %preview(&msg.content, 50),
            "accepted message"
        );

        let outcome = match self.classify(&msg, now)? {
            Decision::Busy(elapsed) => {
                tracing::info!(
                    identity = %msg.target.identity,
                    elapsed_secs = elapsed.as_secs(),
                    "previous request still processing"
                );
                self.deliver(&msg.target, &messages::busy(elapsed)).await;
                return Ok(Outcome::Busy { elapsed });
            }
            Decision::Reset => {
                tracing::info!(identity = %msg.target.identity, "session reset");
                self.deliver(&msg.target, messages::RESET_CONFIRMED).await;
                return Ok(Outcome::Reset);
            }
            Decision::Normal => {
                let this = Arc::clone(self);
                let new_session = tokio::spawn(async move { this.run_normal(msg, now).await })
                    .await
                    .map_err(|e| WebhookError::Internal(format!("normal exchange aborted: {e}")))?;
                Outcome::Processed { new_session }
            }
            Decision::Reasoning { invocation } => {
                tracing::info!(
                    identity = %msg.target.identity,
                    group_id = %msg.target.group_id,
                    invocation,
                    "dispatching reasoning request"
                );
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_reasoning(msg, invocation).await });
                Outcome::Dispatched { invocation }
            }
        };

        self.sweep_at(now).await;
        Ok(outcome)
    }

    /// The per-identity decision.  Everything here happens under one lock
    /// acquisition so no other call for the same identity can interleave.
    fn classify(&self, msg: &InboundMessage, now: Instant) -> Result<Decision, WebhookError> {
        let identity = msg.target.identity.as_str();
        let mut stores = self.lock();

        // A live request wins over the rate gate: the caller always gets the
        // wait notice, or a cancellation if they asked for one.
        if let Some(elapsed) = stores.active.peek(identity, now) {
            if elapsed < self.config.max_wait {
                if is_reset_command(&msg.text) {
                    stores.sessions.reset(identity);
                    stores.active.end(identity);
                    return Ok(Decision::Reset);
                }
                return Ok(Decision::Busy(elapsed));
            }
        }

        let check = stores.limiter.check(identity, now);
        if check.limited {
            tracing::warn!(
                identity = %identity,
                elapsed_ms = check.elapsed.as_millis() as u64,
                "rate limited"
            );
            return Err(WebhookError::TooManyRequests {
                elapsed: check.elapsed,
                retry_after: stores.limiter.min_interval().saturating_sub(check.elapsed),
            });
        }

        if is_reset_command(&msg.text) {
            stores.sessions.reset(identity);
            stores.active.end(identity);
            return Ok(Decision::Reset);
        }

        match msg.mode {
            Mode::Normal => Ok(Decision::Normal),
            Mode::Reasoning => {
                let invocation = match stores.active.try_begin(&msg.target, now) {
                    Begin::Started { invocation } => invocation,
                    // Only reachable past max-wait; take the slot over now
                    // instead of waiting for the janitor.
                    Begin::Occupied { .. } => stores.active.replace(&msg.target, now),
                };
                Ok(Decision::Reasoning { invocation })
            }
        }
    }

    async fn run_normal(&self, msg: InboundMessage, now: Instant) -> bool {
        let started = Instant::now();
        let identity = msg.target.identity.as_str();
        let (session, history) = {
            let mut stores = self.lock();
            let session = stores.sessions.touch_or_create(identity, now);
            let history = stores
                .sessions
                .recent_history(identity, self.config.history_limit);
            (session, history)
        };

        let group = self.groups.get(&msg.target.group_id).clone();
        let conversation = self.conversation(&msg, &group, history).await;
        let result = self.model.complete(&group.model, &conversation).await;
        if let Err(err) = &result {
            self.metrics.model_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(identity = %identity, model = %group.model, error = %err, "model call failed");
        }

        // A reset while the call was in flight replaces the session; the
        // exchange belongs to the old one and is discarded.
        let current = {
            let mut stores = self.lock();
            match &result {
                Ok(answer) => {
                    stores
                        .sessions
                        .append_if(identity, session.generation, &msg.text, answer)
                }
                Err(_) => stores.sessions.is_generation(identity, session.generation),
            }
        };
        if !current {
            self.drop_stale_reply(identity, "session was reset, dropping reply");
            return session.created;
        }

        match result {
            Ok(answer) => {
                tracing::info!(
                    identity = %identity,
                    model = %group.model,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "normal exchange completed"
                );
                self.deliver(&msg.target, &answer).await;
                if session.created {
                    self.deliver(&msg.target, messages::WELCOME_GUIDE).await;
                }
            }
            Err(_) => self.deliver(&msg.target, messages::APOLOGY).await,
        }
        session.created
    }

    async fn run_reasoning(self: Arc<Self>, msg: InboundMessage, invocation: u64) {
        let identity = msg.target.identity.clone();
        let _guard = ActiveGuard {
            coordinator: Arc::clone(&self),
            identity: identity.clone(),
            invocation,
        };
        let deadline = Deadline::new(self.config.max_wait);
        let started = Instant::now();

        self.deliver(&msg.target, messages::PROGRESS).await;

        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::error!(identity = %identity, "reasoning worker pool closed");
                return;
            }
        };

        let (session, history) = {
            let mut stores = self.lock();
            if !stores.active.is_current(&identity, invocation) {
                tracing::info!(identity = %identity, invocation, "request cancelled before start");
                return;
            }
            let session = stores.sessions.touch_or_create(&identity, Instant::now());
            let history = stores
                .sessions
                .recent_history(&identity, self.config.history_limit);
            (session, history)
        };

        let group = self.groups.get(&msg.target.group_id).clone();
        let conversation = self.conversation(&msg, &group, history).await;
        let result = self
            .model
            .complete_streaming(&group.reasoning_model, &conversation, deadline)
            .await;

        match &result {
            Ok(answer) => {
                if answer.ends_with(messages::TRUNCATION_NOTICE)
                    || answer == messages::TIMEOUT_WITHOUT_ANSWER
                {
                    self.metrics.stream_truncations.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                self.metrics.model_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    identity = %identity,
                    model = %group.reasoning_model,
                    error = %err,
                    "reasoning model call failed"
                );
            }
        }

        let current = {
            let mut stores = self.lock();
            stores.active.is_current(&identity, invocation)
                && match &result {
                    Ok(answer) => {
                        stores
                            .sessions
                            .append_if(&identity, session.generation, &msg.text, answer)
                    }
                    Err(_) => stores.sessions.is_generation(&identity, session.generation),
                }
        };
        if !current {
            self.drop_stale_reply(&identity, "request was reset or swept, dropping reply");
            return;
        }

        match result {
            Ok(answer) => {
                self.deliver(&msg.target, &answer).await;
                if session.created {
                    self.deliver(&msg.target, messages::WELCOME_GUIDE).await;
                }
            }
            Err(_) => self.deliver(&msg.target, messages::APOLOGY).await,
        }
        tracing::info!(
            identity = %identity,
            invocation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reasoning exchange completed"
        );
    }

    fn drop_stale_reply(&self, identity: &str, reason: &'static str) {
        self.metrics
            .stale_replies_dropped
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(identity = %identity, "{}", reason);
    }

    async fn conversation(
        &self,
        msg: &InboundMessage,
        group: &GroupConfig,
        history: Vec<Turn>,
    ) -> Vec<Turn> {
        let docs = self
            .knowledge
            .documents(&msg.target.group_id, group)
            .await;
        build_conversation(msg.mode, group, &docs, history, &msg.text)
    }

    /// Run the janitor and tell the owners of swept requests that they were
    /// abandoned.  Notifications go out after the lock is released.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let report = {
            let mut stores = self.lock();
            self.janitor.sweep(&mut stores, now)
        };
        if report.is_empty() {
            return 0;
        }
        self.metrics
            .swept_sessions
            .fetch_add(report.sessions_expired as u64, Ordering::Relaxed);
        self.metrics
            .swept_requests
            .fetch_add(report.stale_requests.len() as u64, Ordering::Relaxed);
        self.metrics
            .swept_rate_entries
            .fetch_add(report.rate_entries_pruned as u64, Ordering::Relaxed);

        for record in &report.stale_requests {
            self.deliver(&record.target, messages::STALE_REQUEST).await;
        }
        report.sessions_expired + report.stale_requests.len() + report.rate_entries_pruned
    }

    pub fn snapshot(&self, now: Instant) -> RelaySnapshot {
        let wall_now = Utc::now();
        let stores = self.lock();
        let sessions = stores
            .sessions
            .summaries(now, ADMIN_RECENT_TURNS)
            .into_iter()
            .map(|s| {
                let last_active = wall_now - chrono::Duration::seconds(s.idle_secs as i64);
                let view = SessionView {
                    message_count: s.message_count,
                    last_active: last_active.to_rfc3339(),
                    idle_secs: s.idle_secs,
                    has_active_request: stores.active.contains(&s.identity),
                    recent_messages: s.recent_messages,
                };
                (s.identity, view)
            })
            .collect();
        let requests = stores
            .active
            .summaries(now)
            .into_iter()
            .map(|r| {
                let view = RequestView {
                    started_at: r.started_at,
                    duration_secs: r.duration_secs,
                    status: r.status,
                    group_id: r.group_id,
                };
                (r.identity, view)
            })
            .collect();
        RelaySnapshot {
            active_sessions: stores.sessions.len(),
            active_requests: stores.active.len(),
            sessions,
            requests,
        }
    }

    async fn deliver(&self, target: &ReplyTarget, content: &str) {
        if let Err(err) = self.notifier.notify(target, content).await {
            self.metrics.notify_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                identity = %target.identity,
                group_id = %target.group_id,
                error = %err,
                "failed to deliver message"
            );
        }
    }
}

/// Clears the reasoning record when the worker finishes, however it
/// finishes.  A record that was reset or replaced meanwhile is left alone.
struct ActiveGuard {
    coordinator: Arc<RequestCoordinator>,
    identity: String,
    invocation: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.coordinator
            .lock()
            .active
            .end_if(&self.identity, self.invocation);
    }
}

/// Assemble the messages sent to the model.  Reasoning models are driven
/// without a system role, so the instruction is folded into the user turn.
pub fn build_conversation(
    mode: Mode,
    group: &GroupConfig,
    docs: &[String],
    history: Vec<Turn>,
    text: &str,
) -> Vec<Turn> {
    let instruction = if docs.is_empty() {
        group.system_prompt.clone()
    } else {
        format!("{}\n\n参考资料：\n{}", group.system_prompt, docs.join("\n\n"))
    };
    let mut conversation = Vec::with_capacity(history.len() + 2);
    match mode {
        Mode::Normal => {
            conversation.push(Turn::system(instruction));
            conversation.extend(history);
            conversation.push(Turn::user(text));
        }
        Mode::Reasoning => {
            conversation.extend(history);
            conversation.push(Turn::user(format!(
                "请按照以下指令行动：{instruction}\n\n用户问题：{text}"
            )));
        }
    }
    conversation
}
