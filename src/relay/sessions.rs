//! Conversation history per identity with idle expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::Turn;

#[derive(Debug, Clone)]
pub struct UserSession {
    generation: u64,
    turns: Vec<Turn>,
    last_active: Instant,
}

impl UserSession {
    fn new(generation: u64, now: Instant) -> Self {
        Self {
            generation,
            turns: Vec::new(),
            last_active: now,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }
}

/// Result of `touch_or_create`.  `generation` identifies this incarnation of
/// the session; a reset or expiry followed by a new message yields a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touched {
    pub generation: u64,
    pub created: bool,
}

/// Read-only view of one session for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub identity: String,
    pub message_count: usize,
    pub idle_secs: u64,
    pub recent_messages: Vec<Turn>,
}

/// Holds every live conversation.  History is kept in full; callers decide
/// how much of it to submit to the model through `recent_history`.
#[derive(Debug)]
pub struct SessionStore {
    idle_timeout: Duration,
    next_generation: u64,
    sessions: HashMap<String, UserSession>,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            next_generation: 1,
            sessions: HashMap::new(),
        }
    }

    /// Mark the identity active, starting a fresh session when none exists or
    /// the previous one has been idle longer than the timeout.
    pub fn touch_or_create(&mut self, identity: &str, now: Instant) -> Touched {
        match self.sessions.get_mut(identity) {
            Some(session) if session.idle_for(now) <= self.idle_timeout => {
                session.last_active = now;
                Touched {
                    generation: session.generation,
                    created: false,
                }
            }
            _ => {
                let generation = self.next_generation;
                self.next_generation += 1;
                self.sessions
                    .insert(identity.to_owned(), UserSession::new(generation, now));
                tracing::info!(identity = %identity, generation, "created new session");
                Touched {
                    generation,
                    created: true,
                }
            }
        }
    }

    /// Whether the identity's live session is still the given incarnation.
    pub fn is_generation(&self, identity: &str, generation: u64) -> bool {
        self.sessions
            .get(identity)
            .is_some_and(|session| session.generation == generation)
    }

    /// Append one user turn followed by one assistant turn to the given
    /// incarnation of the session.  Returns false, appending nothing, when
    /// that session was reset or expired in the meantime.
    pub fn append_if(
        &mut self,
        identity: &str,
        generation: u64,
        user_text: &str,
        assistant_text: &str,
    ) -> bool {
        match self.sessions.get_mut(identity) {
            Some(session) if session.generation == generation => {
                session.turns.push(Turn::user(user_text));
                session.turns.push(Turn::assistant(assistant_text));
                true
            }
            _ => false,
        }
    }

    /// The most recent `limit` turns, oldest first.
    pub fn recent_history(&self, identity: &str, limit: usize) -> Vec<Turn> {
        self.sessions
            .get(identity)
            .map(|session| {
                let start = session.turns.len().saturating_sub(limit);
                session.turns[start..].to_vec()
            })
            .unwrap_or_default()
    }

    /// Remove every session idle for strictly longer than `timeout`.
    pub fn expire_older_than(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|identity, session| {
            let keep = session.idle_for(now) <= timeout;
            if !keep {
                tracing::info!(identity = %identity, "expired idle session");
            }
            keep
        });
        before - self.sessions.len()
    }

    pub fn reset(&mut self, identity: &str) -> bool {
        self.sessions.remove(identity).is_some()
    }

    pub fn get(&self, identity: &str) -> Option<&UserSession> {
        self.sessions.get(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn summaries(&self, now: Instant, recent: usize) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|(identity, session)| SessionSummary {
                identity: identity.clone(),
                message_count: session.turns.len(),
                idle_secs: session.idle_for(now).as_secs(),
                recent_messages: self.recent_history(identity, recent),
            })
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Role;

    const TIMEOUT: Duration = Duration::from_secs(1800);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn append(store: &mut SessionStore, identity: &str, user: &str, assistant: &str) -> bool {
        let generation = store.get(identity).map(UserSession::generation).unwrap_or(0);
        store.append_if(identity, generation, user, assistant)
    }

    #[test]
    fn touch_creates_once_and_preserves_history() {
        let mut store = SessionStore::new(TIMEOUT);
        let t0 = Instant::now();
        let first = store.touch_or_create("alice", t0);
        assert!(first.created);
        assert!(append(&mut store, "alice", "hi", "hello"));

        let again = store.touch_or_create("alice", t0 + secs(60));
        assert!(!again.created);
        assert_eq!(again.generation, first.generation);
        assert_eq!(store.recent_history("alice", 20).len(), 2);
        assert_eq!(store.get("alice").unwrap().last_active(), t0 + secs(60));
    }

    #[test]
    fn touch_after_idle_timeout_starts_fresh() {
        let mut store = SessionStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.touch_or_create("alice", t0);
        append(&mut store, "alice", "hi", "hello");

        assert!(!store.touch_or_create("alice", t0 + TIMEOUT).created);
        assert!(store.touch_or_create("alice", t0 + TIMEOUT + TIMEOUT + secs(1)).created);
        assert!(store.recent_history("alice", 20).is_empty());
    }

    #[test]
    fn recent_history_is_bounded_and_oldest_first() {
        let mut store = SessionStore::new(TIMEOUT);
        store.touch_or_create("alice", Instant::now());
        for i in 0..15 {
            append(&mut store, "alice", &format!("q{i}"), &format!("a{i}"));
        }
        let history = store.recent_history("alice", 20);
        assert_eq!(history.len(), 20);
        assert_eq!(history[0], Turn::user("q5"));
        assert_eq!(history[19], Turn::assistant("a14"));
        assert_eq!(history[0].role, Role::User);
        assert_eq!(store.get("alice").unwrap().turns().len(), 30);
    }

    #[test]
    fn recent_history_of_unknown_identity_is_empty() {
        let store = SessionStore::new(TIMEOUT);
        assert!(store.recent_history("nobody", 20).is_empty());
    }

    #[test]
    fn expiry_keeps_sessions_exactly_at_the_boundary() {
        let mut store = SessionStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.touch_or_create("old", t0);
        store.touch_or_create("edge", t0 + secs(100));
        store.touch_or_create("fresh", t0 + secs(1000));

        let now = t0 + secs(1900);
        assert_eq!(store.expire_older_than(now, TIMEOUT), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("edge").is_some());
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn append_after_reset_is_ignored() {
        let mut store = SessionStore::new(TIMEOUT);
        let touched = store.touch_or_create("alice", Instant::now());
        assert!(store.reset("alice"));
        assert!(!store.append_if("alice", touched.generation, "late", "answer"));
        assert!(store.is_empty());
        assert!(!store.reset("alice"));
    }

    #[test]
    fn recreated_session_rejects_turns_from_its_predecessor() {
        let mut store = SessionStore::new(TIMEOUT);
        let t0 = Instant::now();
        let old = store.touch_or_create("alice", t0);
        store.reset("alice");
        let new = store.touch_or_create("alice", t0 + secs(2));
        assert!(new.created);
        assert_ne!(new.generation, old.generation);

        assert!(!store.is_generation("alice", old.generation));
        assert!(!store.append_if("alice", old.generation, "stale", "answer"));
        assert!(store.append_if("alice", new.generation, "fresh", "answer"));
        assert_eq!(
            store.recent_history("alice", 20),
            vec![Turn::user("fresh"), Turn::assistant("answer")]
        );
    }

    #[test]
    fn summaries_report_recent_messages() {
        let mut store = SessionStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.touch_or_create("bob", t0);
        for i in 0..5 {
            append(&mut store, "bob", &format!("q{i}"), &format!("a{i}"));
        }
        let summaries = store.summaries(t0 + secs(42), 6);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_count, 10);
        assert_eq!(summaries[0].idle_secs, 42);
        assert_eq!(summaries[0].recent_messages.len(), 6);
        assert_eq!(summaries[0].recent_messages[0], Turn::user("q2"));
    }
}
