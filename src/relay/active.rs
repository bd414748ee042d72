//! At most one in-flight long-running request per identity.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ReplyTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Processing,
}

#[derive(Debug, Clone)]
pub struct ActiveRequestRecord {
    /// Unique per begin; lets a finishing task tell whether its record was
    /// reset or swept and replaced in the meantime.
    pub invocation: u64,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub status: RequestStatus,
    pub target: ReplyTarget,
}

impl ActiveRequestRecord {
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Outcome of `ActiveRequestTracker::try_begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    Started { invocation: u64 },
    /// A record already exists; nothing was inserted.
    Occupied { elapsed: Duration },
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSummary {
    pub identity: String,
    pub started_at: String,
    pub duration_secs: u64,
    pub status: RequestStatus,
    pub group_id: String,
}

#[derive(Debug, Default)]
pub struct ActiveRequestTracker {
    records: HashMap<String, ActiveRequestRecord>,
    next_invocation: u64,
}

impl ActiveRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a processing record unless one already exists for the identity.
    /// Whether an existing record counts as busy or stale is the caller's
    /// policy.
    pub fn try_begin(&mut self, target: &ReplyTarget, now: Instant) -> Begin {
        if let Some(existing) = self.records.get(&target.identity) {
            return Begin::Occupied {
                elapsed: existing.elapsed(now),
            };
        }
        Begin::Started {
            invocation: self.insert(target, now),
        }
    }

    /// Overwrite whatever record the identity holds.  Used when the existing
    /// record is already past the max-wait bound.
    pub fn replace(&mut self, target: &ReplyTarget, now: Instant) -> u64 {
        if let Some(old) = self.records.get(&target.identity) {
            tracing::warn!(
                identity = %target.identity,
                invocation = old.invocation,
                elapsed_secs = old.elapsed(now).as_secs(),
                "replacing stale active request"
            );
        }
        self.insert(target, now)
    }

    fn insert(&mut self, target: &ReplyTarget, now: Instant) -> u64 {
        self.next_invocation += 1;
        let invocation = self.next_invocation;
        self.records.insert(
            target.identity.clone(),
            ActiveRequestRecord {
                invocation,
                started_at: now,
                started_wall: Utc::now(),
                status: RequestStatus::Processing,
                target: target.clone(),
            },
        );
        invocation
    }

    /// Elapsed time of the identity's record, if any.
    pub fn peek(&self, identity: &str, now: Instant) -> Option<Duration> {
        self.records.get(identity).map(|r| r.elapsed(now))
    }

    pub fn end(&mut self, identity: &str) -> Option<ActiveRequestRecord> {
        self.records.remove(identity)
    }

    /// Remove the record only if it still belongs to `invocation`.
    pub fn end_if(&mut self, identity: &str, invocation: u64) -> bool {
        if self.is_current(identity, invocation) {
            self.records.remove(identity);
            true
        } else {
            false
        }
    }

    pub fn is_current(&self, identity: &str, invocation: u64) -> bool {
        self.records
            .get(identity)
            .is_some_and(|r| r.invocation == invocation)
    }

    /// Remove and return every record strictly older than `stale_after`.
    pub fn sweep_stale(&mut self, now: Instant, stale_after: Duration) -> Vec<ActiveRequestRecord> {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.elapsed(now) > stale_after)
            .map(|(identity, _)| identity.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|identity| self.records.remove(&identity))
            .collect()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summaries(&self, now: Instant) -> Vec<ActiveSummary> {
        let mut out: Vec<ActiveSummary> = self
            .records
            .iter()
            .map(|(identity, r)| ActiveSummary {
                identity: identity.clone(),
                started_at: r.started_wall.to_rfc3339(),
                duration_secs: r.elapsed(now).as_secs(),
                status: r.status,
                group_id: r.target.group_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }
}
