//! Size-triggered cleanup of the relay stores.
//!
//! The sweep runs on the request path after a message has been handled.
//! Each of the three scans is gated by its own store size so that a quiet
//! process pays nothing and a busy one amortises the linear scans.

use std::time::{Duration, Instant};

use super::{ActiveRequestRecord, RelayStores};

#[derive(Debug, Clone)]
pub struct SweepPolicy {
    pub session_threshold: usize,
    pub active_threshold: usize,
    pub rate_threshold: usize,
    pub session_timeout: Duration,
    /// Max-wait plus grace.
    pub stale_after: Duration,
    pub rate_expire: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            session_threshold: 100,
            active_threshold: 20,
            rate_threshold: 1000,
            session_timeout: Duration::from_secs(1800),
            stale_after: Duration::from_secs(600 + 30),
            rate_expire: Duration::from_secs(600),
        }
    }
}

/// What one sweep removed.  Stale request records are handed back so the
/// caller can notify their callback addresses after releasing the lock.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub sessions_expired: usize,
    pub stale_requests: Vec<ActiveRequestRecord>,
    pub rate_entries_pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.sessions_expired == 0 && self.stale_requests.is_empty() && self.rate_entries_pruned == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Janitor {
    policy: SweepPolicy,
}

impl Janitor {
    pub fn new(policy: SweepPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SweepPolicy {
        &self.policy
    }

    pub fn sweep(&self, stores: &mut RelayStores, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        if stores.sessions.len() > self.policy.session_threshold {
            report.sessions_expired = stores
                .sessions
                .expire_older_than(now, self.policy.session_timeout);
        }

        if stores.active.len() > self.policy.active_threshold {
            report.stale_requests = stores.active.sweep_stale(now, self.policy.stale_after);
            for record in &report.stale_requests {
                tracing::warn!(
                    identity = %record.target.identity,
                    elapsed_secs = record.elapsed(now).as_secs(),
                    "swept stale active request"
                );
            }
        }

        if stores.limiter.len() > self.policy.rate_threshold {
            report.rate_entries_pruned = stores.limiter.prune(now, self.policy.rate_expire);
        }

        if !report.is_empty() {
            tracing::info!(
                sessions = report.sessions_expired,
                requests = report.stale_requests.len(),
                rate_entries = report.rate_entries_pruned,
                "janitor sweep removed entries"
            );
        }
        report
    }
}
