//! Minimum-interval rate limiting per identity.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Result of a single rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub limited: bool,
    /// Time since the last accepted request, zero on the first request.
    pub elapsed: Duration,
}

/// Enforces a minimum interval between accepted requests of one identity.
///
/// A limited call never moves the stored timestamp, so repeated immediate
/// retries keep hitting the window opened by the last *accepted* request.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_accepted: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: HashMap::new(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn check(&mut self, identity: &str, now: Instant) -> RateCheck {
        let elapsed = match self.last_accepted.get(identity) {
            Some(prior) => {
                let gap = now.saturating_duration_since(*prior);
                if gap < self.min_interval {
                    return RateCheck {
                        limited: true,
                        elapsed: gap,
                    };
                }
                gap
            }
            None => Duration::ZERO,
        };
        self.last_accepted.insert(identity.to_owned(), now);
        RateCheck {
            limited: false,
            elapsed,
        }
    }

    /// Drop entries whose last accepted request is older than `expire`.
    pub fn prune(&mut self, now: Instant, expire: Duration) -> usize {
        let before = self.last_accepted.len();
        self.last_accepted
            .retain(|_, last| now.saturating_duration_since(*last) <= expire);
        before - self.last_accepted.len()
    }

    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}
