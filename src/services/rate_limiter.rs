//! Per-user, per-category sliding window rate limiting.
//!
//! Each (user, category) pair keeps the timestamps of its accepted requests
//! inside the trailing window. State is in-memory only; a restart resets all
//! limits, which degrades to "no limiting" and never affects trade state.

use crate::config::{RateLimitConfig, RateRule};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Operation category with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    Trade,
    Lookup,
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateCategory::Trade => write!(f, "trade"),
            RateCategory::Lookup => write!(f, "lookup"),
        }
    }
}

/// Request rejected by policy. Retry after `retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limited for {category} requests, retry in {}s", retry_after_secs(.retry_after))]
pub struct RateLimited {
    pub category: RateCategory,
    pub retry_after: Duration,
}

impl RateLimited {
    /// Whole seconds to wait, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(&self.retry_after)
    }
}

fn retry_after_secs(d: &Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

/// Sliding window rate limiter keyed by (user, category).
pub struct RateLimiter {
    windows: DashMap<(String, RateCategory), VecDeque<Instant>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    fn rule(&self, category: RateCategory) -> RateRule {
        match category {
            RateCategory::Trade => self.config.trade,
            RateCategory::Lookup => self.config.lookup,
        }
    }

    /// Returns true and records the request if the user is under budget.
    pub fn allow(&self, user_id: &str, category: RateCategory) -> bool {
        self.check(user_id, category).is_ok()
    }

    /// Like [`allow`](Self::allow) but reports how long to wait on rejection.
    pub fn check(&self, user_id: &str, category: RateCategory) -> Result<(), RateLimited> {
        self.check_at(user_id, category, Instant::now())
    }

    /// Gate a request at an explicit instant.
    pub fn check_at(
        &self,
        user_id: &str,
        category: RateCategory,
        now: Instant,
    ) -> Result<(), RateLimited> {
        let rule = self.rule(category);
        let window = Duration::from_secs(rule.time_window_seconds);

        let mut timestamps = self
            .windows
            .entry((user_id.to_string(), category))
            .or_default();
        prune(&mut timestamps, now, window);

        if timestamps.len() >= rule.max_requests as usize {
            let retry_after = timestamps
                .front()
                .map(|oldest| (*oldest + window).saturating_duration_since(now))
                .unwrap_or(window);
            debug!(
                user_id,
                %category,
                count = timestamps.len(),
                max = rule.max_requests,
                "Rate limit hit"
            );
            return Err(RateLimited {
                category,
                retry_after,
            });
        }

        timestamps.push_back(now);
        Ok(())
    }

    /// Drop windows with no request inside their trailing window.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|(_, category), timestamps| {
            let window = Duration::from_secs(self.rule(*category).time_window_seconds);
            timestamps
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < window)
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of (user, category) windows currently held.
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while timestamps
        .front()
        .is_some_and(|&t| now.saturating_duration_since(t) >= window)
    {
        timestamps.pop_front();
    }
}
