//! Sliding-window rate limiter.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::clock::{system_clock, SharedClock};

/// Outcome of a single admission check, with the data a proxy needs for
/// `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Configured requests per window
    pub limit: u64,
    /// Requests still admissible in the current window
    pub remaining: u64,
    /// Time until the oldest admission leaves the window
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// `reset_after` rounded up to whole seconds.
    pub fn reset_after_secs(&self) -> u64 {
        self.reset_after.as_secs_f64().ceil() as u64
    }
}

/// Snapshot of a limiter for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStatus {
    /// Configured requests per window
    pub requests: u64,
    /// Window length in seconds
    pub window: f64,
    /// Requests still admissible in the current window
    pub remaining: u64,
    /// Seconds until a slot frees up
    pub reset: f64,
}

/// Admits at most `limit` requests in any trailing `window`.
///
/// Admission instants are kept oldest first, so expiry is a trim of the
/// front of the queue. Every operation mutates state under one per-instance
/// lock; a timestamp whose age equals the window is already expired.
pub struct SlidingWindowLimiter {
    name: String,
    limit: u64,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
    clock: SharedClock,
}

impl SlidingWindowLimiter {
    /// Create a limiter reading the system clock.
    pub fn new(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self::with_clock(name, limit, window, system_clock())
    }

    /// Create a limiter reading the given clock.
    pub fn with_clock(
        name: impl Into<String>,
        limit: u64,
        window: Duration,
        clock: SharedClock,
    ) -> Self {
        let name = name.into();
        info!(
            limiter = %name,
            requests = limit,
            window_secs = window.as_secs_f64(),
            "Rate limiter initialized"
        );

        Self {
            name,
            limit,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(limit.min(1024) as usize)),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or reject one request.
    pub fn allow_request(&self) -> bool {
        self.check().allowed
    }

    /// Admit or reject one request, reporting the resulting quota.
    pub fn check(&self) -> RateLimitDecision {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock();
        self.trim(&mut timestamps, now);

        let allowed = (timestamps.len() as u64) < self.limit;
        if allowed {
            timestamps.push_back(now);
        }

        let decision = RateLimitDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(timestamps.len() as u64),
            reset_after: self.reset_after_at(&timestamps, now),
        };
        drop(timestamps);

        if allowed {
            trace!(limiter = %self.name, remaining = decision.remaining, "Request admitted");
        } else {
            debug!(
                limiter = %self.name,
                limit = self.limit,
                reset_secs = decision.reset_after.as_secs_f64(),
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Requests still admissible in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count())
    }

    /// Admissions currently inside the window.
    pub fn current_count(&self) -> u64 {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock();
        self.trim(&mut timestamps, now);
        timestamps.len() as u64
    }

    /// Minimum wait before at least one slot frees up; zero when nothing is retained.
    pub fn reset_after(&self) -> Duration {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock();
        self.trim(&mut timestamps, now);
        self.reset_after_at(&timestamps, now)
    }

    /// Forget every admission.
    pub fn reset(&self) {
        self.timestamps.lock().clear();
        info!(limiter = %self.name, "Rate limiter reset");
    }

    /// Status snapshot. Does not count as a request.
    pub fn status(&self) -> RateLimiterStatus {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock();
        self.trim(&mut timestamps, now);

        RateLimiterStatus {
            requests: self.limit,
            window: self.window.as_secs_f64(),
            remaining: self.limit.saturating_sub(timestamps.len() as u64),
            reset: self.reset_after_at(&timestamps, now).as_secs_f64(),
        }
    }

    fn trim(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn reset_after_at(&self, timestamps: &VecDeque<Instant>, now: Instant) -> Duration {
        timestamps
            .front()
            .map(|&oldest| {
                self.window
                    .saturating_sub(now.saturating_duration_since(oldest))
            })
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
