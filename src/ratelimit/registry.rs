//! Lookup-or-create registry of rate limiters keyed by resource name.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::window::{RateLimiterStatus, SlidingWindowLimiter};
use crate::clock::{system_clock, SharedClock};
use crate::error::{MeshGuardError, Result};
use crate::registry::NamedRegistry;
use crate::status::StatusReport;

/// Default requests per window when the caller does not specify a limit.
pub const DEFAULT_REQUESTS: u64 = 100;
/// Default window when the caller does not specify one.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Owns every rate limiter in the process.
///
/// All call sites asking for the same name share one limiter. The first
/// registration of a name fixes its parameters; see [`get_rate_limiter`]
/// and [`register`](Self::register) for the two ways of handling later
/// requests with different parameters.
///
/// Instances are never evicted, so the set of names must be bounded by the
/// caller (configured routes or services, not arbitrary client input).
///
/// [`get_rate_limiter`]: Self::get_rate_limiter
pub struct RateLimiterRegistry {
    limiters: NamedRegistry<SlidingWindowLimiter>,
    default_limit: u64,
    default_window: Duration,
    clock: SharedClock,
}

impl RateLimiterRegistry {
    /// Create a registry with the stock defaults (100 requests per 60 seconds).
    pub fn new() -> Self {
        Self::with_defaults(DEFAULT_REQUESTS, DEFAULT_WINDOW)
    }

    /// Create a registry whose lazily created limiters use the given defaults.
    pub fn with_defaults(limit: u64, window: Duration) -> Self {
        info!(
            default_requests = limit,
            default_window_secs = window.as_secs_f64(),
            "Rate limiter registry initialized"
        );
        Self {
            limiters: NamedRegistry::new(),
            default_limit: limit,
            default_window: window,
            clock: system_clock(),
        }
    }

    /// Use `clock` for every limiter created from now on.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }

    pub fn default_window(&self) -> Duration {
        self.default_window
    }

    /// Return the limiter for `name`, creating it with `limit`/`window` if absent.
    ///
    /// If `name` already exists, its original parameters are kept and the
    /// ones passed here are ignored; a mismatch is logged at `warn`.
    pub fn get_rate_limiter(
        &self,
        name: &str,
        limit: u64,
        window: Duration,
    ) -> Arc<SlidingWindowLimiter> {
        let (limiter, created) = self.get_or_create(name, limit, window);
        if !created && !Self::matches(&limiter, limit, window) {
            warn!(
                limiter = %name,
                requested_limit = limit,
                requested_window_secs = window.as_secs_f64(),
                active_limit = limiter.limit(),
                active_window_secs = limiter.window().as_secs_f64(),
                "Ignoring parameters for already registered rate limiter"
            );
        }
        limiter
    }

    /// Return the limiter for `name`, creating it with the registry defaults.
    pub fn get_or_default(&self, name: &str) -> Arc<SlidingWindowLimiter> {
        self.get_or_create(name, self.default_limit, self.default_window)
            .0
    }

    /// Register `name` explicitly.
    ///
    /// Registering an existing name with identical parameters returns the
    /// existing limiter; different parameters are a [`MeshGuardError::Conflict`].
    pub fn register(
        &self,
        name: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Arc<SlidingWindowLimiter>> {
        let (limiter, created) = self.get_or_create(name, limit, window);
        if created || Self::matches(&limiter, limit, window) {
            return Ok(limiter);
        }

        Err(MeshGuardError::Conflict {
            name: name.to_string(),
            detail: format!(
                "registered with {} requests per {:?}, requested {} per {:?}",
                limiter.limit(),
                limiter.window(),
                limit,
                window
            ),
        })
    }

    /// Return the limiter for `name` without creating one.
    pub fn get(&self, name: &str) -> Option<Arc<SlidingWindowLimiter>> {
        self.limiters.get(name)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.limiters.names()
    }

    /// Reset every limiter.
    pub fn reset_all(&self) {
        let limiters = self.limiters.snapshot();
        for (_, limiter) in &limiters {
            limiter.reset();
        }
        info!(count = limiters.len(), "All rate limiters reset");
    }

    /// Status of every limiter in registration order.
    pub fn get_status(&self) -> StatusReport<RateLimiterStatus> {
        self.limiters
            .snapshot()
            .into_iter()
            .map(|(name, limiter)| (name, limiter.status()))
            .collect()
    }

    fn get_or_create(
        &self,
        name: &str,
        limit: u64,
        window: Duration,
    ) -> (Arc<SlidingWindowLimiter>, bool) {
        let (limiter, created) = self.limiters.get_or_insert_with(name, || {
            SlidingWindowLimiter::with_clock(name, limit, window, Arc::clone(&self.clock))
        });
        if created {
            debug!(limiter = %name, total = self.limiters.len(), "Registered rate limiter");
        }
        (limiter, created)
    }

    fn matches(limiter: &SlidingWindowLimiter, limit: u64, window: Duration) -> bool {
        limiter.limit() == limit && limiter.window() == window
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
