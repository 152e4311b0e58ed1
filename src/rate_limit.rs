use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

/// Per-client sliding-window limiter.
///
/// Each key keeps the instants of its requests inside the window; a request
/// is allowed while fewer than `max_requests` remain. `max_requests == 0`
/// disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    trust_forwarded_for: bool,
    clients: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            trust_forwarded_for: false,
            clients: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_secs(config.window_secs))
            .with_forwarded_for(config.trust_forwarded_for)
    }

    pub fn with_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Whether clients are keyed by `X-Forwarded-For` rather than peer address.
    pub fn trusts_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        let window = self.window;
        let mut timestamps = self.clients.entry(key.to_string()).or_default();
        timestamps.retain(|&ts| now.duration_since(ts) < window);
        if (timestamps.len() as u32) < self.max_requests {
            timestamps.push(now);
            true
        } else {
            debug!(client = %key, "rate limit exceeded");
            false
        }
    }

    /// Forget clients with no requests inside the window. Returns how many.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.clients.len();
        self.clients
            .retain(|_, timestamps| timestamps.iter().any(|&ts| now.duration_since(ts) < window));
        before - self.clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}
