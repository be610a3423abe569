use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Quota state for one submitting identity.
#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window throttle keyed by submitting identity.
///
/// The first request opens a window of `window` length; once it ends, the next
/// request starts a fresh window with a full budget, however much of the old one
/// was used.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    /// Consumes one unit of quota for `identity`, returning false when none is left.
    pub fn is_allowed(&self, identity: &str) -> bool {
        self.is_allowed_at(identity, Instant::now())
    }

    pub fn is_allowed_at(&self, identity: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows
            .entry(identity.to_string())
            .or_insert(RateLimitWindow {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }

        if window.count >= self.max_requests {
            warn!(identity, "Rate limit of {} requests reached", self.max_requests);
            return false;
        }

        window.count += 1;
        true
    }

    /// Requests `identity` may still make in its current window.
    pub fn remaining(&self, identity: &str) -> u32 {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        match windows.get(identity) {
            Some(window) if Instant::now() < window.reset_at => {
                self.max_requests.saturating_sub(window.count)
            }
            _ => self.max_requests,
        }
    }

    /// Drops expired windows and returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let before = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        let removed = before - windows.len();
        if removed > 0 {
            debug!("Evicted {} expired rate limit windows", removed);
        }
        removed
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
