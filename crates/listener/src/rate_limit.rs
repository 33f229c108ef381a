//! Per-installation delivery rate limiting.
//!
//! A sliding window of accepted deliveries is kept for every installation (and
//! one shared window for deliveries that name none, such as marketplace
//! events). A delivery over the limit is answered `429` with `Retry-After`
//! and never reaches the engine.
//!
//! The number of tracked keys is capped; idle windows are swept every
//! `cleanup_interval` checks and again before a new key is refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use engine::InstallationId;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::WebhookError;

/// Limits applied by [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Deliveries accepted per key within `window`.
    pub max_deliveries: u32,
    /// Length of the sliding window.
    pub window: Duration,
    /// Sweep idle windows every this many checks.
    pub cleanup_interval: u64,
    /// Hard cap on distinct keys tracked.
    pub max_tracked: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 120,
            window: Duration::from_secs(60),
            cleanup_interval: 100,
            max_tracked: 10_000,
        }
    }
}

/// What a delivery is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKey {
    Installation(InstallationId),
    /// Deliveries without an `installation.id`.
    Unscoped,
}

impl RateKey {
    /// The key for a webhook payload.
    pub fn of(payload: &Value) -> Self {
        payload
            .pointer("/installation/id")
            .and_then(Value::as_u64)
            .map_or(Self::Unscoped, |id| Self::Installation(InstallationId::new(id)))
    }
}

/// Sliding-window limiter shared by all webhook handlers.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<RateKey, Vec<Instant>>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RateKey, Vec<Instant>>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one delivery for `key`.
    ///
    /// # Errors
    ///
    /// [`WebhookError::RateLimited`] when `key` has used its window, or when
    /// `key` is new and the tracked-key cap is reached.
    pub fn check(&self, key: RateKey) -> Result<(), WebhookError> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: RateKey, now: Instant) -> Result<(), WebhookError> {
        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        let mut windows = self.lock();
        if count > 0 && count % self.config.cleanup_interval.max(1) == 0 {
            self.sweep(&mut windows, now);
        }

        if !windows.contains_key(&key) && windows.len() >= self.config.max_tracked {
            self.sweep(&mut windows, now);
            if windows.len() >= self.config.max_tracked {
                warn!(?key, tracked = windows.len(), "rate limiter full; refusing new key");
                return Err(WebhookError::RateLimited {
                    retry_after: self.config.window,
                });
            }
        }

        let window = self.config.window;
        let stamps = windows.entry(key).or_default();
        stamps.retain(|t| now.saturating_duration_since(*t) < window);

        if stamps.len() >= self.config.max_deliveries as usize {
            let oldest = stamps.first().copied().unwrap_or(now);
            let retry_after = round_up_to_secs(window.saturating_sub(now - oldest));
            warn!(?key, deliveries = stamps.len(), ?retry_after, "rate limit exceeded");
            return Err(WebhookError::RateLimited { retry_after });
        }

        stamps.push(now);
        Ok(())
    }

    fn sweep(&self, windows: &mut HashMap<RateKey, Vec<Instant>>, now: Instant) {
        let window = self.config.window;
        let before = windows.len();
        windows.retain(|_, stamps| {
            stamps.retain(|t| now.saturating_duration_since(*t) < window);
            !stamps.is_empty()
        });
        debug!(swept = before - windows.len(), "rate limiter sweep");
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

fn round_up_to_secs(d: Duration) -> Duration {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}
