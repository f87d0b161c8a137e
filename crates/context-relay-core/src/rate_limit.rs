//! Fixed-window rate limiting over a [`KeyValueStore`].
//!
//! The first request for a key opens a window of `window_ms` with count 1.
//! Later requests in the same window are admitted while `count <
//! max_requests`, after which they are rejected with
//! `retry_after = ceil((window_end - now) / 1000)` seconds. Once
//! `now > window_end` the next request opens a fresh window.
//!
//! Read-modify-write of an entry is serialised by an async mutex owned by the
//! limiter, so interleaved requests on one instance never lose an increment.
//! Nothing is coordinated across instances: each process counts separately
//! unless the store itself is shared and strongly consistent.
//!
//! Store failures are logged and the request is admitted (fail-open).

use std::sync::Arc;
use std::time::Duration;

use futures::lock::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::RelayError;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "ratelimit:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
        }
    }
}

/// Persisted per-key window state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    pub key: String,
    pub count: u32,
    /// Unix milliseconds at which the window ends.
    pub window_reset_time: u64,
}

/// Outcome of one [`FixedWindowLimiter::admit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

pub struct FixedWindowLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    lock: Mutex<()>,
}

impl FixedWindowLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count one request for `key` and decide whether it may proceed.
    pub async fn admit(&self, key: &str) -> RateLimitDecision {
        let _guard = self.lock.lock().await;
        let now = self.clock.now_ms();
        let storage_key = format!("{KEY_PREFIX}{key}");

        let stored = match self.store.get(&storage_key).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "rate-limit store read failed, admitting request");
                return self.fail_open(now);
            }
        };

        let current = stored.and_then(|raw| match serde_json::from_str::<RateLimitEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key, error = %e, "corrupt rate-limit entry, starting a new window");
                None
            }
        });

        let mut entry = match current {
            Some(entry) if now <= entry.window_reset_time => entry,
            _ => RateLimitEntry {
                key: key.to_string(),
                count: 0,
                window_reset_time: now.saturating_add(self.config.window_ms),
            },
        };

        if entry.count >= self.config.max_requests {
            let retry_after = (entry.window_reset_time - now).div_ceil(1000);
            tracing::debug!(key, count = entry.count, retry_after, "rate limit exceeded");
            return RateLimitDecision {
                allowed: false,
                count: entry.count,
                limit: self.config.max_requests,
                remaining: 0,
                reset_at_ms: entry.window_reset_time,
                retry_after_secs: Some(retry_after),
            };
        }

        entry.count += 1;
        // Keep the entry alive through the last millisecond of its window.
        let ttl = Duration::from_millis(entry.window_reset_time - now + 1);
        match serde_json::to_string(&entry) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&storage_key, raw, Some(ttl)).await {
                    tracing::warn!(
                        key,
                        error = %e,
                        "rate-limit store write failed, admitting request"
                    );
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "failed to encode rate-limit entry"),
        }

        RateLimitDecision {
            allowed: true,
            count: entry.count,
            limit: self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(entry.count),
            reset_at_ms: entry.window_reset_time,
            retry_after_secs: None,
        }
    }

    /// [`admit`](Self::admit), with rejection as a typed error.
    pub async fn check(&self, key: &str) -> Result<RateLimitDecision, RelayError> {
        let decision = self.admit(key).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RelayError::RateLimited {
                retry_after: decision.retry_after_secs.unwrap_or(0),
            })
        }
    }

    /// Drop expired entries from the store. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        match self.store.purge_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::debug!(removed, "swept expired rate-limit entries");
                }
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate-limit sweep failed");
                0
            }
        }
    }

    fn fail_open(&self, now: u64) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            count: 0,
            limit: self.config.max_requests,
            remaining: self.config.max_requests,
            reset_at_ms: now.saturating_add(self.config.window_ms),
            retry_after_secs: None,
        }
    }
}
