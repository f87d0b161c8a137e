//! Key-value storage abstraction for rate-limit and cache state.
//!
//! The [`KeyValueStore`] trait is the only way the rate limiter and the
//! response cache touch shared state, so a distributed backing store can be
//! substituted without changing either caller.
//!
//! The bundled [`memory::InMemoryKvStore`] keeps state in the current
//! process. It is correct only for a single-instance deployment: two
//! instances behind a load balancer each count and cache independently.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Abstract string key-value store with optional per-entry TTL.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](KeyValueStore::get) | Read a live (non-expired) value |
/// | [`set`](KeyValueStore::set) | Insert or overwrite, optionally expiring |
/// | [`delete`](KeyValueStore::delete) | Remove a key |
/// | [`purge_expired`](KeyValueStore::purge_expired) | Drop expired entries |
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`. With `ttl`, the entry expires after it.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Physically removes expired entries and returns how many were dropped.
    ///
    /// Stores with native expiry keep the default, which does nothing.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}
