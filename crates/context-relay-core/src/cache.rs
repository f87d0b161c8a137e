//! Edge-local response cache over a [`KeyValueStore`].
//!
//! Entries are keyed by `METHOD:path[?sortedQuery]` and hold a full response
//! (status, headers, body). Only `GET` responses with status 200 are
//! cacheable. Each stored response carries `cache-control: max-age=<ttl>`
//! and expires from the store after the same TTL; entries are never
//! invalidated any other way.
//!
//! Store failures are logged and treated as a miss (on read) or as not
//! stored (on write).

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "cache:";

/// Normalised cache key: `METHOD:path` plus `?query` with pairs sorted by
/// name then value. An empty query adds nothing.
pub fn cache_key(method: &str, path: &str, query: Option<&str>) -> String {
    let method = method.to_ascii_uppercase();
    let mut pairs: Vec<(String, String)> = query
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    if pairs.is_empty() {
        return format!("{method}:{path}");
    }

    pairs.sort();
    let normalized = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter())
        .finish();
    format!("{method}:{path}?{normalized}")
}

/// Only successful `GET` responses are cached.
pub fn is_cacheable(method: &str, status: u16) -> bool {
    method.eq_ignore_ascii_case("GET") && status == 200
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Storage representation; the body travels as base64.
#[derive(Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let raw = match self.store.get(&format!("{KEY_PREFIX}{key}")).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        let stored: StoredResponse = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(key, error = %e, "corrupt cache entry, treating as miss");
                return None;
            }
        };
        let body = match STANDARD.decode(stored.body.as_bytes()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(key, error = %e, "corrupt cache body, treating as miss");
                return None;
            }
        };

        tracing::debug!(key, "cache hit");
        Some(CachedResponse {
            status: stored.status,
            headers: stored.headers,
            body,
        })
    }

    /// Store `response` under `key` for the configured TTL. Returns whether
    /// the entry was written.
    pub async fn set(&self, key: &str, response: &CachedResponse) -> bool {
        self.set_with_ttl(key, response, self.ttl).await
    }

    pub async fn set_with_ttl(&self, key: &str, response: &CachedResponse, ttl: Duration) -> bool {
        let mut headers: Vec<(String, String)> = response
            .headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("cache-control"))
            .cloned()
            .collect();
        headers.push((
            "cache-control".to_string(),
            format!("max-age={}", ttl.as_secs()),
        ));

        let stored = StoredResponse {
            status: response.status,
            headers,
            body: STANDARD.encode(&response.body),
        };
        let raw = match serde_json::to_string(&stored) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to encode cache entry");
                return false;
            }
        };

        match self.store.set(&format!("{KEY_PREFIX}{key}"), raw, Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache write failed");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(&format!("{KEY_PREFIX}{key}")).await {
            tracing::warn!(key, error = %e, "cache delete failed");
        }
    }
}
