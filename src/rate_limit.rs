//! Per-client sliding window rate limiting, bounded by an LRU over client keys so a flood of
//! distinct addresses cannot grow memory without limit.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::debug;
use lru::LruCache;
use tokio::sync::RwLock;

pub const DEFAULT_MAX_CLIENTS: usize = 10_000;


pub struct RateLimiter {
    /// Client key -> request times inside the current window, oldest first
    clients: LruCache<String, Vec<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, max_clients: usize) -> Self {
        let cap = NonZeroUsize::new(max_clients).unwrap_or(NonZeroUsize::MIN);
        RateLimiter {
            clients: LruCache::new(cap),
            max_requests,
            window,
        }
    }

    /// Records a request at `now` if the client is under its limit.
    pub fn check_at(&mut self, key: &str, now: Instant) -> bool {
        let window = self.window;
        let entries = self.clients.get_or_insert_mut(key.to_string(), Vec::new);
        entries.retain(|ts| now.saturating_duration_since(*ts) < window);
        if entries.len() >= self.max_requests {
            debug!("Rate limit reached for {}", key);
            return false;
        }
        entries.push(now);
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.clients.len()
    }
}


/// Thread-safe wrapper shared by the request handlers
#[derive(Clone)]
pub struct SharedRateLimiter {
    inner: Arc<RwLock<RateLimiter>>,
}

impl SharedRateLimiter {
    pub fn new(max_requests: usize, window: Duration, max_clients: usize) -> Self {
        SharedRateLimiter {
            inner: Arc::new(RwLock::new(RateLimiter::new(max_requests, window, max_clients))),
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        let mut limiter = self.inner.write().await;
        limiter.check_at(key, Instant::now())
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        let limiter = self.inner.read().await;
        limiter.len()
    }
}
