// Process-wide cache for short-lived credentials such as carrier login tokens

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Single-value cache with expiry and refresh-on-miss.
///
/// Refreshes are single-flight: the lock is held while the refresh future runs, so
/// concurrent callers wait for one login instead of each performing their own.
#[derive(Debug)]
pub struct TokenCache {
    entry: Mutex<Option<CacheEntry>>,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: Mutex::new(None),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value when it is still valid.
    pub async fn peek(&self) -> Option<String> {
        let guard = self.entry.lock().await;
        guard
            .as_ref()
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone())
    }

    /// Stores a value with the cache's TTL.
    pub async fn set(&self, value: impl Into<String>) {
        *self.entry.lock().await = Some(CacheEntry::new(value.into(), self.ttl));
    }

    /// Drops the cached value, forcing the next caller to refresh.
    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }

    /// Returns the cached value or runs `refresh` to obtain and store a new one.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let mut guard = self.entry.lock().await;
        if let Some(entry) = guard.as_ref().filter(|e| !e.is_expired()) {
            return Ok(entry.value.clone());
        }

        debug!("Token cache miss; refreshing");
        let value = refresh().await?;
        *guard = Some(CacheEntry::new(value.clone(), self.ttl));
        Ok(value)
    }
}
