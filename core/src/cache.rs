/// Explicit cache for slow-changing lookups (current user profile)
use crate::clock::{to_delta, SharedClock};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// A value and when it was fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    pub value: T,
    pub fetched_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    pub fn new(value: T, fetched_at: DateTime<Utc>) -> Self {
        Self { value, fetched_at }
    }

    /// Stale once `ttl` has fully elapsed since the fetch
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.fetched_at >= to_delta(ttl)
    }
}

pub struct Repository<T> {
    name: &'static str,
    clock: SharedClock,
    ttl: Duration,
    slot: RwLock<Option<Cached<T>>>,
}

impl<T: Clone> Repository<T> {
    pub fn new(name: &'static str, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            name,
            clock,
            ttl,
            slot: RwLock::new(None),
        }
    }

    /// Cached value if still fresh
    pub async fn get_fresh(&self) -> Option<T> {
        let now = self.clock.now();
        self.slot
            .read()
            .await
            .as_ref()
            .filter(|c| !c.is_stale(now, self.ttl))
            .map(|c| c.value.clone())
    }

    /// Last fetched value, stale or not
    pub async fn last_known(&self) -> Option<T> {
        self.slot.read().await.as_ref().map(|c| c.value.clone())
    }

    pub async fn store(&self, value: T) -> T {
        let cached = Cached::new(value.clone(), self.clock.now());
        *self.slot.write().await = Some(cached);
        value
    }

    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }

    /// Fresh cached value, or fetch and remember a new one.
    /// A failed fetch leaves the previous entry untouched.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.get_fresh().await {
            return Ok(value);
        }
        debug!("Repository {} miss, fetching", self.name);
        let value = fetch().await?;
        Ok(self.store(value).await)
    }
}
