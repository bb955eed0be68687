//! Request spacing for the rate-limited provider.
//!
//! Wraps any [`Provider`] so consecutive calls of the same operation are at
//! least `delay` (plus optional random jitter) apart. Search pages and
//! profile lookups are throttled independently.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use perch_core::throttle::{ThrottleConfig, ThrottledProvider};
//! use perch_core::traits::Provider;
//!
//! fn throttled<P: Provider>(provider: P) -> ThrottledProvider<P> {
//!     let config = ThrottleConfig::new(Duration::from_secs(1))
//!         .with_jitter(Duration::from_millis(500));
//!     ThrottledProvider::new(provider, config)
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::{AuthorProfile, RawPost, SearchQuery};
use crate::traits::Provider;

/// Configuration for the throttled provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive calls of the same operation.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter)).
    /// Set to `Duration::ZERO` to disable.
    pub jitter: Duration,
}

impl ThrottleConfig {
    /// Create a new config with the given delay and no jitter.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Effective delay for a single wait (delay + random jitter).
    fn effective_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        self.delay + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }
}

impl Default for ThrottleConfig {
    /// 1 second delay, 500ms jitter.
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Operation {
    Search,
    Lookup,
}

/// A [`Provider`] wrapper that spaces out calls per operation.
#[derive(Clone)]
pub struct ThrottledProvider<P> {
    inner: P,
    config: ThrottleConfig,
    last_request: Arc<Mutex<HashMap<Operation, Instant>>>,
}

impl<P: Provider> ThrottledProvider<P> {
    pub fn new(inner: P, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            last_request: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Waits until the delay since the last call of `op` has elapsed, then
    /// records now as the last call.
    async fn wait_for(&self, op: Operation) {
        let mut map = self.last_request.lock().await;

        if let Some(&last) = map.get(&op) {
            let elapsed = last.elapsed();
            let required = self.config.effective_delay();
            if elapsed < required {
                let sleep_duration = required - elapsed;
                tracing::debug!(
                    operation = ?op,
                    sleep_ms = sleep_duration.as_millis() as u64,
                    "Throttling provider call"
                );
                // Held across the sleep so concurrent callers queue up.
                tokio::time::sleep(sleep_duration).await;
            }
        }
        map.insert(op, Instant::now());
    }
}

impl<P: Provider> Provider for ThrottledProvider<P> {
    async fn search_page(&self, query: &SearchQuery, page: u32) -> Result<Vec<RawPost>, AppError> {
        self.wait_for(Operation::Search).await;
        self.inner.search_page(query, page).await
    }

    async fn lookup_author(&self, author_id: u64) -> Result<Option<AuthorProfile>, AppError> {
        self.wait_for(Operation::Lookup).await;
        self.inner.lookup_author(author_id).await
    }
}
