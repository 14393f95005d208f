// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Detached background refresh of stale cache entries.
//!
//! A refresh is keyed (normally by query hash and scope). It waits out the
//! debounce window, then runs with quick retries. Requests for a key that
//! already has a refresh pending are coalesced into it. Failures are only
//! logged; the caller has already been answered from the cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;
use crate::resilience::retry::{retry, RetryConfig};

pub struct BackgroundRefresher {
    debounce: Duration,
    retry: RetryConfig,
    pending: Arc<DashSet<String>>,
}

impl BackgroundRefresher {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            retry: RetryConfig::query(),
            pending: Arc::new(DashSet::new()),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Schedule `job` unless a refresh for `key` is already pending.
    /// Returns whether a new task was spawned.
    pub fn schedule<F, Fut>(&self, key: String, job: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.pending.insert(key.clone()) {
            crate::metrics::record_background_refresh("debounced");
            debug!(%key, "Refresh already pending");
            return false;
        }

        let pending = Arc::clone(&self.pending);
        let debounce = self.debounce;
        let config = self.retry.clone();
        tokio::spawn(async move {
            sleep(debounce).await;
            match retry("background_refresh", &config, job).await {
                Ok(()) => {
                    crate::metrics::record_background_refresh("success");
                    debug!(%key, "Background refresh complete");
                }
                Err(e) => {
                    crate::metrics::record_background_refresh("error");
                    warn!(%key, error = %e, "Background refresh failed");
                }
            }
            pending.remove(&key);
        });
        true
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
