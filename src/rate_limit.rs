//! Fixed-window request counting per (tenant, endpoint).
//!
//! Each endpoint gets one counter row whose window is aligned to the start of the
//! clock hour. Once `now` passes `window_end` the row is stale: it is treated as an
//! empty window and the next increment restarts it at 1.
//!
//! Check and increment happen in a single store operation
//! ([`RateLimiter::try_acquire`]) so concurrent dispatches for the same endpoint
//! cannot both observe `count = limit - 1` and both proceed.

use crate::{Result, store::WebhookStore};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Default requests allowed per endpoint per hour.
pub const DEFAULT_REQUESTS_PER_HOUR: i32 = 1000;

/// Hourly counter for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRateLimit {
    pub tenant_id: Uuid,
    pub endpoint_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub request_count: i32,
    pub limit: i32,
}

impl WebhookRateLimit {
    /// A fresh window containing `now` with `request_count` requests in it.
    pub fn open(
        tenant_id: Uuid,
        endpoint_id: Uuid,
        limit: i32,
        now: DateTime<Utc>,
        request_count: i32,
    ) -> Self {
        let window_start = window_start(now);
        Self {
            tenant_id,
            endpoint_id,
            window_start,
            window_end: window_start + Duration::hours(1),
            request_count,
            limit,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }

    /// Limited iff the window is current and already at its budget.
    pub fn is_limited(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.request_count >= self.limit
    }

    /// Count one request, restarting the window when stale. Always succeeds.
    pub fn increment(&mut self, limit: i32, now: DateTime<Utc>) {
        if self.is_expired(now) {
            *self = Self::open(self.tenant_id, self.endpoint_id, limit, now, 1);
        } else {
            self.request_count += 1;
            self.limit = limit;
        }
    }

    /// Count one request only if the budget allows it.
    pub fn try_acquire(&mut self, limit: i32, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            *self = Self::open(self.tenant_id, self.endpoint_id, limit, now, 1);
            return true;
        }
        self.limit = limit;
        if self.request_count >= limit {
            return false;
        }
        self.request_count += 1;
        true
    }
}

/// Start of the clock hour containing `now`.
pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

/// Store-backed rate limiter shared by the dispatcher and the delivery worker.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WebhookStore>,
    limit: i32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WebhookStore>, requests_per_hour: i32) -> Self {
        Self {
            store,
            limit: requests_per_hour,
        }
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    /// Whether the endpoint has used up its current window.
    pub async fn is_limited(&self, tenant_id: Uuid, endpoint_id: Uuid) -> Result<bool> {
        self.is_limited_at(tenant_id, endpoint_id, Utc::now()).await
    }

    pub async fn is_limited_at(
        &self,
        tenant_id: Uuid,
        endpoint_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let counter = self.store.get_rate_limit(tenant_id, endpoint_id).await?;
        Ok(counter.is_some_and(|c| c.is_limited(now)))
    }

    /// Unconditionally count one request against the endpoint.
    pub async fn increment(&self, tenant_id: Uuid, endpoint_id: Uuid) -> Result<WebhookRateLimit> {
        self.increment_at(tenant_id, endpoint_id, Utc::now()).await
    }

    pub async fn increment_at(
        &self,
        tenant_id: Uuid,
        endpoint_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WebhookRateLimit> {
        self.store
            .increment_rate_limit(tenant_id, endpoint_id, self.limit, now)
            .await
    }

    /// Atomically check the budget and count one request. `false` means limited.
    pub async fn try_acquire(&self, tenant_id: Uuid, endpoint_id: Uuid) -> Result<bool> {
        self.try_acquire_at(tenant_id, endpoint_id, Utc::now()).await
    }

    pub async fn try_acquire_at(
        &self,
        tenant_id: Uuid,
        endpoint_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.store
            .try_acquire_rate_limit(tenant_id, endpoint_id, self.limit, now)
            .await
    }

    /// Delete counters whose window ended before `now - retention`.
    pub async fn cleanup(&self, retention: std::time::Duration, now: DateTime<Utc>) -> Result<u64> {
        let retention = Duration::from_std(retention).unwrap_or_else(|_| Duration::hours(24));
        let removed = self.store.purge_rate_limits(now - retention).await?;
        debug!(removed, "Purged expired rate limit windows");
        Ok(removed)
    }
}
