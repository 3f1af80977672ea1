//! Fan-out of domain events to subscribed endpoints.

use crate::{
    Result,
    config::HookworkConfig,
    delivery::{DeliveryId, WebhookDelivery},
    endpoint::WebhookEndpoint,
    event::WebhookEvent,
    metrics::WebhookMetrics,
    rate_limit::RateLimiter,
    store::WebhookStore,
    worker::DeliveryPool,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one [`EventDispatcher::dispatch`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Deliveries created, one per accepted endpoint
    pub deliveries: Vec<DeliveryId>,
    /// Endpoints skipped because their hourly budget was used up
    pub rate_limited: usize,
    /// Endpoints whose delivery could not be recorded
    pub failed: usize,
}

impl DispatchSummary {
    pub fn created(&self) -> usize {
        self.deliveries.len()
    }
}

/// Creates one delivery per subscribed endpoint and hands it to the delivery pool.
///
/// Failures are contained per endpoint: a rate-limited endpoint is silently
/// skipped, and an endpoint whose delivery cannot be recorded does not stop the
/// others. The producer only sees an error when the endpoint lookup itself fails.
pub struct EventDispatcher {
    store: Arc<dyn WebhookStore>,
    rate_limiter: RateLimiter,
    pool: DeliveryPool,
    failure_threshold: i32,
    metrics: Option<Arc<WebhookMetrics>>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn WebhookStore>, pool: DeliveryPool, config: &HookworkConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::new(store.clone(), config.rate_limit.requests_per_hour),
            store,
            pool,
            failure_threshold: config.circuit_breaker.failure_threshold,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<WebhookMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn dispatch<T: Serialize + ?Sized>(
        &self,
        tenant_id: Uuid,
        event: WebhookEvent,
        event_id: Uuid,
        payload: &T,
    ) -> Result<DispatchSummary> {
        self.dispatch_at(tenant_id, event, event_id, payload, Utc::now())
            .await
    }

    /// [`dispatch`](Self::dispatch) with an explicit clock for the rate-limit window.
    pub async fn dispatch_at<T: Serialize + ?Sized>(
        &self,
        tenant_id: Uuid,
        event: WebhookEvent,
        event_id: Uuid,
        payload: &T,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary> {
        let endpoints = self
            .store
            .find_subscribed_endpoints(tenant_id, event, self.failure_threshold)
            .await?;

        let mut summary = DispatchSummary::default();
        if endpoints.is_empty() {
            debug!(tenant_id = %tenant_id, event = %event, "No endpoints subscribed");
            return Ok(summary);
        }

        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    tenant_id = %tenant_id,
                    event = %event,
                    event_id = %event_id,
                    error = %e,
                    "Failed to serialize event payload, skipping dispatch"
                );
                summary.failed = endpoints.len();
                self.record_skips("error", endpoints.len());
                return Ok(summary);
            }
        };

        for endpoint in &endpoints {
            match self.dispatch_one(endpoint, event, event_id, &body, now).await {
                Ok(Some(delivery_id)) => summary.deliveries.push(delivery_id),
                Ok(None) => {
                    summary.rate_limited += 1;
                    self.record_skips("rate_limited", 1);
                }
                Err(e) => {
                    warn!(
                        tenant_id = %tenant_id,
                        endpoint_id = %endpoint.id,
                        event = %event,
                        error = %e,
                        "Failed to create delivery"
                    );
                    summary.failed += 1;
                    self.record_skips("error", 1);
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            event = %event,
            event_id = %event_id,
            created = summary.created(),
            rate_limited = summary.rate_limited,
            failed = summary.failed,
            "Dispatched event"
        );
        Ok(summary)
    }

    /// `Ok(None)` when the endpoint is rate limited.
    async fn dispatch_one(
        &self,
        endpoint: &WebhookEndpoint,
        event: WebhookEvent,
        event_id: Uuid,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryId>> {
        if !self
            .rate_limiter
            .try_acquire_at(endpoint.tenant_id, endpoint.id, now)
            .await?
        {
            debug!(endpoint_id = %endpoint.id, event = %event, "Endpoint rate limited, dropping event");
            return Ok(None);
        }

        let delivery = WebhookDelivery::new(endpoint, event, event_id, body.to_string());
        self.store.insert_delivery(&delivery).await?;

        // The row is durable now; a lost hand-off is picked up by the stale sweep.
        if let Err(e) = self.pool.submit(delivery.tenant_id, delivery.id).await {
            warn!(delivery_id = %delivery.id, error = %e, "Failed to queue delivery");
        }
        Ok(Some(delivery.id))
    }

    fn record_skips(&self, reason: &str, count: usize) {
        if let Some(metrics) = &self.metrics {
            for _ in 0..count {
                metrics.record_dispatch_skipped(reason);
            }
        }
    }
}
