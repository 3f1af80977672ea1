//! Prometheus metrics for deliveries and inbound callbacks.
//!
//! Services take an optional `Arc<WebhookMetrics>`; without the `metrics` feature
//! the collector is a no-op with the same API.

use crate::Result;

#[cfg(feature = "metrics")]
use crate::HookworkError;

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Final outcome of one delivery attempt, as labelled in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptLabel {
    Delivered,
    Retrying,
    Exhausted,
}

impl AttemptLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptLabel::Delivered => "delivered",
            AttemptLabel::Retrying => "retrying",
            AttemptLabel::Exhausted => "exhausted",
        }
    }
}

#[cfg(feature = "metrics")]
pub struct WebhookMetrics {
    registry: Registry,
    delivery_attempts_total: CounterVec,
    delivery_duration: HistogramVec,
    dispatch_skipped_total: CounterVec,
    incoming_total: CounterVec,
}

#[cfg(feature = "metrics")]
fn metrics_error(what: &str, e: prometheus::Error) -> HookworkError {
    HookworkError::Metrics {
        message: format!("Failed to set up {}: {}", what, e),
    }
}

#[cfg(feature = "metrics")]
impl WebhookMetrics {
    /// Create the collectors in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let delivery_attempts_total = CounterVec::new(
            Opts::new(
                "hookwork_delivery_attempts_total",
                "Delivery attempts by outcome",
            ),
            &["event", "outcome"],
        )
        .map_err(|e| metrics_error("delivery_attempts_total", e))?;

        let delivery_duration = HistogramVec::new(
            HistogramOpts::new(
                "hookwork_delivery_duration_seconds",
                "Round-trip time of delivery attempts in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["event"],
        )
        .map_err(|e| metrics_error("delivery_duration", e))?;

        let dispatch_skipped_total = CounterVec::new(
            Opts::new(
                "hookwork_dispatch_skipped_total",
                "Endpoints skipped at dispatch by reason",
            ),
            &["reason"],
        )
        .map_err(|e| metrics_error("dispatch_skipped_total", e))?;

        let incoming_total = CounterVec::new(
            Opts::new(
                "hookwork_incoming_webhooks_total",
                "Inbound provider callbacks by provider and outcome",
            ),
            &["provider", "outcome"],
        )
        .map_err(|e| metrics_error("incoming_total", e))?;

        registry
            .register(Box::new(delivery_attempts_total.clone()))
            .map_err(|e| metrics_error("delivery_attempts_total registration", e))?;
        registry
            .register(Box::new(delivery_duration.clone()))
            .map_err(|e| metrics_error("delivery_duration registration", e))?;
        registry
            .register(Box::new(dispatch_skipped_total.clone()))
            .map_err(|e| metrics_error("dispatch_skipped_total registration", e))?;
        registry
            .register(Box::new(incoming_total.clone()))
            .map_err(|e| metrics_error("incoming_total registration", e))?;

        Ok(Self {
            registry,
            delivery_attempts_total,
            delivery_duration,
            dispatch_skipped_total,
            incoming_total,
        })
    }

    pub fn record_attempt(&self, event: &str, outcome: AttemptLabel, duration_ms: i64) {
        self.delivery_attempts_total
            .with_label_values(&[event, outcome.as_str()])
            .inc();
        self.delivery_duration
            .with_label_values(&[event])
            .observe(duration_ms.max(0) as f64 / 1000.0);
    }

    /// `reason` is `rate_limited` or `error`.
    pub fn record_dispatch_skipped(&self, reason: &str) {
        self.dispatch_skipped_total.with_label_values(&[reason]).inc();
    }

    /// `outcome` is `accepted`, `duplicate`, `rejected` or `failed`.
    pub fn record_incoming(&self, provider: &str, outcome: &str) {
        self.incoming_total
            .with_label_values(&[provider, outcome])
            .inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metrics_error("metrics encoding", e))?;

        String::from_utf8(buffer).map_err(|e| HookworkError::Metrics {
            message: format!("Failed to convert metrics to string: {}", e),
        })
    }
}

/// No-op metrics collector when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct WebhookMetrics;

#[cfg(not(feature = "metrics"))]
impl WebhookMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    pub fn record_attempt(&self, _event: &str, _outcome: AttemptLabel, _duration_ms: i64) {}

    pub fn record_dispatch_skipped(&self, _reason: &str) {}

    pub fn record_incoming(&self, _provider: &str, _outcome: &str) {}

    pub fn gather_text(&self) -> Result<String> {
        Ok("# Metrics collection disabled\n".to_string())
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_text_contains_recorded_series() {
        let metrics = WebhookMetrics::new().unwrap();
        metrics.record_attempt("order.created", AttemptLabel::Retrying, 120);
        metrics.record_attempt("order.created", AttemptLabel::Delivered, 80);
        metrics.record_dispatch_skipped("rate_limited");
        metrics.record_incoming("stripe", "accepted");

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("hookwork_delivery_attempts_total"));
        assert!(text.contains(r#"outcome="delivered""#));
        assert!(text.contains("hookwork_delivery_duration_seconds_bucket"));
        assert!(text.contains(r#"reason="rate_limited""#));
        assert!(text.contains(r#"provider="stripe""#));
    }

    #[test]
    fn test_collectors_are_independent() {
        let a = WebhookMetrics::new().unwrap();
        let b = WebhookMetrics::new().unwrap();
        a.record_dispatch_skipped("error");
        assert!(!b.gather_text().unwrap().contains(r#"reason="error""#));
    }
}
