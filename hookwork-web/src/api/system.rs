//! Health probe and Prometheus scrape endpoint.
//!
//! - `GET /health` - liveness, version and the registered inbound providers
//! - `GET /metrics` - Prometheus text exposition

use super::reply_error;
use hookwork::WebhookMetrics;
use serde::Serialize;
use std::sync::Arc;
use warp::{Filter, Reply};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub storage: String,
    pub providers: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Create system routes
pub fn routes(
    metrics: Arc<WebhookMetrics>,
    storage: &'static str,
    providers: Vec<String>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || {
            warp::reply::json(&HealthStatus {
                status: "healthy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                storage: storage.to_string(),
                providers: providers.clone(),
                timestamp: chrono::Utc::now(),
            })
        });

    let scrape = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::any().map(move || metrics.clone()))
        .and_then(metrics_handler);

    health.or(scrape)
}

async fn metrics_handler(metrics: Arc<WebhookMetrics>) -> Result<warp::reply::Response, warp::Rejection> {
    match metrics.gather_text() {
        Ok(text) => Ok(warp::reply::with_header(
            text,
            "content-type",
            "text/plain; version=0.0.4",
        )
        .into_response()),
        Err(e) => Ok(reply_error(e)),
    }
}
