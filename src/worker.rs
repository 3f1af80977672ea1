//! Delivery execution.
//!
//! [`DeliveryWorker`] performs one attempt of one delivery: claim, sign, send,
//! record. [`DeliveryPool`] feeds it from a bounded queue with a cap on concurrent
//! outbound requests, so a burst of events applies backpressure to producers
//! instead of opening an unbounded number of connections.

use crate::{
    HookworkError, Result,
    client::{DeliveryClient, SignedRequest},
    config::HookworkConfig,
    delivery::{AttemptOutcome, DeliveryId, WebhookDelivery},
    metrics::{AttemptLabel, WebhookMetrics},
    rate_limit::RateLimiter,
    store::{HealthUpdate, WebhookStore},
};
use chrono::Utc;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct DeliveryWorker {
    store: Arc<dyn WebhookStore>,
    client: DeliveryClient,
    rate_limiter: RateLimiter,
    metrics: Option<Arc<WebhookMetrics>>,
    log_deliveries: bool,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn WebhookStore>, config: &HookworkConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::new(store.clone(), config.rate_limit.requests_per_hour),
            store,
            client: DeliveryClient::new(&config.delivery),
            metrics: None,
            log_deliveries: config.delivery.log_deliveries,
        }
    }

    pub fn with_client(mut self, client: DeliveryClient) -> Self {
        self.client = client;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WebhookMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one attempt of the delivery.
    ///
    /// Returns the updated delivery, or `None` when there was nothing to do: the
    /// delivery or its endpoint no longer exists, or another worker holds the
    /// attempt, or the delivery is already terminal. Those cases consume no attempt.
    pub async fn deliver(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
    ) -> Result<Option<WebhookDelivery>> {
        let Some(delivery) = self.store.get_delivery(tenant_id, delivery_id).await? else {
            warn!(tenant_id = %tenant_id, delivery_id = %delivery_id, "Delivery not found, skipping");
            return Ok(None);
        };

        let Some(endpoint) = self
            .store
            .get_endpoint(tenant_id, delivery.endpoint_id)
            .await?
        else {
            debug!(
                delivery_id = %delivery_id,
                endpoint_id = %delivery.endpoint_id,
                "Endpoint no longer exists, abandoning delivery"
            );
            return Ok(None);
        };

        let Some(delivery) = self
            .store
            .begin_attempt(tenant_id, delivery_id, Utc::now())
            .await?
        else {
            debug!(delivery_id = %delivery_id, "Delivery is not claimable, skipping");
            return Ok(None);
        };

        // The first attempt was counted when it was dispatched.
        if delivery.attempt_count > 1 {
            if let Err(e) = self.rate_limiter.increment(tenant_id, endpoint.id).await {
                warn!(endpoint_id = %endpoint.id, error = %e, "Failed to count retry against rate limit");
            }
        }

        let attempt = self
            .client
            .send(SignedRequest {
                url: &endpoint.url,
                secret: &endpoint.secret,
                event: delivery.event_type,
                delivery_id,
                body: &delivery.payload,
                timeout: endpoint.timeout(),
            })
            .await;

        let finished = Utc::now();
        let next_retry_at = (!attempt.success && delivery.has_attempts_remaining())
            .then(|| {
                let delay = endpoint
                    .retry_policy
                    .calculate_delay(delivery.attempt_count as u32);
                chrono::Duration::from_std(delay)
                    .ok()
                    .map(|delay| finished + delay)
            })
            .flatten();

        let outcome = AttemptOutcome {
            success: attempt.success,
            request_url: attempt.request_url,
            request_headers: attempt.request_headers,
            response_status: attempt.status.map(i32::from),
            response_headers: attempt.response_headers,
            response_body: attempt.response_body,
            response_time_ms: attempt.response_time_ms,
            error_message: attempt.error,
            next_retry_at,
        };

        let delivery = self
            .store
            .complete_attempt(tenant_id, delivery_id, &outcome, finished)
            .await?;

        let (health, label) = if outcome.success {
            (HealthUpdate::Succeeded, AttemptLabel::Delivered)
        } else if delivery.is_terminal() {
            (HealthUpdate::Exhausted, AttemptLabel::Exhausted)
        } else {
            (HealthUpdate::Unchanged, AttemptLabel::Retrying)
        };

        if let Err(e) = self
            .store
            .record_endpoint_attempt(
                tenant_id,
                endpoint.id,
                outcome.response_status,
                health,
                finished,
            )
            .await
        {
            warn!(endpoint_id = %endpoint.id, error = %e, "Failed to update endpoint health");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(
                delivery.event_type.as_str(),
                label,
                outcome.response_time_ms,
            );
        }

        if self.log_deliveries {
            match label {
                AttemptLabel::Delivered => info!(
                    tenant_id = %tenant_id,
                    delivery_id = %delivery_id,
                    endpoint_id = %endpoint.id,
                    event = %delivery.event_type,
                    attempt = delivery.attempt_count,
                    status = ?outcome.response_status,
                    response_time_ms = outcome.response_time_ms,
                    "Webhook delivered"
                ),
                AttemptLabel::Retrying => info!(
                    tenant_id = %tenant_id,
                    delivery_id = %delivery_id,
                    endpoint_id = %endpoint.id,
                    event = %delivery.event_type,
                    attempt = delivery.attempt_count,
                    next_retry_at = ?delivery.next_retry_at,
                    error = outcome.error_message.as_deref().unwrap_or_default(),
                    "Webhook delivery failed, retry scheduled"
                ),
                AttemptLabel::Exhausted => warn!(
                    tenant_id = %tenant_id,
                    delivery_id = %delivery_id,
                    endpoint_id = %endpoint.id,
                    event = %delivery.event_type,
                    attempt = delivery.attempt_count,
                    error = outcome.error_message.as_deref().unwrap_or_default(),
                    "Webhook delivery failed permanently"
                ),
            }
        }

        Ok(Some(delivery))
    }
}

#[derive(Debug, Clone, Copy)]
struct DeliveryJob {
    tenant_id: Uuid,
    delivery_id: DeliveryId,
}

/// Bounded queue of delivery attempts executed with limited concurrency.
///
/// Cloning is cheap; every clone submits into the same queue.
#[derive(Clone)]
pub struct DeliveryPool {
    sender: mpsc::Sender<DeliveryJob>,
    shutdown_tx: mpsc::Sender<()>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DeliveryPool {
    /// Spawn the pool on the current runtime.
    pub fn start(worker: Arc<DeliveryWorker>, config: &HookworkConfig) -> Self {
        Self::with_limits(
            worker,
            config.delivery.queue_capacity,
            config.delivery.max_concurrent_deliveries,
        )
    }

    pub fn with_limits(
        worker: Arc<DeliveryWorker>,
        queue_capacity: usize,
        max_concurrent: usize,
    ) -> Self {
        let (sender, jobs) = mpsc::channel(queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let max_concurrent = max_concurrent.max(1);

        info!(queue_capacity, max_concurrent, "Starting delivery pool");
        let handle = tokio::spawn(run_pool(worker, jobs, shutdown_rx, max_concurrent));

        Self {
            sender,
            shutdown_tx,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue one attempt. Waits while the queue is full.
    pub async fn submit(&self, tenant_id: Uuid, delivery_id: DeliveryId) -> Result<()> {
        self.sender
            .send(DeliveryJob {
                tenant_id,
                delivery_id,
            })
            .await
            .map_err(|_| HookworkError::Worker {
                message: "Delivery pool is shut down".to_string(),
            })
    }

    /// Stop accepting work, finish everything already queued, and wait for
    /// in-flight attempts.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down delivery pool");
        if self.shutdown_tx.send(()).await.is_err() {
            debug!("Delivery pool already stopped");
        }

        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.map_err(|e| HookworkError::Worker {
                message: format!("Delivery pool task failed: {}", e),
            })?;
        }
        Ok(())
    }
}

async fn run_pool(
    worker: Arc<DeliveryWorker>,
    mut jobs: mpsc::Receiver<DeliveryJob>,
    mut shutdown_rx: mpsc::Receiver<()>,
    max_concurrent: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    loop {
        let job = tokio::select! {
            _ = shutdown_rx.recv() => {
                jobs.close();
                break;
            }
            job = jobs.recv() => job,
        };
        let Some(job) = job else { break };
        spawn_job(&worker, &semaphore, job).await;
    }

    // drain what was queued before the close
    while let Some(job) = jobs.recv().await {
        spawn_job(&worker, &semaphore, job).await;
    }

    if semaphore.acquire_many(max_concurrent as u32).await.is_err() {
        warn!("Delivery pool semaphore closed while draining");
    }
    info!("Delivery pool stopped");
}

async fn spawn_job(worker: &Arc<DeliveryWorker>, semaphore: &Arc<Semaphore>, job: DeliveryJob) {
    let Ok(permit) = semaphore.clone().acquire_owned().await else {
        return;
    };
    let worker = worker.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.deliver(job.tenant_id, job.delivery_id).await {
            error!(
                tenant_id = %job.tenant_id,
                delivery_id = %job.delivery_id,
                error = %e,
                "Delivery attempt failed"
            );
        }
        drop(permit);
    });
}
