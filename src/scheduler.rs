//! Periodic background sweeps.
//!
//! Retries are pulled, not pushed: every `retry.interval` the scheduler asks the
//! store for failed deliveries whose `next_retry_at` has passed and queues them on
//! the [`DeliveryPool`]. The same sweep recovers work a crash may have stranded
//! (attempts whose outcome was never recorded, deliveries that were recorded but
//! never queued, verified inbound webhooks that were never handled), and a slower
//! timer purges expired rate-limit windows.
//!
//! A failing step is logged and tried again on the next tick; it never stops the
//! loop or the other steps.

use crate::{
    HookworkError, Result,
    config::HookworkConfig,
    endpoint::MAX_TIMEOUT_SECS,
    inbound::IncomingWebhookProcessor,
    rate_limit::RateLimiter,
    store::{HealthUpdate, WebhookStore},
    worker::DeliveryPool,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Attempts stuck in `delivering` past any possible timeout, marked failed
    pub interrupted: usize,
    /// Failed deliveries queued for their next attempt
    pub retried: usize,
    /// Pending deliveries that were never attempted, queued again
    pub recovered: usize,
    /// Verified inbound webhooks handed back to their provider handler
    pub redriven_incoming: usize,
}

#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn WebhookStore>,
    pool: DeliveryPool,
    rate_limiter: RateLimiter,
    incoming: Option<IncomingWebhookProcessor>,
    interval: Duration,
    batch_size: i64,
    recovery_grace: ChronoDuration,
    cleanup_interval: Duration,
    retention: Duration,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn WebhookStore>, pool: DeliveryPool, config: &HookworkConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::new(store.clone(), config.rate_limit.requests_per_hour),
            store,
            pool,
            incoming: None,
            interval: config.retry.interval,
            batch_size: config.retry.batch_size,
            recovery_grace: ChronoDuration::from_std(config.retry.recovery_grace)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
            cleanup_interval: config.rate_limit.cleanup_interval,
            retention: config.rate_limit.retention,
        }
    }

    /// Also re-drive unhandled inbound webhooks through `processor`.
    pub fn with_incoming(mut self, processor: IncomingWebhookProcessor) -> Self {
        self.incoming = Some(processor);
        self
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        // before retry_due so interrupted attempts with retries left go out this sweep
        match self.expire_interrupted(now).await {
            Ok(count) => report.interrupted = count,
            Err(e) => error!(error = %e, "Interrupted attempt sweep failed"),
        }
        match self.retry_due(now).await {
            Ok(count) => report.retried = count,
            Err(e) => error!(error = %e, "Retry sweep failed"),
        }
        match self.recover_stale(now).await {
            Ok(count) => report.recovered = count,
            Err(e) => error!(error = %e, "Stale delivery sweep failed"),
        }
        match self.redrive_incoming(now).await {
            Ok(count) => report.redriven_incoming = count,
            Err(e) => error!(error = %e, "Inbound webhook re-drive failed"),
        }

        if report != SweepReport::default() {
            info!(
                interrupted = report.interrupted,
                retried = report.retried,
                recovered = report.recovered,
                redriven_incoming = report.redriven_incoming,
                "Sweep complete"
            );
        }
        report
    }

    /// Fail attempts that have been `delivering` longer than the longest endpoint
    /// timeout plus the recovery grace. Their worker crashed or lost the store
    /// before recording an outcome.
    pub async fn expire_interrupted(&self, now: DateTime<Utc>) -> Result<usize> {
        let started_before = now - ChronoDuration::seconds(i64::from(MAX_TIMEOUT_SECS))
            - self.recovery_grace;
        let expired = self
            .store
            .expire_stale_attempts(started_before, now, self.batch_size)
            .await?;
        for delivery in &expired {
            warn!(
                delivery_id = %delivery.id,
                attempt = delivery.attempt_count,
                retrying = !delivery.is_terminal(),
                "Attempt outcome never recorded, marking failed"
            );
            if delivery.is_terminal() {
                if let Err(e) = self
                    .store
                    .record_endpoint_attempt(
                        delivery.tenant_id,
                        delivery.endpoint_id,
                        None,
                        HealthUpdate::Exhausted,
                        now,
                    )
                    .await
                {
                    warn!(endpoint_id = %delivery.endpoint_id, error = %e, "Failed to update endpoint health");
                }
            }
        }
        Ok(expired.len())
    }

    /// Queue failed deliveries whose retry time has passed.
    pub async fn retry_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_retries(now, self.batch_size).await?;
        let mut queued = 0;
        for delivery in due {
            debug!(
                delivery_id = %delivery.id,
                attempt = delivery.attempt_count + 1,
                "Queueing retry"
            );
            self.pool.submit(delivery.tenant_id, delivery.id).await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Queue pending deliveries older than the recovery grace.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .store
            .stale_pending(now - self.recovery_grace, self.batch_size)
            .await?;
        let mut queued = 0;
        for delivery in stale {
            warn!(delivery_id = %delivery.id, "Re-queueing delivery that was never attempted");
            self.pool.submit(delivery.tenant_id, delivery.id).await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Handle verified inbound webhooks older than the recovery grace that were
    /// never marked processed. Rows whose handler run still holds its claim are
    /// skipped and not counted.
    pub async fn redrive_incoming(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(processor) = &self.incoming else {
            return Ok(0);
        };
        let rows = self
            .store
            .unprocessed_incoming(now - self.recovery_grace, self.batch_size)
            .await?;
        let mut redriven = 0;
        for incoming in rows {
            let (incoming_id, provider) = (incoming.id, incoming.provider.clone());
            if processor.process_at(incoming, now).await {
                warn!(
                    incoming_id = %incoming_id,
                    provider = %provider,
                    "Re-drove unprocessed inbound webhook"
                );
                redriven += 1;
            }
        }
        Ok(redriven)
    }

    /// Purge rate-limit windows past retention.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<u64> {
        self.rate_limiter.cleanup(self.retention, now).await
    }

    /// Sweep on every tick until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Retry scheduler started"
        );

        let mut sweep_tick = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick =
            tokio::time::interval(self.cleanup_interval.max(Duration::from_secs(1)));
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Retry scheduler shutting down");
                    break;
                }
                _ = sweep_tick.tick() => {
                    self.sweep().await;
                }
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.cleanup_at(Utc::now()).await {
                        error!(error = %e, "Rate limit cleanup failed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            if let Err(e) = self.run(shutdown_rx).await {
                error!(error = %e, "Retry scheduler stopped with error");
            }
        });
        SchedulerHandle {
            shutdown_tx,
            handle,
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) -> Result<()> {
        if self.shutdown_tx.send(()).await.is_err() {
            warn!("Retry scheduler already stopped");
        }
        self.handle.await.map_err(|e| HookworkError::Worker {
            message: format!("Retry scheduler task failed: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::{AttemptOutcome, DeliveryStatus, INTERRUPTED_ATTEMPT, WebhookDelivery},
        endpoint::{NewEndpoint, WebhookEndpoint},
        event::WebhookEvent,
        rate_limit::WebhookRateLimit,
        store::memory::InMemoryStore,
        worker::DeliveryWorker,
    };
    use std::collections::BTreeMap;
    use uuid::Uuid;

    async fn failed_delivery(store: &InMemoryStore, retry_in: ChronoDuration) -> WebhookDelivery {
        let endpoint = WebhookEndpoint::from_request(
            Uuid::new_v4(),
            NewEndpoint::new("http://127.0.0.1:9/hook", vec![WebhookEvent::OrderCreated]),
        )
        .unwrap();
        store.insert_endpoint(&endpoint).await.unwrap();
        let delivery = WebhookDelivery::new(
            &endpoint,
            WebhookEvent::OrderCreated,
            Uuid::new_v4(),
            "{}".to_string(),
        );
        store.insert_delivery(&delivery).await.unwrap();

        let now = Utc::now();
        store
            .begin_attempt(delivery.tenant_id, delivery.id, now)
            .await
            .unwrap();
        store
            .complete_attempt(
                delivery.tenant_id,
                delivery.id,
                &AttemptOutcome {
                    success: false,
                    request_url: endpoint.url.clone(),
                    request_headers: BTreeMap::new(),
                    response_status: Some(503),
                    response_headers: BTreeMap::new(),
                    response_body: None,
                    response_time_ms: 5,
                    error_message: Some("HTTP 503: ".to_string()),
                    next_retry_at: Some(now + retry_in),
                },
                now,
            )
            .await
            .unwrap()
    }

    fn scheduler(store: Arc<InMemoryStore>) -> (RetryScheduler, DeliveryPool) {
        let config = HookworkConfig::default();
        let worker = Arc::new(DeliveryWorker::new(store.clone(), &config));
        let pool = DeliveryPool::with_limits(worker, 16, 4);
        (RetryScheduler::new(store, pool.clone(), &config), pool)
    }

    #[tokio::test]
    async fn test_sweep_only_picks_due_retries() {
        let store = Arc::new(InMemoryStore::new());
        let due = failed_delivery(&store, ChronoDuration::minutes(1)).await;
        let later = failed_delivery(&store, ChronoDuration::hours(2)).await;
        let (scheduler, pool) = scheduler(store.clone());

        // nothing is due yet
        assert_eq!(scheduler.sweep().await, SweepReport::default());

        let report = scheduler
            .sweep_at(Utc::now() + ChronoDuration::minutes(2))
            .await;
        assert_eq!(report.retried, 1);
        pool.shutdown().await.unwrap();

        let retried = store.get_delivery(due.tenant_id, due.id).await.unwrap().unwrap();
        assert_eq!(retried.attempt_count, 2);
        let untouched = store
            .get_delivery(later.tenant_id, later.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.attempt_count, 1);
        assert_eq!(untouched.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_sweep_recovers_never_attempted_deliveries() {
        let store = Arc::new(InMemoryStore::new());
        let endpoint = WebhookEndpoint::from_request(
            Uuid::new_v4(),
            NewEndpoint::new("http://127.0.0.1:9/hook", vec![WebhookEvent::OrderCreated]),
        )
        .unwrap();
        store.insert_endpoint(&endpoint).await.unwrap();
        let stranded = WebhookDelivery::new(
            &endpoint,
            WebhookEvent::OrderCreated,
            Uuid::new_v4(),
            "{}".to_string(),
        );
        store.insert_delivery(&stranded).await.unwrap();
        let (scheduler, pool) = scheduler(store.clone());

        assert_eq!(scheduler.sweep().await.recovered, 0);
        let report = scheduler
            .sweep_at(Utc::now() + ChronoDuration::minutes(10))
            .await;
        assert_eq!(report.recovered, 1);
        pool.shutdown().await.unwrap();

        let attempted = store
            .get_delivery(stranded.tenant_id, stranded.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempted.attempt_count, 1);
    }

    async fn claimed_delivery(store: &InMemoryStore, max_retries: i32) -> WebhookDelivery {
        let endpoint = WebhookEndpoint::from_request(
            Uuid::new_v4(),
            NewEndpoint::new("http://127.0.0.1:9/hook", vec![WebhookEvent::OrderCreated])
                .with_max_retries(max_retries),
        )
        .unwrap();
        store.insert_endpoint(&endpoint).await.unwrap();
        let delivery = WebhookDelivery::new(
            &endpoint,
            WebhookEvent::OrderCreated,
            Uuid::new_v4(),
            "{}".to_string(),
        );
        store.insert_delivery(&delivery).await.unwrap();
        // the worker that claimed it never reports back
        store
            .begin_attempt(delivery.tenant_id, delivery.id, Utc::now())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_fails_attempts_that_never_finished() {
        let store = Arc::new(InMemoryStore::new());
        let stuck = claimed_delivery(&store, 3).await;
        let (scheduler, pool) = scheduler(store.clone());

        // still inside the longest possible timeout
        assert_eq!(scheduler.sweep().await.interrupted, 0);

        let report = scheduler
            .sweep_at(Utc::now() + ChronoDuration::days(1))
            .await;
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.retried, 1);
        pool.shutdown().await.unwrap();

        let retried = store
            .get_delivery(stuck.tenant_id, stuck.id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(retried.status, DeliveryStatus::Delivering);
        assert_eq!(retried.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_interrupted_last_attempt_is_terminal() {
        let store = Arc::new(InMemoryStore::new());
        let stuck = claimed_delivery(&store, 1).await;
        let (scheduler, pool) = scheduler(store.clone());

        let report = scheduler
            .sweep_at(Utc::now() + ChronoDuration::days(7))
            .await;
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.retried, 0);
        pool.shutdown().await.unwrap();

        let failed = store
            .get_delivery(stuck.tenant_id, stuck.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert!(failed.is_terminal());
        assert_eq!(failed.error_message.as_deref(), Some(INTERRUPTED_ATTEMPT));

        let endpoint = store
            .get_endpoint(stuck.tenant_id, stuck.endpoint_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(endpoint.failure_count, 1);

        // nothing left to expire
        let again = scheduler
            .sweep_at(Utc::now() + ChronoDuration::days(30))
            .await;
        assert_eq!(again.interrupted, 0);
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_windows() {
        let store = Arc::new(InMemoryStore::new());
        let (scheduler, pool) = scheduler(store.clone());
        let tenant = Uuid::new_v4();
        let endpoint = Uuid::new_v4();
        let two_days_ago = Utc::now() - ChronoDuration::days(2);
        store
            .increment_rate_limit(tenant, endpoint, 10, two_days_ago)
            .await
            .unwrap();

        assert_eq!(scheduler.cleanup_at(Utc::now()).await.unwrap(), 1);
        let remaining: Option<WebhookRateLimit> =
            store.get_rate_limit(tenant, endpoint).await.unwrap();
        assert!(remaining.is_none());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_scheduler_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let (scheduler, pool) = scheduler(store);
        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await.unwrap();
        pool.shutdown().await.unwrap();
    }
}
