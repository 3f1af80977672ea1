//! Persistence for endpoints, deliveries, rate-limit counters and inbound callbacks.
//!
//! Services talk to storage only through the [`WebhookStore`] trait. Two backends
//! implement it: [`postgres::PostgresStore`] for production and
//! [`memory::InMemoryStore`] for tests and single-process development.
//!
//! Every tenant-facing method takes the tenant id and filters on it. The only
//! cross-tenant methods are the background sweeps (`due_retries`, `stale_pending`,
//! `expire_stale_attempts`, `unprocessed_incoming`, `purge_rate_limits`).
//!
//! Operations that touch state shared by concurrent delivery tasks are atomic in
//! every backend: claiming an attempt, updating endpoint health, and the rate-limit
//! counter are each a single conditional write.

use crate::{
    Result,
    delivery::{AttemptOutcome, DeliveryId, DeliveryQuery, WebhookDelivery},
    endpoint::{EndpointId, WebhookEndpoint},
    event::WebhookEvent,
    incoming::{IncomingId, WebhookIncoming},
    rate_limit::WebhookRateLimit,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Effect of a finished attempt on the endpoint's consecutive failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    /// Delivered: reset the count
    Succeeded,
    /// Failed with attempts left, or a test send: leave the count alone
    Unchanged,
    /// Failed with no attempts left: one more consecutive failure
    Exhausted,
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    // Endpoints
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()>;

    /// A live (not deleted) endpoint owned by `tenant_id`.
    async fn get_endpoint(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
    ) -> Result<Option<WebhookEndpoint>>;

    async fn list_endpoints(&self, tenant_id: Uuid) -> Result<Vec<WebhookEndpoint>>;

    /// Persist the mutable configuration of an endpoint. The stored
    /// `failure_count` is reset only when `rearm` is set and is otherwise left
    /// as the store has it. Returns `false` when no live endpoint matched.
    async fn update_endpoint(&self, endpoint: &WebhookEndpoint, rearm: bool) -> Result<bool>;

    /// Soft-delete. Returns `false` when no live endpoint matched.
    async fn delete_endpoint(&self, tenant_id: Uuid, endpoint_id: EndpointId) -> Result<bool>;

    /// Live, active endpoints of `tenant_id` subscribed to `event` whose
    /// `failure_count` is below `failure_threshold`.
    async fn find_subscribed_endpoints(
        &self,
        tenant_id: Uuid,
        event: WebhookEvent,
        failure_threshold: i32,
    ) -> Result<Vec<WebhookEndpoint>>;

    /// Record an attempt's result on the endpoint's health fields.
    async fn record_endpoint_attempt(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        status: Option<i32>,
        update: HealthUpdate,
        at: DateTime<Utc>,
    ) -> Result<()>;

    // Deliveries
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    async fn get_delivery(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
    ) -> Result<Option<WebhookDelivery>>;

    /// Deliveries of one endpoint, newest first.
    async fn list_deliveries(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        query: DeliveryQuery,
    ) -> Result<Vec<WebhookDelivery>>;

    /// Atomically claim the next attempt (`pending|failed → delivering`,
    /// `attempt_count + 1`). `None` when the delivery is missing, in flight,
    /// delivered or out of attempts.
    async fn begin_attempt(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookDelivery>>;

    /// Store the outcome of the attempt in flight (`delivering → delivered|failed`).
    async fn complete_attempt(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<WebhookDelivery>;

    /// Failed deliveries with attempts left whose `next_retry_at <= now`, oldest
    /// first, skipping deleted endpoints.
    async fn due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookDelivery>>;

    /// Pending deliveries created at or before `created_before` that were never
    /// attempted, oldest first, skipping deleted endpoints.
    async fn stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>>;

    /// Fail deliveries still `delivering` whose attempt started at or before
    /// `started_before`, oldest first. Those with attempts left become due at
    /// `now`; the rest end terminal. Returns the updated deliveries.
    async fn expire_stale_attempts(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>>;

    // Rate limits
    async fn get_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
    ) -> Result<Option<WebhookRateLimit>>;

    /// Count one request, opening a new window when the stored one is stale.
    async fn increment_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<WebhookRateLimit>;

    /// Count one request only if the current window is below `limit`.
    async fn try_acquire_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete counters whose window ended before `before`.
    async fn purge_rate_limits(&self, before: DateTime<Utc>) -> Result<u64>;

    // Incoming
    /// Persist an inbound callback. Returns `false`, storing nothing, when a
    /// verified row with the same `(tenant_id, provider, external_event_id)`
    /// already exists.
    async fn insert_incoming(&self, incoming: &WebhookIncoming) -> Result<bool>;

    async fn get_incoming(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
    ) -> Result<Option<WebhookIncoming>>;

    /// Set `is_processed`. Returns `false` when the row was already processed.
    async fn mark_incoming_processed(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Take the right to run the handler for a verified, unprocessed callback by
    /// stamping `processing_started_at = now`. A row already claimed after
    /// `lease_expired_before` is held by a live run; `None` means somebody else
    /// owns it or it needs no handling.
    async fn claim_incoming(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<Option<WebhookIncoming>>;

    /// Verified, unprocessed callbacks received at or before `received_before`.
    async fn unprocessed_incoming(
        &self,
        received_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookIncoming>>;
}
