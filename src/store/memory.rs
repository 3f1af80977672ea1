//! In-memory implementation of [`WebhookStore`].
//!
//! All state lives behind one `RwLock`, so every write method is atomic with
//! respect to the others, which gives the same guarantees the Postgres backend
//! gets from its conditional statements. Used by the test suites and for running
//! the engine without a database.
//!
//! # Examples
//!
//! ```rust
//! use hookwork::endpoint::{NewEndpoint, WebhookEndpoint};
//! use hookwork::event::WebhookEvent;
//! use hookwork::store::{WebhookStore, memory::InMemoryStore};
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() -> hookwork::Result<()> {
//! let store = InMemoryStore::new();
//! let tenant = Uuid::new_v4();
//! let endpoint = WebhookEndpoint::from_request(
//!     tenant,
//!     NewEndpoint::new("https://example.com/hooks", vec![WebhookEvent::OrderCreated]),
//! )?;
//! store.insert_endpoint(&endpoint).await?;
//!
//! assert!(store.get_endpoint(tenant, endpoint.id).await?.is_some());
//! assert!(store.get_endpoint(Uuid::new_v4(), endpoint.id).await?.is_none());
//! # Ok(())
//! # }
//! ```

use crate::{
    HookworkError, Result,
    delivery::{AttemptOutcome, DeliveryId, DeliveryQuery, DeliveryStatus, WebhookDelivery},
    endpoint::{EndpointId, WebhookEndpoint},
    event::WebhookEvent,
    incoming::{IncomingId, WebhookIncoming},
    rate_limit::WebhookRateLimit,
    store::{HealthUpdate, WebhookStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    endpoints: HashMap<EndpointId, WebhookEndpoint>,
    deliveries: HashMap<DeliveryId, WebhookDelivery>,
    rate_limits: HashMap<(Uuid, EndpointId), WebhookRateLimit>,
    incoming: HashMap<IncomingId, WebhookIncoming>,
}

impl State {
    fn live_endpoint_mut(
        &mut self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
    ) -> Option<&mut WebhookEndpoint> {
        self.endpoints
            .get_mut(&endpoint_id)
            .filter(|e| e.tenant_id == tenant_id && e.deleted_at.is_none())
    }

    fn is_live(&self, endpoint_id: EndpointId) -> bool {
        self.endpoints
            .get(&endpoint_id)
            .is_some_and(|e| e.deleted_at.is_none())
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deliveries held, across tenants.
    pub async fn delivery_count(&self) -> usize {
        self.state.read().await.deliveries.len()
    }

    /// Number of inbound rows held, across tenants.
    pub async fn incoming_count(&self) -> usize {
        self.state.read().await.incoming.len()
    }

    /// Overwrite an endpoint's consecutive failure count.
    pub async fn set_failure_count(&self, endpoint_id: EndpointId, failure_count: i32) {
        if let Some(endpoint) = self.state.write().await.endpoints.get_mut(&endpoint_id) {
            endpoint.failure_count = failure_count;
        }
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        let mut state = self.state.write().await;
        if state.endpoints.contains_key(&endpoint.id) {
            return Err(HookworkError::Storage {
                message: format!("endpoint {} already exists", endpoint.id),
            });
        }
        state.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
    ) -> Result<Option<WebhookEndpoint>> {
        let state = self.state.read().await;
        Ok(state
            .endpoints
            .get(&endpoint_id)
            .filter(|e| e.tenant_id == tenant_id && e.deleted_at.is_none())
            .cloned())
    }

    async fn list_endpoints(&self, tenant_id: Uuid) -> Result<Vec<WebhookEndpoint>> {
        let state = self.state.read().await;
        let mut endpoints: Vec<_> = state
            .endpoints
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.deleted_at.is_none())
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        Ok(endpoints)
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint, rearm: bool) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(stored) = state.live_endpoint_mut(endpoint.tenant_id, endpoint.id) else {
            return Ok(false);
        };
        stored.url = endpoint.url.clone();
        stored.description = endpoint.description.clone();
        stored.events = endpoint.events.clone();
        stored.secret = endpoint.secret.clone();
        stored.active = endpoint.active;
        stored.retry_policy = endpoint.retry_policy;
        stored.max_retries = endpoint.max_retries;
        stored.timeout_secs = endpoint.timeout_secs;
        if rearm {
            stored.failure_count = 0;
        }
        stored.updated_at = endpoint.updated_at;
        Ok(true)
    }

    async fn delete_endpoint(&self, tenant_id: Uuid, endpoint_id: EndpointId) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(stored) = state.live_endpoint_mut(tenant_id, endpoint_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        stored.deleted_at = Some(now);
        stored.active = false;
        stored.updated_at = now;
        Ok(true)
    }

    async fn find_subscribed_endpoints(
        &self,
        tenant_id: Uuid,
        event: WebhookEvent,
        failure_threshold: i32,
    ) -> Result<Vec<WebhookEndpoint>> {
        let state = self.state.read().await;
        let mut endpoints: Vec<_> = state
            .endpoints
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.accepts(event, failure_threshold))
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        Ok(endpoints)
    }

    async fn record_endpoint_attempt(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        status: Option<i32>,
        update: HealthUpdate,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(endpoint) = state.live_endpoint_mut(tenant_id, endpoint_id) {
            endpoint.last_delivery_at = Some(at);
            endpoint.last_status = status;
            match update {
                HealthUpdate::Succeeded => endpoint.failure_count = 0,
                HealthUpdate::Unchanged => {}
                HealthUpdate::Exhausted => endpoint.failure_count += 1,
            }
        }
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut state = self.state.write().await;
        if state.deliveries.contains_key(&delivery.id) {
            return Err(HookworkError::Storage {
                message: format!("delivery {} already exists", delivery.id),
            });
        }
        state.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
    ) -> Result<Option<WebhookDelivery>> {
        let state = self.state.read().await;
        Ok(state
            .deliveries
            .get(&delivery_id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_deliveries(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        query: DeliveryQuery,
    ) -> Result<Vec<WebhookDelivery>> {
        let state = self.state.read().await;
        let mut deliveries: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| d.tenant_id == tenant_id && d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deliveries
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn begin_attempt(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookDelivery>> {
        let mut state = self.state.write().await;
        let Some(delivery) = state
            .deliveries
            .get_mut(&delivery_id)
            .filter(|d| d.tenant_id == tenant_id)
        else {
            return Ok(None);
        };
        if delivery.begin_attempt(now) {
            Ok(Some(delivery.clone()))
        } else {
            Ok(None)
        }
    }

    async fn complete_attempt(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<WebhookDelivery> {
        let mut state = self.state.write().await;
        let delivery = state
            .deliveries
            .get_mut(&delivery_id)
            .filter(|d| d.tenant_id == tenant_id)
            .ok_or_else(|| HookworkError::DeliveryNotFound {
                id: delivery_id.to_string(),
            })?;
        if delivery.status != DeliveryStatus::Delivering {
            return Err(HookworkError::Storage {
                message: format!(
                    "delivery {} is {}, not delivering",
                    delivery_id, delivery.status
                ),
            });
        }
        delivery.record(outcome, now);
        Ok(delivery.clone())
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let state = self.state.read().await;
        let mut due: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| d.is_due(now) && state.is_live(d.endpoint_id))
            .cloned()
            .collect();
        due.sort_by_key(|d| d.next_retry_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        let state = self.state.read().await;
        let mut stale: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Pending
                    && d.created_at <= created_before
                    && state.is_live(d.endpoint_id)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|d| d.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn expire_stale_attempts(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        let mut state = self.state.write().await;
        let mut stuck: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Delivering
                    && d.last_attempt_at.is_some_and(|at| at <= started_before)
            })
            .map(|d| (d.last_attempt_at, d.id))
            .collect();
        stuck.sort();
        stuck.truncate(limit.max(0) as usize);

        let mut expired = Vec::with_capacity(stuck.len());
        for (_, id) in stuck {
            if let Some(delivery) = state.deliveries.get_mut(&id) {
                if delivery.interrupt(now) {
                    expired.push(delivery.clone());
                }
            }
        }
        Ok(expired)
    }

    async fn get_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
    ) -> Result<Option<WebhookRateLimit>> {
        let state = self.state.read().await;
        Ok(state.rate_limits.get(&(tenant_id, endpoint_id)).cloned())
    }

    async fn increment_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<WebhookRateLimit> {
        let mut state = self.state.write().await;
        let counter = state
            .rate_limits
            .entry((tenant_id, endpoint_id))
            .and_modify(|c| c.increment(limit, now))
            .or_insert_with(|| WebhookRateLimit::open(tenant_id, endpoint_id, limit, now, 1));
        Ok(counter.clone())
    }

    async fn try_acquire_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let counter = state
            .rate_limits
            .entry((tenant_id, endpoint_id))
            .or_insert_with(|| WebhookRateLimit::open(tenant_id, endpoint_id, limit, now, 0));
        Ok(counter.try_acquire(limit, now))
    }

    async fn purge_rate_limits(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let initial = state.rate_limits.len();
        state.rate_limits.retain(|_, c| c.window_end >= before);
        Ok((initial - state.rate_limits.len()) as u64)
    }

    async fn insert_incoming(&self, incoming: &WebhookIncoming) -> Result<bool> {
        let mut state = self.state.write().await;
        if incoming.is_verified {
            if let Some(external_id) = &incoming.external_event_id {
                let duplicate = state.incoming.values().any(|existing| {
                    existing.is_verified
                        && existing.tenant_id == incoming.tenant_id
                        && existing.provider == incoming.provider
                        && existing.external_event_id.as_ref() == Some(external_id)
                });
                if duplicate {
                    return Ok(false);
                }
            }
        }
        state.incoming.insert(incoming.id, incoming.clone());
        Ok(true)
    }

    async fn get_incoming(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
    ) -> Result<Option<WebhookIncoming>> {
        let state = self.state.read().await;
        Ok(state
            .incoming
            .get(&incoming_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn mark_incoming_processed(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let incoming = state
            .incoming
            .get_mut(&incoming_id)
            .filter(|i| i.tenant_id == tenant_id)
            .ok_or_else(|| HookworkError::IncomingNotFound {
                id: incoming_id.to_string(),
            })?;
        if incoming.is_processed {
            return Ok(false);
        }
        incoming.is_processed = true;
        incoming.processed_at = Some(at);
        incoming.processing_error = error;
        Ok(true)
    }

    async fn claim_incoming(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<Option<WebhookIncoming>> {
        let mut state = self.state.write().await;
        let Some(incoming) = state
            .incoming
            .get_mut(&incoming_id)
            .filter(|i| i.tenant_id == tenant_id && i.is_claimable(lease_expired_before))
        else {
            return Ok(None);
        };
        incoming.processing_started_at = Some(now);
        Ok(Some(incoming.clone()))
    }

    async fn unprocessed_incoming(
        &self,
        received_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookIncoming>> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .incoming
            .values()
            .filter(|i| i.is_verified && !i.is_processed && i.received_at <= received_before)
            .cloned()
            .collect();
        pending.sort_by_key(|i| i.received_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }
}
