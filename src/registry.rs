//! Tenant-facing endpoint management.
//!
//! The [`EndpointRegistry`] validates and persists endpoints, exposes their
//! delivery history, and runs the manual "test" send. Every operation is scoped
//! by tenant: an id that belongs to another tenant is reported as not found.

use crate::{
    HookworkError, Result,
    client::{DeliveryClient, SignedRequest},
    config::HookworkConfig,
    delivery::{DeliveryId, DeliveryQuery, WebhookDelivery},
    endpoint::{EndpointId, EndpointUpdate, NewEndpoint, WebhookEndpoint},
    event::WebhookEvent,
    retry::RetryPolicy,
    store::{HealthUpdate, WebhookStore},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of [`EndpointRegistry::test`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDeliveryResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: i64,
    pub error: Option<String>,
}

pub struct EndpointRegistry {
    store: Arc<dyn WebhookStore>,
    client: DeliveryClient,
    default_max_attempts: i32,
    default_timeout_secs: i32,
    default_policy: RetryPolicy,
}

impl EndpointRegistry {
    pub fn new(store: Arc<dyn WebhookStore>, config: &HookworkConfig) -> Self {
        Self {
            store,
            client: DeliveryClient::new(&config.delivery),
            default_max_attempts: config.delivery.default_max_attempts,
            default_timeout_secs: config.delivery.default_timeout_secs(),
            default_policy: config.retry.default_policy,
        }
    }

    pub fn with_client(mut self, client: DeliveryClient) -> Self {
        self.client = client;
        self
    }

    /// Register a new endpoint, generating its secret when none is supplied.
    pub async fn create(&self, tenant_id: Uuid, mut request: NewEndpoint) -> Result<WebhookEndpoint> {
        request.max_retries.get_or_insert(self.default_max_attempts);
        request.retry_policy.get_or_insert(self.default_policy);
        request.timeout_secs.get_or_insert(self.default_timeout_secs);

        let endpoint = WebhookEndpoint::from_request(tenant_id, request)?;
        self.store.insert_endpoint(&endpoint).await?;

        info!(
            tenant_id = %tenant_id,
            endpoint_id = %endpoint.id,
            url = %endpoint.url,
            events = endpoint.events.len(),
            "Registered webhook endpoint"
        );
        Ok(endpoint)
    }

    pub async fn get(&self, tenant_id: Uuid, endpoint_id: EndpointId) -> Result<WebhookEndpoint> {
        self.store
            .get_endpoint(tenant_id, endpoint_id)
            .await?
            .ok_or_else(|| not_found(endpoint_id))
    }

    pub async fn list(&self, tenant_id: Uuid) -> Result<Vec<WebhookEndpoint>> {
        self.store.list_endpoints(tenant_id).await
    }

    /// Merge the supplied fields into the endpoint.
    pub async fn update(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        update: EndpointUpdate,
    ) -> Result<WebhookEndpoint> {
        let mut endpoint = self.get(tenant_id, endpoint_id).await?;
        let rearm = endpoint.apply_update(update)?;

        if !self.store.update_endpoint(&endpoint, rearm).await? {
            return Err(not_found(endpoint_id));
        }

        info!(
            tenant_id = %tenant_id,
            endpoint_id = %endpoint_id,
            active = endpoint.active,
            rearm,
            "Updated webhook endpoint"
        );
        Ok(endpoint)
    }

    /// Remove the endpoint. Queued retries for it are abandoned.
    pub async fn delete(&self, tenant_id: Uuid, endpoint_id: EndpointId) -> Result<()> {
        if !self.store.delete_endpoint(tenant_id, endpoint_id).await? {
            return Err(not_found(endpoint_id));
        }
        info!(tenant_id = %tenant_id, endpoint_id = %endpoint_id, "Deleted webhook endpoint");
        Ok(())
    }

    /// Send a signed synthetic `test` event to the endpoint and report how it went.
    ///
    /// Nothing is written to the delivery table; the endpoint's `last_status` and
    /// `last_delivery_at` are refreshed.
    pub async fn test(&self, tenant_id: Uuid, endpoint_id: EndpointId) -> Result<TestDeliveryResult> {
        let endpoint = self.get(tenant_id, endpoint_id).await?;
        let now = Utc::now();
        let body = serde_json::to_string(&serde_json::json!({
            "event": WebhookEvent::Test.as_str(),
            "endpoint_id": endpoint.id,
            "tenant_id": tenant_id,
            "timestamp": now.to_rfc3339(),
        }))?;

        let attempt = self
            .client
            .send(SignedRequest {
                url: &endpoint.url,
                secret: &endpoint.secret,
                event: WebhookEvent::Test,
                delivery_id: Uuid::new_v4(),
                body: &body,
                timeout: endpoint.timeout(),
            })
            .await;

        if let Err(e) = self
            .store
            .record_endpoint_attempt(
                tenant_id,
                endpoint_id,
                attempt.status.map(i32::from),
                HealthUpdate::Unchanged,
                Utc::now(),
            )
            .await
        {
            warn!(endpoint_id = %endpoint_id, error = %e, "Failed to record test result on endpoint");
        }

        info!(
            tenant_id = %tenant_id,
            endpoint_id = %endpoint_id,
            success = attempt.success,
            status = ?attempt.status,
            response_time_ms = attempt.response_time_ms,
            "Sent test webhook"
        );

        Ok(TestDeliveryResult {
            success: attempt.success,
            status_code: attempt.status,
            response_time_ms: attempt.response_time_ms,
            error: attempt.error,
        })
    }

    /// Delivery history of an endpoint, newest first.
    pub async fn deliveries(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        query: DeliveryQuery,
    ) -> Result<Vec<WebhookDelivery>> {
        self.get(tenant_id, endpoint_id).await?;
        self.store.list_deliveries(tenant_id, endpoint_id, query).await
    }

    pub async fn delivery(&self, tenant_id: Uuid, delivery_id: DeliveryId) -> Result<WebhookDelivery> {
        self.store
            .get_delivery(tenant_id, delivery_id)
            .await?
            .ok_or_else(|| HookworkError::DeliveryNotFound {
                id: delivery_id.to_string(),
            })
    }
}

fn not_found(endpoint_id: EndpointId) -> HookworkError {
    HookworkError::EndpointNotFound {
        id: endpoint_id.to_string(),
    }
}
