//! Turns verified provider callbacks into outbound tenant events.
//!
//! A payment gateway reporting a captured payment becomes `payment.succeeded`
//! for every endpoint of the tenant subscribed to it; carrier tracking updates
//! become `shipment.updated`, or `shipment.delivered` once the parcel arrives.
//!
//! The outbound event id is the id of the stored callback, so handling the same
//! callback again produces deliveries with the same event id.

use async_trait::async_trait;
use hookwork::{
    EventDispatcher, IncomingId, WebhookEvent,
    inbound::{PaymentActions, PaymentUpdate, ShipmentActions, ShipmentUpdate},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Forwards provider callbacks to the [`EventDispatcher`].
#[derive(Clone)]
pub struct EventBridge {
    dispatcher: Arc<EventDispatcher>,
}

impl EventBridge {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self { dispatcher }
    }

    async fn publish<T: Serialize + Sync>(
        &self,
        tenant_id: Uuid,
        event: WebhookEvent,
        event_id: IncomingId,
        payload: &T,
    ) -> hookwork::Result<()> {
        let summary = self
            .dispatcher
            .dispatch(tenant_id, event, event_id, payload)
            .await?;
        info!(
            tenant_id = %tenant_id,
            event = %event,
            event_id = %event_id,
            deliveries = summary.created(),
            "Published provider update"
        );
        Ok(())
    }
}

#[async_trait]
impl PaymentActions for EventBridge {
    async fn payment_succeeded(&self, tenant_id: Uuid, update: PaymentUpdate) -> hookwork::Result<()> {
        self.publish(tenant_id, WebhookEvent::PaymentSucceeded, update.incoming_id, &update)
            .await
    }

    async fn payment_failed(&self, tenant_id: Uuid, update: PaymentUpdate) -> hookwork::Result<()> {
        self.publish(tenant_id, WebhookEvent::PaymentFailed, update.incoming_id, &update)
            .await
    }

    async fn payment_refunded(&self, tenant_id: Uuid, update: PaymentUpdate) -> hookwork::Result<()> {
        self.publish(tenant_id, WebhookEvent::PaymentRefunded, update.incoming_id, &update)
            .await
    }
}

#[async_trait]
impl ShipmentActions for EventBridge {
    async fn shipment_status_changed(
        &self,
        tenant_id: Uuid,
        update: ShipmentUpdate,
    ) -> hookwork::Result<()> {
        let event = shipment_event(&update.status);
        self.publish(tenant_id, event, update.incoming_id, &update)
            .await
    }
}

fn shipment_event(status: &str) -> WebhookEvent {
    if status.eq_ignore_ascii_case("delivered") {
        WebhookEvent::ShipmentDelivered
    } else {
        WebhookEvent::ShipmentUpdated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwork::{
        DeliveryPool, DeliveryWorker, EndpointRegistry, HookworkConfig, NewEndpoint,
        store::memory::InMemoryStore,
    };

    #[test]
    fn test_shipment_event_mapping() {
        assert_eq!(shipment_event("delivered"), WebhookEvent::ShipmentDelivered);
        assert_eq!(shipment_event("DELIVERED"), WebhookEvent::ShipmentDelivered);
        assert_eq!(shipment_event("in_transit"), WebhookEvent::ShipmentUpdated);
    }

    #[tokio::test]
    async fn test_payment_update_is_published_to_subscribers() {
        let config = HookworkConfig::default();
        let store = Arc::new(InMemoryStore::new());
        let worker = Arc::new(DeliveryWorker::new(store.clone(), &config));
        let pool = DeliveryPool::start(worker, &config);
        pool.shutdown().await.unwrap();

        let tenant = Uuid::new_v4();
        let registry = EndpointRegistry::new(store.clone(), &config);
        let endpoint = registry
            .create(
                tenant,
                NewEndpoint::new(
                    "https://shop.example.com/hooks",
                    vec![WebhookEvent::PaymentSucceeded],
                ),
            )
            .await
            .unwrap();

        let bridge = EventBridge::new(Arc::new(EventDispatcher::new(store.clone(), pool, &config)));
        let incoming_id = Uuid::new_v4();
        let update = PaymentUpdate {
            incoming_id,
            provider_reference: "pi_1".to_string(),
            amount: Some(1200),
            currency: Some("usd".to_string()),
            reason: None,
        };
        bridge.payment_succeeded(tenant, update.clone()).await.unwrap();
        // handling the same callback again
        bridge.payment_succeeded(tenant, update).await.unwrap();

        let deliveries = registry
            .deliveries(tenant, endpoint.id, Default::default())
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|d| d.event_id == incoming_id));
        assert_eq!(deliveries[0].event_type, WebhookEvent::PaymentSucceeded);
        let payload: serde_json::Value = serde_json::from_str(&deliveries[0].payload).unwrap();
        assert_eq!(payload["provider_reference"], "pi_1");
        assert!(payload.get("incoming_id").is_none());
    }
}
