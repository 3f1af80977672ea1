//! Catalogue of the domain events that tenants can subscribe to.
//!
//! Events travel over the wire by their dotted name (`order.created`,
//! `payment.succeeded`, ...) in the `X-Webhook-Event` header and are stored the
//! same way, so the enum serializes as that name.

use crate::HookworkError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A domain event that can be fanned out to webhook endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WebhookEvent {
    OrderCreated,
    OrderUpdated,
    OrderCancelled,
    OrderCompleted,
    PaymentSucceeded,
    PaymentFailed,
    PaymentRefunded,
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
    InventoryUpdated,
    InventoryLow,
    ShipmentCreated,
    ShipmentUpdated,
    ShipmentDelivered,
    CustomerCreated,
    CustomerUpdated,
    /// Synthetic event used by the endpoint test operation.
    Test,
}

impl WebhookEvent {
    /// Every event type, in catalogue order.
    pub const ALL: [WebhookEvent; 18] = [
        WebhookEvent::OrderCreated,
        WebhookEvent::OrderUpdated,
        WebhookEvent::OrderCancelled,
        WebhookEvent::OrderCompleted,
        WebhookEvent::PaymentSucceeded,
        WebhookEvent::PaymentFailed,
        WebhookEvent::PaymentRefunded,
        WebhookEvent::ProductCreated,
        WebhookEvent::ProductUpdated,
        WebhookEvent::ProductDeleted,
        WebhookEvent::InventoryUpdated,
        WebhookEvent::InventoryLow,
        WebhookEvent::ShipmentCreated,
        WebhookEvent::ShipmentUpdated,
        WebhookEvent::ShipmentDelivered,
        WebhookEvent::CustomerCreated,
        WebhookEvent::CustomerUpdated,
        WebhookEvent::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::OrderCreated => "order.created",
            WebhookEvent::OrderUpdated => "order.updated",
            WebhookEvent::OrderCancelled => "order.cancelled",
            WebhookEvent::OrderCompleted => "order.completed",
            WebhookEvent::PaymentSucceeded => "payment.succeeded",
            WebhookEvent::PaymentFailed => "payment.failed",
            WebhookEvent::PaymentRefunded => "payment.refunded",
            WebhookEvent::ProductCreated => "product.created",
            WebhookEvent::ProductUpdated => "product.updated",
            WebhookEvent::ProductDeleted => "product.deleted",
            WebhookEvent::InventoryUpdated => "inventory.updated",
            WebhookEvent::InventoryLow => "inventory.low",
            WebhookEvent::ShipmentCreated => "shipment.created",
            WebhookEvent::ShipmentUpdated => "shipment.updated",
            WebhookEvent::ShipmentDelivered => "shipment.delivered",
            WebhookEvent::CustomerCreated => "customer.created",
            WebhookEvent::CustomerUpdated => "customer.updated",
            WebhookEvent::Test => "test",
        }
    }

    /// The resource family of the event (`order`, `payment`, ...).
    pub fn category(&self) -> &'static str {
        self.as_str().split('.').next().unwrap_or("test")
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEvent {
    type Err = HookworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WebhookEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| HookworkError::UnknownEvent {
                name: s.to_string(),
            })
    }
}

impl Serialize for WebhookEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WebhookEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
