//! Stripe-style payment gateway callbacks.
//!
//! The gateway signs `"<timestamp>.<raw body>"` with the shared secret and sends
//!
//! ```text
//! Stripe-Signature: t=1700000000,v1=5257a869e7ecebeda32affa62cdca3fa51cad7e77a0e56ff536d0ce8e108d8bd
//! ```
//!
//! Several `v1` entries may be present while the gateway rolls its secret; any
//! match is accepted. Timestamps further than the configured tolerance from the
//! local clock are rejected to limit replays.

use super::ProviderHandler;
use crate::{
    HookworkError, Result,
    config::ProviderConfig,
    incoming::{InboundRequest, IncomingId, WebhookIncoming},
    signature,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Payment state change reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentUpdate {
    /// Stored callback this update came from; stable across re-drives
    #[serde(skip)]
    pub incoming_id: IncomingId,
    /// Gateway id of the payment intent
    pub provider_reference: String,
    /// Minor units
    pub amount: Option<i64>,
    pub currency: Option<String>,
    /// Decline or failure message
    pub reason: Option<String>,
}

/// Domain side of payment callbacks.
#[async_trait]
pub trait PaymentActions: Send + Sync {
    async fn payment_succeeded(&self, tenant_id: Uuid, update: PaymentUpdate) -> Result<()>;

    async fn payment_failed(&self, tenant_id: Uuid, update: PaymentUpdate) -> Result<()>;

    async fn payment_refunded(&self, tenant_id: Uuid, update: PaymentUpdate) -> Result<()>;
}

pub struct StripeProvider {
    secret: String,
    tolerance: Duration,
    actions: Arc<dyn PaymentActions>,
}

impl StripeProvider {
    pub fn new(config: &ProviderConfig, actions: Arc<dyn PaymentActions>) -> Self {
        Self {
            secret: config.secret.clone(),
            tolerance: config.tolerance,
            actions,
        }
    }

    /// Header value for `body` signed at `timestamp`, as the gateway would send it.
    pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            signature::sign(&signed_payload(timestamp, body), secret)
        )
    }
}

fn signed_payload(timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut payload = format!("{}.", timestamp).into_bytes();
    payload.extend_from_slice(body);
    payload
}

fn invalid(message: &str) -> HookworkError {
    HookworkError::SignatureInvalid {
        message: message.to_string(),
    }
}

/// Split `t=..,v1=..,v1=..` into the timestamp and the v1 signatures.
fn parse_header(header: &str) -> Result<(i64, Vec<&str>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| invalid("malformed timestamp"))?)
            }
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(|| invalid("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(invalid("missing v1 signature"));
    }
    Ok((timestamp, signatures))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl ProviderHandler for StripeProvider {
    fn verify(&self, request: &InboundRequest, now: DateTime<Utc>) -> Result<()> {
        let header = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| invalid("missing Stripe-Signature header"))?;
        let (timestamp, signatures) = parse_header(header)?;

        let age = (now.timestamp() - timestamp).unsigned_abs();
        if age > self.tolerance.as_secs() {
            return Err(invalid("timestamp outside tolerance"));
        }

        let payload = signed_payload(timestamp, &request.body);
        if signatures
            .iter()
            .any(|sig| signature::verify(&payload, sig, &self.secret))
        {
            Ok(())
        } else {
            Err(invalid("no matching v1 signature"))
        }
    }

    fn signature(&self, request: &InboundRequest) -> Option<String> {
        request.header(SIGNATURE_HEADER).map(str::to_string)
    }

    fn external_id(&self, body: &[u8]) -> Option<String> {
        let event: Value = serde_json::from_slice(body).ok()?;
        str_field(&event, "id")
    }

    async fn handle(&self, incoming: &WebhookIncoming) -> Result<()> {
        let event: Value = serde_json::from_slice(&incoming.body)?;
        let event_type = str_field(&event, "type").ok_or_else(|| HookworkError::InvalidPayload {
            message: "missing event type".to_string(),
        })?;
        let object = event
            .pointer("/data/object")
            .ok_or_else(|| HookworkError::InvalidPayload {
                message: "missing data.object".to_string(),
            })?;

        match event_type.as_str() {
            "payment_intent.succeeded" => {
                let update = PaymentUpdate {
                    incoming_id: incoming.id,
                    provider_reference: reference(object, "id")?,
                    amount: object
                        .get("amount_received")
                        .or_else(|| object.get("amount"))
                        .and_then(Value::as_i64),
                    currency: str_field(object, "currency"),
                    reason: None,
                };
                self.actions.payment_succeeded(incoming.tenant_id, update).await
            }
            "payment_intent.payment_failed" => {
                let update = PaymentUpdate {
                    incoming_id: incoming.id,
                    provider_reference: reference(object, "id")?,
                    amount: object.get("amount").and_then(Value::as_i64),
                    currency: str_field(object, "currency"),
                    reason: object
                        .pointer("/last_payment_error/message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                };
                self.actions.payment_failed(incoming.tenant_id, update).await
            }
            "charge.refunded" => {
                let update = PaymentUpdate {
                    incoming_id: incoming.id,
                    provider_reference: reference(object, "payment_intent")
                        .or_else(|_| reference(object, "id"))?,
                    amount: object.get("amount_refunded").and_then(Value::as_i64),
                    currency: str_field(object, "currency"),
                    reason: None,
                };
                self.actions.payment_refunded(incoming.tenant_id, update).await
            }
            other => {
                debug!(event_type = other, "Ignoring unhandled payment event");
                Ok(())
            }
        }
    }
}

fn reference(object: &Value, key: &str) -> Result<String> {
    str_field(object, key).ok_or_else(|| HookworkError::InvalidPayload {
        message: format!("missing data.object.{}", key),
    })
}
