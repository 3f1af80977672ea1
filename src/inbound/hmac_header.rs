//! Providers that sign the raw body with HMAC-SHA256 in a single header.
//!
//! Most shipping carriers and smaller gateways work this way: the header name and
//! the JSON field holding the event id vary per provider and come from
//! configuration. A `sha256=` prefix on the signature is tolerated.

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
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_EVENT_ID_FIELD: &str = "id";

/// What to do with a verified callback body.
#[async_trait]
pub trait InboundAction: Send + Sync {
    async fn apply(&self, incoming: &WebhookIncoming, payload: &Value) -> Result<()>;
}

/// Tracking update reported by a carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentUpdate {
    /// Stored callback this update came from; stable across re-drives
    #[serde(skip)]
    pub incoming_id: IncomingId,
    /// Provider name the update came from
    pub carrier: String,
    pub tracking_number: String,
    pub status: String,
    pub occurred_at: Option<String>,
}

/// Domain side of carrier callbacks.
#[async_trait]
pub trait ShipmentActions: Send + Sync {
    async fn shipment_status_changed(&self, tenant_id: Uuid, update: ShipmentUpdate) -> Result<()>;
}

/// Maps carrier payloads (`tracking_number`, `status`, optional `occurred_at`,
/// either at the top level or under `data`) onto [`ShipmentActions`].
pub struct ShipmentRouter {
    actions: Arc<dyn ShipmentActions>,
}

impl ShipmentRouter {
    pub fn new(actions: Arc<dyn ShipmentActions>) -> Self {
        Self { actions }
    }
}

#[async_trait]
impl InboundAction for ShipmentRouter {
    async fn apply(&self, incoming: &WebhookIncoming, payload: &Value) -> Result<()> {
        let data = payload.get("data").filter(|d| d.is_object()).unwrap_or(payload);
        let field = |name: &str| data.get(name).and_then(Value::as_str).map(str::to_string);

        let update = ShipmentUpdate {
            incoming_id: incoming.id,
            carrier: incoming.provider.clone(),
            tracking_number: field("tracking_number").ok_or_else(|| {
                HookworkError::InvalidPayload {
                    message: "missing tracking_number".to_string(),
                }
            })?,
            status: field("status").ok_or_else(|| HookworkError::InvalidPayload {
                message: "missing status".to_string(),
            })?,
            occurred_at: field("occurred_at"),
        };
        self.actions
            .shipment_status_changed(incoming.tenant_id, update)
            .await
    }
}

pub struct HmacHeaderProvider {
    secret: String,
    signature_header: String,
    event_id_field: String,
    action: Arc<dyn InboundAction>,
}

impl HmacHeaderProvider {
    /// Fails when the provider config names no signature header.
    pub fn new(name: &str, config: &ProviderConfig, action: Arc<dyn InboundAction>) -> Result<Self> {
        let signature_header = config
            .signature_header
            .clone()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| {
                HookworkError::Config(format!("provider '{}' needs a signature_header", name))
            })?;

        Ok(Self {
            secret: config.secret.clone(),
            signature_header,
            event_id_field: config
                .event_id_field
                .clone()
                .unwrap_or_else(|| DEFAULT_EVENT_ID_FIELD.to_string()),
            action,
        })
    }
}

/// Follow a dot-separated path (`data.event_id`) into a JSON document.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| current.get(key))
}

#[async_trait]
impl ProviderHandler for HmacHeaderProvider {
    fn verify(&self, request: &InboundRequest, _now: DateTime<Utc>) -> Result<()> {
        let header = request.header(&self.signature_header).ok_or_else(|| {
            HookworkError::SignatureInvalid {
                message: format!("missing {} header", self.signature_header),
            }
        })?;
        let signature = header.strip_prefix("sha256=").unwrap_or(header);

        if signature::verify(&request.body, signature, &self.secret) {
            Ok(())
        } else {
            Err(HookworkError::SignatureInvalid {
                message: "HMAC-SHA256 signature mismatch".to_string(),
            })
        }
    }

    fn signature(&self, request: &InboundRequest) -> Option<String> {
        request.header(&self.signature_header).map(str::to_string)
    }

    fn external_id(&self, body: &[u8]) -> Option<String> {
        let payload: Value = serde_json::from_slice(body).ok()?;
        match lookup(&payload, &self.event_id_field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    async fn handle(&self, incoming: &WebhookIncoming) -> Result<()> {
        let payload: Value = serde_json::from_slice(&incoming.body)?;
        self.action.apply(incoming, &payload).await
    }
}
