//! Inbound provider callbacks: verification, persistence and routing.
//!
//! Each provider (payment gateway, shipping carrier, ...) is a [`ProviderHandler`]
//! registered under a name in the [`ProviderRegistry`]. The
//! [`IncomingWebhookProcessor`] runs every callback through the same pipeline:
//!
//! 1. look up the handler by provider name;
//! 2. verify the provider's signature scheme; failures are stored unverified for
//!    audit and rejected, no handler runs;
//! 3. persist the verified callback, deduplicated on the provider's event id;
//! 4. claim the row, run the handler in a background task and mark the row
//!    processed.
//!
//! The scheduler re-drives verified rows that were never marked processed, so a
//! crash between steps 3 and 4 delays handling instead of losing it. A handler
//! only runs under a claim, and a claim holds the row for the claim lease, so a
//! re-drive never overlaps a run that is still in flight.

pub mod hmac_header;
pub mod stripe;

pub use hmac_header::{
    HmacHeaderProvider, InboundAction, ShipmentActions, ShipmentRouter, ShipmentUpdate,
};
pub use stripe::{PaymentActions, PaymentUpdate, StripeProvider};

use crate::{
    HookworkError, Result,
    config::{ProviderConfig, ProviderKind},
    incoming::{InboundRequest, IncomingId, WebhookIncoming},
    metrics::WebhookMetrics,
    store::WebhookStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A provider's signing scheme plus the translation of its callbacks into
/// domain actions.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Check the request's signature. `Err(SignatureInvalid)` rejects it.
    fn verify(&self, request: &InboundRequest, now: DateTime<Utc>) -> Result<()>;

    /// Raw signature header, kept on the stored row.
    fn signature(&self, request: &InboundRequest) -> Option<String>;

    /// Provider-assigned id of the event, used to drop redeliveries.
    fn external_id(&self, body: &[u8]) -> Option<String>;

    /// Apply a verified callback.
    async fn handle(&self, incoming: &WebhookIncoming) -> Result<()>;
}

/// Provider name → handler.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    handlers: HashMap<String, Arc<dyn ProviderHandler>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build handlers for every configured provider.
    ///
    /// `stripe` providers report to `payments`; `hmac_header` providers report
    /// shipment status changes to `shipments`.
    pub fn from_config(
        providers: &HashMap<String, ProviderConfig>,
        payments: Arc<dyn PaymentActions>,
        shipments: Arc<dyn ShipmentActions>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for (name, config) in providers {
            if config.secret.is_empty() {
                return Err(HookworkError::Config(format!(
                    "provider '{}' has an empty secret",
                    name
                )));
            }
            let handler: Arc<dyn ProviderHandler> = match config.kind {
                ProviderKind::Stripe => Arc::new(StripeProvider::new(config, payments.clone())),
                ProviderKind::HmacHeader => Arc::new(HmacHeaderProvider::new(
                    name,
                    config,
                    Arc::new(ShipmentRouter::new(shipments.clone())),
                )?),
            };
            registry = registry.register(name, handler);
        }
        Ok(registry)
    }

    pub fn register(mut self, name: &str, handler: Arc<dyn ProviderHandler>) -> Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// How a callback that passed verification was taken in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReceiveOutcome {
    /// Stored and queued for handling
    Accepted { incoming_id: IncomingId },
    /// Already received under the same provider event id; nothing was done
    Duplicate { external_event_id: String },
}

#[derive(Clone)]
pub struct IncomingWebhookProcessor {
    store: Arc<dyn WebhookStore>,
    providers: Arc<ProviderRegistry>,
    metrics: Option<Arc<WebhookMetrics>>,
    claim_lease: ChronoDuration,
}

impl IncomingWebhookProcessor {
    pub fn new(store: Arc<dyn WebhookStore>, providers: ProviderRegistry) -> Self {
        Self {
            store,
            providers: Arc::new(providers),
            metrics: None,
            claim_lease: ChronoDuration::hours(1),
        }
    }

    /// How long a handler run owns its row.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = ChronoDuration::from_std(lease).unwrap_or(self.claim_lease);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WebhookMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Verify and store one callback, then handle it in the background.
    pub async fn receive(
        &self,
        tenant_id: Uuid,
        provider: &str,
        request: InboundRequest,
    ) -> Result<ReceiveOutcome> {
        let handler = self
            .providers
            .get(provider)
            .ok_or_else(|| HookworkError::UnknownProvider {
                provider: provider.to_string(),
            })?;

        let signature = handler.signature(&request);
        let external_id = handler.external_id(&request.body);

        if let Err(e) = handler.verify(&request, Utc::now()) {
            warn!(
                tenant_id = %tenant_id,
                provider,
                source_ip = request.source_ip.as_deref().unwrap_or_default(),
                error = %e,
                "Rejected inbound webhook"
            );
            let audit = WebhookIncoming::from_request(
                tenant_id,
                provider,
                &request,
                external_id,
                signature,
                false,
            );
            if let Err(store_err) = self.store.insert_incoming(&audit).await {
                warn!(provider, error = %store_err, "Failed to store rejected webhook for audit");
            }
            self.record(provider, "rejected");
            return Err(e);
        }

        let incoming = WebhookIncoming::from_request(
            tenant_id,
            provider,
            &request,
            external_id,
            signature,
            true,
        );

        if !self.store.insert_incoming(&incoming).await? {
            let external_event_id = incoming.external_event_id.unwrap_or_default();
            info!(
                tenant_id = %tenant_id,
                provider,
                external_event_id = %external_event_id,
                "Ignoring redelivered inbound webhook"
            );
            self.record(provider, "duplicate");
            return Ok(ReceiveOutcome::Duplicate { external_event_id });
        }

        debug!(
            tenant_id = %tenant_id,
            provider,
            incoming_id = %incoming.id,
            "Stored inbound webhook"
        );
        self.record(provider, "accepted");

        let incoming_id = incoming.id;
        let processor = self.clone();
        tokio::spawn(async move {
            processor.process(incoming).await;
        });

        Ok(ReceiveOutcome::Accepted { incoming_id })
    }

    /// Claim a stored, verified callback, run its handler and mark it processed.
    ///
    /// Returns `false` without running anything when the row is unverified,
    /// already processed or claimed by a run whose lease has not expired.
    pub async fn process(&self, incoming: WebhookIncoming) -> bool {
        self.process_at(incoming, Utc::now()).await
    }

    pub async fn process_at(&self, incoming: WebhookIncoming, now: DateTime<Utc>) -> bool {
        if !incoming.is_claimable(now - self.claim_lease) {
            return false;
        }
        let Some(handler) = self.providers.get(&incoming.provider) else {
            warn!(
                incoming_id = %incoming.id,
                provider = %incoming.provider,
                "No handler registered for stored webhook"
            );
            return false;
        };

        let incoming = match self
            .store
            .claim_incoming(incoming.tenant_id, incoming.id, now, now - self.claim_lease)
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(incoming_id = %incoming.id, "Inbound webhook is handled elsewhere");
                return false;
            }
            Err(e) => {
                error!(incoming_id = %incoming.id, error = %e, "Failed to claim inbound webhook");
                return false;
            }
        };

        let processing_error = match handler.handle(&incoming).await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    tenant_id = %incoming.tenant_id,
                    provider = %incoming.provider,
                    incoming_id = %incoming.id,
                    error = %e,
                    "Inbound webhook handler failed"
                );
                self.record(&incoming.provider, "failed");
                Some(e.to_string())
            }
        };

        match self
            .store
            .mark_incoming_processed(incoming.tenant_id, incoming.id, processing_error, Utc::now())
            .await
        {
            Ok(true) => debug!(incoming_id = %incoming.id, "Inbound webhook processed"),
            Ok(false) => debug!(incoming_id = %incoming.id, "Inbound webhook was already processed"),
            Err(e) => error!(
                incoming_id = %incoming.id,
                error = %e,
                "Failed to mark inbound webhook processed"
            ),
        }
        true
    }

    fn record(&self, provider: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_incoming(provider, outcome);
        }
    }
}
