//! Inbound provider callbacks as received and persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type IncomingId = Uuid;

/// A received third-party webhook.
///
/// The raw body is kept byte for byte for audit. Rows with `is_verified = false`
/// are never handed to a provider handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookIncoming {
    pub id: IncomingId,
    pub tenant_id: Uuid,
    pub provider: String,
    /// Provider's own event id, the idempotency key together with tenant and provider
    pub external_event_id: Option<String>,
    pub signature: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub is_verified: bool,
    pub is_processed: bool,
    /// When the current handler run claimed the row; a run holds it for the
    /// processor's claim lease
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Transport-level view of a callback handed to the processor by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundRequest {
    /// Header names lower-cased
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub source_ip: Option<String>,
}

impl InboundRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

impl WebhookIncoming {
    /// Snapshot `request` as an unprocessed row.
    pub fn from_request(
        tenant_id: Uuid,
        provider: &str,
        request: &InboundRequest,
        external_event_id: Option<String>,
        signature: Option<String>,
        is_verified: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            provider: provider.to_string(),
            external_event_id,
            signature,
            headers: request.headers.clone(),
            body: request.body.clone(),
            source_ip: request.source_ip.clone(),
            user_agent: request.user_agent().map(str::to_string),
            is_verified,
            is_processed: false,
            processing_started_at: None,
            processed_at: None,
            processing_error: None,
            received_at: Utc::now(),
        }
    }

    /// Whether a handler may start on this row at `now`: verified, not yet
    /// processed and not held by a run that started after `lease_expired_before`.
    pub fn is_claimable(&self, lease_expired_before: DateTime<Utc>) -> bool {
        self.is_verified
            && !self.is_processed
            && self
                .processing_started_at
                .is_none_or(|started| started <= lease_expired_before)
    }
}
