//! Delivery records: one per (event, endpoint) pair.
//!
//! A delivery moves through a small state machine:
//!
//! ```text
//! pending ──► delivering ──► delivered
//!    ▲            │
//!    │            ▼
//!    └──────── failed ──(attempts exhausted)──► terminal failed
//! ```
//!
//! `delivered` is terminal. `failed` with `next_retry_at = None` is terminal.
//! `attempt_count` never decreases and never exceeds `max_attempts`.

use crate::{endpoint::WebhookEndpoint, event::WebhookEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

pub type DeliveryId = Uuid;

/// Error recorded on an attempt whose outcome was never stored.
pub const INTERRUPTED_ATTEMPT: &str = "attempt interrupted before its outcome was recorded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivering,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivering => "delivering",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "delivering" => Some(DeliveryStatus::Delivering),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event's delivery to a single endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub tenant_id: Uuid,
    pub endpoint_id: Uuid,
    pub event_type: WebhookEvent,
    /// Producer's id for the source event, for receiver-side correlation
    pub event_id: Uuid,
    /// Serialized once at dispatch, sent byte-for-byte on every attempt
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    /// Target URL at the time of the last attempt
    pub request_url: String,
    /// Headers of the last request, signature included
    pub request_headers: BTreeMap<String, String>,
    pub response_status: Option<i32>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// A fresh pending delivery of `payload` to `endpoint`.
    pub fn new(
        endpoint: &WebhookEndpoint,
        event_type: WebhookEvent,
        event_id: Uuid,
        payload: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: endpoint.tenant_id,
            endpoint_id: endpoint.id,
            event_type,
            event_id,
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: endpoint.max_attempts(),
            request_url: endpoint.url.clone(),
            request_headers: BTreeMap::new(),
            response_status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            response_time_ms: None,
            error_message: None,
            last_attempt_at: None,
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            DeliveryStatus::Delivered => true,
            DeliveryStatus::Failed => self.next_retry_at.is_none(),
            DeliveryStatus::Pending | DeliveryStatus::Delivering => false,
        }
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Whether a worker may start another attempt on this delivery.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Pending | DeliveryStatus::Failed
        ) && self.has_attempts_remaining()
    }

    /// Whether the retry sweep should pick this delivery up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Failed
            && self.has_attempts_remaining()
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Claim the next attempt: `pending|failed → delivering`, one more attempt used.
    ///
    /// Returns `false` and leaves the record untouched when the delivery is not claimable.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_claimable() {
            return false;
        }
        self.status = DeliveryStatus::Delivering;
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        true
    }

    /// Fail an attempt stuck in `delivering`. With attempts left the delivery is
    /// due again at `now`, otherwise it is terminal.
    ///
    /// Returns `false` and leaves the record untouched unless it is delivering.
    pub fn interrupt(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != DeliveryStatus::Delivering {
            return false;
        }
        self.status = DeliveryStatus::Failed;
        self.failed_at = Some(now);
        self.error_message = Some(INTERRUPTED_ATTEMPT.to_string());
        self.next_retry_at = self.has_attempts_remaining().then_some(now);
        self.updated_at = now;
        true
    }

    /// Record the outcome of the attempt in flight.
    pub fn record(&mut self, outcome: &AttemptOutcome, now: DateTime<Utc>) {
        self.request_url = outcome.request_url.clone();
        self.request_headers = outcome.request_headers.clone();
        self.response_status = outcome.response_status;
        self.response_headers = outcome.response_headers.clone();
        self.response_body = outcome.response_body.clone();
        self.response_time_ms = Some(outcome.response_time_ms);
        self.updated_at = now;
        if outcome.success {
            self.status = DeliveryStatus::Delivered;
            self.delivered_at = Some(now);
            self.error_message = None;
            self.next_retry_at = None;
        } else {
            self.status = DeliveryStatus::Failed;
            self.failed_at = Some(now);
            self.error_message = outcome.error_message.clone();
            self.next_retry_at = if self.has_attempts_remaining() {
                outcome.next_retry_at
            } else {
                None
            };
        }
    }
}

/// Result of one HTTP attempt, as persisted on the delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub success: bool,
    pub request_url: String,
    pub request_headers: BTreeMap<String, String>,
    pub response_status: Option<i32>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub response_time_ms: i64,
    pub error_message: Option<String>,
    /// When to retry; ignored on success or when no attempts remain
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Paging parameters for delivery listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryQuery {
    pub limit: i64,
    pub offset: i64,
}

impl Default for DeliveryQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}
