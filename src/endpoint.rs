//! Webhook endpoints: a tenant's subscription target.
//!
//! A [`WebhookEndpoint`] couples a URL with the set of events it wants, the HMAC
//! secret used to sign deliveries, delivery tuning (retry policy, attempt budget,
//! timeout) and health bookkeeping written by the delivery worker.
//!
//! # Examples
//!
//! ```rust
//! use hookwork::endpoint::{NewEndpoint, WebhookEndpoint};
//! use hookwork::event::WebhookEvent;
//! use uuid::Uuid;
//!
//! let tenant_id = Uuid::new_v4();
//! let request = NewEndpoint::new(
//!     "https://shop.example.com/hooks",
//!     vec![WebhookEvent::OrderCreated, WebhookEvent::PaymentSucceeded],
//! )
//! .with_description("storefront sync")
//! .with_max_retries(3);
//!
//! let endpoint = WebhookEndpoint::from_request(tenant_id, request).unwrap();
//! assert!(endpoint.secret.starts_with("whsec_"));
//! assert!(endpoint.subscribes_to(WebhookEvent::OrderCreated));
//! assert!(!endpoint.subscribes_to(WebhookEvent::ProductDeleted));
//! ```

use crate::{HookworkError, Result, event::WebhookEvent, retry::RetryPolicy, signature};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, time::Duration};
use uuid::Uuid;

pub type EndpointId = Uuid;

/// Default number of attempts per delivery.
pub const DEFAULT_MAX_RETRIES: i32 = 5;
/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: i32 = 30;
/// Upper bound accepted for a per-request timeout.
pub const MAX_TIMEOUT_SECS: i32 = 300;

/// A tenant-registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: EndpointId,
    pub tenant_id: Uuid,
    pub url: String,
    pub description: Option<String>,
    /// Events this endpoint is subscribed to
    pub events: BTreeSet<WebhookEvent>,
    /// HMAC key for `X-Webhook-Signature`. Never empty once created.
    pub secret: String,
    pub active: bool,
    pub retry_policy: RetryPolicy,
    /// Total attempt budget for each delivery to this endpoint
    pub max_retries: i32,
    pub timeout_secs: i32,
    pub last_delivery_at: Option<DateTime<Utc>>,
    /// HTTP status of the last attempt, `None` when it never got a response
    pub last_status: Option<i32>,
    /// Consecutive terminally failed deliveries
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the endpoint is removed; deleted endpoints are invisible to tenants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WebhookEndpoint {
    /// Build and validate a new endpoint from a creation request, generating a
    /// secret when none is supplied.
    pub fn from_request(tenant_id: Uuid, request: NewEndpoint) -> Result<Self> {
        validate_url(&request.url)?;
        validate_events(&request.events)?;

        let max_retries = request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        validate_max_retries(max_retries)?;
        let timeout_secs = request.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        validate_timeout(timeout_secs)?;

        let secret = match request.secret {
            Some(secret) if !secret.trim().is_empty() => secret,
            _ => signature::generate_secret(),
        };

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id,
            url: request.url,
            description: request.description,
            events: request.events.into_iter().collect(),
            secret,
            active: request.active.unwrap_or(true),
            retry_policy: request.retry_policy.unwrap_or_default(),
            max_retries,
            timeout_secs,
            last_delivery_at: None,
            last_status: None,
            failure_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn subscribes_to(&self, event: WebhookEvent) -> bool {
        self.events.contains(&event)
    }

    /// Whether the consecutive failure count has tripped the circuit breaker.
    pub fn is_circuit_open(&self, failure_threshold: i32) -> bool {
        self.failure_count >= failure_threshold
    }

    /// Active, subscribed and not tripped: eligible for new deliveries of `event`.
    pub fn accepts(&self, event: WebhookEvent, failure_threshold: i32) -> bool {
        self.deleted_at.is_none()
            && self.active
            && self.subscribes_to(event)
            && !self.is_circuit_open(failure_threshold)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1) as u64)
    }

    /// Attempt budget for deliveries created for this endpoint.
    pub fn max_attempts(&self) -> i32 {
        self.max_retries.max(1)
    }

    /// Merge a partial update. Ownership (`id`, `tenant_id`) never changes.
    ///
    /// Returns whether the update re-arms the circuit breaker, which an explicit
    /// `active: true` does. The store resets the stored failure count only then.
    pub fn apply_update(&mut self, update: EndpointUpdate) -> Result<bool> {
        if let Some(url) = update.url {
            validate_url(&url)?;
            self.url = url;
        }
        if let Some(description) = update.description {
            self.description = Some(description);
        }
        if let Some(events) = update.events {
            validate_events(&events)?;
            self.events = events.into_iter().collect();
        }
        if let Some(secret) = update.secret {
            if secret.trim().is_empty() {
                return Err(HookworkError::InvalidEndpoint {
                    message: "secret must not be empty".to_string(),
                });
            }
            self.secret = secret;
        }
        if let Some(retry_policy) = update.retry_policy {
            self.retry_policy = retry_policy;
        }
        if let Some(max_retries) = update.max_retries {
            validate_max_retries(max_retries)?;
            self.max_retries = max_retries;
        }
        if let Some(timeout_secs) = update.timeout_secs {
            validate_timeout(timeout_secs)?;
            self.timeout_secs = timeout_secs;
        }
        let rearm = update.active == Some(true);
        if let Some(active) = update.active {
            self.active = active;
        }
        if rearm {
            self.failure_count = 0;
        }
        self.updated_at = Utc::now();
        Ok(rearm)
    }
}

/// Request to register a new endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEndpoint {
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub events: Vec<WebhookEvent>,
    /// Use this secret instead of generating one
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub timeout_secs: Option<i32>,
}

impl NewEndpoint {
    pub fn new(url: impl Into<String>, events: Vec<WebhookEvent>) -> Self {
        Self {
            url: url.into(),
            events,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: i32) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = Some(false);
        self
    }
}

/// Partial update of an endpoint; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<WebhookEvent>>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub timeout_secs: Option<i32>,
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| HookworkError::InvalidEndpoint {
        message: format!("malformed url '{}': {}", url, e),
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(HookworkError::InvalidEndpoint {
                message: format!("url scheme '{}' is not http or https", scheme),
            });
        }
    }
    if parsed.host_str().is_none() {
        return Err(HookworkError::InvalidEndpoint {
            message: format!("url '{}' has no host", url),
        });
    }
    Ok(())
}

fn validate_events(events: &[WebhookEvent]) -> Result<()> {
    if events.is_empty() {
        return Err(HookworkError::InvalidEndpoint {
            message: "an endpoint must subscribe to at least one event".to_string(),
        });
    }
    Ok(())
}

fn validate_max_retries(max_retries: i32) -> Result<()> {
    if max_retries < 1 {
        return Err(HookworkError::InvalidEndpoint {
            message: format!("max_retries must be at least 1, got {}", max_retries),
        });
    }
    Ok(())
}

fn validate_timeout(timeout_secs: i32) -> Result<()> {
    if !(1..=MAX_TIMEOUT_SECS).contains(&timeout_secs) {
        return Err(HookworkError::InvalidEndpoint {
            message: format!(
                "timeout_secs must be between 1 and {}, got {}",
                MAX_TIMEOUT_SECS, timeout_secs
            ),
        });
    }
    Ok(())
}
