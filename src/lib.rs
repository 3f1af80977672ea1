//! # Hookwork
//!
//! A database-backed webhook delivery engine for multi-tenant platforms: signed,
//! rate-limited, retried fan-out of domain events to tenant-registered HTTP
//! endpoints, plus verified, deduplicated ingestion of third-party provider
//! callbacks.
//!
//! ## Features
//!
//! - **At-least-once delivery**: every attempt is recorded before it is sent, and
//!   failures are retried with a per-endpoint backoff policy capped at 24 hours
//! - **HMAC-SHA256 signatures** on every outbound request (`X-Webhook-Signature`)
//! - **Hourly rate limits** per endpoint, enforced with an atomic check-and-count
//! - **Circuit breaker**: endpoints with 10 consecutive exhausted deliveries stop
//!   receiving new events until re-enabled
//! - **Bounded concurrency**: deliveries run on a pool with a queue and a cap on
//!   in-flight requests
//! - **Inbound providers** with pluggable signature schemes (Stripe-style
//!   timestamped signatures, single-header HMAC) and idempotent handling
//! - **Storage backends**: PostgreSQL (`postgres` feature) and an in-memory store
//! - **Prometheus metrics** (`metrics` feature, enabled by default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hookwork::{
//!     DeliveryPool, DeliveryWorker, EndpointRegistry, EventDispatcher, HookworkConfig,
//!     NewEndpoint, RetryScheduler, WebhookEvent, store::memory::InMemoryStore,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> hookwork::Result<()> {
//!     let config = HookworkConfig::default();
//!     let store = Arc::new(InMemoryStore::new());
//!
//!     // Delivery pool and retry sweep
//!     let worker = Arc::new(DeliveryWorker::new(store.clone(), &config));
//!     let pool = DeliveryPool::start(worker, &config);
//!     let scheduler = RetryScheduler::new(store.clone(), pool.clone(), &config).spawn();
//!
//!     // A tenant registers an endpoint
//!     let tenant_id = Uuid::new_v4();
//!     let registry = EndpointRegistry::new(store.clone(), &config);
//!     let endpoint = registry
//!         .create(
//!             tenant_id,
//!             NewEndpoint::new("https://shop.example.com/hooks", vec![WebhookEvent::OrderCreated]),
//!         )
//!         .await?;
//!     println!("share this secret with the tenant: {}", endpoint.secret);
//!
//!     // Something happened in the shop
//!     let dispatcher = EventDispatcher::new(store.clone(), pool.clone(), &config);
//!     dispatcher
//!         .dispatch(
//!             tenant_id,
//!             WebhookEvent::OrderCreated,
//!             Uuid::new_v4(),
//!             &json!({"order_id": "ord_42", "total": 1999}),
//!         )
//!         .await?;
//!
//!     scheduler.shutdown().await?;
//!     pool.shutdown().await
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Endpoints
//!
//! A [`WebhookEndpoint`] is a tenant's subscription: a URL, the set of
//! [`WebhookEvent`]s it wants, the secret used to sign requests to it, and its retry
//! settings. Endpoints are managed through the [`EndpointRegistry`].
//!
//! ### Deliveries
//!
//! Dispatching an event creates one [`WebhookDelivery`] per subscribed endpoint.
//! A delivery moves `pending → delivering → delivered | failed`; a failed delivery
//! with attempts left carries a `next_retry_at` and is picked up again by the
//! [`RetryScheduler`].
//!
//! ### Inbound webhooks
//!
//! Provider callbacks go through the [`IncomingWebhookProcessor`], which verifies
//! them with the provider's [`ProviderHandler`](inbound::ProviderHandler), stores
//! them as [`WebhookIncoming`] rows and hands them to the handler exactly once per
//! provider event id.

pub mod client;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod inbound;
pub mod incoming;
pub mod metrics;
pub mod migrations;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod signature;
pub mod store;
pub mod worker;

pub use client::DeliveryClient;
pub use config::{HookworkConfig, ProviderConfig, ProviderKind};
pub use delivery::{DeliveryId, DeliveryQuery, DeliveryStatus, WebhookDelivery};
pub use dispatcher::{DispatchSummary, EventDispatcher};
pub use endpoint::{EndpointId, EndpointUpdate, NewEndpoint, WebhookEndpoint};
pub use error::HookworkError;
pub use event::WebhookEvent;
pub use inbound::{IncomingWebhookProcessor, ProviderRegistry, ReceiveOutcome};
pub use incoming::{InboundRequest, IncomingId, WebhookIncoming};
pub use metrics::WebhookMetrics;
pub use rate_limit::{RateLimiter, WebhookRateLimit};
pub use registry::{EndpointRegistry, TestDeliveryResult};
pub use retry::RetryPolicy;
pub use scheduler::{RetryScheduler, SchedulerHandle, SweepReport};
pub use store::WebhookStore;
pub use worker::{DeliveryPool, DeliveryWorker};

/// Convenient type alias for Results with [`HookworkError`] as the error type.
pub type Result<T> = std::result::Result<T, HookworkError>;
