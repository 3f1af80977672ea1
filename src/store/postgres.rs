//! PostgreSQL implementation of [`WebhookStore`].
//!
//! Concurrency-sensitive writes are single statements so that concurrent delivery
//! tasks serialize on the row lock instead of racing a read-then-write:
//!
//! - `begin_attempt` is a conditional `UPDATE ... RETURNING`
//! - stuck attempts are expired with `FOR UPDATE SKIP LOCKED`, so concurrent
//!   sweepers never expire the same row twice
//! - endpoint health is updated with in-place increments and resets
//! - rate-limit counters are an `INSERT ... ON CONFLICT DO UPDATE ... WHERE` upsert
//! - duplicate inbound events are rejected by a partial unique index

use crate::{
    HookworkError, Result,
    delivery::{
        AttemptOutcome, DeliveryId, DeliveryQuery, DeliveryStatus, INTERRUPTED_ATTEMPT,
        WebhookDelivery,
    },
    endpoint::{EndpointId, WebhookEndpoint},
    event::WebhookEvent,
    incoming::{IncomingId, WebhookIncoming},
    rate_limit::WebhookRateLimit,
    retry::RetryPolicy,
    store::{HealthUpdate, WebhookStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, types::Json};
use std::collections::BTreeMap;
use uuid::Uuid;

const ENDPOINT_COLUMNS: &str = "id, tenant_id, url, description, events, secret, active, \
     retry_policy, max_retries, timeout_secs, last_delivery_at, last_status, failure_count, \
     created_at, updated_at, deleted_at";

const DELIVERY_COLUMNS: &str = "id, tenant_id, endpoint_id, event_type, event_id, payload, \
     status, attempt_count, max_attempts, request_url, request_headers, response_status, \
     response_headers, response_body, response_time_ms, error_message, last_attempt_at, \
     next_retry_at, delivered_at, failed_at, created_at, updated_at";

/// Delivery columns prefixed with the `d` alias, for queries joining endpoints.
fn qualified_delivery_columns() -> String {
    DELIVERY_COLUMNS
        .split(',')
        .map(|c| format!("d.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

const RATE_LIMIT_COLUMNS: &str =
    "tenant_id, endpoint_id, window_start, window_end, request_count, request_limit";

const INCOMING_COLUMNS: &str = "id, tenant_id, provider, external_event_id, signature, headers, \
     body, source_ip, user_agent, is_verified, is_processed, processing_started_at, processed_at, \
     processing_error, received_at";

#[derive(FromRow)]
pub(crate) struct EndpointRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub url: String,
    pub description: Option<String>,
    pub events: Vec<String>,
    pub secret: String,
    pub active: bool,
    pub retry_policy: String,
    pub max_retries: i32,
    pub timeout_secs: i32,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_status: Option<i32>,
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl EndpointRow {
    pub fn into_endpoint(self) -> Result<WebhookEndpoint> {
        let events = self
            .events
            .iter()
            .map(|name| name.parse::<WebhookEvent>())
            .collect::<Result<_>>()?;
        Ok(WebhookEndpoint {
            id: self.id,
            tenant_id: self.tenant_id,
            url: self.url,
            description: self.description,
            events,
            secret: self.secret,
            active: self.active,
            retry_policy: self.retry_policy.parse().unwrap_or(RetryPolicy::Quadratic),
            max_retries: self.max_retries,
            timeout_secs: self.timeout_secs,
            last_delivery_at: self.last_delivery_at,
            last_status: self.last_status,
            failure_count: self.failure_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct DeliveryRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub endpoint_id: Uuid,
    pub event_type: String,
    pub event_id: Uuid,
    pub payload: String,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub request_url: String,
    pub request_headers: Json<BTreeMap<String, String>>,
    pub response_status: Option<i32>,
    pub response_headers: Json<BTreeMap<String, String>>,
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

impl DeliveryRow {
    pub fn into_delivery(self) -> Result<WebhookDelivery> {
        let status = DeliveryStatus::parse(&self.status).ok_or_else(|| HookworkError::Storage {
            message: format!("unknown delivery status '{}'", self.status),
        })?;
        Ok(WebhookDelivery {
            id: self.id,
            tenant_id: self.tenant_id,
            endpoint_id: self.endpoint_id,
            event_type: self.event_type.parse()?,
            event_id: self.event_id,
            payload: self.payload,
            status,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            request_url: self.request_url,
            request_headers: self.request_headers.0,
            response_status: self.response_status,
            response_headers: self.response_headers.0,
            response_body: self.response_body,
            response_time_ms: self.response_time_ms,
            error_message: self.error_message,
            last_attempt_at: self.last_attempt_at,
            next_retry_at: self.next_retry_at,
            delivered_at: self.delivered_at,
            failed_at: self.failed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct RateLimitRow {
    pub tenant_id: Uuid,
    pub endpoint_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub request_count: i32,
    pub request_limit: i32,
}

impl From<RateLimitRow> for WebhookRateLimit {
    fn from(row: RateLimitRow) -> Self {
        Self {
            tenant_id: row.tenant_id,
            endpoint_id: row.endpoint_id,
            window_start: row.window_start,
            window_end: row.window_end,
            request_count: row.request_count,
            limit: row.request_limit,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct IncomingRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    pub external_event_id: Option<String>,
    pub signature: Option<String>,
    pub headers: Json<BTreeMap<String, String>>,
    pub body: Vec<u8>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub is_verified: bool,
    pub is_processed: bool,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl From<IncomingRow> for WebhookIncoming {
    fn from(row: IncomingRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            provider: row.provider,
            external_event_id: row.external_event_id,
            signature: row.signature,
            headers: row.headers.0,
            body: row.body,
            source_ip: row.source_ip,
            user_agent: row.user_agent,
            is_verified: row.is_verified,
            is_processed: row.is_processed,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
            processing_error: row.processing_error,
            received_at: row.received_at,
        }
    }
}

fn event_names(endpoint: &WebhookEndpoint) -> Vec<String> {
    endpoint.events.iter().map(|e| e.as_str().to_string()).collect()
}

/// Postgres-backed store. Run the migrations before use.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` with a pool of at most `pool_size` connections.
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WebhookStore for PostgresStore {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hookwork_endpoints
                (id, tenant_id, url, description, events, secret, active, retry_policy,
                 max_retries, timeout_secs, failure_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(endpoint.id)
        .bind(endpoint.tenant_id)
        .bind(&endpoint.url)
        .bind(&endpoint.description)
        .bind(event_names(endpoint))
        .bind(&endpoint.secret)
        .bind(endpoint.active)
        .bind(endpoint.retry_policy.as_str())
        .bind(endpoint.max_retries)
        .bind(endpoint.timeout_secs)
        .bind(endpoint.failure_count)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_endpoint(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
    ) -> Result<Option<WebhookEndpoint>> {
        let row: Option<EndpointRow> = sqlx::query_as(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM hookwork_endpoints
             WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"
        ))
        .bind(endpoint_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EndpointRow::into_endpoint).transpose()
    }

    async fn list_endpoints(&self, tenant_id: Uuid) -> Result<Vec<WebhookEndpoint>> {
        let rows: Vec<EndpointRow> = sqlx::query_as(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM hookwork_endpoints
             WHERE tenant_id = $1 AND deleted_at IS NULL
             ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EndpointRow::into_endpoint).collect()
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint, rearm: bool) -> Result<bool> {
        // failure_count is only ever reset here; increments belong to record_endpoint_attempt
        let result = sqlx::query(
            r#"
            UPDATE hookwork_endpoints
            SET url = $3, description = $4, events = $5, secret = $6, active = $7,
                retry_policy = $8, max_retries = $9, timeout_secs = $10,
                failure_count = CASE WHEN $11 THEN 0 ELSE failure_count END,
                updated_at = $12
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(endpoint.id)
        .bind(endpoint.tenant_id)
        .bind(&endpoint.url)
        .bind(&endpoint.description)
        .bind(event_names(endpoint))
        .bind(&endpoint.secret)
        .bind(endpoint.active)
        .bind(endpoint.retry_policy.as_str())
        .bind(endpoint.max_retries)
        .bind(endpoint.timeout_secs)
        .bind(rearm)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_endpoint(&self, tenant_id: Uuid, endpoint_id: EndpointId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE hookwork_endpoints
             SET deleted_at = $3, active = FALSE, updated_at = $3
             WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
        )
        .bind(endpoint_id)
        .bind(tenant_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_subscribed_endpoints(
        &self,
        tenant_id: Uuid,
        event: WebhookEvent,
        failure_threshold: i32,
    ) -> Result<Vec<WebhookEndpoint>> {
        let rows: Vec<EndpointRow> = sqlx::query_as(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM hookwork_endpoints
             WHERE tenant_id = $1 AND deleted_at IS NULL AND active
               AND events @> ARRAY[$2]::TEXT[] AND failure_count < $3
             ORDER BY created_at"
        ))
        .bind(tenant_id)
        .bind(event.as_str())
        .bind(failure_threshold)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EndpointRow::into_endpoint).collect()
    }

    async fn record_endpoint_attempt(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        status: Option<i32>,
        update: HealthUpdate,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let failure_count = match update {
            HealthUpdate::Succeeded => "0",
            HealthUpdate::Unchanged => "failure_count",
            HealthUpdate::Exhausted => "failure_count + 1",
        };
        sqlx::query(&format!(
            "UPDATE hookwork_endpoints
             SET last_delivery_at = $3, last_status = $4, failure_count = {failure_count}
             WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"
        ))
        .bind(endpoint_id)
        .bind(tenant_id)
        .bind(at)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hookwork_deliveries
                (id, tenant_id, endpoint_id, event_type, event_id, payload, status,
                 attempt_count, max_attempts, request_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.tenant_id)
        .bind(delivery.endpoint_id)
        .bind(delivery.event_type.as_str())
        .bind(delivery.event_id)
        .bind(&delivery.payload)
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_count)
        .bind(delivery.max_attempts)
        .bind(&delivery.request_url)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_delivery(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
    ) -> Result<Option<WebhookDelivery>> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM hookwork_deliveries WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(delivery_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeliveryRow::into_delivery).transpose()
    }

    async fn list_deliveries(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        query: DeliveryQuery,
    ) -> Result<Vec<WebhookDelivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM hookwork_deliveries
             WHERE tenant_id = $1 AND endpoint_id = $2
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4"
        ))
        .bind(tenant_id)
        .bind(endpoint_id)
        .bind(query.limit.max(0))
        .bind(query.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRow::into_delivery).collect()
    }

    async fn begin_attempt(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookDelivery>> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "UPDATE hookwork_deliveries
             SET status = 'delivering', attempt_count = attempt_count + 1,
                 last_attempt_at = $3, next_retry_at = NULL, updated_at = $3
             WHERE id = $1 AND tenant_id = $2
               AND status IN ('pending', 'failed')
               AND attempt_count < max_attempts
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(delivery_id)
        .bind(tenant_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeliveryRow::into_delivery).transpose()
    }

    async fn complete_attempt(
        &self,
        tenant_id: Uuid,
        delivery_id: DeliveryId,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<WebhookDelivery> {
        let status = if outcome.success {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Failed
        };
        let error_message = if outcome.success {
            None
        } else {
            outcome.error_message.clone()
        };
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "UPDATE hookwork_deliveries
             SET status = $3, request_url = $4, request_headers = $5,
                 response_status = $6, response_headers = $7, response_body = $8,
                 response_time_ms = $9, error_message = $10, updated_at = $11,
                 delivered_at = CASE WHEN $3 = 'delivered' THEN $11 ELSE delivered_at END,
                 failed_at = CASE WHEN $3 = 'failed' THEN $11 ELSE failed_at END,
                 next_retry_at = CASE
                     WHEN $3 = 'failed' AND attempt_count < max_attempts THEN $12
                     ELSE NULL
                 END
             WHERE id = $1 AND tenant_id = $2 AND status = 'delivering'
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(delivery_id)
        .bind(tenant_id)
        .bind(status.as_str())
        .bind(&outcome.request_url)
        .bind(Json(&outcome.request_headers))
        .bind(outcome.response_status)
        .bind(Json(&outcome.response_headers))
        .bind(&outcome.response_body)
        .bind(outcome.response_time_ms)
        .bind(error_message)
        .bind(now)
        .bind(outcome.next_retry_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_delivery(),
            None => match self.get_delivery(tenant_id, delivery_id).await? {
                Some(current) => Err(HookworkError::Storage {
                    message: format!(
                        "delivery {} is {}, not delivering",
                        delivery_id, current.status
                    ),
                }),
                None => Err(HookworkError::DeliveryNotFound {
                    id: delivery_id.to_string(),
                }),
            },
        }
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM hookwork_deliveries d
             JOIN hookwork_endpoints e ON e.id = d.endpoint_id AND e.tenant_id = d.tenant_id
             WHERE d.status = 'failed' AND d.next_retry_at <= $1
               AND d.attempt_count < d.max_attempts
               AND e.deleted_at IS NULL
             ORDER BY d.next_retry_at
             LIMIT $2",
            qualified_delivery_columns()
        ))
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRow::into_delivery).collect()
    }

    async fn stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM hookwork_deliveries d
             JOIN hookwork_endpoints e ON e.id = d.endpoint_id AND e.tenant_id = d.tenant_id
             WHERE d.status = 'pending' AND d.created_at <= $1
               AND e.deleted_at IS NULL
             ORDER BY d.created_at
             LIMIT $2",
            qualified_delivery_columns()
        ))
        .bind(created_before)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRow::into_delivery).collect()
    }

    async fn expire_stale_attempts(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "UPDATE hookwork_deliveries
             SET status = 'failed', failed_at = $2, updated_at = $2, error_message = $4,
                 next_retry_at = CASE WHEN attempt_count < max_attempts THEN $2 ELSE NULL END
             WHERE id IN (
                 SELECT id FROM hookwork_deliveries
                 WHERE status = 'delivering' AND last_attempt_at <= $1
                 ORDER BY last_attempt_at
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             ) AND status = 'delivering'
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(started_before)
        .bind(now)
        .bind(limit.max(0))
        .bind(INTERRUPTED_ATTEMPT)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRow::into_delivery).collect()
    }

    async fn get_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
    ) -> Result<Option<WebhookRateLimit>> {
        let row: Option<RateLimitRow> = sqlx::query_as(&format!(
            "SELECT {RATE_LIMIT_COLUMNS} FROM hookwork_rate_limits
             WHERE tenant_id = $1 AND endpoint_id = $2"
        ))
        .bind(tenant_id)
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WebhookRateLimit::from))
    }

    async fn increment_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<WebhookRateLimit> {
        let window = WebhookRateLimit::open(tenant_id, endpoint_id, limit, now, 1);
        let row: RateLimitRow = sqlx::query_as(&format!(
            "INSERT INTO hookwork_rate_limits AS r ({RATE_LIMIT_COLUMNS})
             VALUES ($1, $2, $3, $4, 1, $5)
             ON CONFLICT (tenant_id, endpoint_id) DO UPDATE SET
                 window_start = CASE WHEN r.window_end <= $6 THEN EXCLUDED.window_start ELSE r.window_start END,
                 window_end = CASE WHEN r.window_end <= $6 THEN EXCLUDED.window_end ELSE r.window_end END,
                 request_count = CASE WHEN r.window_end <= $6 THEN 1 ELSE r.request_count + 1 END,
                 request_limit = EXCLUDED.request_limit
             RETURNING {RATE_LIMIT_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(endpoint_id)
        .bind(window.window_start)
        .bind(window.window_end)
        .bind(limit)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn try_acquire_rate_limit(
        &self,
        tenant_id: Uuid,
        endpoint_id: EndpointId,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if limit <= 0 {
            return Ok(false);
        }
        let window = WebhookRateLimit::open(tenant_id, endpoint_id, limit, now, 1);
        let acquired: Option<(i32,)> = sqlx::query_as(&format!(
            "INSERT INTO hookwork_rate_limits AS r ({RATE_LIMIT_COLUMNS})
             VALUES ($1, $2, $3, $4, 1, $5)
             ON CONFLICT (tenant_id, endpoint_id) DO UPDATE SET
                 window_start = CASE WHEN r.window_end <= $6 THEN EXCLUDED.window_start ELSE r.window_start END,
                 window_end = CASE WHEN r.window_end <= $6 THEN EXCLUDED.window_end ELSE r.window_end END,
                 request_count = CASE WHEN r.window_end <= $6 THEN 1 ELSE r.request_count + 1 END,
                 request_limit = EXCLUDED.request_limit
             WHERE r.window_end <= $6 OR r.request_count < EXCLUDED.request_limit
             RETURNING request_count"
        ))
        .bind(tenant_id)
        .bind(endpoint_id)
        .bind(window.window_start)
        .bind(window.window_end)
        .bind(limit)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn purge_rate_limits(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM hookwork_rate_limits WHERE window_end < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_incoming(&self, incoming: &WebhookIncoming) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO hookwork_incoming
                (id, tenant_id, provider, external_event_id, signature, headers, body,
                 source_ip, user_agent, is_verified, is_processed, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (tenant_id, provider, external_event_id)
                WHERE is_verified AND external_event_id IS NOT NULL
            DO NOTHING
            "#,
        )
        .bind(incoming.id)
        .bind(incoming.tenant_id)
        .bind(&incoming.provider)
        .bind(&incoming.external_event_id)
        .bind(&incoming.signature)
        .bind(Json(&incoming.headers))
        .bind(&incoming.body)
        .bind(&incoming.source_ip)
        .bind(&incoming.user_agent)
        .bind(incoming.is_verified)
        .bind(incoming.is_processed)
        .bind(incoming.received_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_incoming(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
    ) -> Result<Option<WebhookIncoming>> {
        let row: Option<IncomingRow> = sqlx::query_as(&format!(
            "SELECT {INCOMING_COLUMNS} FROM hookwork_incoming WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(incoming_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WebhookIncoming::from))
    }

    async fn mark_incoming_processed(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE hookwork_incoming
             SET is_processed = TRUE, processed_at = $3, processing_error = $4
             WHERE id = $1 AND tenant_id = $2 AND NOT is_processed",
        )
        .bind(incoming_id)
        .bind(tenant_id)
        .bind(at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_incoming(tenant_id, incoming_id).await? {
            Some(_) => Ok(false),
            None => Err(HookworkError::IncomingNotFound {
                id: incoming_id.to_string(),
            }),
        }
    }

    async fn claim_incoming(
        &self,
        tenant_id: Uuid,
        incoming_id: IncomingId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<Option<WebhookIncoming>> {
        let row: Option<IncomingRow> = sqlx::query_as(&format!(
            "UPDATE hookwork_incoming
             SET processing_started_at = $3
             WHERE id = $1 AND tenant_id = $2 AND is_verified AND NOT is_processed
               AND (processing_started_at IS NULL OR processing_started_at <= $4)
             RETURNING {INCOMING_COLUMNS}"
        ))
        .bind(incoming_id)
        .bind(tenant_id)
        .bind(now)
        .bind(lease_expired_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WebhookIncoming::from))
    }

    async fn unprocessed_incoming(
        &self,
        received_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookIncoming>> {
        let rows: Vec<IncomingRow> = sqlx::query_as(&format!(
            "SELECT {INCOMING_COLUMNS} FROM hookwork_incoming
             WHERE is_verified AND NOT is_processed AND received_at <= $1
             ORDER BY received_at
             LIMIT $2"
        ))
        .bind(received_before)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WebhookIncoming::from).collect())
    }
}
