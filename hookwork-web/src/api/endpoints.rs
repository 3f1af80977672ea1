//! Tenant endpoint management API.
//!
//! # API Endpoints
//!
//! - `GET /api/tenants/{tenant_id}/endpoints` - List the tenant's endpoints
//! - `POST /api/tenants/{tenant_id}/endpoints` - Register an endpoint
//! - `GET /api/tenants/{tenant_id}/endpoints/{id}` - Get one endpoint
//! - `PUT /api/tenants/{tenant_id}/endpoints/{id}` - Update an endpoint
//! - `DELETE /api/tenants/{tenant_id}/endpoints/{id}` - Remove an endpoint
//! - `POST /api/tenants/{tenant_id}/endpoints/{id}/test` - Send a signed test payload
//! - `GET /api/tenants/{tenant_id}/endpoints/{id}/deliveries` - Delivery history
//! - `GET /api/tenants/{tenant_id}/deliveries/{id}` - One delivery
//!
//! The signing secret is only returned when the endpoint is created.
//!
//! # Examples
//!
//! ```rust
//! use hookwork_web::api::endpoints::EndpointResponse;
//! use hookwork::{NewEndpoint, WebhookEndpoint, WebhookEvent};
//! use uuid::Uuid;
//!
//! let endpoint = WebhookEndpoint::from_request(
//!     Uuid::new_v4(),
//!     NewEndpoint::new("https://shop.example.com/hooks", vec![WebhookEvent::OrderCreated]),
//! )
//! .unwrap();
//!
//! let listed = EndpointResponse::from(endpoint.clone());
//! assert!(listed.secret.is_none());
//!
//! let created = EndpointResponse::with_secret(endpoint);
//! assert!(created.secret.unwrap().starts_with("whsec_"));
//! ```

use super::{PaginationParams, reply, with_pagination};
use chrono::{DateTime, Utc};
use hookwork::{
    EndpointRegistry, EndpointUpdate, NewEndpoint, RetryPolicy, WebhookEndpoint, WebhookEvent,
};
use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use uuid::Uuid;
use warp::{Filter, Reply, http::StatusCode};

/// Endpoint as shown to tenants
#[derive(Debug, Clone, Serialize)]
pub struct EndpointResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub url: String,
    pub description: Option<String>,
    pub events: BTreeSet<WebhookEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub active: bool,
    pub retry_policy: RetryPolicy,
    pub max_retries: i32,
    pub timeout_secs: i32,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_status: Option<i32>,
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WebhookEndpoint> for EndpointResponse {
    fn from(endpoint: WebhookEndpoint) -> Self {
        Self {
            id: endpoint.id,
            tenant_id: endpoint.tenant_id,
            url: endpoint.url,
            description: endpoint.description,
            events: endpoint.events,
            secret: None,
            active: endpoint.active,
            retry_policy: endpoint.retry_policy,
            max_retries: endpoint.max_retries,
            timeout_secs: endpoint.timeout_secs,
            last_delivery_at: endpoint.last_delivery_at,
            last_status: endpoint.last_status,
            failure_count: endpoint.failure_count,
            created_at: endpoint.created_at,
            updated_at: endpoint.updated_at,
        }
    }
}

impl EndpointResponse {
    pub fn with_secret(endpoint: WebhookEndpoint) -> Self {
        let secret = endpoint.secret.clone();
        Self {
            secret: Some(secret),
            ..Self::from(endpoint)
        }
    }
}

/// `tenants/{tenant_id}/endpoints`
fn tenant_endpoints() -> impl Filter<Extract = (Uuid,), Error = warp::Rejection> + Clone {
    warp::path("tenants")
        .and(warp::path::param::<Uuid>())
        .and(warp::path("endpoints"))
}

/// Create endpoint routes
pub fn routes(
    registry: Arc<EndpointRegistry>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let registry_filter = warp::any().map(move || registry.clone());

    let list = tenant_endpoints()
        .and(warp::path::end())
        .and(warp::get())
        .and(registry_filter.clone())
        .and_then(list_handler);

    let create = tenant_endpoints()
        .and(warp::path::end())
        .and(warp::post())
        .and(registry_filter.clone())
        .and(warp::body::json())
        .and_then(create_handler);

    let get = tenant_endpoints()
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::get())
        .and(registry_filter.clone())
        .and_then(get_handler);

    let update = tenant_endpoints()
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::put())
        .and(registry_filter.clone())
        .and(warp::body::json())
        .and_then(update_handler);

    let delete = tenant_endpoints()
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(registry_filter.clone())
        .and_then(delete_handler);

    let test = tenant_endpoints()
        .and(warp::path::param::<Uuid>())
        .and(warp::path("test"))
        .and(warp::path::end())
        .and(warp::post())
        .and(registry_filter.clone())
        .and_then(test_handler);

    let deliveries = tenant_endpoints()
        .and(warp::path::param::<Uuid>())
        .and(warp::path("deliveries"))
        .and(warp::path::end())
        .and(warp::get())
        .and(registry_filter.clone())
        .and(with_pagination())
        .and_then(deliveries_handler);

    let delivery = warp::path("tenants")
        .and(warp::path::param::<Uuid>())
        .and(warp::path("deliveries"))
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::get())
        .and(registry_filter)
        .and_then(delivery_handler);

    list.or(create)
        .or(get)
        .or(update)
        .or(delete)
        .or(test)
        .or(deliveries)
        .or(delivery)
}

async fn list_handler(
    tenant_id: Uuid,
    registry: Arc<EndpointRegistry>,
) -> Result<impl Reply, warp::Rejection> {
    let result = registry.list(tenant_id).await.map(|endpoints| {
        endpoints
            .into_iter()
            .map(EndpointResponse::from)
            .collect::<Vec<_>>()
    });
    Ok(reply(result, StatusCode::OK))
}

async fn create_handler(
    tenant_id: Uuid,
    registry: Arc<EndpointRegistry>,
    request: NewEndpoint,
) -> Result<impl Reply, warp::Rejection> {
    let result = registry
        .create(tenant_id, request)
        .await
        .map(EndpointResponse::with_secret);
    Ok(reply(result, StatusCode::CREATED))
}

async fn get_handler(
    tenant_id: Uuid,
    endpoint_id: Uuid,
    registry: Arc<EndpointRegistry>,
) -> Result<impl Reply, warp::Rejection> {
    let result = registry
        .get(tenant_id, endpoint_id)
        .await
        .map(EndpointResponse::from);
    Ok(reply(result, StatusCode::OK))
}

async fn update_handler(
    tenant_id: Uuid,
    endpoint_id: Uuid,
    registry: Arc<EndpointRegistry>,
    update: EndpointUpdate,
) -> Result<impl Reply, warp::Rejection> {
    let result = registry
        .update(tenant_id, endpoint_id, update)
        .await
        .map(EndpointResponse::from);
    Ok(reply(result, StatusCode::OK))
}

async fn delete_handler(
    tenant_id: Uuid,
    endpoint_id: Uuid,
    registry: Arc<EndpointRegistry>,
) -> Result<impl Reply, warp::Rejection> {
    let result = registry
        .delete(tenant_id, endpoint_id)
        .await
        .map(|()| serde_json::json!({ "id": endpoint_id, "deleted": true }));
    Ok(reply(result, StatusCode::OK))
}

async fn test_handler(
    tenant_id: Uuid,
    endpoint_id: Uuid,
    registry: Arc<EndpointRegistry>,
) -> Result<impl Reply, warp::Rejection> {
    Ok(reply(
        registry.test(tenant_id, endpoint_id).await,
        StatusCode::OK,
    ))
}

async fn deliveries_handler(
    tenant_id: Uuid,
    endpoint_id: Uuid,
    registry: Arc<EndpointRegistry>,
    pagination: PaginationParams,
) -> Result<impl Reply, warp::Rejection> {
    Ok(reply(
        registry
            .deliveries(tenant_id, endpoint_id, pagination.to_query())
            .await,
        StatusCode::OK,
    ))
}

async fn delivery_handler(
    tenant_id: Uuid,
    delivery_id: Uuid,
    registry: Arc<EndpointRegistry>,
) -> Result<impl Reply, warp::Rejection> {
    Ok(reply(
        registry.delivery(tenant_id, delivery_id).await,
        StatusCode::OK,
    ))
}
