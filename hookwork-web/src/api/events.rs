//! Event publishing API.
//!
//! `POST /api/tenants/{tenant_id}/events` hands a domain event to the dispatcher,
//! for producers that run outside this process. The response reports how many
//! deliveries were created; delivery itself happens in the background.
//!
//! ```rust
//! use hookwork_web::api::events::PublishEventRequest;
//!
//! let request: PublishEventRequest = serde_json::from_str(
//!     r#"{"event": "order.created", "payload": {"order_id": "ord_42"}}"#,
//! )
//! .unwrap();
//! assert_eq!(request.event.as_str(), "order.created");
//! assert!(request.event_id.is_none());
//! ```

use super::reply;
use hookwork::{EventDispatcher, WebhookEvent};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use warp::{Filter, Reply, http::StatusCode};

/// Event publish request
#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    pub event: WebhookEvent,
    /// Id of the originating domain object change; generated when absent
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Create event routes
pub fn routes(
    dispatcher: Arc<EventDispatcher>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let dispatcher_filter = warp::any().map(move || dispatcher.clone());

    warp::path("tenants")
        .and(warp::path::param::<Uuid>())
        .and(warp::path("events"))
        .and(warp::path::end())
        .and(warp::post())
        .and(dispatcher_filter)
        .and(warp::body::json())
        .and_then(publish_handler)
}

async fn publish_handler(
    tenant_id: Uuid,
    dispatcher: Arc<EventDispatcher>,
    request: PublishEventRequest,
) -> Result<impl Reply, warp::Rejection> {
    let event_id = request.event_id.unwrap_or_else(Uuid::new_v4);
    let result = dispatcher
        .dispatch(tenant_id, request.event, event_id, &request.payload)
        .await;
    Ok(reply(result, StatusCode::ACCEPTED))
}
