//! Inbound provider callbacks.
//!
//! `POST /webhooks/{tenant_id}/{provider}` takes the raw body and headers of a
//! provider callback and hands them to the [`IncomingWebhookProcessor`].
//!
//! | Outcome | Status |
//! |---|---|
//! | accepted, or a redelivery of an accepted event | 202 |
//! | signature check failed | 401 |
//! | no provider registered under that name | 404 |

use super::reply;
use hookwork::{InboundRequest, IncomingWebhookProcessor};
use std::net::SocketAddr;
use uuid::Uuid;
use warp::{
    Filter, Reply,
    http::{HeaderMap, StatusCode},
    hyper::body::Bytes,
};

/// Largest callback body accepted.
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Create inbound webhook routes
pub fn routes(
    processor: IncomingWebhookProcessor,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let processor_filter = warp::any().map(move || processor.clone());

    warp::path("webhooks")
        .and(warp::path::param::<Uuid>())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(processor_filter)
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and_then(receive_handler)
}

/// Convert a warp request into the processor's transport-neutral view.
pub fn inbound_request(headers: &HeaderMap, remote: Option<SocketAddr>, body: Bytes) -> InboundRequest {
    let mut request = InboundRequest::new(body.to_vec());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    // first hop of X-Forwarded-For when behind a proxy
    let forwarded = request
        .header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());
    match forwarded.or_else(|| remote.map(|addr| addr.ip().to_string())) {
        Some(ip) => request.with_source_ip(ip),
        None => request,
    }
}

async fn receive_handler(
    tenant_id: Uuid,
    provider: String,
    processor: IncomingWebhookProcessor,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    body: Bytes,
) -> Result<warp::reply::Response, warp::Rejection> {
    let request = inbound_request(&headers, remote, body);
    Ok(reply(
        processor.receive(tenant_id, &provider, request).await,
        StatusCode::ACCEPTED,
    ))
}
