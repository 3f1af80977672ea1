//! REST API for the Hookwork server.
//!
//! - [`inbound`]: provider callbacks (`/webhooks/{tenant_id}/{provider}`)
//! - [`endpoints`]: tenant endpoint management and delivery history
//! - [`events`]: publishing domain events into the dispatcher
//! - [`system`]: health probe and Prometheus metrics

pub mod endpoints;
pub mod events;
pub mod inbound;
pub mod system;

use hookwork::{DeliveryQuery, HookworkError};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use warp::{Filter, Reply, http::StatusCode};

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Pagination parameters
#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: Some(1),
            limit: Some(50),
            offset: None,
        }
    }
}

impl PaginationParams {
    pub fn get_offset(&self) -> u32 {
        if let Some(offset) = self.offset {
            offset
        } else {
            let page = self.page.unwrap_or(1);
            let limit = self.get_limit();
            (page.saturating_sub(1)) * limit
        }
    }

    pub fn get_limit(&self) -> u32 {
        self.limit.unwrap_or(50).min(1000) // Cap at 1000 items
    }

    pub fn to_query(&self) -> DeliveryQuery {
        DeliveryQuery {
            limit: i64::from(self.get_limit()),
            offset: i64::from(self.get_offset()),
        }
    }
}

/// Status code an engine error is reported with.
pub fn status_for(error: &HookworkError) -> StatusCode {
    match error {
        HookworkError::EndpointNotFound { .. }
        | HookworkError::DeliveryNotFound { .. }
        | HookworkError::IncomingNotFound { .. }
        | HookworkError::UnknownProvider { .. } => StatusCode::NOT_FOUND,
        HookworkError::InvalidEndpoint { .. }
        | HookworkError::UnknownEvent { .. }
        | HookworkError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
        HookworkError::SignatureInvalid { .. } => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Wrap `data` in a success envelope.
pub fn reply_success<T: Serialize>(data: T, status: StatusCode) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&ApiResponse::success(data)), status)
        .into_response()
}

/// Wrap an engine error in an error envelope with its status code. Server-side
/// failures are logged and reported without detail.
pub fn reply_error(error: HookworkError) -> warp::reply::Response {
    let status = status_for(&error);
    let message = if error.is_client_error() {
        error.to_string()
    } else {
        tracing::error!(error = %error, "Request failed");
        "Internal server error".to_string()
    };
    warp::reply::with_status(warp::reply::json(&ApiResponse::<()>::error(message)), status)
        .into_response()
}

/// Reply with `result`, using `status` on success.
pub fn reply<T: Serialize>(result: hookwork::Result<T>, status: StatusCode) -> warp::reply::Response {
    match result {
        Ok(data) => reply_success(data, status),
        Err(e) => reply_error(e),
    }
}

/// Common error handling for API endpoints
pub async fn handle_api_error(err: warp::Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Resource not found")
    } else if err
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (StatusCode::BAD_REQUEST, "Invalid request body")
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query parameters")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ApiResponse::<()>::error(message.to_string())),
        status,
    ))
}

/// Extract pagination parameters from query string
pub fn with_pagination()
-> impl Filter<Extract = (PaginationParams,), Error = warp::Rejection> + Clone {
    warp::query::<PaginationParams>()
}
