//! Signed outbound HTTP requests to tenant endpoints.
//!
//! The wire contract of every delivery (and of the endpoint test) is:
//!
//! ```text
//! POST <endpoint.url>
//! Content-Type: application/json
//! User-Agent: Webhook-Service/1.0
//! X-Webhook-Event: <event name>
//! X-Webhook-ID: <delivery id>
//! X-Webhook-Timestamp: <unix seconds at send time>
//! X-Webhook-Signature: <hex HMAC-SHA256 of the body with the endpoint secret>
//!
//! <JSON payload>
//! ```

use crate::{config::DeliveryConfig, event::WebhookEvent, signature};
use chrono::Utc;
use reqwest::{Client, Response};
use std::{collections::BTreeMap, time::Duration};
use tokio::time::timeout;
use uuid::Uuid;

pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_ID: &str = "X-Webhook-ID";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// Appended to response bodies cut at `max_response_body_size`.
pub const TRUNCATED_MARKER: &str = "... [truncated]";

/// One signed request, ready to send.
#[derive(Debug, Clone)]
pub struct SignedRequest<'a> {
    pub url: &'a str,
    pub secret: &'a str,
    pub event: WebhookEvent,
    pub delivery_id: Uuid,
    pub body: &'a str,
    pub timeout: Duration,
}

/// What happened on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpAttempt {
    pub success: bool,
    pub request_url: String,
    pub request_headers: BTreeMap<String, String>,
    pub status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub response_time_ms: i64,
    /// `"HTTP <code>: <body>"` for non-2xx responses, the transport error otherwise
    pub error: Option<String>,
}

/// HTTP client used for deliveries and endpoint tests.
#[derive(Clone)]
pub struct DeliveryClient {
    http: Client,
    user_agent: String,
    max_response_body_size: usize,
}

impl DeliveryClient {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            http: Client::new(),
            user_agent: config.user_agent.clone(),
            max_response_body_size: config.max_response_body_size,
        }
    }

    /// Use an existing reqwest client, e.g. one with custom TLS roots.
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Headers for `request` signed at `timestamp`.
    pub fn headers(&self, request: &SignedRequest<'_>, timestamp: i64) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), self.user_agent.clone()),
            (HEADER_EVENT.to_string(), request.event.as_str().to_string()),
            (HEADER_ID.to_string(), request.delivery_id.to_string()),
            (HEADER_TIMESTAMP.to_string(), timestamp.to_string()),
            (
                HEADER_SIGNATURE.to_string(),
                signature::sign(request.body.as_bytes(), request.secret),
            ),
        ])
    }

    /// Send one signed POST. Never fails: transport errors and timeouts come back
    /// as an unsuccessful [`HttpAttempt`].
    pub async fn send(&self, request: SignedRequest<'_>) -> HttpAttempt {
        let headers = self.headers(&request, Utc::now().timestamp());
        let start_time = std::time::Instant::now();

        let mut builder = self.http.post(request.url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let builder = builder.body(request.body.to_string());

        let max_body = self.max_response_body_size;
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let response_headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect::<BTreeMap<_, _>>();
            let body = read_capped(response, max_body).await.ok();
            Ok::<_, reqwest::Error>((status, response_headers, body))
        };

        let result = timeout(request.timeout, exchange).await;
        let response_time_ms = start_time.elapsed().as_millis() as i64;

        let mut attempt = HttpAttempt {
            success: false,
            request_url: request.url.to_string(),
            request_headers: headers,
            status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            response_time_ms,
            error: None,
        };

        match result {
            Ok(Ok((status, response_headers, body))) => {
                attempt.success = status.is_success();
                attempt.status = Some(status.as_u16());
                attempt.response_headers = response_headers;
                if !attempt.success {
                    attempt.error = Some(format!(
                        "HTTP {}: {}",
                        status.as_u16(),
                        body.as_deref().unwrap_or_default()
                    ));
                }
                attempt.response_body = body;
            }
            Ok(Err(err)) => {
                attempt.error = Some(err.to_string());
            }
            Err(_) => {
                attempt.error = Some(format!(
                    "request timed out after {}s",
                    request.timeout.as_secs()
                ));
            }
        }

        attempt
    }
}

/// Read at most `max` bytes of the body; the rest is never pulled off the wire.
async fn read_capped(mut response: Response, max: usize) -> reqwest::Result<String> {
    let mut body = Vec::new();
    let mut cut = false;
    while let Some(chunk) = response.chunk().await? {
        let room = max - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            cut = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }
    let text = String::from_utf8_lossy(&body).into_owned();
    Ok(if cut { truncate(text, max) } else { text })
}

/// Cut `body` to at most `max` bytes on a char boundary and mark it.
fn truncate(mut body: String, max: usize) -> String {
    let mut end = max.min(body.len());
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body.truncate(end);
    body.push_str(TRUNCATED_MARKER);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(url: &'a str, body: &'a str) -> SignedRequest<'a> {
        SignedRequest {
            url,
            secret: "whsec_test",
            event: WebhookEvent::OrderCreated,
            delivery_id: Uuid::nil(),
            body,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_headers_carry_signature_over_body() {
        let client = DeliveryClient::new(&DeliveryConfig::default());
        let body = r#"{"order_id":"ord_1"}"#;
        let headers = client.headers(&request("http://localhost", body), 1_700_000_000);

        assert_eq!(headers["User-Agent"], "Webhook-Service/1.0");
        assert_eq!(headers["Content-Type"], "application/json");
        assert_eq!(headers[HEADER_EVENT], "order.created");
        assert_eq!(headers[HEADER_ID], Uuid::nil().to_string());
        assert_eq!(headers[HEADER_TIMESTAMP], "1700000000");
        assert!(signature::verify(
            body.as_bytes(),
            &headers[HEADER_SIGNATURE],
            "whsec_test"
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short".to_string(), 10), "short... [truncated]");
        let truncated = truncate("ééééé".to_string(), 3);
        assert_eq!(truncated, "é... [truncated]");
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_failed_attempt() {
        let client = DeliveryClient::new(&DeliveryConfig::default());
        // port 9 (discard) is closed on test hosts
        let attempt = client.send(request("http://127.0.0.1:9/hook", "{}")).await;
        assert!(!attempt.success);
        assert!(attempt.status.is_none());
        assert!(attempt.error.is_some());
        assert!(attempt.request_headers.contains_key(HEADER_SIGNATURE));
    }

    #[tokio::test]
    async fn test_oversized_response_body_is_capped() {
        use warp::{Filter, http::StatusCode};

        let route = warp::post().map(|| {
            warp::reply::with_status("x".repeat(1024 * 1024), StatusCode::INTERNAL_SERVER_ERROR)
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = DeliveryClient::new(&DeliveryConfig {
            max_response_body_size: 1024,
            ..Default::default()
        });
        let url = format!("http://{}/hook", addr);
        let attempt = client.send(request(&url, "{}")).await;

        assert!(!attempt.success);
        assert_eq!(attempt.status, Some(500));
        let body = attempt.response_body.unwrap();
        assert_eq!(body.len(), 1024 + TRUNCATED_MARKER.len());
        assert!(body.ends_with(TRUNCATED_MARKER));
        assert!(attempt.error.unwrap().len() < 1100);
    }

    #[tokio::test]
    async fn test_small_response_body_is_kept_whole() {
        use warp::Filter;

        let route = warp::post().map(|| "accepted");
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = DeliveryClient::new(&DeliveryConfig::default());
        let url = format!("http://{}/hook", addr);
        let attempt = client.send(request(&url, "{}")).await;
        assert!(attempt.success);
        assert_eq!(attempt.response_body.as_deref(), Some("accepted"));
    }
}
