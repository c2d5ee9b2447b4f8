//! ProxyDispatcher: forwards requests to downstream services.
//!
//! One shared `reqwest` client serves every route. Each call is bounded by its
//! route's timeout and is never retried; a failure is classified once and
//! handed back to the caller, which answers with a uniform 503.

use crate::routes::RouteRule;
use crate::token::Claims;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Idle keep-alive for pooled downstream connections
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Hop-by-hop headers, never forwarded in either direction
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Downstream call failure
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("downstream call timed out")]
    Timeout,

    #[error("downstream connection failed")]
    ConnectionRefused,

    #[error("downstream transport error: {0}")]
    Unexpected(String),
}

impl ProxyError {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Timeout => "timeout",
            ProxyError::ConnectionRefused => "connection_refused",
            ProxyError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout
        } else if err.is_connect() {
            ProxyError::ConnectionRefused
        } else {
            ProxyError::Unexpected(err.to_string())
        }
    }
}

/// Result of one forwarded call
pub type ProxyOutcome = Result<DownstreamResponse, ProxyError>;

/// Downstream response, passed back to the client verbatim
pub struct DownstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl DownstreamResponse {
    fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = forwardable_headers(response.headers());
        let body = Body::from_stream(response.bytes_stream());
        Self {
            status,
            headers,
            body,
        }
    }
}

impl IntoResponse for DownstreamResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Request body as handed to the dispatcher
pub enum OutboundBody {
    /// No request body
    Empty,
    /// Fully read by the gateway
    Buffered(Bytes),
    /// Streamed through without buffering
    Streamed(Body),
}

/// A request ready to be forwarded
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: OutboundBody,
    pub identity: Option<Claims>,
}

/// Forwards requests using one pooled HTTP client
#[derive(Clone)]
pub struct ProxyDispatcher {
    client: Client,
}

impl ProxyDispatcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Forward `request` to the rule's target under the rule's deadline.
    pub async fn forward(&self, request: OutboundRequest, rule: &RouteRule) -> ProxyOutcome {
        let url = rule.outbound_url(&request.path, request.query.as_deref());

        let mut headers = forwardable_headers(&request.headers);
        rule.apply_header_rewrites(&mut headers, &request.headers, request.identity.as_ref());

        let body = match request.body {
            OutboundBody::Empty => None,
            OutboundBody::Buffered(bytes) => Some(reqwest::Body::from(bytes)),
            OutboundBody::Streamed(body) => {
                Some(reqwest::Body::wrap_stream(body.into_data_stream()))
            }
        };

        debug!(
            route = %rule.name,
            method = %request.method,
            url = %url,
            "Forwarding request"
        );

        let mut outbound = self
            .client
            .request(request.method, url)
            .headers(headers)
            .timeout(rule.timeout);
        if let Some(body) = body {
            outbound = outbound.body(body);
        }

        let response = outbound.send().await?;

        Ok(DownstreamResponse::from_reqwest(response))
    }
}

/// Copy of `headers` without hop-by-hop headers and `host`.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    out.remove(header::HOST);
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway:3000"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        let out = forwardable_headers(&headers);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(out[header::CONTENT_TYPE], "application/json");
        assert_eq!(out[header::AUTHORIZATION], "Bearer t");
    }

    #[test]
    fn proxy_error_kinds() {
        assert_eq!(ProxyError::Timeout.kind(), "timeout");
        assert_eq!(ProxyError::ConnectionRefused.kind(), "connection_refused");
        assert_eq!(ProxyError::Unexpected("boom".into()).kind(), "unexpected");
    }

    #[tokio::test]
    async fn unreachable_target_is_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let rule = RouteRule::new(
            "Post",
            "/api/v1/posts",
            reqwest::Url::parse(&format!("http://{addr}")).unwrap(),
        );
        let request = OutboundRequest {
            method: Method::GET,
            path: "/api/v1/posts".into(),
            query: None,
            headers: HeaderMap::new(),
            body: OutboundBody::Empty,
            identity: None,
        };

        let outcome = ProxyDispatcher::new().unwrap().forward(request, &rule).await;
        assert!(matches!(outcome, Err(ProxyError::ConnectionRefused)));
    }

    #[tokio::test]
    async fn connection_closed_without_response_is_unexpected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept, then hang up without a response
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let rule = RouteRule::new(
            "Post",
            "/api/v1/posts",
            reqwest::Url::parse(&format!("http://{addr}")).unwrap(),
        );
        let request = OutboundRequest {
            method: Method::GET,
            path: "/api/v1/posts".into(),
            query: None,
            headers: HeaderMap::new(),
            body: OutboundBody::Empty,
            identity: None,
        };

        let outcome = ProxyDispatcher::new().unwrap().forward(request, &rule).await;
        assert!(matches!(outcome, Err(ProxyError::Unexpected(_))));
    }
}
