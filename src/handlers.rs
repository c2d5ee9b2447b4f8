//! HTTP request handlers for the API gateway.
//!
//! - `/health` and `/refresh` are answered by the gateway itself
//! - Everything else reaches [`proxy_request`] after route resolution and
//!   the AuthGate have run
//! - Every error leaves through [`ApiError`] as `{success: false, message}`

use crate::auth::{AuthenticatedUser, Rejection};
use crate::config::Config;
use crate::models::*;
use crate::proxy::{OutboundBody, OutboundRequest, ProxyDispatcher};
use crate::routes::{MatchedRoute, RouteError, RouteTable};
use crate::token::{fingerprint, IssueError, TokenIssuer, TokenVerifier};
use axum::{
    body::HttpBody,
    extract::{rejection::JsonRejection, FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub routes: Arc<RouteTable>,
    /// Access-token verifier used by the AuthGate
    pub verifier: Arc<TokenVerifier>,
    /// Refresh-token exchange
    pub issuer: Arc<TokenIssuer>,
    pub dispatcher: ProxyDispatcher,
}

impl AppState {
    /// State with the standard route table for `config`.
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let routes = RouteTable::from_config(&config);
        Self::with_routes(config, routes)
    }

    /// State with an explicit route table.
    pub fn with_routes(config: Config, routes: RouteTable) -> Result<Self, reqwest::Error> {
        let verifier = TokenVerifier::new(config.jwt_access_secret.as_bytes());
        let issuer = TokenIssuer::new(
            config.jwt_refresh_secret.as_bytes(),
            config.jwt_access_secret.as_bytes(),
        );

        Ok(Self {
            config: Arc::new(config),
            routes: Arc::new(routes),
            verifier: Arc::new(verifier),
            issuer: Arc::new(issuer),
            dispatcher: ProxyDispatcher::new()?,
        })
    }
}

// === Health Check ===

/// GET /health - Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        success: true,
        message: "API Gateway is healthy",
        timestamp: chrono::Utc::now(),
    })
}

// === Token Refresh ===

/// POST /refresh - Exchange a refresh token for a new access token
///
/// Bypasses route resolution and the AuthGate. The refresh token itself is
/// not rotated; the response carries only the new access token.
pub async fn refresh_token(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let Json(req) = payload.map_err(|rejection| {
        debug!(error = %rejection, "Malformed refresh body");
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::InvalidBody
        }
    })?;

    let token = req
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingRefreshToken)?;

    let now = chrono::Utc::now().timestamp();
    match state.issuer.refresh(&token, now) {
        Ok(issued) => {
            info!(user_id = %issued.claims.subject_id, "Access token refreshed");
            Ok(Json(RefreshResponse {
                success: true,
                access_token: issued.token,
            }))
        }
        Err(IssueError::Rejected(reason)) => {
            warn!(
                reason = %reason,
                token = %fingerprint(&token),
                "Refresh token rejected"
            );
            Err(ApiError::InvalidRefreshToken)
        }
        Err(IssueError::Signing(e)) => {
            error!(error = %e, "Failed to sign access token");
            Err(ApiError::Internal)
        }
    }
}

/// Method fallback for `/health` and `/refresh`
pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

// === Proxied Routes ===

/// Fallback for proxied paths - forward to the matched downstream service
///
/// Buffered routes read the body under the configured limit; streamed routes
/// hand the body to the dispatcher untouched.
pub async fn proxy_request(
    State(state): State<AppState>,
    Extension(MatchedRoute(rule)): Extension<MatchedRoute>,
    user: Option<Extension<AuthenticatedUser>>,
    request: Request,
) -> Result<Response, ApiError> {
    let identity = user.map(|Extension(AuthenticatedUser(claims))| claims);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let headers = request.headers().clone();

    let body = if rule.buffer_body {
        let bytes = Bytes::from_request(request, &state).await.map_err(|rejection| {
            debug!(route = %rule.name, error = %rejection, "Failed to read request body");
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge
            } else {
                ApiError::InvalidBody
            }
        })?;
        if bytes.is_empty() {
            OutboundBody::Empty
        } else {
            OutboundBody::Buffered(bytes)
        }
    } else if request.body().is_end_stream() {
        OutboundBody::Empty
    } else {
        OutboundBody::Streamed(request.into_body())
    };

    let user_id = identity.as_ref().map(|c| c.subject_id.clone());
    let outbound = OutboundRequest {
        method,
        path,
        query,
        headers,
        body,
        identity,
    };

    match state.dispatcher.forward(outbound, &rule).await {
        Ok(response) => Ok(response.into_response()),
        Err(err) => {
            error!(
                route = %rule.name,
                user_id = user_id.as_deref().unwrap_or("-"),
                kind = err.kind(),
                error = %err,
                "{} service proxy error",
                rule.name
            );
            Err(ApiError::ServiceUnavailable(rule.name.clone()))
        }
    }
}

// === Error Handling ===

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Request body could not be parsed
    InvalidBody,
    /// Refresh request without a refresh token
    MissingRefreshToken,
    /// Refresh token failed verification
    InvalidRefreshToken,
    /// Rejected by the AuthGate
    Auth(Rejection),
    /// No route matches the path
    RouteNotFound,
    /// Path with `.` or `..` segments
    InvalidPath,
    /// Gateway endpoint called with the wrong method
    MethodNotAllowed,
    /// Buffered body over the configured limit
    PayloadTooLarge,
    /// Downstream service failed; carries the service name
    ServiceUnavailable(String),
    Internal,
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        ApiError::Auth(rejection)
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoMatch => ApiError::RouteNotFound,
            RouteError::DotSegment => ApiError::InvalidPath,
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidBody => StatusCode::BAD_REQUEST,
            ApiError::MissingRefreshToken => StatusCode::UNAUTHORIZED,
            ApiError::InvalidRefreshToken => StatusCode::FORBIDDEN,
            ApiError::Auth(rejection) => rejection.status(),
            ApiError::RouteNotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidPath => StatusCode::BAD_REQUEST,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidBody => "Invalid request body".to_string(),
            ApiError::MissingRefreshToken => "Refresh token required".to_string(),
            ApiError::InvalidRefreshToken => "Invalid refresh token".to_string(),
            ApiError::Auth(rejection) => rejection.message().to_string(),
            ApiError::RouteNotFound => "Route not found".to_string(),
            ApiError::InvalidPath => "Invalid request path".to_string(),
            ApiError::MethodNotAllowed => "Method not allowed".to_string(),
            ApiError::PayloadTooLarge => "Request body too large".to_string(),
            ApiError::ServiceUnavailable(service) => format!("{service} service unavailable"),
            ApiError::Internal => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse::new(self.message()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_contract() {
        assert_eq!(ApiError::InvalidBody.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Auth(Rejection::MissingToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Auth(Rejection::Expired).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Auth(Rejection::InvalidToken).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ApiError::RouteNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::InvalidPath.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::MethodNotAllowed.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            ApiError::ServiceUnavailable("Media".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unavailable_message_names_the_service() {
        assert_eq!(
            ApiError::ServiceUnavailable("Media".into()).message(),
            "Media service unavailable"
        );
    }

    #[test]
    fn route_error_maps_to_not_found() {
        assert!(matches!(
            ApiError::from(RouteError::NoMatch),
            ApiError::RouteNotFound
        ));
        assert!(matches!(
            ApiError::from(RouteError::DotSegment),
            ApiError::InvalidPath
        ));
    }
}
