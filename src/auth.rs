//! AuthGate: bearer-token authentication for proxied routes.
//!
//! Runs after route resolution. For rules that require authentication the
//! gate verifies the `Authorization: Bearer <token>` header and either
//! rejects the request or attaches the identity headers consumed by
//! downstream services.
//!
//! # Trust Model
//!
//! - `x-user-id` / `x-user-email` are set only here; any client-supplied
//!   value is stripped first, on every proxied route
//! - The headers carry no cryptographic proof, so downstream services must
//!   not be reachable from outside the gateway's network
//! - Expired tokens are reported separately from invalid ones so clients can
//!   refresh on expiry but not on tampering
//! - Tokens are never logged, only their fingerprint

use crate::handlers::{ApiError, AppState};
use crate::routes::{MatchedRoute, X_USER_EMAIL, X_USER_ID};
use crate::token::{fingerprint, AuthError, Claims, TokenVerifier};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};

/// Why the gate rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No bearer token in the request
    MissingToken,
    /// Token verified but past its expiry
    Expired,
    /// Malformed, forged or otherwise unusable token
    InvalidToken,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::MissingToken | Rejection::Expired => StatusCode::UNAUTHORIZED,
            Rejection::InvalidToken => StatusCode::FORBIDDEN,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Rejection::MissingToken => "Access token required",
            Rejection::Expired => "Access token expired",
            Rejection::InvalidToken => "Invalid access token",
        }
    }
}

impl From<AuthError> for Rejection {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Expired => Rejection::Expired,
            AuthError::Malformed | AuthError::BadSignature => Rejection::InvalidToken,
        }
    }
}

/// Identity of an authenticated request (request extension)
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Claims);

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(authorization: &str) -> Option<&str> {
    authorization
        .strip_prefix("Bearer ")
        .or_else(|| authorization.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Verify the bearer token in `headers`.
pub fn authenticate(
    headers: &HeaderMap,
    verifier: &TokenVerifier,
    now: i64,
) -> Result<Claims, Rejection> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or(Rejection::MissingToken)?;

    verifier.verify(token, now).map_err(|err| {
        warn!(
            reason = %err,
            token = %fingerprint(token),
            "Access token rejected"
        );
        Rejection::from(err)
    })
}

/// Remove any client-supplied identity headers.
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    headers.remove(X_USER_ID);
    headers.remove(X_USER_EMAIL);
}

/// Set the outbound identity headers from verified claims.
pub fn attach_identity_headers(headers: &mut HeaderMap, claims: &Claims) -> Result<(), Rejection> {
    let user_id = HeaderValue::from_str(&claims.subject_id).map_err(|_| Rejection::InvalidToken)?;
    headers.insert(X_USER_ID, user_id);

    if !claims.email.is_empty() {
        let email = HeaderValue::from_str(&claims.email).map_err(|_| Rejection::InvalidToken)?;
        headers.insert(X_USER_EMAIL, email);
    }
    Ok(())
}

/// Gate middleware; expects [`MatchedRoute`] from `resolve_route`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    strip_identity_headers(request.headers_mut());

    let Some(MatchedRoute(rule)) = request.extensions().get::<MatchedRoute>().cloned() else {
        error!("AuthGate reached without a resolved route");
        return Err(ApiError::Internal);
    };

    if !rule.auth_required {
        return Ok(next.run(request).await);
    }

    let now = chrono::Utc::now().timestamp();
    let claims = authenticate(request.headers(), &state.verifier, now)
        .and_then(|claims| attach_identity_headers(request.headers_mut(), &claims).map(|()| claims))
        .map_err(|rejection| {
            warn!(
                route = %rule.name,
                path = %request.uri().path(),
                ?rejection,
                "Request rejected by AuthGate"
            );
            rejection
        })?;

    debug!(
        route = %rule.name,
        user_id = %claims.subject_id,
        "Authenticated, identity headers attached"
    );

    request.extensions_mut().insert(AuthenticatedUser(claims));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"access-secret";
    const NOW: i64 = 1_700_000_000;

    fn headers_with(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    fn token(exp: i64, secret: &[u8]) -> String {
        encode(
            &Header::default(),
            &json!({"userId": "u-1", "email": "a@example.com", "exp": exp}),
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn extract_bearer_token_works() {
        assert_eq!(extract_bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer_token("bearer ABC123"), Some("ABC123"));
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc123"), None);
        assert_eq!(extract_bearer_token("abc123"), None);
    }

    #[test]
    fn missing_header_is_missing_token() {
        let verifier = TokenVerifier::new(SECRET);
        assert_eq!(
            authenticate(&HeaderMap::new(), &verifier, NOW),
            Err(Rejection::MissingToken)
        );
        assert_eq!(
            authenticate(&headers_with("Basic xyz"), &verifier, NOW),
            Err(Rejection::MissingToken)
        );
    }

    #[test]
    fn expired_and_invalid_are_distinct() {
        let verifier = TokenVerifier::new(SECRET);

        let expired = headers_with(&format!("Bearer {}", token(NOW - 60, SECRET)));
        let rejection = authenticate(&expired, &verifier, NOW).unwrap_err();
        assert_eq!(rejection, Rejection::Expired);
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
        assert!(rejection.message().contains("expired"));

        let forged = headers_with(&format!("Bearer {}", token(NOW + 60, b"other")));
        let rejection = authenticate(&forged, &verifier, NOW).unwrap_err();
        assert_eq!(rejection, Rejection::InvalidToken);
        assert_eq!(rejection.status(), StatusCode::FORBIDDEN);
        assert_eq!(rejection.message(), "Invalid access token");
    }

    #[test]
    fn valid_token_yields_claims() {
        let verifier = TokenVerifier::new(SECRET);
        let headers = headers_with(&format!("Bearer {}", token(NOW + 60, SECRET)));

        let claims = authenticate(&headers, &verifier, NOW).unwrap();
        assert_eq!(claims.subject_id, "u-1");
        assert_eq!(claims.email, "a@example.com");
    }

    #[test]
    fn identity_headers_replace_client_values() {
        let mut headers = HeaderMap::new();
        headers.insert(X_USER_ID, HeaderValue::from_static("attacker"));
        headers.insert(X_USER_EMAIL, HeaderValue::from_static("evil@example.com"));

        strip_identity_headers(&mut headers);
        assert!(headers.get(X_USER_ID).is_none());
        assert!(headers.get(X_USER_EMAIL).is_none());

        let claims = Claims {
            subject_id: "u-1".into(),
            email: "a@example.com".into(),
            issued_at: None,
            expires_at: NOW,
        };
        attach_identity_headers(&mut headers, &claims).unwrap();
        assert_eq!(headers[X_USER_ID], "u-1");
        assert_eq!(headers[X_USER_EMAIL], "a@example.com");
        assert_eq!(headers.get_all(X_USER_ID).iter().count(), 1);
    }

    #[test]
    fn empty_email_sets_only_user_id() {
        let mut headers = HeaderMap::new();
        let claims = Claims {
            subject_id: "u-2".into(),
            email: String::new(),
            issued_at: None,
            expires_at: NOW,
        };
        attach_identity_headers(&mut headers, &claims).unwrap();
        assert_eq!(headers[X_USER_ID], "u-2");
        assert!(headers.get(X_USER_EMAIL).is_none());
    }
}
