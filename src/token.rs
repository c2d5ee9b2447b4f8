//! Bearer token verification and access-token minting.
//!
//! Both token kinds are HS256 JWTs issued by the identity service. Access
//! tokens and refresh tokens are signed with distinct secrets, so a refresh
//! token never verifies as an access token and vice versa.
//!
//! # Claims compatibility
//!
//! The subject is read from `userId`, falling back to `id`. Tokens minted by
//! the identity service carry `userId`; older tokens carry `id`. When both are
//! present `userId` wins.
//!
//! # Clock
//!
//! Verification takes `now` as unix seconds instead of reading the system
//! clock, so expiry is a pure function of the inputs.

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};

/// Access token lifetime (15 minutes)
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Length of the hex token fingerprint written to logs
const FINGERPRINT_LEN: usize = 12;

/// Token verification failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Not a parseable signed token, or required claims are missing
    #[error("token is malformed")]
    Malformed,
    /// Signature does not validate against the secret
    #[error("token signature is invalid")]
    BadSignature,
    /// `now` is past the token's `exp`
    #[error("token has expired")]
    Expired,
}

/// Identity claims extracted from a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (`userId`, or `id` for older tokens)
    pub subject_id: String,
    /// Subject email, empty when the token carries none
    pub email: String,
    /// Issue time (unix seconds), when present
    pub issued_at: Option<i64>,
    /// Expiry time (unix seconds)
    pub expires_at: i64,
}

/// Claims as they appear on the wire
#[derive(Debug, Deserialize)]
struct WireClaims {
    #[serde(rename = "userId")]
    user_id: Option<SubjectId>,
    id: Option<SubjectId>,
    email: Option<String>,
    iat: Option<i64>,
    exp: i64,
}

/// Subject identifiers are strings from the identity service, but numeric
/// ids are accepted too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubjectId {
    Text(String),
    Number(i64),
}

impl SubjectId {
    fn into_string(self) -> String {
        match self {
            SubjectId::Text(s) => s,
            SubjectId::Number(n) => n.to_string(),
        }
    }
}

/// Body of a freshly minted access token
#[derive(Debug, Serialize)]
struct MintedClaims<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
    email: &'a str,
    iat: i64,
    exp: i64,
}

/// Verifies tokens signed with one secret.
///
/// Holds only immutable key material and is shared freely across requests.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock in `verify`.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify `token` and extract its identity claims.
    ///
    /// The signature is checked before expiry, so a forged token is reported
    /// as `BadSignature` even when its `exp` is in the past.
    pub fn verify(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        let data = decode::<WireClaims>(token, &self.key, &self.validation)
            .map_err(|e| classify(e.kind()))?;
        let wire = data.claims;

        if now > wire.exp {
            return Err(AuthError::Expired);
        }

        let subject_id = wire
            .user_id
            .or(wire.id)
            .map(SubjectId::into_string)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::Malformed)?;

        Ok(Claims {
            subject_id,
            email: wire.email.unwrap_or_default(),
            issued_at: wire.iat,
            expires_at: wire.exp,
        })
    }
}

fn classify(kind: &ErrorKind) -> AuthError {
    match kind {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::BadSignature,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Malformed,
    }
}

/// A minted access token and the claims it carries
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Refresh failure
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("refresh token rejected: {0}")]
    Rejected(#[from] AuthError),

    #[error("failed to sign access token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Mints access tokens from refresh tokens.
///
/// Refresh tokens are not rotated or revoked: the same refresh token keeps
/// working until its own expiry.
#[derive(Clone)]
pub struct TokenIssuer {
    refresh: TokenVerifier,
    access_key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(refresh_secret: &[u8], access_secret: &[u8]) -> Self {
        Self {
            refresh: TokenVerifier::new(refresh_secret),
            access_key: EncodingKey::from_secret(access_secret),
        }
    }

    /// Validate `refresh_token` and mint an access token for the same subject.
    pub fn refresh(&self, refresh_token: &str, now: i64) -> Result<IssuedToken, IssueError> {
        let claims = self.refresh.verify(refresh_token, now)?;
        self.mint(&claims.subject_id, &claims.email, now)
    }

    /// Sign an access token carrying only `{userId, email}`, valid for
    /// [`ACCESS_TOKEN_TTL_SECS`] from `now`.
    pub fn mint(&self, subject_id: &str, email: &str, now: i64) -> Result<IssuedToken, IssueError> {
        let expires_at = now + ACCESS_TOKEN_TTL_SECS;
        let body = MintedClaims {
            user_id: subject_id,
            email,
            iat: now,
            exp: expires_at,
        };

        let token = encode(&Header::new(Algorithm::HS256), &body, &self.access_key)?;

        Ok(IssuedToken {
            token,
            claims: Claims {
                subject_id: subject_id.to_string(),
                email: email.to_string(),
                issued_at: Some(now),
                expires_at,
            },
        })
    }
}

/// Short SHA-256 fingerprint of a token, safe to log.
pub fn fingerprint(token: &str) -> String {
    let hash = digest(&SHA256, token.as_bytes());
    let mut hex = hex::encode(hash.as_ref());
    hex.truncate(FINGERPRINT_LEN);
    hex
}
