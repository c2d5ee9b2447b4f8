//! Static routing table for proxied traffic.
//!
//! Each rule maps a path prefix to a downstream service together with its
//! auth requirement, deadline, body policy and rewrites. The table is built
//! once at startup and never mutated, so resolution needs no locking.
//!
//! # Matching
//!
//! Rules are kept sorted by prefix length, longest first, and a prefix only
//! matches on a path-segment boundary: `/api/v1/media` matches
//! `/api/v1/media` and `/api/v1/media/x` but not `/api/v1/mediax`.
//!
//! Paths with `.` or `..` segments (plain or percent-encoded) are rejected
//! outright. The downstream client would normalize them after the prefix
//! check, so `/api/v1/auth/../posts` could otherwise leave as `/api/v1/posts`
//! without the post route's authentication.

use crate::config::Config;
use crate::handlers::{ApiError, AppState};
use crate::token::Claims;
use axum::{
    extract::{Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Outbound identity header carrying the subject id
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");

/// Outbound identity header carrying the subject email
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");

/// Route resolution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no route matches the request path")]
    NoMatch,
    #[error("request path contains dot segments")]
    DotSegment,
}

/// How an outbound header value is derived
#[derive(Debug, Clone)]
pub enum HeaderDerivation {
    /// Copy the named header from the inbound request
    Inbound(HeaderName),
    /// Authenticated subject id
    SubjectId,
    /// Authenticated subject email
    Email,
    /// Constant value
    Fixed(HeaderValue),
}

impl HeaderDerivation {
    /// Evaluate against the inbound headers and the caller identity.
    ///
    /// `None` means the outbound header is removed.
    pub fn derive(&self, inbound: &HeaderMap, identity: Option<&Claims>) -> Option<HeaderValue> {
        match self {
            HeaderDerivation::Inbound(name) => inbound.get(name).cloned(),
            HeaderDerivation::SubjectId => {
                identity.and_then(|c| HeaderValue::from_str(&c.subject_id).ok())
            }
            HeaderDerivation::Email => identity
                .filter(|c| !c.email.is_empty())
                .and_then(|c| HeaderValue::from_str(&c.email).ok()),
            HeaderDerivation::Fixed(value) => Some(value.clone()),
        }
    }
}

/// Prefix substitution applied to the outbound path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

impl PathRewrite {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Rewrite `path` when it starts with `from` on a segment boundary.
    pub fn apply(&self, path: &str) -> Option<String> {
        strip_segment_prefix(path, &self.from).map(|rest| format!("{}{rest}", self.to))
    }
}

/// One routing rule
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// Logical service name, used in client-facing errors ("Media")
    pub name: String,
    /// Path prefix without trailing slash
    pub prefix: String,
    /// Downstream base URL
    pub target: Url,
    /// Whether AuthGate must authenticate the request
    pub auth_required: bool,
    /// Hard deadline for the downstream call
    pub timeout: Duration,
    /// Buffer the request body before forwarding. When false the body is
    /// streamed through untouched (file uploads).
    pub buffer_body: bool,
    /// Optional outbound path rewrite
    pub rewrite: Option<PathRewrite>,
    /// Outbound headers set after the inbound headers are copied
    pub header_rewrites: Vec<(HeaderName, HeaderDerivation)>,
}

impl RouteRule {
    /// A rule that passes paths, bodies and headers through unchanged.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, target: Url) -> Self {
        let prefix: String = prefix.into();
        Self {
            name: name.into(),
            prefix: prefix.trim_end_matches('/').to_string(),
            target,
            auth_required: false,
            timeout: Duration::from_secs(30),
            buffer_body: true,
            rewrite: None,
            header_rewrites: Vec::new(),
        }
    }

    pub fn authenticated(mut self) -> Self {
        self.auth_required = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn streamed(mut self) -> Self {
        self.buffer_body = false;
        self
    }

    pub fn rewrite(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrite = Some(PathRewrite::new(from, to));
        self
    }

    pub fn header(mut self, name: HeaderName, derivation: HeaderDerivation) -> Self {
        self.header_rewrites.push((name, derivation));
        self
    }

    /// Whether this rule's prefix covers `path`.
    pub fn matches(&self, path: &str) -> bool {
        strip_segment_prefix(path, &self.prefix).is_some()
    }

    /// Outbound path after the rule's rewrite.
    pub fn outbound_path(&self, path: &str) -> String {
        self.rewrite
            .as_ref()
            .and_then(|rewrite| rewrite.apply(path))
            .unwrap_or_else(|| path.to_string())
    }

    /// Full downstream URL for an inbound path and optional query string.
    pub fn outbound_url(&self, path: &str, query: Option<&str>) -> String {
        let base = self.target.as_str().trim_end_matches('/');
        let path = self.outbound_path(path);
        match query {
            Some(q) => format!("{base}{path}?{q}"),
            None => format!("{base}{path}"),
        }
    }

    /// Apply the header rewrites to an outbound header map.
    pub fn apply_header_rewrites(
        &self,
        outbound: &mut HeaderMap,
        inbound: &HeaderMap,
        identity: Option<&Claims>,
    ) {
        for (name, derivation) in &self.header_rewrites {
            match derivation.derive(inbound, identity) {
                Some(value) => {
                    outbound.insert(name.clone(), value);
                }
                None => {
                    outbound.remove(name);
                }
            }
        }
    }
}

/// Remainder of `path` after `prefix`, if the prefix ends on a segment boundary.
fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Ordered, immutable set of routing rules
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<Arc<RouteRule>>,
}

impl RouteTable {
    /// Build a table; rules are ordered longest prefix first. Among equal
    /// prefixes the earlier rule wins.
    pub fn new(rules: Vec<RouteRule>) -> Self {
        let mut rules: Vec<Arc<RouteRule>> = rules.into_iter().map(Arc::new).collect();
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { rules }
    }

    /// The gateway's standard table: media, posts and identity.
    pub fn from_config(config: &Config) -> Self {
        Self::new(vec![
            RouteRule::new("Media", "/api/v1/media", config.media_service_url.clone())
                .authenticated()
                .timeout(config.media_timeout)
                .streamed()
                .rewrite("/api/v1/media", "/api/media")
                .header(CONTENT_TYPE, HeaderDerivation::Inbound(CONTENT_TYPE))
                .header(X_USER_ID, HeaderDerivation::SubjectId),
            RouteRule::new("Post", "/api/v1/posts", config.post_service_url.clone())
                .authenticated()
                .timeout(config.post_timeout),
            RouteRule::new("Identity", "/api/v1/auth", config.identity_service_url.clone())
                .timeout(config.identity_timeout),
        ])
    }

    /// Most specific rule covering `path`.
    pub fn resolve(&self, path: &str) -> Option<Arc<RouteRule>> {
        self.rules.iter().find(|rule| rule.matches(path)).cloned()
    }

    /// Resolve a request path, refusing paths that are not normalized.
    pub fn route(&self, path: &str) -> Result<Arc<RouteRule>, RouteError> {
        if has_dot_segment(path) {
            return Err(RouteError::DotSegment);
        }
        self.resolve(path).ok_or(RouteError::NoMatch)
    }
}

/// Whether any segment of `path` is `.` or `..`, including `%2e` spellings.
fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let segment = segment.to_ascii_lowercase().replace("%2e", ".");
        segment == "." || segment == ".."
    })
}

/// Rule resolved for the current request (request extension)
#[derive(Debug, Clone)]
pub struct MatchedRoute(pub Arc<RouteRule>);

/// Resolve the route before any auth or proxy work; unmatched paths end here.
pub async fn resolve_route(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let rule = match state.routes.route(request.uri().path()) {
        Ok(rule) => rule,
        Err(err) => {
            info!(
                method = %request.method(),
                path = %request.uri().path(),
                error = %err,
                "Route not found"
            );
            return Err(err.into());
        }
    };

    request.extensions_mut().insert(MatchedRoute(rule));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn table() -> RouteTable {
        RouteTable::new(vec![
            RouteRule::new("Identity", "/api/v1", url("http://identity:3001")),
            RouteRule::new("Media", "/api/v1/media", url("http://media:3003"))
                .authenticated()
                .streamed()
                .rewrite("/api/v1/media", "/api/media"),
            RouteRule::new("Post", "/api/v1/posts/", url("http://post:3002")).authenticated(),
        ])
    }

    fn claims() -> Claims {
        Claims {
            subject_id: "u-1".into(),
            email: "a@example.com".into(),
            issued_at: None,
            expires_at: 0,
        }
    }

    #[test]
    fn longer_prefix_wins_regardless_of_declaration_order() {
        let table = table();
        assert_eq!(table.resolve("/api/v1/media/abc").unwrap().name, "Media");
        assert_eq!(table.resolve("/api/v1/posts").unwrap().name, "Post");
        assert_eq!(table.resolve("/api/v1/login").unwrap().name, "Identity");
    }

    #[test]
    fn matching_respects_segment_boundaries() {
        let table = table();
        assert_eq!(table.resolve("/api/v1/mediax").unwrap().name, "Identity");
        assert!(table.resolve("/api/v10").is_none());
        assert!(table.resolve("/health").is_none());
        assert!(table.resolve("/").is_none());
    }

    #[test]
    fn dot_segments_are_refused() {
        let table = table();
        for path in [
            "/api/v1/media/../posts/1",
            "/api/v1/media/./x",
            "/api/v1/media/%2e%2e/posts",
            "/api/v1/media/%2E./posts",
            "/api/v1/media/.%2e",
            "/api/v1/media/%2e",
        ] {
            assert_eq!(table.route(path).unwrap_err(), RouteError::DotSegment, "{path}");
        }
    }

    #[test]
    fn dotted_names_are_not_dot_segments() {
        let table = table();
        assert_eq!(table.route("/api/v1/media/photo.jpg").unwrap().name, "Media");
        assert_eq!(table.route("/api/v1/media/...").unwrap().name, "Media");
        assert_eq!(table.route("/api/v1/media/.hidden").unwrap().name, "Media");
        assert_eq!(table.route("/nope").unwrap_err(), RouteError::NoMatch);
    }

    #[test]
    fn trailing_slash_in_prefix_is_normalized() {
        let table = table();
        let rule = table.resolve("/api/v1/posts/42").unwrap();
        assert_eq!(rule.prefix, "/api/v1/posts");
    }

    #[test]
    fn resolution_is_idempotent() {
        let table = table();
        let first = table.resolve("/api/v1/posts/1").unwrap();
        for _ in 0..10 {
            assert!(Arc::ptr_eq(&first, &table.resolve("/api/v1/posts/1").unwrap()));
        }
    }

    #[test]
    fn concurrent_resolution_does_not_interfere() {
        let table = Arc::new(table());
        let handles: Vec<_> = ["/api/v1/media/1", "/api/v1/posts", "/api/v1/x", "/nope"]
            .into_iter()
            .cycle()
            .take(16)
            .map(|path| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || (path, table.resolve(path).map(|r| r.name.clone())))
            })
            .collect();

        for handle in handles {
            let (path, name) = handle.join().unwrap();
            let expected = match path {
                "/api/v1/media/1" => Some("Media"),
                "/api/v1/posts" => Some("Post"),
                "/api/v1/x" => Some("Identity"),
                _ => None,
            };
            assert_eq!(name.as_deref(), expected);
        }
    }

    #[test]
    fn rewrite_replaces_only_the_prefix() {
        let table = table();
        let media = table.resolve("/api/v1/media/upload").unwrap();
        assert_eq!(media.outbound_path("/api/v1/media/upload"), "/api/media/upload");
        assert_eq!(media.outbound_path("/api/v1/media"), "/api/media");

        let post = table.resolve("/api/v1/posts/1").unwrap();
        assert_eq!(post.outbound_path("/api/v1/posts/1"), "/api/v1/posts/1");
    }

    #[test]
    fn outbound_url_keeps_query_string() {
        let rule = RouteRule::new("Post", "/api/v1/posts", url("http://post:3002/"));
        assert_eq!(
            rule.outbound_url("/api/v1/posts", Some("page=2&limit=10")),
            "http://post:3002/api/v1/posts?page=2&limit=10"
        );
        assert_eq!(
            rule.outbound_url("/api/v1/posts/7", None),
            "http://post:3002/api/v1/posts/7"
        );
    }

    #[test]
    fn default_table_matches_gateway_layout() {
        let config = Config::from_lookup(|name| match name {
            "JWT_ACCESS_SECRET" => Some("a".into()),
            "JWT_REFRESH_SECRET" => Some("b".into()),
            _ => None,
        })
        .unwrap();
        let table = RouteTable::from_config(&config);

        let media = table.resolve("/api/v1/media/upload").unwrap();
        assert!(media.auth_required);
        assert!(!media.buffer_body);
        assert_eq!(media.timeout, Duration::from_secs(120));
        assert_eq!(media.outbound_path("/api/v1/media/upload"), "/api/media/upload");

        let posts = table.resolve("/api/v1/posts/1").unwrap();
        assert!(posts.auth_required);
        assert!(posts.buffer_body);

        let identity = table.resolve("/api/v1/auth/login").unwrap();
        assert!(!identity.auth_required);

        assert!(table.resolve("/api/v1/unknown").is_none());
    }

    #[test]
    fn header_rewrites_derive_from_identity_and_inbound() {
        let rule = RouteRule::new("Media", "/m", url("http://media:3003"))
            .header(CONTENT_TYPE, HeaderDerivation::Inbound(CONTENT_TYPE))
            .header(X_USER_ID, HeaderDerivation::SubjectId)
            .header(X_USER_EMAIL, HeaderDerivation::Email)
            .header(
                HeaderName::from_static("x-gateway"),
                HeaderDerivation::Fixed(HeaderValue::from_static("edge")),
            );

        let mut inbound = HeaderMap::new();
        inbound.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=x"),
        );

        let mut outbound = HeaderMap::new();
        rule.apply_header_rewrites(&mut outbound, &inbound, Some(&claims()));

        assert_eq!(outbound[CONTENT_TYPE], "multipart/form-data; boundary=x");
        assert_eq!(outbound[X_USER_ID], "u-1");
        assert_eq!(outbound[X_USER_EMAIL], "a@example.com");
        assert_eq!(outbound["x-gateway"], "edge");
    }

    #[test]
    fn header_rewrite_without_source_removes_header() {
        let rule = RouteRule::new("Media", "/m", url("http://media:3003"))
            .header(X_USER_ID, HeaderDerivation::SubjectId);

        let mut outbound = HeaderMap::new();
        outbound.insert(X_USER_ID, HeaderValue::from_static("spoofed"));
        rule.apply_header_rewrites(&mut outbound, &HeaderMap::new(), None);

        assert!(outbound.get(X_USER_ID).is_none());
    }
}
