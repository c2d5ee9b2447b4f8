//! Configuration for the API gateway.
//!
//! All configuration is loaded from environment variables. Missing,
//! unparsable or zero-duration values fall back to defaults, and every
//! substitution is logged as a warning. The two signing secrets have no
//! default.
//! No secrets are logged.

use reqwest::Url;
use std::time::Duration;
use tracing::warn;

/// Default downstream identity service address
pub const DEFAULT_IDENTITY_SERVICE_URL: &str = "http://localhost:3001";

/// Default downstream post service address
pub const DEFAULT_POST_SERVICE_URL: &str = "http://localhost:3002";

/// Default downstream media service address
pub const DEFAULT_MEDIA_SERVICE_URL: &str = "http://localhost:3003";

/// Default listen address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default cap for buffered request bodies (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Configuration errors that abort startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingSecret(&'static str),

    #[error("JWT_ACCESS_SECRET and JWT_REFRESH_SECRET must differ")]
    SharedSecret,

    #[error("{name} is not a valid http(s) URL: {value}")]
    InvalidUrl { name: &'static str, value: String },
}

/// Gateway configuration
#[derive(Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: String,

    /// Server port
    pub port: u16,

    // === Downstream services ===
    /// Identity service base URL (login, registration, token issuance)
    pub identity_service_url: Url,

    /// Post service base URL
    pub post_service_url: Url,

    /// Media service base URL
    pub media_service_url: Url,

    // === Secrets ===
    /// HMAC secret for access tokens
    pub jwt_access_secret: String,

    /// HMAC secret for refresh tokens
    pub jwt_refresh_secret: String,

    // === Timeouts ===
    /// Deadline for identity service calls (default: 30s)
    pub identity_timeout: Duration,

    /// Deadline for post service calls (default: 30s)
    pub post_timeout: Duration,

    /// Deadline for media service calls (default: 120s)
    pub media_timeout: Duration,

    /// Drain budget after a termination signal (default: 30s)
    pub shutdown_timeout: Duration,

    // === Limits ===
    /// Maximum buffered request body in bytes (default: 10 MiB)
    pub max_body_size: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_access_secret = secret(&lookup, "JWT_ACCESS_SECRET")?;
        let jwt_refresh_secret = secret(&lookup, "JWT_REFRESH_SECRET")?;
        if jwt_access_secret == jwt_refresh_secret {
            return Err(ConfigError::SharedSecret);
        }

        Ok(Self {
            bind_addr: bind_addr(&lookup),
            port: number(&lookup, "PORT", 3000),

            identity_service_url: service_url(
                &lookup,
                "IDENTITY_SERVICE_URL",
                DEFAULT_IDENTITY_SERVICE_URL,
            )?,
            post_service_url: service_url(&lookup, "POST_SERVICE_URL", DEFAULT_POST_SERVICE_URL)?,
            media_service_url: service_url(
                &lookup,
                "MEDIA_SERVICE_URL",
                DEFAULT_MEDIA_SERVICE_URL,
            )?,

            jwt_access_secret,
            jwt_refresh_secret,

            identity_timeout: seconds(&lookup, "IDENTITY_TIMEOUT_SECS", 30),
            post_timeout: seconds(&lookup, "POST_TIMEOUT_SECS", 30),
            media_timeout: seconds(&lookup, "MEDIA_TIMEOUT_SECS", 120),
            shutdown_timeout: seconds(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30),

            max_body_size: number(&lookup, "MAX_BODY_SIZE", DEFAULT_MAX_BODY_SIZE),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field("identity_service_url", &self.identity_service_url.as_str())
            .field("post_service_url", &self.post_service_url.as_str())
            .field("media_service_url", &self.media_service_url.as_str())
            .field("jwt_access_secret", &"<redacted>")
            .field("jwt_refresh_secret", &"<redacted>")
            .field("identity_timeout", &self.identity_timeout)
            .field("post_timeout", &self.post_timeout)
            .field("media_timeout", &self.media_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

fn secret<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::MissingSecret(name))
}

fn service_url<F>(lookup: &F, name: &'static str, default: &str) -> Result<Url, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(name).filter(|v| !v.trim().is_empty()) {
        Some(value) => value,
        None => {
            warn!(variable = name, default, "Service URL not set, using default");
            default.to_string()
        }
    };

    match Url::parse(value.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(url),
        _ => Err(ConfigError::InvalidUrl { name, value }),
    }
}

fn bind_addr<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("BIND_ADDR").filter(|v| !v.trim().is_empty()) {
        Some(addr) => addr.trim().to_string(),
        None => {
            warn!(
                variable = "BIND_ADDR",
                default = DEFAULT_BIND_ADDR,
                "Variable not set, using default"
            );
            DEFAULT_BIND_ADDR.to_string()
        }
    }
}

/// A non-zero duration in whole seconds.
fn seconds<F>(lookup: &F, name: &'static str, default: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match number(lookup, name, default) {
        0 => {
            warn!(variable = name, default, "Zero duration is not allowed, using default");
            Duration::from_secs(default)
        }
        secs => Duration::from_secs(secs),
    }
}

fn number<F, T>(lookup: &F, name: &'static str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match lookup(name) {
        None => {
            warn!(variable = name, %default, "Variable not set, using default");
            default
        }
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, %default, "Invalid value, using default");
                default
            }
        },
    }
}
