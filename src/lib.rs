//! # API Gateway
//!
//! Edge gateway in front of the identity, post and media services.
//!
//! ## Design Principles
//!
//! - **Single trust boundary**: bearer tokens are verified here and nowhere
//!   else; downstream services trust `x-user-id` / `x-user-email`
//! - **Static routing**: the route table is built once at startup
//! - **No retries**: a downstream failure is reported once as a 503
//! - **Bounded shutdown**: in-flight requests drain under a fixed deadline
//! - **No secrets in logs**: tokens appear only as short fingerprints
//!
//! ## Architecture
//!
//! ```text
//!                ┌───────────────────────────────────────────┐
//! ┌────────┐     │  RouteTable ──▶ AuthGate ──▶ Dispatcher   │     ┌──────────┐
//! │ Client │────▶│                                           │────▶│ identity │
//! └────────┘     │  /health  /refresh (TokenIssuer)          │     │ post     │
//!                └───────────────────────────────────────────┘     │ media    │
//!                                                                  └──────────┘
//! ```
//!
//! ## API Overview
//!
//! | Endpoint | Method | Auth | Description |
//! |----------|--------|------|-------------|
//! | `/health` | GET | no | Health check |
//! | `/refresh`, `/api/v1/refresh` | POST | no | Exchange refresh token for access token |
//! | `/api/v1/auth/*` | any | no | Identity service |
//! | `/api/v1/posts/*` | any | yes | Post service |
//! | `/api/v1/media/*` | any | yes | Media service (streamed, rewritten to `/api/media`) |

pub mod auth;
pub mod config;
pub mod handlers;
pub mod layers;
pub mod lifecycle;
pub mod models;
pub mod proxy;
pub mod routes;
pub mod token;

pub use config::Config;
pub use handlers::AppState;
pub use lifecycle::{Lifecycle, ShutdownOutcome, ShutdownState};
pub use routes::{RouteRule, RouteTable};

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

/// Build the Axum router with all endpoints and middleware.
pub fn build_router(state: AppState) -> Router {
    let max_body_size = state.config.max_body_size;

    // Proxied traffic: route resolution runs first, then the AuthGate
    let proxied = Router::new()
        .fallback(handlers::proxy_request)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::resolve_route,
        ))
        .with_state(state.clone());

    let app = Router::new()
        // Health check (unauthenticated)
        .route(
            "/health",
            get(handlers::health).fallback(handlers::method_not_allowed),
        )
        // Token refresh (unauthenticated, bypasses the route table)
        .route(
            "/refresh",
            post(handlers::refresh_token).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/v1/refresh",
            post(handlers::refresh_token).fallback(handlers::method_not_allowed),
        )
        .fallback_service(proxied)
        // Applies to extractors only; streamed bodies are not limited
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state);

    layers::apply(app)
}
