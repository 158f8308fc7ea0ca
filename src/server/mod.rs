//! HTTP control surface: JSON API plus a WebSocket feed of session events.
//!
//! Callers are authorized upstream; the tenant arrives in the
//! `X-Tenant-Id` header and scopes every store call.

pub mod api;
pub mod ws;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::middleware;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::hitl::HitlRouter;
use crate::orchestrator::Orchestrator;
use crate::pubsub::BroadcastPubSub;
use crate::ratelimit::{TenantRateLimiter, rate_limit};
use crate::store::Stores;

pub use api::ApiError;

pub const TENANT_HEADER: &str = "x-tenant-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub stores: Stores,
    pub orchestrator: Arc<Orchestrator>,
    pub hitl: Arc<HitlRouter>,
    pub bus: BroadcastPubSub,
    /// Platform assumed for HITL replies that name none.
    pub hitl_platform: String,
}

pub type SharedState = Arc<AppState>;

/// The tenant named by the request headers, if any and well-formed.
pub fn tenant_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(TENANT_HEADER)?
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

/// Extractor for the calling tenant; rejects with 400 when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenant(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        tenant_from_headers(&parts.headers)
            .map(Tenant)
            .ok_or_else(|| ApiError::BadRequest("Missing or invalid X-Tenant-Id header".into()))
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// API and WebSocket routes behind the per-tenant rate limit.
pub fn build_router(state: SharedState, limiter: Arc<TenantRateLimiter>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(limiter, rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "aira listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;
    info!("server shut down gracefully");
    Ok(())
}
