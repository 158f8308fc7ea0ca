//! Per-tenant token buckets for the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::server::tenant_from_headers;

/// Buckets untouched for this long are evicted by the sweep.
pub const IDLE_TTL: Duration = Duration::from_secs(30 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct TenantRateLimiter {
    rate: f64,
    burst: f64,
    buckets: DashMap<Uuid, Bucket>,
}

impl TenantRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            rate: config.rate.max(f64::MIN_POSITIVE),
            burst: f64::from(config.burst.max(1)),
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, tenant_id: Uuid) -> Result<(), Duration> {
        self.check_at(tenant_id, Instant::now())
    }

    /// Take one token from the tenant's bucket. On refusal returns how long
    /// until a token is available.
    pub fn check_at(&self, tenant_id: Uuid, now: Instant) -> Result<(), Duration> {
        let mut bucket = self.buckets.entry(tenant_id).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
        }
    }

    /// Drop buckets idle for longer than [`IDLE_TTL`]. Returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < IDLE_TTL);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = limiter.sweep(Instant::now());
                        if evicted > 0 {
                            debug!(evicted, remaining = limiter.len(), "rate limiter sweep");
                        }
                    }
                }
            }
        })
    }
}

/// Axum middleware. Requests without a tenant header pass through; the
/// handlers reject them.
pub async fn rate_limit(
    State(limiter): State<Arc<TenantRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(tenant_id) = tenant_from_headers(request.headers()) else {
        return next.run(request).await;
    };

    match limiter.check(tenant_id) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            warn!(%tenant_id, retry_after_secs = secs, "rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "Rate limit exceeded" })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}
