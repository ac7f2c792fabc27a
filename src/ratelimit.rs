//! Fixed-window rate limiting keyed by client address.
//!
//! The client id is the first entry of `X-Forwarded-For` when present, else
//! the peer address. Health, readiness, and metrics endpoints bypass the
//! limiter.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use serde_json::json;
use tracing::warn;

use crate::handlers::AppState;
use crate::metrics;

const EXEMPT_PATHS: [&str; 3] = ["/health", "/ready", "/metrics"];

struct WindowCounter {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited,
}

pub struct RateLimiter {
    requests: DashMap<String, WindowCounter>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            limit: limit.max(1),
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_seconds(&self) -> u64 {
        self.window.as_secs()
    }

    /// Count a request against the client's current window.
    pub fn check(&self, client_id: &str) -> Decision {
        let now = Instant::now();
        let mut entry = self
            .requests
            .entry(client_id.to_string())
            .or_insert(WindowCounter {
                count: 0,
                window_start: now,
            });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 1;
            entry.window_start = now;
            return Decision::Allowed {
                remaining: self.limit - 1,
            };
        }

        if entry.count >= self.limit {
            return Decision::Limited;
        }

        entry.count += 1;
        Decision::Allowed {
            remaining: self.limit - entry.count,
        }
    }
}

/// Request middleware wrapping the limiter.
pub async fn middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let limiter = match &state.rate_limiter {
        Some(limiter) => limiter.clone(),
        None => return next.run(request).await,
    };

    let client_id = client_id(&request);
    match limiter.check(&client_id) {
        Decision::Limited => {
            metrics::REQUESTS_RATE_LIMITED.inc();
            warn!(client = %client_id, "rate limit exceeded");

            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "Rate limit exceeded",
                    "retry_after": limiter.window_seconds(),
                })),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert("Retry-After", header_num(limiter.window_seconds()));
            headers.insert("X-RateLimit-Limit", header_num(limiter.limit() as u64));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            response
        }
        Decision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", header_num(limiter.limit() as u64));
            headers.insert("X-RateLimit-Remaining", header_num(remaining as u64));
            response
        }
    }
}

fn header_num(n: u64) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn client_id(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
