//! In-memory fixed-window rate limiting for the checkout endpoints, keyed by
//! the opaque caller identity. Load shedding only; the availability
//! invariants do not depend on it.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::handlers::common::CALLER_ID_HEADER;
use crate::AppState;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Per-key fixed-window counters.
#[derive(Clone)]
pub struct RateLimiter {
    entries: Arc<DashMap<String, WindowEntry>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Records one request for `key`; `Err` carries the time until the
    /// window resets.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(WindowEntry {
                count: 0,
                window_start: now,
            });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        if entry.count > self.config.requests_per_window {
            let elapsed = now.duration_since(entry.window_start);
            Err(self.config.window.saturating_sub(elapsed))
        } else {
            Ok(())
        }
    }

    /// Drops windows that have been idle for at least one full window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

/// Axum middleware enforcing the limiter on whatever routes it wraps.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let key = req
        .headers()
        .get(CALLER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string();

    match state.rate_limiter.check(&key) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            debug!(caller = %key, "rate limit exceeded");
            let secs = retry_after.as_secs().max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", secs.to_string())],
                Json(json!({
                    "type": "rate_limited",
                    "code": "too_many_requests",
                    "message": "rate limit exceeded, slow down",
                })),
            )
                .into_response()
        }
    }
}
