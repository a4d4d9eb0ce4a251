//! Per-client rate limiting for secret creation.
//!
//! Token buckets keyed by client IP. Several windows can be stacked (for
//! example 5 per minute and 50 per hour); a request must fit in all of them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::AppState;

/// One refill window: `max_tokens` requests per `period`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateWindow {
    pub max_tokens: u32,
    pub period: Duration,
}

impl RateWindow {
    pub fn per_minute(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            period: Duration::from_secs(60),
        }
    }

    pub fn per_hour(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            period: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    last_refill: Instant,
    refill_rate_per_sec: f64,
}

impl TokenBucket {
    fn new(window: RateWindow, now: Instant) -> Self {
        Self {
            tokens: window.max_tokens as f64,
            max_tokens: window.max_tokens as f64,
            last_refill: now,
            refill_rate_per_sec: window.max_tokens as f64 / window.period.as_secs_f64(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Seconds until a token is available, or 0 if one is available now.
    fn wait_secs(&self) -> u32 {
        if self.tokens >= 1.0 {
            0
        } else {
            ((1.0 - self.tokens) / self.refill_rate_per_sec).ceil() as u32
        }
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.max_tokens
    }
}

/// Rate limiter over one or more stacked windows.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Vec<TokenBucket>>>>,
    windows: Vec<RateWindow>,
}

impl RateLimiter {
    /// Build a limiter; windows with zero capacity are dropped. Returns
    /// `None` when no window remains, i.e. limiting is disabled.
    pub fn new(windows: impl IntoIterator<Item = RateWindow>) -> Option<Self> {
        let windows: Vec<_> = windows
            .into_iter()
            .filter(|w| w.max_tokens > 0 && !w.period.is_zero())
            .collect();
        if windows.is_empty() {
            return None;
        }
        Some(Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            windows,
        })
    }

    /// Take one token from every window for `key`.
    ///
    /// Returns `Err(retry_after_secs)` without consuming anything if any
    /// window is exhausted.
    pub async fn check(&self, key: &str) -> Result<(), u32> {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: &str, now: Instant) -> Result<(), u32> {
        let mut buckets = self.buckets.lock().await;
        let entry = buckets.entry(key.to_owned()).or_insert_with(|| {
            self.windows
                .iter()
                .map(|w| TokenBucket::new(*w, now))
                .collect()
        });

        for bucket in entry.iter_mut() {
            bucket.refill(now);
        }

        let retry_after = entry.iter().map(TokenBucket::wait_secs).max().unwrap_or(0);
        if retry_after > 0 {
            warn!(key = %key, retry_after_seconds = retry_after, "rate limit exceeded");
            return Err(retry_after);
        }

        for bucket in entry.iter_mut() {
            bucket.tokens -= 1.0;
        }
        debug!(key = %key, "rate limit check passed");
        Ok(())
    }

    /// Drop buckets that have fully refilled; they carry no state worth keeping.
    pub async fn prune(&self) -> usize {
        self.prune_at(Instant::now()).await
    }

    async fn prune_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, entry| {
            entry.iter_mut().for_each(|b| b.refill(now));
            !entry.iter().all(TokenBucket::is_full)
        });
        before - buckets.len()
    }

    /// Spawn a background task that prunes idle buckets every `interval`.
    pub fn spawn_prune(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let pruned = self.prune().await;
                if pruned > 0 {
                    debug!(pruned, "pruned idle rate limit buckets");
                }
            }
        });
    }
}

/// Resolve the client address used as the rate limit key.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = xff.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_owned();
                }
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            let trimmed = real_ip.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Axum middleware enforcing the configured limiter, if any.
pub async fn limit_by_ip(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return next.run(request).await;
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer, state.trust_proxy);

    match limiter.check(&ip).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "rate limit exceeded"})),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}
