pub mod handlers;
pub mod rate_limit;
pub mod server;
pub mod store;

use std::time::Duration;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    /// Upper bound on waiting for the store (see `Store::with_writer`).
    pub store_timeout: Duration,
    /// `None` when rate limiting is disabled.
    pub rate_limiter: Option<rate_limit::RateLimiter>,
    /// Take the client address from proxy headers.
    pub trust_proxy: bool,
}

pub use server::{read_key_file, resolve_data_dir, router, run, ServerConfig};
