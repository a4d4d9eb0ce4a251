use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    handlers::{create_secret, get_secret, healthcheck},
    rate_limit::{limit_by_ip, RateLimiter, RateWindow},
    store::{
        crypto::{self, EncryptionKey},
        db::{DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_TTL_SECONDS},
        KeyMode, Store, StoreOptions,
    },
    AppState,
};

/// Allowance on top of the payload limit for multipart framing and the
/// non-payload fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const KEY_FILE: &str = "burnlink.key";
const SALT_FILE: &str = "burnlink.salt";
const DB_FILE: &str = "burnlink.db";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Keep everything in memory; secrets do not survive a restart.
    pub in_memory: bool,
    pub key_mode: KeyMode,
    pub max_payload_bytes: usize,
    pub max_ttl_seconds: i64,
    pub sweep_interval: Duration,
    /// Upper bound on waiting for the store writer.
    pub store_timeout: Duration,
    /// `0` disables the window.
    pub rate_limit_per_minute: u32,
    /// `0` disables the window.
    pub rate_limit_per_hour: u32,
    /// Use `X-Forwarded-For` / `X-Real-IP` for the client address.
    pub trust_proxy: bool,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BURNLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("BURNLINK_PORT", 8080),
            data_dir: std::env::var("BURNLINK_DATA_DIR").ok().map(PathBuf::from),
            in_memory: env_flag("BURNLINK_IN_MEMORY", false),
            key_mode: env_parse("BURNLINK_KEY_MODE", KeyMode::Server),
            max_payload_bytes: env_parse("BURNLINK_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES),
            max_ttl_seconds: env_parse("BURNLINK_MAX_TTL_SECONDS", DEFAULT_MAX_TTL_SECONDS),
            sweep_interval: env_duration("BURNLINK_SWEEP_INTERVAL", Duration::from_secs(30)),
            store_timeout: env_duration("BURNLINK_STORE_TIMEOUT", Duration::from_secs(5)),
            rate_limit_per_minute: env_parse("BURNLINK_RATE_LIMIT_PER_MINUTE", 5),
            rate_limit_per_hour: env_parse("BURNLINK_RATE_LIMIT_PER_HOUR", 50),
            trust_proxy: env_flag("BURNLINK_TRUST_PROXY", false),
            cors_origins: std::env::var("BURNLINK_CORS_ORIGINS").ok(),
        }
    }
}

impl ServerConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            key_mode: self.key_mode,
            max_payload_bytes: self.max_payload_bytes,
            max_ttl_seconds: self.max_ttl_seconds,
        }
    }

    pub fn rate_limiter(&self) -> Option<RateLimiter> {
        RateLimiter::new([
            RateWindow::per_minute(self.rate_limit_per_minute),
            RateWindow::per_hour(self.rate_limit_per_hour),
        ])
    }
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!(var = name, value = %raw, error = %e, "ignoring invalid value");
            default
        }),
        Err(_) => default,
    }
}

fn env_duration(name: &str, default: Duration) -> Duration {
    env_parse::<humantime::Duration>(name, default.into()).into()
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

/// Read a master key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the master key from `BURNLINK_MASTER_KEY_FILE` (preferred) or
/// `BURNLINK_MASTER_KEY`. `None` means the server key lives in the data dir.
pub fn resolve_master_key() -> Result<Option<String>> {
    if let Ok(path) = std::env::var("BURNLINK_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("BURNLINK_MASTER_KEY").is_ok() {
            warn!("both BURNLINK_MASTER_KEY and BURNLINK_MASTER_KEY_FILE are set; using file");
        }
        return Ok(Some(key));
    }
    match std::env::var("BURNLINK_MASTER_KEY") {
        Ok(key) if key.is_empty() => anyhow::bail!("BURNLINK_MASTER_KEY must not be empty"),
        Ok(key) => Ok(Some(key)),
        Err(_) => Ok(None),
    }
}

/// Resolve (and create) the data directory: the configured one, else the
/// platform data dir (`~/.local/share/burnlink/` on Linux).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "burnlink")
            .context("no platform data directory; set BURNLINK_DATA_DIR")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir: {}", dir.display()))?;
    Ok(dir)
}

/// Build the server-wide encryption key.
///
/// With a master key: Argon2id over the master key and the persisted salt.
/// Without one: the raw key file in the data dir, generated on first start.
/// `data_dir = None` (in-memory mode) never touches disk.
pub fn load_server_key(master_key: Option<&str>, data_dir: Option<&Path>) -> Result<EncryptionKey> {
    match (master_key, data_dir) {
        (Some(master), Some(dir)) => {
            let salt = load_or_create_salt(dir)?;
            crypto::derive_key(master, &salt).context("derive server key")
        }
        (Some(master), None) => {
            crypto::derive_key(master, &crypto::generate_salt()).context("derive server key")
        }
        (None, Some(dir)) => load_or_create_key(dir),
        (None, None) => Ok(crypto::generate_key()),
    }
}

fn load_or_create_key(data_dir: &Path) -> Result<EncryptionKey> {
    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read burnlink.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "burnlink.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        write_private(&key_path, key.as_bytes()).context("write burnlink.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn load_or_create_salt(data_dir: &Path) -> Result<[u8; 32]> {
    let salt_path = data_dir.join(SALT_FILE);
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read burnlink.salt")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "burnlink.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let salt = crypto::generate_salt();
        write_private(&salt_path, &salt).context("write burnlink.salt")?;
        info!("generated new key derivation salt");
        Ok(salt)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// Assemble the HTTP router around `state`.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let body_limit = state.store.options().max_payload_bytes + MULTIPART_OVERHEAD;

    // Creation is throttled per client; reads are not.
    let create = Router::new()
        .route("/api/secrets/", post(create_secret))
        .route("/api/secrets", post(create_secret))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(state.clone(), limit_by_ip));

    let public = Router::new()
        .route("/api/secrets/{token}", get(get_secret))
        .route("/healthcheck", get(healthcheck));

    Router::new()
        .merge(create)
        .merge(public)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let master_key = resolve_master_key()?;
    let options = cfg.store_options();

    let store = if cfg.in_memory {
        info!("using in-memory store; secrets will not survive a restart");
        let key = load_server_key(master_key.as_deref(), None)?;
        Store::open_in_memory(key, options).context("open in-memory store")?
    } else {
        let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
        info!(data_dir = %data_dir.display(), "using data directory");
        let key = load_server_key(master_key.as_deref(), Some(&data_dir))?;
        Store::open(&data_dir.join(DB_FILE), key, options).context("open store")?
    };

    info!(
        key_mode = %cfg.key_mode,
        max_payload_bytes = cfg.max_payload_bytes,
        max_ttl_seconds = cfg.max_ttl_seconds,
        "secret store ready"
    );

    store
        .clone()
        .spawn_sweep(cfg.sweep_interval, cfg.store_timeout);

    let rate_limiter = cfg.rate_limiter();
    match &rate_limiter {
        Some(limiter) => {
            info!(
                per_minute = cfg.rate_limit_per_minute,
                per_hour = cfg.rate_limit_per_hour,
                "rate limiting secret creation"
            );
            limiter.clone().spawn_prune(Duration::from_secs(300));
        }
        None => warn!("rate limiting disabled"),
    }

    let state = AppState {
        store,
        store_timeout: cfg.store_timeout,
        rate_limiter,
        trust_proxy: cfg.trust_proxy,
    };

    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "burnlink server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
