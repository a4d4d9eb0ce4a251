use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use burnlink_server::store::KeyMode;
use clap::{Parser, Subcommand};
use reqwest::{multipart, Client, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILE_MIME: &str = "application/octet-stream";

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnlink", about = "burnlink: one-time secret links", version)]
struct Cli {
    /// burnlink server URL (default: http://localhost:8080 or $BURNLINK_SERVER)
    #[arg(long, env = "BURNLINK_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the burnlink HTTP server
    Serve {
        /// Host to bind (default: $BURNLINK_HOST or 0.0.0.0)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (default: $BURNLINK_PORT or 8080)
        #[arg(long)]
        port: Option<u16>,
        /// Directory for the database and key material
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Keep secrets in memory only
        #[arg(long)]
        in_memory: bool,
        /// Where the decryption key lives: server or link
        #[arg(long)]
        key_mode: Option<KeyMode>,
    },
    /// Create a one-time secret and print its link
    Create {
        /// Secret text; `-` reads it from stdin
        #[arg(long, short)]
        message: Option<String>,
        /// File to attach
        #[arg(long, short)]
        file: Option<PathBuf>,
        /// MIME type of the attachment (default: guessed from the extension)
        #[arg(long, requires = "file")]
        mime: Option<String>,
        /// Lifetime e.g. 10m, 1h, 7d
        #[arg(long, default_value = "1h")]
        ttl: String,
        /// Base URL of the share page (default: the server URL)
        #[arg(long, env = "BURNLINK_SHARE_BASE")]
        share_base: Option<String>,
    },
    /// Open a secret link (this destroys the secret)
    Open {
        /// Full link or bare token
        link: String,
        /// Directory to write an attached file into
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Check that the server and its store are up
    Health,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Commands::Serve { .. }));

    match cli.command {
        Commands::Serve {
            host,
            port,
            data_dir,
            in_memory,
            key_mode,
        } => cmd_serve(host, port, data_dir, in_memory, key_mode).await,

        Commands::Create {
            message,
            file,
            mime,
            ttl,
            share_base,
        } => {
            let base = share_base.as_deref().unwrap_or(&cli.server);
            let attachment = file.as_deref().map(|path| (path, mime.as_deref()));
            cmd_create(&cli.server, base, message, attachment, &ttl).await
        }

        Commands::Open { link, out } => cmd_open(&cli.server, &link, &out).await,

        Commands::Health => cmd_health(&cli.server).await,
    }
}

fn init_tracing(serving: bool) {
    let default_level = if serving { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("BURNLINK_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = std::env::var("BURNLINK_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(
    host: Option<String>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
    in_memory: bool,
    key_mode: Option<KeyMode>,
) -> Result<()> {
    let mut cfg = burnlink_server::ServerConfig::default();
    if let Some(host) = host {
        cfg.host = host;
    }
    if let Some(port) = port {
        cfg.port = port;
    }
    if data_dir.is_some() {
        cfg.data_dir = data_dir;
    }
    if in_memory {
        cfg.in_memory = true;
    }
    if let Some(mode) = key_mode {
        cfg.key_mode = mode;
    }

    burnlink_server::run(cfg).await
}

#[derive(Deserialize)]
struct CreateResponse {
    url: String,
}

async fn cmd_create(
    server: &str,
    share_base: &str,
    message: Option<String>,
    file: Option<(&Path, Option<&str>)>,
    ttl: &str,
) -> Result<()> {
    if message.is_none() && file.is_none() {
        anyhow::bail!("provide --message, --file or both");
    }
    let ttl_seconds = parse_duration(ttl)?;

    let mut form = multipart::Form::new().text("ttl", ttl_seconds.to_string());

    if let Some(message) = message {
        let message = if message == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read message from stdin")?;
            buf
        } else {
            message
        };
        form = form.text("message", message);
    }

    if let Some((path, mime)) = file {
        let bytes =
            std::fs::read(path).with_context(|| format!("read file: {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        let mime = mime.unwrap_or_else(|| mime_for_path(path));
        debug!(file = %name, mime, bytes = bytes.len(), "attaching file");
        let part = multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str(mime)
            .with_context(|| format!("invalid MIME type: {mime}"))?;
        form = form.part("file", part);
    }

    let resp = Client::new()
        .post(format!("{}/api/secrets/", server.trim_end_matches('/')))
        .multipart(form)
        .send()
        .await
        .context("HTTP request failed")?;

    let resp = check_status(resp).await?;
    let created: CreateResponse = resp.json().await.context("parse response")?;
    println!("{}{}", share_base.trim_end_matches('/'), created.url);
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretResponse {
    message: Option<String>,
    file_name: Option<String>,
    file_data: Option<String>,
}

async fn cmd_open(server: &str, link: &str, out: &Path) -> Result<()> {
    let token = token_from_link(link).context("link does not contain a secret token")?;

    let resp = Client::new()
        .get(format!(
            "{}/api/secrets/{}",
            server.trim_end_matches('/'),
            token
        ))
        .send()
        .await
        .context("HTTP request failed")?;

    let resp = check_status(resp).await?;
    let secret: SecretResponse = resp.json().await.context("parse response")?;

    if let Some(message) = &secret.message {
        println!("{message}");
    }

    if let Some(data) = &secret.file_data {
        let bytes = STANDARD.decode(data).context("decode file data")?;
        let name = secret
            .file_name
            .as_deref()
            .and_then(|n| Path::new(n).file_name())
            .map(|n| n.to_owned())
            .unwrap_or_else(|| "file".into());
        let dest = out.join(name);
        std::fs::write(&dest, &bytes)
            .with_context(|| format!("write file: {}", dest.display()))?;
        println!("✓ wrote {} ({} bytes)", dest.display(), bytes.len());
    }
    Ok(())
}

async fn cmd_health(server: &str) -> Result<()> {
    let resp = Client::new()
        .get(format!("{}/healthcheck", server.trim_end_matches('/')))
        .send()
        .await
        .context("HTTP request failed")?;

    check_status(resp).await?;
    println!("ok");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Turn a non-2xx response into an error carrying the server's message.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let json: Value = resp.json().await.unwrap_or_default();
    match json["error"].as_str() {
        Some(error) => anyhow::bail!("{error} ({status})"),
        None => anyhow::bail!("server returned {status}"),
    }
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

/// MIME type for an attachment, from its extension.
fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        // Text
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        "env" | "pem" | "key" | "pub" | "crt" => "text/plain",
        // Images
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        // Documents
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        // Archives
        "zip" => "application/zip",
        "gz" | "gzip" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        _ => DEFAULT_FILE_MIME,
    }
}

/// Last path segment of a link, ignoring any query or fragment.
fn token_from_link(link: &str) -> Option<&str> {
    let link = link.split(['?', '#']).next().unwrap_or(link);
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|t| !t.is_empty())
}
