use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        Multipart, Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    store::{
        codec::{DEFAULT_FILE_MIME, DEFAULT_FILE_NAME},
        token::KEY_SEPARATOR,
        FileAttachment, Payload, SecretError,
    },
    AppState,
};

// ── Error mapping ────────────────────────────────────────────────────────────

impl IntoResponse for SecretError {
    fn into_response(self) -> Response {
        if self.is_internal() {
            error!(error = %self, "request failed");
        }
        let (status, message) = match &self {
            SecretError::InvalidPayload(msg) | SecretError::InvalidTtl(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            SecretError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            SecretError::NotFound => (
                StatusCode::NOT_FOUND,
                "Secret not found or expired".to_owned(),
            ),
            SecretError::CorruptPayload(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_owned(),
            ),
            SecretError::StorageUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service unavailable".to_owned(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn healthcheck(State(state): State<AppState>) -> Response {
    match state
        .store
        .with_reader(state.store_timeout, |store| store.ping())
        .await
    {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => {
            warn!(error = %e, "healthcheck failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "storage unavailable"})),
            )
                .into_response()
        }
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub url: String,
}

/// Fields collected from the multipart body.
struct CreateForm {
    ttl: Option<i64>,
    payload: Payload,
}

pub async fn create_secret(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CreateResponse>, SecretError> {
    let multipart = multipart.map_err(|e| SecretError::InvalidPayload(e.body_text()))?;
    let limit = state.store.options().max_payload_bytes;
    let form = read_form(multipart, limit).await?;

    let ttl = form
        .ttl
        .ok_or_else(|| SecretError::InvalidTtl("ttl is required".into()))?;
    let payload = form.payload;

    let created = state
        .store
        .with_writer(state.store_timeout, move |store| store.create(&payload, ttl))
        .await?;

    info!(id = %created.id, ttl_seconds = ttl, "audit: secret.create");
    Ok(Json(CreateResponse {
        url: format!("/secrets/{}", created.token()),
    }))
}

async fn read_form(mut multipart: Multipart, limit: usize) -> Result<CreateForm, SecretError> {
    let mut form = CreateForm {
        ttl: None,
        payload: Payload::default(),
    };
    // Message and file bytes share one budget.
    let mut used = 0usize;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "ttl" => {
                let text = field.text().await.map_err(|e| multipart_error(e, limit))?;
                form.ttl = Some(parse_ttl(&text)?);
            }
            "message" => {
                let bytes = read_limited(&mut field, &mut used, limit).await?;
                let text = String::from_utf8(bytes).map_err(|_| {
                    SecretError::InvalidPayload("message must be valid UTF-8".into())
                })?;
                if !text.is_empty() {
                    form.payload.message = Some(text);
                }
            }
            "file" => {
                let file_name = field
                    .file_name()
                    .and_then(sanitize_file_name)
                    .unwrap_or_else(|| DEFAULT_FILE_NAME.to_owned());
                let mime = field
                    .content_type()
                    .filter(|m| !m.is_empty())
                    .unwrap_or(DEFAULT_FILE_MIME)
                    .to_owned();
                let bytes = read_limited(&mut field, &mut used, limit).await?;
                if !bytes.is_empty() {
                    form.payload.file = Some(FileAttachment {
                        name: file_name,
                        mime,
                        bytes,
                    });
                }
            }
            other => debug!(field = %other, "ignoring unknown form field"),
        }
    }

    Ok(form)
}

async fn read_limited(
    field: &mut Field<'_>,
    used: &mut usize,
    limit: usize,
) -> Result<Vec<u8>, SecretError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, limit))? {
        *used += chunk.len();
        if *used > limit {
            return Err(SecretError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn multipart_error(e: MultipartError, limit: usize) -> SecretError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        SecretError::PayloadTooLarge { limit }
    } else {
        SecretError::InvalidPayload(format!("malformed form data: {}", e.body_text()))
    }
}

fn parse_ttl(text: &str) -> Result<i64, SecretError> {
    text.trim().parse::<i64>().map_err(|_| {
        SecretError::InvalidTtl("ttl must be an integer number of seconds".into())
    })
}

/// Keep only the final path component of a client-supplied file name.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_owned())
    }
}

// ── Get ───────────────────────────────────────────────────────────────────────

/// JSON shape of a consumed secret. Absent parts are omitted.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mime: Option<String>,
    /// Base64 (standard alphabet, padded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
}

impl From<&Payload> for SecretResponse {
    fn from(payload: &Payload) -> Self {
        let file = payload.file.as_ref();
        Self {
            message: payload.message.clone(),
            file_name: file.map(|f| f.name.clone()),
            file_mime: file.map(|f| f.mime.clone()),
            file_data: file.map(|f| STANDARD.encode(&f.bytes)),
        }
    }
}

pub async fn get_secret(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, SecretError> {
    // Never log the link key half of a token.
    let id = token
        .split(KEY_SEPARATOR)
        .next()
        .unwrap_or_default()
        .to_owned();

    let result = state
        .store
        .with_writer(state.store_timeout, move |store| store.consume(&token))
        .await;

    match result {
        Ok(payload) => {
            info!(id = %id, "audit: secret.burned");
            let body = SecretResponse::from(&payload);
            Ok(([(header::CACHE_CONTROL, "no-store")], Json(body)).into_response())
        }
        Err(SecretError::NotFound) => {
            debug!(id = %id, "secret not found or expired");
            Err(SecretError::NotFound)
        }
        Err(e) => Err(e),
    }
}
