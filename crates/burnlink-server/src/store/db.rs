use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error};

use super::codec::{self, CodecError, Payload, MAX_FILE_NAME_LEN};
use super::crypto::{self, EncryptionKey};
use super::error::SecretError;
use super::model::{KeyMode, SecretRecord};
use super::token::{self, SecretToken};

pub(super) const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Marker byte for the record framing: `[RECORD_MARKER, key_mode] + bincode(record)`.
const RECORD_MARKER: u8 = 0x01;

/// How many fresh ids to try before giving up on a collision streak.
const MAX_ID_ATTEMPTS: usize = 4;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_TTL_SECONDS: i64 = 7 * 86_400;

/// Record manager policy.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Key policy applied to newly created records.
    pub key_mode: KeyMode,
    pub max_payload_bytes: usize,
    pub max_ttl_seconds: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            key_mode: KeyMode::Server,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_ttl_seconds: DEFAULT_MAX_TTL_SECONDS,
        }
    }
}

/// Result of a successful `create`.
pub struct CreatedSecret {
    pub id: String,
    /// Unix milliseconds.
    pub expires_at: i64,
    link_key: Option<EncryptionKey>,
}

impl std::fmt::Debug for CreatedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedSecret")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .field("link_key", &self.link_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CreatedSecret {
    /// Token to embed in the share link.
    pub fn token(&self) -> String {
        token::format_token(&self.id, self.link_key.as_ref())
    }
}

enum ConsumeOutcome {
    Missing,
    WrongKey,
    Evicted,
    Corrupt(String),
    Served(Payload),
}

enum OpenError {
    WrongKey,
    Corrupt(String),
}

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    key: Arc<EncryptionKey>,
    options: StoreOptions,
    /// Bounds how long async callers wait for redb's single writer.
    pub(super) write_gate: Arc<Mutex<()>>,
}

impl Store {
    /// Open (or create) the database at `path`, sealing server-mode records with `key`.
    pub fn open(path: &Path, key: EncryptionKey, options: StoreOptions) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;
        Self::init(db, key, options)
    }

    /// Open a store that lives only in memory; everything is lost on exit.
    pub fn open_in_memory(key: EncryptionKey, options: StoreOptions) -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .context("create in-memory redb database")?;
        Self::init(db, key, options)
    }

    fn init(db: Database, key: EncryptionKey, options: StoreOptions) -> Result<Self> {
        // Ensure the table exists.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
            options,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub(super) fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Store a new secret and return its id (plus link key in link mode).
    pub fn create(&self, payload: &Payload, ttl_seconds: i64) -> Result<CreatedSecret, SecretError> {
        self.create_at(payload, ttl_seconds, Self::now())
    }

    pub(crate) fn create_at(
        &self,
        payload: &Payload,
        ttl_seconds: i64,
        now: i64,
    ) -> Result<CreatedSecret, SecretError> {
        self.validate(payload, ttl_seconds)?;
        // An empty message or file next to real content is not stored.
        let cleaned = payload.without_empty_parts();
        let payload = cleaned.as_ref().unwrap_or(payload);

        let mode = self.options.key_mode;
        let link_key = match mode {
            KeyMode::Server => None,
            KeyMode::Link => Some(crypto::generate_key()),
        };
        let key = link_key.as_ref().unwrap_or(self.key.as_ref());

        let stored = codec::encode(payload, key)
            .map_err(|e| SecretError::CorruptPayload(e.to_string()))?;
        let record = SecretRecord::new(stored, now, ttl_seconds);
        let bytes = encode_record(&record, mode)?;

        let write_txn = self.db.begin_write()?;
        let id = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut attempt = 0;
            loop {
                let candidate = token::generate_id();
                let taken = table.get(candidate.as_str())?.is_some();
                if !taken {
                    table.insert(candidate.as_str(), bytes.as_slice())?;
                    break candidate;
                }
                attempt += 1;
                if attempt >= MAX_ID_ATTEMPTS {
                    return Err(SecretError::StorageUnavailable(
                        "could not allocate a unique secret id".into(),
                    ));
                }
            }
        };
        write_txn.commit()?;

        debug!(id = %id, key_mode = %mode, expires_at = record.expires_at, "stored secret");
        Ok(CreatedSecret {
            id,
            expires_at: record.expires_at,
            link_key,
        })
    }

    fn validate(&self, payload: &Payload, ttl_seconds: i64) -> Result<(), SecretError> {
        if payload.is_empty() {
            return Err(SecretError::InvalidPayload(
                "must provide message or file".into(),
            ));
        }
        if let Some(file) = &payload.file {
            if file.name.len() > MAX_FILE_NAME_LEN {
                return Err(SecretError::InvalidPayload(format!(
                    "file name exceeds {MAX_FILE_NAME_LEN} bytes"
                )));
            }
        }
        if ttl_seconds <= 0 {
            return Err(SecretError::InvalidTtl("ttl must be positive".into()));
        }
        if ttl_seconds > self.options.max_ttl_seconds {
            return Err(SecretError::InvalidTtl(format!(
                "ttl must not exceed {} seconds",
                self.options.max_ttl_seconds
            )));
        }
        if payload.size() > self.options.max_payload_bytes {
            return Err(SecretError::PayloadTooLarge {
                limit: self.options.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Read a secret exactly once. The lookup, the consumed transition and the
    /// delete all happen inside one write transaction; the payload is handed
    /// back only after that transaction commits.
    pub fn consume(&self, token: &str) -> Result<Payload, SecretError> {
        self.consume_at(token, Self::now())
    }

    pub(crate) fn consume_at(&self, token: &str, now: i64) -> Result<Payload, SecretError> {
        let Some(token) = SecretToken::parse(token) else {
            return Err(SecretError::NotFound);
        };
        let id = token.id.as_str();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Copy the bytes out so the AccessGuard is dropped before mutation.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => ConsumeOutcome::Missing,
                Some(bytes) => match decode_record(&bytes) {
                    Err(e) => {
                        table.remove(id)?;
                        ConsumeOutcome::Corrupt(e.to_string())
                    }
                    Ok((mut record, mode)) => {
                        if record.is_dead(now) {
                            table.remove(id)?;
                            debug!(id = %id, "lazy-evicted expired secret");
                            ConsumeOutcome::Evicted
                        } else {
                            match self.open_payload(&record, mode, token.link_key.as_ref()) {
                                Err(OpenError::WrongKey) => ConsumeOutcome::WrongKey,
                                Err(OpenError::Corrupt(msg)) => {
                                    table.remove(id)?;
                                    ConsumeOutcome::Corrupt(msg)
                                }
                                Ok(payload) => {
                                    record.consumed = true;
                                    debug_assert!(record.is_dead(now));
                                    table.remove(id)?;
                                    ConsumeOutcome::Served(payload)
                                }
                            }
                        }
                    }
                },
            }
        };

        match outcome {
            ConsumeOutcome::Missing => {
                write_txn.abort()?;
                Err(SecretError::NotFound)
            }
            ConsumeOutcome::WrongKey => {
                write_txn.abort()?;
                debug!(id = %id, "link key rejected; record left intact");
                Err(SecretError::NotFound)
            }
            ConsumeOutcome::Evicted => {
                write_txn.commit()?;
                Err(SecretError::NotFound)
            }
            ConsumeOutcome::Corrupt(msg) => {
                write_txn.commit()?;
                error!(id = %id, error = %msg, "discarded undecodable secret");
                Err(SecretError::CorruptPayload(msg))
            }
            ConsumeOutcome::Served(payload) => {
                write_txn.commit()?;
                debug!(id = %id, "burned after read");
                Ok(payload)
            }
        }
    }

    fn open_payload(
        &self,
        record: &SecretRecord,
        mode: KeyMode,
        link_key: Option<&EncryptionKey>,
    ) -> Result<Payload, OpenError> {
        let stored = record.stored_payload();
        match (mode, link_key) {
            (KeyMode::Server, None) => {
                codec::decode(&stored, &self.key).map_err(|e| OpenError::Corrupt(e.to_string()))
            }
            (KeyMode::Link, Some(key)) => codec::decode(&stored, key).map_err(|e| match e {
                CodecError::Decrypt => OpenError::WrongKey,
                other => OpenError::Corrupt(other.to_string()),
            }),
            _ => Err(OpenError::WrongKey),
        }
    }

    /// Number of stored records, expired-but-unswept included.
    pub fn len(&self) -> Result<usize, SecretError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let mut count = 0;
        for item in table.iter()? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, SecretError> {
        Ok(self.len()? == 0)
    }

    /// Liveness check: open a read transaction on the secrets table.
    pub fn ping(&self) -> Result<(), SecretError> {
        let read_txn = self.db.begin_read()?;
        read_txn.open_table(SECRETS)?;
        Ok(())
    }

    /// Run a mutating operation on the blocking pool once the write gate is
    /// held. Only the wait for the gate is bounded by `timeout`; once the
    /// operation starts it runs to completion.
    pub async fn with_writer<T, F>(&self, timeout: Duration, op: F) -> Result<T, SecretError>
    where
        F: FnOnce(&Store) -> Result<T, SecretError> + Send + 'static,
        T: Send + 'static,
    {
        let guard = time::timeout(timeout, self.write_gate.clone().lock_owned())
            .await
            .map_err(|_| {
                SecretError::StorageUnavailable("timed out waiting for store writer".into())
            })?;

        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            op(&store)
        })
        .await
        .map_err(|e| SecretError::StorageUnavailable(format!("store task failed: {e}")))?
    }

    /// Run a read-only operation on the blocking pool, bounded by `timeout`.
    pub async fn with_reader<T, F>(&self, timeout: Duration, op: F) -> Result<T, SecretError>
    where
        F: FnOnce(&Store) -> Result<T, SecretError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let task = tokio::task::spawn_blocking(move || op(&store));
        match time::timeout(timeout, task).await {
            Ok(joined) => {
                joined.map_err(|e| SecretError::StorageUnavailable(format!("store task failed: {e}")))?
            }
            Err(_) => Err(SecretError::StorageUnavailable(
                "store read timed out".into(),
            )),
        }
    }
}

/// Encode a SecretRecord: `[RECORD_MARKER, key_mode] + bincode(record)`.
fn encode_record(record: &SecretRecord, mode: KeyMode) -> Result<Vec<u8>, SecretError> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| SecretError::CorruptPayload(format!("bincode encode: {e}")))?;
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(RECORD_MARKER);
    out.push(mode.as_byte());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode bytes into `(SecretRecord, KeyMode)`.
pub(super) fn decode_record(bytes: &[u8]) -> Result<(SecretRecord, KeyMode)> {
    if bytes.len() < 3 {
        anyhow::bail!("truncated record");
    }
    if bytes[0] != RECORD_MARKER {
        anyhow::bail!("unknown record marker {:#04x}", bytes[0]);
    }
    let mode = KeyMode::from_byte(bytes[1])
        .with_context(|| format!("unknown key mode {:#04x}", bytes[1]))?;
    let (record, _) = bincode::serde::decode_from_slice(&bytes[2..], bincode::config::standard())
        .context("bincode decode")?;
    Ok((record, mode))
}
