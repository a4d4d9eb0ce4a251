use thiserror::Error;

/// Failures surfaced by the record manager.
///
/// `NotFound` deliberately covers unknown, consumed, expired and wrong-key
/// lookups alike.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    InvalidTtl(String),
    #[error("payload exceeds {limit} byte limit")]
    PayloadTooLarge { limit: usize },
    #[error("secret not found or expired")]
    NotFound,
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl SecretError {
    /// True for faults the caller could not have caused.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::CorruptPayload(_) | Self::StorageUnavailable(_)
        )
    }
}

macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SecretError {
                fn from(e: $ty) -> Self {
                    Self::StorageUnavailable(e.to_string())
                }
            }
        )*
    };
}

storage_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
