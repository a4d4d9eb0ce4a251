use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use super::codec::StoredPayload;

/// Stored in redb as bincode-encoded bytes behind a two-byte header.
/// `payload_encrypted` is ChaCha20Poly1305 ciphertext over the bincode payload.
/// Timestamps stay plaintext so the sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// ChaCha20Poly1305 ciphertext (payload + tag).
    pub payload_encrypted: Vec<u8>,
    /// Per-record random 12-byte nonce.
    pub nonce: [u8; 12],
    /// Unix timestamp (milliseconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) after which the record must not be served.
    pub expires_at: i64,
    /// Set in the same transaction that removes the record.
    pub consumed: bool,
}

impl SecretRecord {
    pub fn new(stored: StoredPayload, created_at: i64, ttl_seconds: i64) -> Self {
        Self {
            payload_encrypted: stored.ciphertext,
            nonce: stored.nonce,
            created_at,
            expires_at: created_at.saturating_add(ttl_seconds.saturating_mul(1000)),
            consumed: false,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Consumed or expired: either way the record must not be served.
    pub fn is_dead(&self, now: i64) -> bool {
        self.consumed || self.is_expired(now)
    }

    pub fn stored_payload(&self) -> StoredPayload {
        StoredPayload {
            ciphertext: self.payload_encrypted.clone(),
            nonce: self.nonce,
        }
    }
}

/// Where the key that seals a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyMode {
    /// Sealed with the server-wide key.
    #[default]
    Server,
    /// Sealed with a per-record key that only exists in the share link.
    Link,
}

impl KeyMode {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Server => 0,
            Self::Link => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Server),
            1 => Some(Self::Link),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Link => "link",
        }
    }
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "link" => Ok(Self::Link),
            other => Err(format!("unknown key mode '{other}' (expected server or link)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(created_at: i64, ttl: i64) -> SecretRecord {
        SecretRecord::new(
            StoredPayload {
                ciphertext: vec![1, 2, 3],
                nonce: [0; 12],
            },
            created_at,
            ttl,
        )
    }

    #[test]
    fn expiry_is_strictly_after_expires_at() {
        let r = record(10_000, 60);
        assert_eq!(r.expires_at, 70_000);
        assert!(!r.is_expired(70_000));
        assert!(r.is_expired(70_001));
    }

    #[test]
    fn consumed_record_is_dead() {
        let mut r = record(0, 60);
        assert!(!r.is_dead(1));
        r.consumed = true;
        assert!(r.is_dead(1));
    }

    #[test]
    fn key_mode_parsing() {
        assert_eq!("server".parse::<KeyMode>().unwrap(), KeyMode::Server);
        assert_eq!(" LINK ".parse::<KeyMode>().unwrap(), KeyMode::Link);
        assert!("both".parse::<KeyMode>().is_err());
        for mode in [KeyMode::Server, KeyMode::Link] {
            assert_eq!(KeyMode::from_byte(mode.as_byte()), Some(mode));
        }
        assert_eq!(KeyMode::from_byte(7), None);
    }
}
