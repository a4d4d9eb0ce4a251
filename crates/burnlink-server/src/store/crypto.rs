//! Key material and AEAD sealing.
//!
//! Every record is sealed with ChaCha20Poly1305 under either the server-wide
//! key or a per-record link key. Both are plain 32-byte keys; the server key
//! may be derived from an operator-supplied master key with Argon2id.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 32;

// Argon2id cost: 64 MiB, 3 passes, 1 lane.
const ARGON2_M_COST_KIB: u32 = 64 * 1024;
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Wrong key, wrong nonce or tampered ciphertext.
    #[error("AEAD seal/open failed")]
    Aead,
    #[error("key derivation failed: {0}")]
    Derive(String),
}

#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// base64url without padding; never contains the token separator.
    pub fn to_link_string(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_link_string(s: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(s).ok()?;
        load_key(&bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(&Key::from(self.0))
    }

    /// Encrypt under a fresh random nonce. Returns `(ciphertext, nonce)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(&Nonce::from(nonce), plaintext)
            .map_err(|_| CryptoError::Aead)?;
        Ok((ciphertext, nonce))
    }

    pub fn open(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .decrypt(&Nonce::from(*nonce), ciphertext)
            .map_err(|_| CryptoError::Aead)
    }
}

/// Stretch an operator master key into the server key. The same
/// `(master_key, salt)` pair always yields the same key, so the salt must be
/// persisted next to the database.
pub fn derive_key(master_key: &str, salt: &[u8; SALT_LEN]) -> Result<EncryptionKey, CryptoError> {
    let params = Params::new(
        ARGON2_M_COST_KIB,
        ARGON2_T_COST,
        ARGON2_P_COST,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::Derive(e.to_string()))?;

    let mut key = EncryptionKey([0u8; KEY_LEN]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(master_key.as_bytes(), salt, &mut key.0)
        .map_err(|e| CryptoError::Derive(e.to_string()))?;
    Ok(key)
}

pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// `None` unless exactly [`KEY_LEN`] bytes are given.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; KEY_LEN] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let key = generate_key();
        let (ct, nonce) = key.seal(b"hello, burnlink!").unwrap();
        assert_eq!(key.open(&ct, &nonce).unwrap(), b"hello, burnlink!");
    }

    #[test]
    fn nonces_are_fresh() {
        let key = generate_key();
        let (a, na) = key.seal(b"same").unwrap();
        let (b, nb) = key.seal(b"same").unwrap();
        assert_ne!(na, nb);
        assert_ne!(a, b);
    }

    #[test]
    fn open_with_other_key_fails() {
        let (ct, nonce) = generate_key().seal(b"secret").unwrap();
        assert!(matches!(
            generate_key().open(&ct, &nonce),
            Err(CryptoError::Aead)
        ));
    }

    #[test]
    fn derivation_depends_on_master_and_salt() {
        let salt = generate_salt();
        let a = derive_key("test-master-key", &salt).unwrap();
        let b = derive_key("test-master-key", &salt).unwrap();
        let c = derive_key("other-master-key", &salt).unwrap();
        let d = derive_key("test-master-key", &generate_salt()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert_ne!(a.as_bytes(), d.as_bytes());
    }

    #[test]
    fn link_string_round_trip() {
        let key = generate_key();
        let s = key.to_link_string();
        assert_eq!(s.len(), 43);
        assert!(!s.contains('.'));
        let parsed = EncryptionKey::from_link_string(&s).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn load_key_rejects_wrong_length() {
        assert!(load_key(&[0u8; 31]).is_none());
        assert!(load_key(&[0u8; 33]).is_none());
        assert!(EncryptionKey::from_link_string("not-a-key").is_none());
    }
}
