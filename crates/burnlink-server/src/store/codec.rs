//! Payload codec: plaintext payload <-> encrypted, storage-safe form.
//!
//! The payload is bincode-encoded (file bytes stay binary; base64 only
//! appears at the JSON boundary) and sealed with ChaCha20Poly1305.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::crypto::EncryptionKey;

/// Longest accepted attachment file name, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

pub const DEFAULT_FILE_NAME: &str = "file";
pub const DEFAULT_FILE_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode payload: {0}")]
    Encode(String),
    /// AEAD tag mismatch: wrong key or tampered ciphertext.
    #[error("payload authentication failed")]
    Decrypt,
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// An uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct FileAttachment {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Plaintext secret content. Wiped from memory on drop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Payload {
    pub message: Option<String>,
    pub file: Option<FileAttachment>,
}

impl Payload {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            file: None,
        }
    }

    pub fn file(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            message: None,
            file: Some(FileAttachment {
                name: name.into(),
                mime: mime.into(),
                bytes,
            }),
        }
    }

    /// True when neither a non-empty message nor a non-empty file is present.
    pub fn is_empty(&self) -> bool {
        let no_message = self.message.as_deref().map_or(true, str::is_empty);
        let no_file = self.file.as_ref().map_or(true, |f| f.bytes.is_empty());
        no_message && no_file
    }

    /// A copy without an empty message or an empty file, or `None` when
    /// there is nothing to drop.
    pub fn without_empty_parts(&self) -> Option<Payload> {
        let empty_message = self.message.as_deref() == Some("");
        let empty_file = self.file.as_ref().is_some_and(|f| f.bytes.is_empty());
        if !empty_message && !empty_file {
            return None;
        }
        Some(Payload {
            message: if empty_message { None } else { self.message.clone() },
            file: if empty_file { None } else { self.file.clone() },
        })
    }

    /// Bytes counted against the payload size limit.
    pub fn size(&self) -> usize {
        self.message.as_ref().map_or(0, String::len)
            + self.file.as_ref().map_or(0, |f| f.bytes.len())
    }
}

/// Encrypted payload as persisted inside a record.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
}

pub fn encode(payload: &Payload, key: &EncryptionKey) -> Result<StoredPayload, CodecError> {
    let mut plaintext = bincode::serde::encode_to_vec(payload, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    let sealed = key.seal(&plaintext);
    plaintext.zeroize();

    let (ciphertext, nonce) = sealed.map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(StoredPayload { ciphertext, nonce })
}

pub fn decode(stored: &StoredPayload, key: &EncryptionKey) -> Result<Payload, CodecError> {
    let mut plaintext = key
        .open(&stored.ciphertext, &stored.nonce)
        .map_err(|_| CodecError::Decrypt)?;
    let decoded = bincode::serde::decode_from_slice(&plaintext, bincode::config::standard());
    plaintext.zeroize();

    let (payload, _) = decoded.map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::crypto::generate_key;
    use proptest::prelude::*;

    #[test]
    fn text_payload_round_trip() {
        let key = generate_key();
        let payload = Payload::text("hello");
        let stored = encode(&payload, &key).unwrap();
        assert_eq!(decode(&stored, &key).unwrap(), payload);
    }

    #[test]
    fn message_and_file_together() {
        let key = generate_key();
        let payload = Payload {
            message: Some("see attached".into()),
            file: Some(FileAttachment {
                name: "report.pdf".into(),
                mime: "application/pdf".into(),
                bytes: vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff],
            }),
        };
        let stored = encode(&payload, &key).unwrap();
        assert_eq!(decode(&stored, &key).unwrap(), payload);
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let key = generate_key();
        let stored = encode(&Payload::text("plaintext-marker"), &key).unwrap();
        let needle = b"plaintext-marker";
        assert!(!stored
            .ciphertext
            .windows(needle.len())
            .any(|w| w == needle));
    }

    #[test]
    fn wrong_key_is_decrypt_error() {
        let stored = encode(&Payload::text("x"), &generate_key()).unwrap();
        let err = decode(&stored, &generate_key()).unwrap_err();
        assert!(matches!(err, CodecError::Decrypt));
    }

    #[test]
    fn tampered_ciphertext_is_decrypt_error() {
        let key = generate_key();
        let mut stored = encode(&Payload::text("x"), &key).unwrap();
        stored.ciphertext[0] ^= 0x01;
        assert!(matches!(
            decode(&stored, &key).unwrap_err(),
            CodecError::Decrypt
        ));
    }

    #[test]
    fn garbage_plaintext_is_malformed() {
        let key = generate_key();
        let (ciphertext, nonce) = key.seal(&[0xff; 3]).unwrap();
        let stored = StoredPayload { ciphertext, nonce };
        assert!(matches!(
            decode(&stored, &key).unwrap_err(),
            CodecError::Malformed(_)
        ));
    }

    #[test]
    fn emptiness_and_size() {
        assert!(Payload::default().is_empty());
        assert!(Payload::text("").is_empty());
        assert!(Payload::file("a.bin", DEFAULT_FILE_MIME, vec![]).is_empty());
        assert!(!Payload::text("x").is_empty());

        let both = Payload {
            message: Some("abc".into()),
            file: Some(FileAttachment {
                name: "n".into(),
                mime: "m".into(),
                bytes: vec![0; 10],
            }),
        };
        assert_eq!(both.size(), 13);
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        let file = (
            "[a-zA-Z0-9._ -]{1,40}",
            "[a-z]{1,12}/[a-z0-9.+-]{1,20}",
            proptest::collection::vec(any::<u8>(), 1..2048),
        )
            .prop_map(|(name, mime, bytes)| FileAttachment { name, mime, bytes });
        (proptest::option::of(".*"), proptest::option::of(file))
            .prop_map(|(message, file)| Payload { message, file })
    }

    proptest! {
        #[test]
        fn encode_decode_is_identity(payload in arb_payload()) {
            let key = generate_key();
            let stored = encode(&payload, &key).unwrap();
            prop_assert_eq!(decode(&stored, &key).unwrap(), payload);
        }
    }
}
