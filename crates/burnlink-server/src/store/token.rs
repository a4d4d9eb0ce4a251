use rand::Rng;

use super::crypto::EncryptionKey;

/// Length of a record id in hex characters (16 random bytes).
pub const ID_HEX_LEN: usize = 32;

/// Separator between the id and the link key in a link-mode token.
pub const KEY_SEPARATOR: char = '.';

/// Generate a fresh 128-bit record id as lowercase hex.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// A parsed share-link token: `<id>` or `<id>.<link key>`.
pub struct SecretToken {
    pub id: String,
    pub link_key: Option<EncryptionKey>,
}

impl SecretToken {
    /// Parse a token from a URL path segment. Returns `None` for anything
    /// that could not have been issued by this server.
    pub fn parse(token: &str) -> Option<Self> {
        let (id, key) = match token.split_once(KEY_SEPARATOR) {
            Some((id, key)) => (id, Some(key)),
            None => (token, None),
        };

        if !is_valid_id(id) {
            return None;
        }

        let link_key = match key {
            Some(k) => Some(EncryptionKey::from_link_string(k)?),
            None => None,
        };

        Some(Self {
            id: id.to_owned(),
            link_key,
        })
    }
}

/// Render a token for a newly created record.
pub fn format_token(id: &str, link_key: Option<&EncryptionKey>) -> String {
    match link_key {
        Some(key) => format!("{id}{KEY_SEPARATOR}{}", key.to_link_string()),
        None => id.to_owned(),
    }
}

fn is_valid_id(id: &str) -> bool {
    id.len() == ID_HEX_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::crypto::generate_key;

    #[test]
    fn generated_ids_are_hex_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), ID_HEX_LEN);
        assert!(is_valid_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn parses_server_mode_token() {
        let id = generate_id();
        let token = SecretToken::parse(&id).unwrap();
        assert_eq!(token.id, id);
        assert!(token.link_key.is_none());
    }

    #[test]
    fn parses_link_mode_token() {
        let id = generate_id();
        let key = generate_key();
        let rendered = format_token(&id, Some(&key));
        let token = SecretToken::parse(&rendered).unwrap();
        assert_eq!(token.id, id);
        assert_eq!(token.link_key.unwrap().as_bytes(), key.as_bytes());
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(SecretToken::parse("").is_none());
        assert!(SecretToken::parse("../etc/passwd").is_none());
        assert!(SecretToken::parse(&"A".repeat(ID_HEX_LEN)).is_none());
        assert!(SecretToken::parse(&"a".repeat(ID_HEX_LEN + 1)).is_none());
        let id = generate_id();
        assert!(SecretToken::parse(&format!("{id}.")).is_none());
        assert!(SecretToken::parse(&format!("{id}.short")).is_none());
    }
}
