//! Opaque credential and identifier generation

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;

/// Random bytes per opaque credential (256 bits).
const TOKEN_BYTES: usize = 32;

/// Generate an opaque, URL-safe credential with 256 bits of entropy.
///
/// Used for authorization codes, refresh tokens and session ids. The value
/// is both the lookup key and the secret.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a client identifier. Client ids are public, so 122 random bits
/// from a v4 UUID are plenty.
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_43_url_safe_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "token must be URL-safe base64: {token}"
        );
    }

    #[test]
    fn tokens_do_not_collide() {
        let tokens: std::collections::HashSet<String> = (0..1000).map(|_| generate_token()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn client_ids_are_simple_uuids() {
        let id = generate_client_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_client_id());
    }
}
