//! Symmetric key parsing, generation and provenance

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use rand::RngExt;
use serde::Serialize;

use common::Secret;

use crate::error::{Error, Result};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Where the active key came from. Reported by health checks; the key itself
/// never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    /// Explicit configuration value (env var or config secret)
    Environment,
    /// Read from the key file
    File,
    /// Generated on this start and written to the key file
    Generated,
}

impl KeySource {
    pub fn label(&self) -> &'static str {
        match self {
            KeySource::Environment => "environment",
            KeySource::File => "file",
            KeySource::Generated => "generated",
        }
    }
}

/// Decode a base64 key string (standard or URL-safe alphabet) into 32 bytes.
///
/// Surrounding whitespace is ignored so key files may end in a newline.
pub fn parse_key(encoded: &str) -> Result<Secret<[u8; KEY_LEN]>> {
    let trimmed = encoded.trim();
    let decoded = STANDARD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(trimmed))
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| Error::Config("key is not valid base64".into()))?;
    let decoded = Secret::new(decoded);

    if decoded.expose().len() != KEY_LEN {
        return Err(Error::Config(format!(
            "key must decode to {KEY_LEN} bytes, got {}",
            decoded.expose().len()
        )));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(decoded.expose());
    Ok(Secret::new(key))
}

/// Generate a fresh random key.
pub fn generate_key() -> Secret<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill(&mut key);
    Secret::new(key)
}

/// Key file representation: standard base64 plus trailing newline.
pub fn encode_key(key: &Secret<[u8; KEY_LEN]>) -> Secret<String> {
    Secret::new(format!("{}\n", STANDARD.encode(key.expose())))
}
