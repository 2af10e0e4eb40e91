//! Error types for key management and at-rest encryption

/// Errors from the encryption service.
///
/// `Config` is fatal at startup. `Io`, `Decrypt` and `Envelope` are storage
/// errors that callers must surface, never treat as an empty store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encryption key unusable: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed (wrong key or corrupt payload): {0}")]
    Decrypt(String),

    #[error("malformed encrypted envelope: {0}")]
    Envelope(String),

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
}

/// Result alias for vault operations.
pub type Result<T> = std::result::Result<T, Error>;
