//! At-rest encryption for OAuth engine state
//!
//! Holds the deployment's single AES-256-GCM key and turns opaque plaintext
//! payloads into `{data, iv, version, timestamp}` JSON envelopes on disk.
//!
//! Key resolution order (first hit wins):
//! 1. explicitly configured value (env var / config secret)
//! 2. the operator-provided `encryption.key_file`
//! 3. the key file at the configured key path
//! 4. a freshly generated key, persisted to the key path
//!
//! A missing ciphertext file is a cold start (`Ok(None)`); every other read
//! or decrypt failure is an error. A wrong key never yields plaintext.

pub mod blob;
pub mod error;
pub mod fs;
pub mod key;
pub mod vault;

pub use blob::{BLOB_VERSION, EncryptedBlob};
pub use error::{Error, Result};
pub use key::{KEY_LEN, KeySource};
pub use vault::{EncryptionHealth, EncryptionService, KeyOptions};
