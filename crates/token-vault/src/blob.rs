//! On-disk ciphertext envelope

use serde::{Deserialize, Serialize};

/// Current envelope format version.
pub const BLOB_VERSION: u32 = 1;

/// `{ "data", "iv", "version", "timestamp" }` as written to every store file.
///
/// `data` is base64 ciphertext with the GCM tag appended, `iv` the base64
/// 96-bit nonce, `timestamp` the write time in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub data: String,
    pub iv: String,
    pub version: u32,
    #[serde(default)]
    pub timestamp: u64,
}
