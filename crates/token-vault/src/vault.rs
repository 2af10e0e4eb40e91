//! Encryption service: one AES-256-GCM key per deployment

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;
use serde::Serialize;
use tracing::{info, warn};

use common::Secret;

use crate::blob::{BLOB_VERSION, EncryptedBlob};
use crate::error::{Error, Result};
use crate::fs;
use crate::key::{self, KEY_LEN, KeySource};

/// AES-GCM nonce size (96 bits).
const NONCE_LEN: usize = 12;

const ALGORITHM: &str = "aes-256-gcm";

/// Inputs for key resolution.
#[derive(Debug, Clone)]
pub struct KeyOptions {
    /// Explicit base64 key; wins over everything else when non-blank.
    pub key: Option<Secret<String>>,
    /// Operator-provided key file. Must exist when set; a blank file falls
    /// through to `key_path`.
    pub key_file: Option<PathBuf>,
    /// Key file read when nothing above applies, written when a key is generated.
    pub key_path: PathBuf,
}

/// Health snapshot. Never carries key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptionHealth {
    pub initialized: bool,
    pub key_source: Option<KeySource>,
    pub algorithm: &'static str,
}

/// Holds the symmetric key and encrypts/decrypts store payloads.
///
/// Each `encrypt` call draws a fresh random nonce, so the same plaintext
/// never produces the same ciphertext twice.
pub struct EncryptionService {
    key: Secret<[u8; KEY_LEN]>,
    source: KeySource,
}

impl EncryptionService {
    /// Resolve the deployment key: explicit value, then `key_file`, then the
    /// key at `key_path`, then generate.
    ///
    /// Any failure here is fatal for the caller. A key file that exists but
    /// does not parse is an error rather than a reason to generate a new key,
    /// since replacing it would orphan every existing store file.
    pub async fn initialize(options: KeyOptions) -> Result<Self> {
        if let Some(explicit) = options.key.as_ref().filter(|k| !k.is_blank()) {
            let key = key::parse_key(explicit.expose())?;
            info!(source = "environment", "encryption key loaded");
            return Ok(Self::from_key(key, KeySource::Environment));
        }

        if let Some(key_file) = &options.key_file {
            let contents = tokio::fs::read(key_file).await.map_err(|e| {
                Error::Config(format!(
                    "failed to read encryption.key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            if let Some(key) = parse_key_file(key_file, contents)? {
                info!(source = "file", path = %key_file.display(), "encryption key loaded");
                return Ok(Self::from_key(key, KeySource::File));
            }
            warn!(path = %key_file.display(), "encryption.key_file is empty, falling back to key path");
        }

        let path = &options.key_path;
        if let Some(contents) = fs::read_optional(path).await? {
            if let Some(key) = parse_key_file(path, contents)? {
                info!(source = "file", path = %path.display(), "encryption key loaded");
                return Ok(Self::from_key(key, KeySource::File));
            }
            warn!(path = %path.display(), "key file is empty, generating a new key");
        }

        let key = key::generate_key();
        fs::write_atomic(path, key::encode_key(&key).expose().as_bytes()).await?;
        info!(source = "generated", path = %path.display(), "generated and persisted new encryption key");
        Ok(Self::from_key(key, KeySource::Generated))
    }

    /// Key that lives only in this process. Nothing is written to disk.
    pub fn ephemeral() -> Self {
        Self::from_key(key::generate_key(), KeySource::Generated)
    }

    /// Build a service around an already-resolved key.
    pub fn from_key(key: Secret<[u8; KEY_LEN]>, source: KeySource) -> Self {
        Self { key, source }
    }

    pub fn key_source(&self) -> KeySource {
        self.source
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.expose())
            .map_err(|e| Error::Config(format!("failed to create cipher: {e}")))
    }

    /// Encrypt a payload into an envelope with a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| Error::Encrypt(e.to_string()))?;

        Ok(EncryptedBlob {
            data: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(nonce_bytes),
            version: BLOB_VERSION,
            timestamp: common::now_millis(),
        })
    }

    /// Decrypt an envelope. Authentication failure is an error, never garbage.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>> {
        if blob.version != BLOB_VERSION {
            return Err(Error::UnsupportedVersion(blob.version));
        }

        let ciphertext = STANDARD
            .decode(&blob.data)
            .map_err(|e| Error::Envelope(format!("data is not base64: {e}")))?;
        let nonce_bytes = STANDARD
            .decode(&blob.iv)
            .map_err(|e| Error::Envelope(format!("iv is not base64: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::Envelope(format!(
                "iv must be {NONCE_LEN} bytes, got {}",
                nonce_bytes.len()
            )));
        }

        self.cipher()?
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|e| Error::Decrypt(e.to_string()))
    }

    /// Encrypt `plaintext` and atomically replace `path` with the envelope.
    pub async fn encrypt_to_file(&self, plaintext: &[u8], path: &Path) -> Result<()> {
        let blob = self.encrypt(plaintext)?;
        let json = serde_json::to_vec(&blob)
            .map_err(|e| Error::Envelope(format!("serializing envelope: {e}")))?;
        fs::write_atomic(path, &json).await
    }

    /// Read and decrypt `path`. `Ok(None)` means the file does not exist.
    pub async fn decrypt_from_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let Some(raw) = fs::read_optional(path).await? else {
            return Ok(None);
        };
        let blob: EncryptedBlob = serde_json::from_slice(&raw)
            .map_err(|e| Error::Envelope(format!("{}: {e}", path.display())))?;
        self.decrypt(&blob).map(Some)
    }

    pub fn health(&self) -> EncryptionHealth {
        EncryptionHealth {
            initialized: true,
            key_source: Some(self.source),
            algorithm: ALGORITHM,
        }
    }
}

/// `Ok(None)` for a blank file; anything else must parse as a key.
fn parse_key_file(path: &Path, contents: Vec<u8>) -> Result<Option<Secret<[u8; KEY_LEN]>>> {
    let contents = Secret::new(
        String::from_utf8(contents)
            .map_err(|_| Error::Config(format!("key file {} is not UTF-8", path.display())))?,
    );
    if contents.is_blank() {
        return Ok(None);
    }
    key::parse_key(contents.expose())
        .map(Some)
        .map_err(|e| Error::Config(format!("key file {}: {e}", path.display())))
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
