//! Engine configuration
//!
//! Every field has a default, so an empty TOML table yields a working
//! persistent engine rooted at `data/oauth`. The encryption key itself is
//! never read from TOML; loaders fill `encryption.key` from the environment
//! or from `encryption.key_file`.

use std::path::PathBuf;
use std::time::Duration;

use common::Secret;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub encryption: EncryptionConfig,
    pub storage: StorageConfig,
    pub expiry: ExpiryConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    #[serde(skip)]
    pub key: Option<Secret<String>>,
    /// File holding the base64 key, read by the config loader into `key`
    pub key_file: Option<PathBuf>,
    /// Where a key is looked up, or persisted once generated
    pub key_path: PathBuf,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_file: None,
            key_path: PathBuf::from("data/oauth/encryption.key"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub persistent: bool,
    pub dir: PathBuf,
    pub codes_path: Option<PathBuf>,
    pub tokens_path: Option<PathBuf>,
    pub clients_path: Option<PathBuf>,
    pub sessions_path: Option<PathBuf>,
    pub debounce_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            dir: PathBuf::from("data/oauth"),
            codes_path: None,
            tokens_path: None,
            clients_path: None,
            sessions_path: None,
            debounce_ms: 1000,
        }
    }
}

impl StorageConfig {
    fn resolve(&self, explicit: &Option<PathBuf>, file_name: &str) -> PathBuf {
        explicit.clone().unwrap_or_else(|| self.dir.join(file_name))
    }

    pub fn codes_file(&self) -> PathBuf {
        self.resolve(&self.codes_path, "auth-codes.enc.json")
    }

    pub fn tokens_file(&self) -> PathBuf {
        self.resolve(&self.tokens_path, "refresh-tokens.enc.json")
    }

    pub fn clients_file(&self) -> PathBuf {
        self.resolve(&self.clients_path, "clients.enc.json")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.resolve(&self.sessions_path, "sessions.enc.json")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Credential lifetimes, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    pub authorization_code_secs: u64,
    pub refresh_token_secs: u64,
    pub session_secs: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            authorization_code_secs: 600,
            refresh_token_secs: 30 * 24 * 60 * 60,
            session_secs: 24 * 60 * 60,
        }
    }
}

impl ExpiryConfig {
    pub fn authorization_code(&self) -> Duration {
        Duration::from_secs(self.authorization_code_secs)
    }

    pub fn refresh_token(&self) -> Duration {
        Duration::from_secs(self.refresh_token_secs)
    }

    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl EngineConfig {
    /// Defaults with persistence switched off.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.storage.persistent = false;
        config
    }

    /// Defaults persisting under `dir`, key file included.
    pub fn persistent_in(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut config = Self::default();
        config.encryption.key_path = dir.join("encryption.key");
        config.storage.dir = dir;
        config
    }

    /// Reject values that would make credentials unusable or spin a timer.
    pub fn validate(&self) -> common::Result<()> {
        let checks = [
            ("expiry.authorization_code_secs", self.expiry.authorization_code_secs),
            ("expiry.refresh_token_secs", self.expiry.refresh_token_secs),
            ("expiry.session_secs", self.expiry.session_secs),
            ("storage.debounce_ms", self.storage.debounce_ms),
            ("sweep.interval_secs", self.sweep.interval_secs),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(common::Error::invalid(field, "must be greater than 0"));
            }
        }
        Ok(())
    }
}
