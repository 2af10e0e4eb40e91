//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The encryption key comes from OAUTH_ENCRYPTION_KEY or from the file named
//! by `encryption.key_file`, never from the TOML directly.

use common::Secret;
use oauth_engine::EngineConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var carrying the base64 encryption key.
pub const KEY_ENV: &str = "OAUTH_ENCRYPTION_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

/// Listener settings for the ops endpoints
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            max_connections: 1000,
            drain_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Only OAUTH_ENCRYPTION_KEY is read here. `encryption.key_file` and
    /// `encryption.key_path` are resolved by the engine at startup so the
    /// key's origin is reported accurately.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.engine.validate()?;
        if config.server.max_connections == 0 {
            return Err(common::Error::invalid(
                "server.max_connections",
                "must be greater than 0",
            ));
        }

        if let Ok(key) = std::env::var(KEY_ENV) {
            config.engine.encryption.key = Some(Secret::new(key));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oauth-server.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("oauth-server.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:8787");
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.server.drain_timeout(), Duration::from_secs(5));
        assert!(config.engine.storage.persistent);
        assert_eq!(config.engine.expiry.authorization_code_secs, 600);
        assert!(config.engine.encryption.key.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "0.0.0.0:9000"
max_connections = 64

[encryption]
key_path = "/var/lib/oauth/encryption.key"

[storage]
dir = "/var/lib/oauth"
debounce_ms = 250

[expiry]
authorization_code_secs = 120
refresh_token_secs = 86400

[sweep]
interval_secs = 60
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(
            config.engine.encryption.key_path,
            PathBuf::from("/var/lib/oauth/encryption.key")
        );
        assert_eq!(
            config.engine.storage.codes_file(),
            PathBuf::from("/var/lib/oauth/auth-codes.enc.json")
        );
        assert_eq!(config.engine.storage.debounce_ms, 250);
        assert_eq!(config.engine.expiry.authorization_code_secs, 120);
        assert_eq!(config.engine.expiry.refresh_token_secs, 86400);
        assert_eq!(config.engine.expiry.session_secs, 86400);
        assert_eq!(config.engine.sweep.interval_secs, 60);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_key_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        unsafe { set_env(KEY_ENV, "env-key-value") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.engine.encryption.key.as_ref().unwrap().expose(),
            "env-key-value"
        );
        unsafe { remove_env(KEY_ENV) };
    }

    #[tokio::test]
    async fn test_key_file_is_reported_as_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("oauth.key");
        let key = file_key();
        std::fs::write(&key_path, format!("{key}\n")).unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[encryption]\nkey_file = \"{}\"\nkey_path = \"{}\"\n\n[storage]\ndir = \"{}\"\n",
                key_path.display(),
                dir.path().join("generated.key").display(),
                dir.path().join("state").display()
            ),
        );

        let config = {
            let _lock = ENV_MUTEX.lock().unwrap();
            unsafe { remove_env(KEY_ENV) };
            Config::load(&path).unwrap()
        };
        assert!(config.engine.encryption.key.is_none());
        assert_eq!(config.engine.encryption.key_file.as_deref(), Some(key_path.as_path()));

        let engine = oauth_engine::OAuthEngine::initialize(config.engine).await.unwrap();
        let health = engine.health().await;
        assert_eq!(health.encryption.key_source.map(|s| s.label()), Some("file"));
        assert!(!dir.path().join("generated.key").exists());
    }

    /// A valid base64 key for the file-backed tests.
    fn file_key() -> String {
        "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string()
    }

    #[test]
    fn test_key_env_is_kept_alongside_key_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[encryption]\nkey_file = \"/etc/oauth/key\"\n");

        unsafe { set_env(KEY_ENV, "env-key-value") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.engine.encryption.key.as_ref().unwrap().expose(),
            "env-key-value"
        );
        assert!(config.engine.encryption.key_file.is_some());
        unsafe { remove_env(KEY_ENV) };
    }

    #[tokio::test]
    async fn test_missing_key_file_fails_engine_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[encryption]\nkey_file = \"/nonexistent/path/oauth.key\"\n\n[storage]\ndir = \"{}\"\n",
                dir.path().display()
            ),
        );
        let config = {
            let _lock = ENV_MUTEX.lock().unwrap();
            unsafe { remove_env(KEY_ENV) };
            Config::load(&path).unwrap()
        };

        let err = oauth_engine::OAuthEngine::initialize(config.engine)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("encryption.key_file"), "got: {err}");
    }

    #[test]
    fn test_zero_expiry_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[expiry]\nsession_secs = 0\n");

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("expiry.session_secs"), "got: {err}");
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[server]\nmax_connections = 0\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("oauth-server.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
