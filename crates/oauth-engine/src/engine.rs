//! Engine construction, aggregate metrics/health, and token-endpoint flows
//!
//! Construction order is fixed: encryption key first, then each store loads
//! its encrypted file. A store that cannot be read aborts startup instead of
//! coming up empty and overwriting the file on its first write.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use oauth_store::{
    AuthorizationCodeStore, ClientMetrics, ClientRegistry, CodeMetrics, Error as StoreError,
    GrantFailure, PersistenceMode, RefreshTokenMetrics, RefreshTokenStore, SessionMetrics,
    SessionStore,
};
use token_vault::{EncryptionHealth, EncryptionService, KeyOptions};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Store labels used in metrics, health and errors.
pub const STORE_CODES: &str = "authorization_codes";
pub const STORE_TOKENS: &str = "refresh_tokens";
pub const STORE_CLIENTS: &str = "clients";
pub const STORE_SESSIONS: &str = "sessions";

/// Owns the encryption service and the four credential stores.
pub struct OAuthEngine {
    config: EngineConfig,
    vault: Arc<EncryptionService>,
    codes: AuthorizationCodeStore,
    tokens: RefreshTokenStore,
    clients: ClientRegistry,
    sessions: SessionStore,
}

/// On-disk footprint of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageFile {
    pub store: &'static str,
    pub path: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageMetrics {
    pub persistent: bool,
    pub files: Vec<StorageFile>,
    pub total_bytes: u64,
}

/// Point-in-time counts across every store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub authorization_codes: CodeMetrics,
    pub refresh_tokens: RefreshTokenMetrics,
    pub clients: ClientMetrics,
    pub sessions: SessionMetrics,
    pub storage: StorageMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    pub store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    pub persistent: bool,
    pub stores: Vec<StoreHealth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub encryption: EncryptionHealth,
    pub storage: StorageHealth,
    pub issues: Vec<String>,
}

/// Entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub authorization_codes: usize,
    pub refresh_tokens: usize,
    pub sessions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.authorization_codes + self.refresh_tokens + self.sessions
    }
}

/// Result of a successful token-endpoint exchange.
///
/// Access-token minting belongs to the caller; the engine hands back the
/// refresh token and the identity it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub refresh_token: String,
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub resource: Option<String>,
}

fn load_err(store: &'static str) -> impl FnOnce(StoreError) -> Error {
    move |source| Error::Load { store, source }
}

impl OAuthEngine {
    /// Validate the config, resolve the key, then load every store.
    ///
    /// In non-persistent mode the key is generated in-process and nothing
    /// touches disk.
    pub async fn initialize(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let vault = if config.storage.persistent {
            EncryptionService::initialize(KeyOptions {
                key: config.encryption.key.clone(),
                key_file: config.encryption.key_file.clone(),
                key_path: config.encryption.key_path.clone(),
            })
            .await?
        } else {
            EncryptionService::ephemeral()
        };
        let vault = Arc::new(vault);

        let mode = |path: PathBuf| {
            if config.storage.persistent {
                PersistenceMode::Encrypted {
                    vault: Arc::clone(&vault),
                    path,
                    debounce: config.storage.debounce(),
                }
            } else {
                PersistenceMode::Memory
            }
        };

        let codes = AuthorizationCodeStore::open(
            mode(config.storage.codes_file()),
            config.expiry.authorization_code(),
        )
        .await
        .map_err(load_err(STORE_CODES))?;
        let tokens = RefreshTokenStore::open(
            mode(config.storage.tokens_file()),
            config.expiry.refresh_token(),
        )
        .await
        .map_err(load_err(STORE_TOKENS))?;
        let clients = ClientRegistry::open(mode(config.storage.clients_file()))
            .await
            .map_err(load_err(STORE_CLIENTS))?;
        let sessions = SessionStore::open(
            mode(config.storage.sessions_file()),
            config.expiry.session(),
        )
        .await
        .map_err(load_err(STORE_SESSIONS))?;

        info!(
            persistent = config.storage.persistent,
            key_source = vault.key_source().label(),
            "oauth engine initialized"
        );

        Ok(Self {
            config,
            vault,
            codes,
            tokens,
            clients,
            sessions,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codes(&self) -> &AuthorizationCodeStore {
        &self.codes
    }

    pub fn tokens(&self) -> &RefreshTokenStore {
        &self.tokens
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn storage_paths(&self) -> [(&'static str, Option<&std::path::Path>); 4] {
        [
            (STORE_CODES, self.codes.storage_path()),
            (STORE_TOKENS, self.tokens.storage_path()),
            (STORE_CLIENTS, self.clients.storage_path()),
            (STORE_SESSIONS, self.sessions.storage_path()),
        ]
    }

    async fn last_errors(&self) -> [Option<String>; 4] {
        [
            self.codes.last_persist_error().await,
            self.tokens.last_persist_error().await,
            self.clients.last_persist_error().await,
            self.sessions.last_persist_error().await,
        ]
    }

    /// Store counts plus on-disk file sizes.
    pub async fn metrics(&self) -> EngineMetrics {
        let mut files = Vec::new();
        for (store, path) in self.storage_paths() {
            let Some(path) = path else { continue };
            let bytes = match token_vault::fs::file_size(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(store, error = %e, "could not stat state file");
                    0
                }
            };
            files.push(StorageFile {
                store,
                path: path.display().to_string(),
                bytes,
            });
        }
        let total_bytes = files.iter().map(|f| f.bytes).sum();

        EngineMetrics {
            authorization_codes: self.codes.metrics().await,
            refresh_tokens: self.tokens.metrics().await,
            clients: self.clients.metrics().await,
            sessions: self.sessions.metrics().await,
            storage: StorageMetrics {
                persistent: self.config.storage.persistent,
                files,
                total_bytes,
            },
        }
    }

    /// Unhealthy when encryption is not initialized or any store's last
    /// background write failed.
    pub async fn health(&self) -> HealthReport {
        let encryption = self.vault.health();

        let mut issues = Vec::new();
        if !encryption.initialized {
            issues.push("encryption service is not initialized".to_string());
        }

        let mut stores = Vec::new();
        for ((store, path), last_error) in self.storage_paths().into_iter().zip(self.last_errors().await) {
            if let Some(err) = &last_error {
                issues.push(format!("{store}: last write failed: {err}"));
            }
            stores.push(StoreHealth {
                store,
                path: path.map(|p| p.display().to_string()),
                last_error,
            });
        }

        HealthReport {
            healthy: issues.is_empty(),
            encryption,
            storage: StorageHealth {
                persistent: self.config.storage.persistent,
                stores,
            },
            issues,
        }
    }

    /// Remove expired, consumed and rotated entries from every store.
    pub async fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            authorization_codes: self.codes.sweep().await,
            refresh_tokens: self.tokens.sweep().await,
            sessions: self.sessions.sweep().await,
        };
        if report.total() > 0 {
            info!(
                authorization_codes = report.authorization_codes,
                refresh_tokens = report.refresh_tokens,
                sessions = report.sessions,
                "sweep removed stale credentials"
            );
        }
        report
    }

    /// Write every store now. All stores are attempted even if one fails.
    pub async fn flush(&self) -> Result<()> {
        let results = [
            (STORE_CODES, self.codes.flush().await),
            (STORE_TOKENS, self.tokens.flush().await),
            (STORE_CLIENTS, self.clients.flush().await),
            (STORE_SESSIONS, self.sessions.flush().await),
        ];

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(store, result)| result.err().map(|e| format!("{store}: {e}")))
            .collect();

        if failures.is_empty() {
            debug!("flushed all stores");
            Ok(())
        } else {
            warn!(failures = failures.len(), "flush incomplete");
            Err(Error::Flush { failures })
        }
    }

    async fn require_client(&self, client_id: &str) -> Result<()> {
        match self.clients.lookup(client_id).await {
            Some(_) => Ok(()),
            None => Err(StoreError::InvalidClient(format!("unknown client {client_id}")).into()),
        }
    }

    /// `grant_type=authorization_code`: check the client, redeem the code
    /// with PKCE, and issue a refresh token for the same identity.
    pub async fn exchange_authorization_code(
        &self,
        client_id: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<Grant> {
        self.require_client(client_id).await?;
        let record = self
            .codes
            .redeem(code, client_id, redirect_uri, code_verifier)
            .await?;
        let refresh_token = self
            .tokens
            .issue(client_id, &record.user_id, &record.scope)
            .await;

        info!(client_id, "authorization code exchanged");
        Ok(Grant {
            refresh_token,
            client_id: record.client_id,
            user_id: record.user_id,
            scope: record.scope,
            resource: record.resource,
        })
    }

    /// `grant_type=refresh_token`: check the client and rotate the token.
    pub async fn refresh(&self, client_id: &str, refresh_token: &str) -> Result<Grant> {
        self.require_client(client_id).await?;

        let Some(record) = self.tokens.rotate(refresh_token, client_id).await else {
            // Report why; a lost race means the token was just rotated
            let reason = self
                .tokens
                .validate(refresh_token, client_id)
                .await
                .err()
                .unwrap_or(StoreError::InvalidGrant(GrantFailure::Rotated));
            return Err(reason.into());
        };

        Ok(Grant {
            refresh_token: record.token,
            client_id: record.client_id,
            user_id: record.user_id,
            scope: record.scope,
            resource: None,
        })
    }
}

impl std::fmt::Debug for OAuthEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthEngine")
            .field("persistent", &self.config.storage.persistent)
            .field("vault", &self.vault)
            .finish_non_exhaustive()
    }
}
