//! Refresh tokens with rotation-based replay detection
//!
//! Rotating a token marks the old record `rotated` and mints a fresh one
//! with the same client, user and scope. Rotated records stay in the table
//! until a sweep, so presenting one again is recognized as a replay.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, GrantFailure, Result};
use crate::persist::{PersistenceMode, Record, Table};
use crate::token::generate_token;

/// Default refresh token lifetime: 30 days.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub rotated: bool,
}

impl RefreshToken {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

impl Record for RefreshToken {
    const COLLECTION: &'static str = "tokens";
    const STORE: &'static str = "refresh_tokens";

    fn key(&self) -> &str {
        &self.token
    }

    fn is_expired_at(&self, now: u64) -> bool {
        RefreshToken::is_expired_at(self, now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshTokenMetrics {
    pub count: usize,
    pub expired_count: usize,
    pub rotated_count: usize,
}

#[derive(Clone)]
pub struct RefreshTokenStore {
    table: Arc<Table<RefreshToken>>,
    ttl: Duration,
}

fn check<'a>(
    record: Option<&'a RefreshToken>,
    client_id: &str,
    now: u64,
) -> Result<&'a RefreshToken> {
    let record = record.ok_or(Error::InvalidGrant(GrantFailure::Unknown))?;
    if record.rotated {
        return Err(Error::InvalidGrant(GrantFailure::Rotated));
    }
    if record.is_expired_at(now) {
        return Err(Error::InvalidGrant(GrantFailure::Expired));
    }
    if record.client_id != client_id {
        return Err(Error::InvalidGrant(GrantFailure::ClientMismatch));
    }
    Ok(record)
}

impl RefreshTokenStore {
    pub async fn open(mode: PersistenceMode, ttl: Duration) -> Result<Self> {
        Ok(Self {
            table: Table::open(mode).await?,
            ttl,
        })
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            table: Table::memory(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a new refresh token.
    pub async fn issue(&self, client_id: &str, user_id: &str, scope: &str) -> String {
        let token = {
            let mut entries = self.table.entries().lock().await;
            self.insert_locked(&mut entries, client_id, user_id, scope).token
        };
        self.table.schedule_flush().await;
        debug!(client_id, "issued refresh token");
        token
    }

    fn insert_locked(
        &self,
        entries: &mut std::collections::HashMap<String, RefreshToken>,
        client_id: &str,
        user_id: &str,
        scope: &str,
    ) -> RefreshToken {
        let now = common::now_millis();
        let record = RefreshToken {
            token: generate_token(),
            client_id: client_id.to_owned(),
            user_id: user_id.to_owned(),
            scope: scope.to_owned(),
            created_at: now,
            expires_at: common::expires_at(now, self.ttl),
            rotated: false,
        };
        entries.insert(record.token.clone(), record.clone());
        record
    }

    /// Read-only check: exists, not rotated, unexpired, issued to `client_id`.
    pub async fn validate(&self, token: &str, client_id: &str) -> Result<RefreshToken> {
        let entries = self.table.entries().lock().await;
        check(entries.get(token), client_id, common::now_millis()).cloned()
    }

    /// Exchange `token` for a successor record. Returns `None` when `token`
    /// is not currently valid for `client_id`; a replayed rotated token is
    /// logged and counted.
    pub async fn rotate(&self, token: &str, client_id: &str) -> Option<RefreshToken> {
        let successor = {
            let mut entries = self.table.entries().lock().await;
            let (user_id, scope) =
                match check(entries.get(token), client_id, common::now_millis()) {
                    Ok(record) => (record.user_id.clone(), record.scope.clone()),
                    Err(Error::InvalidGrant(GrantFailure::Rotated)) => {
                        warn!(client_id, "rotated refresh token presented again");
                        metrics::counter!("oauth_refresh_token_replays_total").increment(1);
                        return None;
                    }
                    Err(e) => {
                        debug!(client_id, reason = %e, "refresh token rotation rejected");
                        return None;
                    }
                };

            if let Some(record) = entries.get_mut(token) {
                record.rotated = true;
            }
            self.insert_locked(&mut entries, client_id, &user_id, &scope)
        };
        self.table.schedule_flush().await;
        debug!(client_id, "rotated refresh token");
        Some(successor)
    }

    /// Remove a token unconditionally. Returns whether it existed.
    pub async fn revoke(&self, token: &str) -> bool {
        let removed = self.table.entries().lock().await.remove(token).is_some();
        if removed {
            self.table.schedule_flush().await;
        }
        removed
    }

    /// Remove every token issued to `client_id`.
    pub async fn revoke_all_for_client(&self, client_id: &str) -> usize {
        let removed = self.remove_where(|t| t.client_id == client_id).await;
        info!(client_id, count = removed, "revoked refresh tokens for client");
        removed
    }

    /// Remove every token held by `user_id`, across clients.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> usize {
        let removed = self.remove_where(|t| t.user_id == user_id).await;
        info!(count = removed, "revoked refresh tokens for user");
        removed
    }

    /// Drop expired and rotated tokens. Idempotent.
    pub async fn sweep(&self) -> usize {
        let now = common::now_millis();
        let removed = self
            .remove_where(|t| t.rotated || t.is_expired_at(now))
            .await;
        if removed > 0 {
            metrics::counter!("oauth_sweep_removed_total", "store" => RefreshToken::STORE)
                .increment(removed as u64);
            debug!(count = removed, "swept refresh tokens");
        }
        removed
    }

    async fn remove_where(&self, mut doomed: impl FnMut(&RefreshToken) -> bool) -> usize {
        let removed = {
            let mut entries = self.table.entries().lock().await;
            let before = entries.len();
            entries.retain(|_, t| !doomed(&*t));
            before - entries.len()
        };
        if removed > 0 {
            self.table.schedule_flush().await;
        }
        removed
    }

    pub async fn metrics(&self) -> RefreshTokenMetrics {
        let entries = self.table.entries().lock().await;
        let now = common::now_millis();
        RefreshTokenMetrics {
            count: entries.len(),
            expired_count: entries.values().filter(|t| t.is_expired_at(now)).count(),
            rotated_count: entries.values().filter(|t| t.rotated).count(),
        }
    }

    pub async fn flush(&self) -> Result<()> {
        self.table.flush().await
    }

    pub fn storage_path(&self) -> Option<&std::path::Path> {
        self.table.path()
    }

    pub async fn last_persist_error(&self) -> Option<String> {
        self.table.last_error().await
    }
}

impl std::fmt::Debug for RefreshTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenStore")
            .field("ttl", &self.ttl)
            .finish()
    }
}
