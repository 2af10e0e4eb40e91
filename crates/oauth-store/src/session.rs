//! Authenticated user sessions

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, GrantFailure, Result};
use crate::persist::{PersistenceMode, Record, Table};
use crate::token::generate_token;

/// Default session lifetime: 24 hours.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Record for Session {
    const COLLECTION: &'static str = "sessions";
    const STORE: &'static str = "sessions";

    fn key(&self) -> &str {
        &self.session_id
    }

    fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub count: usize,
    pub expired_count: usize,
}

#[derive(Clone)]
pub struct SessionStore {
    table: Arc<Table<Session>>,
    ttl: Duration,
}

impl SessionStore {
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

    pub async fn create(&self, user_id: &str) -> Session {
        let now = common::now_millis();
        let session = Session {
            session_id: generate_token(),
            user_id: user_id.to_owned(),
            created_at: now,
            expires_at: common::expires_at(now, self.ttl),
        };
        self.table
            .entries()
            .lock()
            .await
            .insert(session.session_id.clone(), session.clone());
        self.table.schedule_flush().await;
        debug!("created session");
        session
    }

    pub async fn validate(&self, session_id: &str) -> Result<Session> {
        let entries = self.table.entries().lock().await;
        let session = entries
            .get(session_id)
            .ok_or(Error::InvalidGrant(GrantFailure::Unknown))?;
        if session.is_expired_at(common::now_millis()) {
            return Err(Error::InvalidGrant(GrantFailure::Expired));
        }
        Ok(session.clone())
    }

    /// End a session (logout). Returns whether it existed.
    pub async fn destroy(&self, session_id: &str) -> bool {
        let removed = self.table.entries().lock().await.remove(session_id).is_some();
        if removed {
            self.table.schedule_flush().await;
        }
        removed
    }

    pub async fn sweep(&self) -> usize {
        let removed = {
            let mut entries = self.table.entries().lock().await;
            let now = common::now_millis();
            let before = entries.len();
            entries.retain(|_, s| !s.is_expired_at(now));
            before - entries.len()
        };
        if removed > 0 {
            metrics::counter!("oauth_sweep_removed_total", "store" => Session::STORE)
                .increment(removed as u64);
            debug!(count = removed, "swept sessions");
            self.table.schedule_flush().await;
        }
        removed
    }

    pub async fn metrics(&self) -> SessionMetrics {
        let entries = self.table.entries().lock().await;
        let now = common::now_millis();
        SessionMetrics {
            count: entries.len(),
            expired_count: entries.values().filter(|s| s.is_expired_at(now)).count(),
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

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_validate_destroy() {
        let store = SessionStore::in_memory(DEFAULT_SESSION_TTL);
        let session = store.create("user-1").await;
        assert_eq!(session.session_id.len(), 43);

        assert_eq!(store.validate(&session.session_id).await.unwrap(), session);
        assert!(store.destroy(&session.session_id).await);
        assert!(!store.destroy(&session.session_id).await);
        assert_eq!(
            store.validate(&session.session_id).await.unwrap_err().grant_failure(),
            Some(GrantFailure::Unknown)
        );
    }

    #[tokio::test]
    async fn expired_sessions_fail_and_sweep() {
        let store = SessionStore::in_memory(Duration::from_secs(1));
        let session = store.create("user-1").await;

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(
            store.validate(&session.session_id).await.unwrap_err().grant_failure(),
            Some(GrantFailure::Expired)
        );
        assert_eq!(
            store.metrics().await,
            SessionMetrics {
                count: 1,
                expired_count: 1
            }
        );
        assert_eq!(store.sweep().await, 1);
        assert_eq!(store.sweep().await, 0);
    }

    #[tokio::test]
    async fn sweep_keeps_live_sessions() {
        let store = SessionStore::in_memory(DEFAULT_SESSION_TTL);
        store.create("user-1").await;
        store.create("user-2").await;
        assert_eq!(store.sweep().await, 0);
        assert_eq!(store.metrics().await.count, 2);
    }
}
