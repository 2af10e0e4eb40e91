//! Authorization codes: short-lived, single-use, PKCE-bound
//!
//! A code moves `issued -> consumed -> swept`. Consumption marks the record
//! instead of deleting it, so a replay is reported as `Consumed` rather than
//! `Unknown` until the next sweep removes it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, GrantFailure, Result};
use crate::persist::{PersistenceMode, Record, Table};
use crate::pkce::{self, ChallengeMethod};
use crate::token::generate_token;

/// Default authorization code lifetime: 10 minutes.
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(600);

/// A persisted authorization code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub value: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: ChallengeMethod,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub consumed: bool,
}

impl AuthorizationCode {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

impl Record for AuthorizationCode {
    const COLLECTION: &'static str = "codes";
    const STORE: &'static str = "authorization_codes";

    fn key(&self) -> &str {
        &self.value
    }

    fn is_expired_at(&self, now: u64) -> bool {
        AuthorizationCode::is_expired_at(self, now)
    }
}

/// Everything captured at consent time that the code is bound to.
#[derive(Debug, Clone)]
pub struct CodeRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: ChallengeMethod,
    pub user_id: String,
    pub resource: Option<String>,
}

/// Point-in-time counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeMetrics {
    pub count: usize,
    pub expired_count: usize,
    pub consumed_count: usize,
}

/// Issues, validates and single-use-consumes authorization codes.
#[derive(Clone)]
pub struct AuthorizationCodeStore {
    table: Arc<Table<AuthorizationCode>>,
    ttl: Duration,
}

/// Shared acceptance check for validate/consume/redeem.
fn check<'a>(
    record: Option<&'a AuthorizationCode>,
    client_id: &str,
    now: u64,
) -> Result<&'a AuthorizationCode> {
    let record = record.ok_or(Error::InvalidGrant(GrantFailure::Unknown))?;
    if record.consumed {
        return Err(Error::InvalidGrant(GrantFailure::Consumed));
    }
    if record.is_expired_at(now) {
        return Err(Error::InvalidGrant(GrantFailure::Expired));
    }
    if record.client_id != client_id {
        return Err(Error::InvalidGrant(GrantFailure::ClientMismatch));
    }
    Ok(record)
}

impl AuthorizationCodeStore {
    /// Open the store, restoring persisted codes in encrypted mode.
    pub async fn open(mode: PersistenceMode, ttl: Duration) -> Result<Self> {
        Ok(Self {
            table: Table::open(mode).await?,
            ttl,
        })
    }

    /// Memory-only store.
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            table: Table::memory(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a code bound to the consent request.
    pub async fn issue(&self, request: CodeRequest) -> String {
        let code = generate_token();
        let now = common::now_millis();
        let client_id = request.client_id.clone();

        self.table.entries().lock().await.insert(
            code.clone(),
            AuthorizationCode {
                value: code.clone(),
                client_id: request.client_id,
                redirect_uri: request.redirect_uri,
                scope: request.scope,
                code_challenge: request.code_challenge,
                code_challenge_method: request.code_challenge_method,
                user_id: request.user_id,
                resource: request.resource,
                created_at: now,
                expires_at: common::expires_at(now, self.ttl),
                consumed: false,
            },
        );
        self.table.schedule_flush().await;

        debug!(client_id, "issued authorization code");
        code
    }

    /// Read-only check: exists, unused, unexpired, issued to `client_id`.
    pub async fn validate(&self, code: &str, client_id: &str) -> Result<AuthorizationCode> {
        let entries = self.table.entries().lock().await;
        check(entries.get(code), client_id, common::now_millis()).cloned()
    }

    /// Validate and mark consumed in one step. Succeeds at most once per code.
    pub async fn consume(&self, code: &str, client_id: &str) -> Result<AuthorizationCode> {
        let consumed = {
            let mut entries = self.table.entries().lock().await;
            check(entries.get(code), client_id, common::now_millis()).inspect_err(|e| {
                if e.grant_failure() == Some(GrantFailure::Consumed) {
                    warn!(client_id, "authorization code replay rejected");
                }
            })?;
            let record = entries
                .get_mut(code)
                .ok_or(Error::InvalidGrant(GrantFailure::Unknown))?;
            record.consumed = true;
            record.clone()
        };
        self.table.schedule_flush().await;
        Ok(consumed)
    }

    /// Token-endpoint exchange: validate, match `redirect_uri`, verify PKCE,
    /// consume. A wrong verifier or redirect still burns the code so it
    /// cannot be retried.
    pub async fn redeem(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<AuthorizationCode> {
        let outcome = {
            let mut entries = self.table.entries().lock().await;
            let record = check(entries.get(code), client_id, common::now_millis())?;

            let outcome = if record.redirect_uri != redirect_uri {
                Err(Error::InvalidGrant(GrantFailure::RedirectMismatch))
            } else if !pkce::is_well_formed_verifier(code_verifier)
                || !pkce::verify(
                    code_verifier,
                    &record.code_challenge,
                    record.code_challenge_method.as_str(),
                )?
            {
                Err(Error::InvalidGrant(GrantFailure::VerifierMismatch))
            } else {
                Ok(())
            };

            let record = entries
                .get_mut(code)
                .ok_or(Error::InvalidGrant(GrantFailure::Unknown))?;
            record.consumed = true;
            outcome.map(|()| record.clone())
        };
        self.table.schedule_flush().await;

        if let Err(e) = &outcome {
            debug!(client_id, reason = %e, "authorization code redemption rejected");
        }
        outcome
    }

    /// Remove a code unconditionally. Returns whether it existed.
    pub async fn revoke(&self, code: &str) -> bool {
        let removed = self.table.entries().lock().await.remove(code).is_some();
        if removed {
            self.table.schedule_flush().await;
        }
        removed
    }

    /// Drop expired and consumed codes. Idempotent.
    pub async fn sweep(&self) -> usize {
        let removed = {
            let mut entries = self.table.entries().lock().await;
            let now = common::now_millis();
            let before = entries.len();
            entries.retain(|_, c| !c.consumed && !c.is_expired_at(now));
            before - entries.len()
        };
        if removed > 0 {
            metrics::counter!("oauth_sweep_removed_total", "store" => AuthorizationCode::STORE)
                .increment(removed as u64);
            debug!(count = removed, "swept authorization codes");
            self.table.schedule_flush().await;
        }
        removed
    }

    pub async fn metrics(&self) -> CodeMetrics {
        let entries = self.table.entries().lock().await;
        let now = common::now_millis();
        CodeMetrics {
            count: entries.len(),
            expired_count: entries.values().filter(|c| c.is_expired_at(now)).count(),
            consumed_count: entries.values().filter(|c| c.consumed).count(),
        }
    }

    /// Write pending changes now.
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

impl std::fmt::Debug for AuthorizationCodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCodeStore")
            .field("ttl", &self.ttl)
            .finish()
    }
}
