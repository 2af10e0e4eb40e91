//! Dynamic client registration

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::{Error, Result};
use crate::persist::{PersistenceMode, Record, Table};
use crate::token::generate_client_id;

/// URI schemes that can never be a redirect target.
const FORBIDDEN_SCHEMES: &[&str] = &["javascript", "data", "file", "vbscript"];

/// Registration metadata with RFC 7591 defaults for a public PKCE client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".into(), "refresh_token".into()]
}

fn default_response_types() -> Vec<String> {
    vec!["code".into()]
}

fn default_auth_method() -> String {
    "none".into()
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            grant_types: default_grant_types(),
            response_types: default_response_types(),
            token_endpoint_auth_method: default_auth_method(),
            scope: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub created_at: u64,
    #[serde(default)]
    pub metadata: ClientMetadata,
}

impl ClientRegistration {
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }
}

impl Record for ClientRegistration {
    const COLLECTION: &'static str = "clients";
    const STORE: &'static str = "clients";

    fn key(&self) -> &str {
        &self.client_id
    }

    // Registrations have no lifetime
    fn is_expired_at(&self, _now: u64) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientMetrics {
    pub count: usize,
}

#[derive(Clone)]
pub struct ClientRegistry {
    table: Arc<Table<ClientRegistration>>,
}

/// Check one redirect URI and return its canonical string.
fn check_redirect_uri(raw: &str) -> Result<String> {
    let uri = Url::parse(raw)
        .map_err(|e| Error::InvalidClientMetadata(format!("redirect_uri {raw:?}: {e}")))?;

    if FORBIDDEN_SCHEMES.contains(&uri.scheme()) {
        return Err(Error::InvalidClientMetadata(format!(
            "redirect_uri {raw:?}: scheme {} is not allowed",
            uri.scheme()
        )));
    }
    if uri.fragment().is_some() {
        return Err(Error::InvalidClientMetadata(format!(
            "redirect_uri {raw:?}: must not contain a fragment"
        )));
    }
    if matches!(uri.scheme(), "http" | "https") && uri.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidClientMetadata(format!(
            "redirect_uri {raw:?}: missing host"
        )));
    }

    // Registered verbatim so later exact-match comparisons see what the
    // client sends
    Ok(raw.to_owned())
}

impl ClientRegistry {
    pub async fn open(mode: PersistenceMode) -> Result<Self> {
        Ok(Self {
            table: Table::open(mode).await?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            table: Table::memory(),
        }
    }

    /// Register a client. `redirect_uris` must be non-empty and every entry
    /// an absolute URI; duplicates are dropped keeping first-seen order.
    pub async fn register(
        &self,
        client_name: Option<&str>,
        redirect_uris: &[String],
        metadata: Option<ClientMetadata>,
    ) -> Result<ClientRegistration> {
        if redirect_uris.is_empty() {
            return Err(Error::InvalidClientMetadata(
                "redirect_uris must not be empty".into(),
            ));
        }

        let mut uris: Vec<String> = Vec::with_capacity(redirect_uris.len());
        for raw in redirect_uris {
            let uri = check_redirect_uri(raw)?;
            if !uris.contains(&uri) {
                uris.push(uri);
            }
        }

        let registration = ClientRegistration {
            client_id: generate_client_id(),
            client_name: client_name.map(str::to_owned),
            redirect_uris: uris,
            created_at: common::now_millis(),
            metadata: metadata.unwrap_or_default(),
        };

        self.table
            .entries()
            .lock()
            .await
            .insert(registration.client_id.clone(), registration.clone());
        self.table.schedule_flush().await;

        info!(
            client_id = %registration.client_id,
            client_name = registration.client_name.as_deref().unwrap_or(""),
            redirect_uris = registration.redirect_uris.len(),
            "registered client"
        );
        Ok(registration)
    }

    pub async fn lookup(&self, client_id: &str) -> Option<ClientRegistration> {
        self.table.entries().lock().await.get(client_id).cloned()
    }

    /// Resolve `client_id` and confirm `redirect_uri` is registered for it.
    pub async fn validate_redirect_uri(
        &self,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<ClientRegistration> {
        let client = self
            .lookup(client_id)
            .await
            .ok_or_else(|| Error::InvalidClient(format!("unknown client {client_id}")))?;
        if !client.allows_redirect(redirect_uri) {
            return Err(Error::InvalidRequest(
                "redirect_uri is not registered for this client".into(),
            ));
        }
        Ok(client)
    }

    pub async fn metrics(&self) -> ClientMetrics {
        ClientMetrics {
            count: self.table.entries().lock().await.len(),
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

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry").finish_non_exhaustive()
    }
}
