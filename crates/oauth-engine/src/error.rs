//! Error types for engine lifecycle operations

/// Errors from engine startup, shutdown and token-endpoint helpers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration value the engine cannot run with.
    #[error(transparent)]
    Config(#[from] common::Error),

    /// The deployment key could not be established. Fatal at startup.
    #[error("encryption key unavailable: {0}")]
    Vault(#[from] token_vault::Error),

    #[error("failed to load {store} state: {source}")]
    Load {
        store: &'static str,
        #[source]
        source: oauth_store::Error,
    },

    #[error(transparent)]
    Store(#[from] oauth_store::Error),

    #[error("flush failed for {}", .failures.join("; "))]
    Flush { failures: Vec<String> },
}

impl Error {
    /// OAuth `error` code when this surfaces at the token endpoint.
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Error::Store(e) => e.oauth_code(),
            _ => "server_error",
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
