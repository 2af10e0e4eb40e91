//! OAuth error vocabulary for the credential stores

use std::fmt;

/// Why a code, token or session was rejected.
///
/// All variants surface as `invalid_grant` on the wire; the reason is kept
/// for logs and tests so a replayed rotated token is distinguishable from
/// one that never existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantFailure {
    Unknown,
    Expired,
    Consumed,
    Rotated,
    ClientMismatch,
    RedirectMismatch,
    VerifierMismatch,
}

impl fmt::Display for GrantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            GrantFailure::Unknown => "unknown or revoked credential",
            GrantFailure::Expired => "credential has expired",
            GrantFailure::Consumed => "authorization code was already used",
            GrantFailure::Rotated => "refresh token was already rotated",
            GrantFailure::ClientMismatch => "credential was issued to another client",
            GrantFailure::RedirectMismatch => "redirect_uri does not match the authorization request",
            GrantFailure::VerifierMismatch => "code_verifier does not match code_challenge",
        };
        f.write_str(reason)
    }
}

/// Errors from credential store operations.
///
/// Protocol errors (`InvalidGrant`, `InvalidClient`, ...) are recoverable by
/// the caller restarting the flow. `Storage`, `Serialization` and
/// `StateVersion` come from persistence and must not be read as "empty".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid_grant: {0}")]
    InvalidGrant(GrantFailure),

    #[error("invalid_client: {0}")]
    InvalidClient(String),

    #[error("invalid_client_metadata: {0}")]
    InvalidClientMetadata(String),

    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    #[error("unsupported_challenge_method: {0}")]
    UnsupportedMethod(String),

    #[error("storage error: {0}")]
    Storage(#[from] token_vault::Error),

    #[error("state serialization error: {0}")]
    Serialization(String),

    #[error("unsupported state version {0}")]
    StateVersion(u64),
}

impl Error {
    /// OAuth `error` code for this failure.
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Error::InvalidGrant(_) => "invalid_grant",
            Error::InvalidClient(_) => "invalid_client",
            Error::InvalidClientMetadata(_) => "invalid_client_metadata",
            Error::InvalidRequest(_) => "invalid_request",
            Error::UnsupportedMethod(_) => "unsupported_challenge_method",
            Error::Storage(_) | Error::Serialization(_) | Error::StateVersion(_) => "server_error",
        }
    }

    /// True for failures the client caused and can recover from.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(
            self,
            Error::Storage(_) | Error::Serialization(_) | Error::StateVersion(_)
        )
    }

    /// The grant failure reason, if this is an `invalid_grant`.
    pub fn grant_failure(&self) -> Option<GrantFailure> {
        match self {
            Error::InvalidGrant(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_codes_match_vocabulary() {
        assert_eq!(Error::InvalidGrant(GrantFailure::Expired).oauth_code(), "invalid_grant");
        assert_eq!(Error::InvalidClient("x".into()).oauth_code(), "invalid_client");
        assert_eq!(
            Error::UnsupportedMethod("plain".into()).oauth_code(),
            "unsupported_challenge_method"
        );
        assert_eq!(Error::StateVersion(9).oauth_code(), "server_error");
    }

    #[test]
    fn display_leads_with_error_code() {
        let err = Error::InvalidGrant(GrantFailure::Rotated);
        assert_eq!(err.to_string(), "invalid_grant: refresh token was already rotated");
    }

    #[test]
    fn storage_errors_are_not_protocol_errors() {
        let err: Error = token_vault::Error::Decrypt("tag mismatch".into()).into();
        assert!(!err.is_protocol_error());
        assert!(Error::InvalidRequest("x".into()).is_protocol_error());
        assert_eq!(err.grant_failure(), None);
        assert_eq!(
            Error::InvalidGrant(GrantFailure::Consumed).grant_failure(),
            Some(GrantFailure::Consumed)
        );
    }
}
