//! Credential stores for the OAuth authorization server
//!
//! Four independent stores (authorization codes, refresh tokens, client
//! registrations, sessions), each an in-memory table behind a tokio Mutex
//! with optional debounced, encrypted persistence. Read-modify-write
//! operations (`consume`, `redeem`, `rotate`, `sweep`) hold the table lock
//! for their whole duration, so a code is consumed at most once and a
//! refresh token rotated at most once even under parallel callers.
//!
//! # Example
//!
//! ```no_run
//! use oauth_store::{AuthorizationCodeStore, ChallengeMethod, CodeRequest, pkce};
//! use oauth_store::code::DEFAULT_CODE_TTL;
//!
//! # async fn demo() -> oauth_store::Result<()> {
//! let codes = AuthorizationCodeStore::in_memory(DEFAULT_CODE_TTL);
//! let verifier = pkce::generate_verifier();
//! let code = codes
//!     .issue(CodeRequest {
//!         client_id: "client".into(),
//!         redirect_uri: "http://localhost/cb".into(),
//!         scope: "mcp".into(),
//!         code_challenge: pkce::derive_challenge(&verifier),
//!         code_challenge_method: ChallengeMethod::S256,
//!         user_id: "user".into(),
//!         resource: None,
//!     })
//!     .await;
//! codes.redeem(&code, "client", "http://localhost/cb", &verifier).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod code;
pub mod error;
pub mod persist;
pub mod pkce;
pub mod refresh;
pub mod session;
pub mod token;

pub use client::{ClientMetadata, ClientMetrics, ClientRegistration, ClientRegistry};
pub use code::{AuthorizationCode, AuthorizationCodeStore, CodeMetrics, CodeRequest};
pub use error::{Error, GrantFailure, Result};
pub use persist::{PersistenceMode, Record};
pub use pkce::ChallengeMethod;
pub use refresh::{RefreshToken, RefreshTokenMetrics, RefreshTokenStore};
pub use session::{Session, SessionMetrics, SessionStore};
