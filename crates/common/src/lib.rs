//! Shared types for the OAuth credential engine
//!
//! Holds the pieces every crate in the workspace leans on: a redacting
//! wrapper for key material and bearer secrets, the configuration error
//! type, and wall-clock helpers for epoch-millisecond timestamps.

mod clock;
mod error;
mod secret;

pub use clock::{expires_at, now_millis};
pub use error::{Error, Result};
pub use secret::Secret;
