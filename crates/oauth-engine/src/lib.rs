//! OAuth credential engine
//!
//! Wires the encryption service and the four credential stores together:
//!
//! 1. resolve the deployment key (explicit value, key file, or generate)
//! 2. load each store from its encrypted file, dropping expired entries
//! 3. serve token-endpoint flows, metrics and health to the HTTP layer
//! 4. sweep stale credentials periodically and flush everything on shutdown
//!
//! Stores are owned by the engine and handed out by reference; there is no
//! global state.

pub mod config;
pub mod engine;
pub mod error;
pub mod sweep;

pub use config::EngineConfig;
pub use engine::{
    EngineMetrics, Grant, HealthReport, OAuthEngine, StorageFile, StorageHealth, StorageMetrics,
    StoreHealth, SweepReport,
};
pub use error::{Error, Result};
pub use sweep::spawn_sweep_task;
