//! Prometheus metrics exposition
//!
//! Counters are emitted by the store crates as events happen
//! (`oauth_persist_writes_total`, `oauth_persist_failures_total`,
//! `oauth_sweep_removed_total`, `oauth_refresh_token_replays_total`).
//! Gauges below are point-in-time snapshots of `EngineMetrics`, refreshed
//! on every scrape and after an admin sweep:
//!
//! - `oauth_store_entries` (gauge): label `store`
//! - `oauth_store_expired` (gauge): label `store`
//! - `oauth_refresh_tokens_rotated` (gauge)
//! - `oauth_codes_consumed` (gauge)
//! - `oauth_storage_bytes` (gauge): label `store`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use oauth_engine::EngineMetrics;

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Publish an engine snapshot as gauges.
pub fn publish_engine_metrics(snapshot: &EngineMetrics) {
    let stores = [
        (
            "authorization_codes",
            snapshot.authorization_codes.count,
            snapshot.authorization_codes.expired_count,
        ),
        (
            "refresh_tokens",
            snapshot.refresh_tokens.count,
            snapshot.refresh_tokens.expired_count,
        ),
        ("clients", snapshot.clients.count, 0),
        (
            "sessions",
            snapshot.sessions.count,
            snapshot.sessions.expired_count,
        ),
    ];
    for (store, entries, expired) in stores {
        metrics::gauge!("oauth_store_entries", "store" => store).set(entries as f64);
        metrics::gauge!("oauth_store_expired", "store" => store).set(expired as f64);
    }

    metrics::gauge!("oauth_refresh_tokens_rotated")
        .set(snapshot.refresh_tokens.rotated_count as f64);
    metrics::gauge!("oauth_codes_consumed").set(snapshot.authorization_codes.consumed_count as f64);

    for file in &snapshot.storage.files {
        metrics::gauge!("oauth_storage_bytes", "store" => file.store).set(file.bytes as f64);
    }
}
