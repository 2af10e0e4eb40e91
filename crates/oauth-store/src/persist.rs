//! Debounced, encrypted write-through for store tables
//!
//! Each store keeps its entities in an in-memory map guarded by a tokio
//! Mutex. Every mutation re-arms a short timer; when the timer fires, the
//! whole table is serialized once and written through the encryption
//! service. Bursts of mutations inside the window collapse into one write.
//!
//! Writes for one table are serialized by a write gate, so an explicit
//! `flush()` and a firing timer never race on the same file. Once a timer
//! has started writing it is detached and can no longer be aborted by a
//! re-arm, which keeps a half-finished write from being cancelled.
//!
//! Background write failures are logged and remembered (see
//! `Table::last_error`) but never propagate into request handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use token_vault::EncryptionService;

use crate::error::{Error, Result};

/// Version of the decrypted `{ "version", "<collection>": [...] }` payload.
pub const STATE_VERSION: u64 = 1;

/// Default quiet period before a scheduled write fires.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// An entity that lives in a persisted table.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Array field holding the entities in the decrypted payload.
    const COLLECTION: &'static str;
    /// Store label for logs and metrics.
    const STORE: &'static str;

    /// Primary key (also the secret for codes, tokens and sessions).
    fn key(&self) -> &str;

    /// Whether the entity is past its expiry at `now` (epoch ms).
    fn is_expired_at(&self, now: u64) -> bool;
}

/// How a store keeps its state.
#[derive(Debug, Clone)]
pub enum PersistenceMode {
    /// In-memory only. Nothing touches disk.
    Memory,
    /// Encrypted file at `path`, written at most once per `debounce` window.
    Encrypted {
        vault: Arc<EncryptionService>,
        path: PathBuf,
        debounce: Duration,
    },
}

impl PersistenceMode {
    /// Encrypted mode with the default debounce window.
    pub fn encrypted(vault: Arc<EncryptionService>, path: impl Into<PathBuf>) -> Self {
        PersistenceMode::Encrypted {
            vault,
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

#[derive(Default)]
struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Writer {
    vault: Arc<EncryptionService>,
    path: PathBuf,
    debounce: Duration,
    timer: Mutex<Timer>,
    write_gate: Mutex<()>,
    last_error: Mutex<Option<String>>,
}

/// Map from primary key to entity, plus its optional encrypted writer.
pub(crate) struct Table<R: Record> {
    entries: Mutex<HashMap<String, R>>,
    writer: Option<Writer>,
}

impl<R: Record> Table<R> {
    /// Empty table with no persistence.
    pub(crate) fn memory() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            writer: None,
        })
    }

    /// Build a table, restoring state from disk in encrypted mode.
    ///
    /// A missing file is a cold start. Decrypt or parse failures are
    /// returned: starting empty over an unreadable file would overwrite it
    /// on the first write.
    pub(crate) async fn open(mode: PersistenceMode) -> Result<Arc<Self>> {
        let PersistenceMode::Encrypted {
            vault,
            path,
            debounce,
        } = mode
        else {
            return Ok(Self::memory());
        };

        let entries = match vault.decrypt_from_file(&path).await? {
            None => {
                info!(store = R::STORE, path = %path.display(), "no state file, starting empty");
                HashMap::new()
            }
            Some(plaintext) => {
                let records = decode::<R>(&plaintext)?;
                let total = records.len();
                let now = common::now_millis();
                let live: HashMap<String, R> = records
                    .into_iter()
                    .filter(|r| !r.is_expired_at(now))
                    .map(|r| (r.key().to_owned(), r))
                    .collect();
                info!(
                    store = R::STORE,
                    path = %path.display(),
                    loaded = live.len(),
                    dropped_expired = total.saturating_sub(live.len()),
                    "restored state"
                );
                live
            }
        };

        Ok(Arc::new(Self {
            entries: Mutex::new(entries),
            writer: Some(Writer {
                vault,
                path,
                debounce,
                timer: Mutex::new(Timer::default()),
                write_gate: Mutex::new(()),
                last_error: Mutex::new(None),
            }),
        }))
    }

    pub(crate) fn entries(&self) -> &Mutex<HashMap<String, R>> {
        &self.entries
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.writer.as_ref().map(|w| w.path.as_path())
    }

    /// Most recent background write failure, cleared by the next success.
    pub(crate) async fn last_error(&self) -> Option<String> {
        match &self.writer {
            Some(writer) => writer.last_error.lock().await.clone(),
            None => None,
        }
    }

    /// Re-arm the debounce timer. No-op in memory mode.
    pub(crate) async fn schedule_flush(self: &Arc<Self>) {
        let Some(writer) = &self.writer else {
            return;
        };

        let mut timer = writer.timer.lock().await;
        if let Some(pending) = timer.handle.take() {
            pending.abort();
        }
        timer.generation += 1;
        let generation = timer.generation;
        let debounce = writer.debounce;
        let table = Arc::clone(self);
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            table.fire(generation).await;
        }));
    }

    async fn fire(&self, generation: u64) {
        let Some(writer) = &self.writer else {
            return;
        };

        {
            let mut timer = writer.timer.lock().await;
            if timer.generation != generation {
                return;
            }
            // Detach so a later re-arm cannot abort this write
            timer.handle = None;
        }

        if let Err(e) = self.write_now().await {
            warn!(store = R::STORE, error = %e, "background flush failed");
        }
    }

    /// Cancel any pending timer and write the current table immediately.
    pub(crate) async fn flush(&self) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        {
            let mut timer = writer.timer.lock().await;
            timer.generation += 1;
            if let Some(pending) = timer.handle.take() {
                pending.abort();
            }
        }

        self.write_now().await
    }

    async fn write_now(&self) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        let _gate = writer.write_gate.lock().await;
        let (payload, count) = self.encode().await?;
        let result = writer.vault.encrypt_to_file(&payload, &writer.path).await;

        match &result {
            Ok(()) => {
                *writer.last_error.lock().await = None;
                metrics::counter!("oauth_persist_writes_total", "store" => R::STORE).increment(1);
                debug!(store = R::STORE, entries = count, "persisted state");
            }
            Err(e) => {
                *writer.last_error.lock().await = Some(e.to_string());
                metrics::counter!("oauth_persist_failures_total", "store" => R::STORE).increment(1);
            }
        }

        result.map_err(Error::from)
    }

    async fn encode(&self) -> Result<(Vec<u8>, usize)> {
        let entries = self.entries.lock().await;
        let records: Vec<&R> = entries.values().collect();
        let mut doc = serde_json::Map::new();
        doc.insert("version".into(), Value::from(STATE_VERSION));
        doc.insert(R::COLLECTION.into(), serde_json::to_value(&records)?);
        let count = records.len();
        drop(entries);

        Ok((serde_json::to_vec(&Value::Object(doc))?, count))
    }
}

/// Parse a decrypted payload into entities.
///
/// A payload without a `version` field is read as version 1; a newer
/// version than this build understands is refused.
fn decode<R: Record>(plaintext: &[u8]) -> Result<Vec<R>> {
    let mut doc: Value = serde_json::from_slice(plaintext)?;
    let version = doc.get("version").and_then(Value::as_u64).unwrap_or(STATE_VERSION);
    if version > STATE_VERSION {
        return Err(Error::StateVersion(version));
    }

    match doc.get_mut(R::COLLECTION).map(Value::take) {
        Some(items) => Ok(serde_json::from_value(items)?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use token_vault::KeySource;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        expires_at: u64,
    }

    impl Record for Note {
        const COLLECTION: &'static str = "notes";
        const STORE: &'static str = "notes";

        fn key(&self) -> &str {
            &self.id
        }

        fn is_expired_at(&self, now: u64) -> bool {
            now >= self.expires_at
        }
    }

    fn vault() -> Arc<EncryptionService> {
        Arc::new(EncryptionService::from_key(
            token_vault::key::generate_key(),
            KeySource::Generated,
        ))
    }

    fn mode(vault: &Arc<EncryptionService>, path: &Path, debounce: Duration) -> PersistenceMode {
        PersistenceMode::Encrypted {
            vault: Arc::clone(vault),
            path: path.to_path_buf(),
            debounce,
        }
    }

    fn note(id: &str, expires_at: u64) -> Note {
        Note {
            id: id.into(),
            expires_at,
        }
    }

    async fn insert(table: &Arc<Table<Note>>, n: Note) {
        table.entries().lock().await.insert(n.id.clone(), n);
        table.schedule_flush().await;
    }

    #[tokio::test]
    async fn cold_start_is_empty_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let table = Table::<Note>::open(mode(&vault(), &path, DEFAULT_DEBOUNCE))
            .await
            .unwrap();

        assert!(table.entries().lock().await.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn flush_then_reopen_restores_and_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let vault = vault();

        let table = Table::<Note>::open(mode(&vault, &path, Duration::from_secs(60)))
            .await
            .unwrap();
        insert(&table, note("live", u64::MAX)).await;
        insert(&table, note("stale", 1)).await;
        table.flush().await.unwrap();

        let reopened = Table::<Note>::open(mode(&vault, &path, Duration::from_secs(60)))
            .await
            .unwrap();
        let entries = reopened.entries().lock().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("live"));
    }

    #[tokio::test]
    async fn plaintext_payload_has_versioned_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let vault = vault();
        let table = Table::<Note>::open(mode(&vault, &path, Duration::from_secs(60)))
            .await
            .unwrap();
        insert(&table, note("a", u64::MAX)).await;
        table.flush().await.unwrap();

        let plaintext = vault.decrypt_from_file(&path).await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["notes"][0]["id"], "a");
    }

    #[tokio::test]
    async fn burst_of_mutations_collapses_into_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let table = Table::<Note>::open(mode(&vault(), &path, Duration::from_millis(100)))
            .await
            .unwrap();

        for i in 0..20 {
            insert(&table, note(&format!("n{i}"), u64::MAX)).await;
        }
        assert!(!path.exists(), "nothing is written inside the debounce window");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(path.exists());
        let first_write = tokio::fs::read(&path).await.unwrap();

        // No further timer is pending, so the file stays untouched
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(tokio::fs::read(&path).await.unwrap(), first_write);
    }

    #[tokio::test]
    async fn flush_cancels_pending_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let vault = vault();
        let table = Table::<Note>::open(mode(&vault, &path, Duration::from_millis(200)))
            .await
            .unwrap();

        insert(&table, note("a", u64::MAX)).await;
        table.flush().await.unwrap();
        let flushed = tokio::fs::read(&path).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            tokio::fs::read(&path).await.unwrap(),
            flushed,
            "cancelled timer must not rewrite the file"
        );
    }

    #[tokio::test]
    async fn flush_racing_a_firing_timer_keeps_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let vault = vault();
        let table = Table::<Note>::open(mode(&vault, &path, Duration::from_millis(1)))
            .await
            .unwrap();

        for i in 0..40 {
            insert(&table, note(&format!("n{i}"), u64::MAX)).await;
            if i % 2 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            table.flush().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(table.last_error().await.is_none());

        let reopened = Table::<Note>::open(mode(&vault, &path, DEFAULT_DEBOUNCE))
            .await
            .unwrap();
        assert_eq!(reopened.entries().lock().await.len(), 40);

        let mut names = Vec::new();
        let mut dir_entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = dir_entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["notes.enc.json"]);
    }

    #[tokio::test]
    async fn wrong_key_on_load_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let table = Table::<Note>::open(mode(&vault(), &path, DEFAULT_DEBOUNCE))
            .await
            .unwrap();
        insert(&table, note("a", u64::MAX)).await;
        table.flush().await.unwrap();

        let result = Table::<Note>::open(mode(&vault(), &path, DEFAULT_DEBOUNCE)).await;
        assert!(matches!(
            result,
            Err(Error::Storage(token_vault::Error::Decrypt(_)))
        ));
    }

    #[tokio::test]
    async fn newer_state_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let vault = vault();
        vault
            .encrypt_to_file(br#"{"version":7,"notes":[]}"#, &path)
            .await
            .unwrap();

        let result = Table::<Note>::open(mode(&vault, &path, DEFAULT_DEBOUNCE)).await;
        assert!(matches!(result, Err(Error::StateVersion(7))));
    }

    #[test]
    fn decode_tolerates_missing_version_and_collection() {
        let notes: Vec<Note> = decode(br#"{"notes":[{"id":"x","expires_at":5}]}"#).unwrap();
        assert_eq!(notes, vec![note("x", 5)]);

        let empty: Vec<Note> = decode(br#"{"version":1}"#).unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn failed_background_write_is_recorded_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.enc.json");
        let table = Table::<Note>::open(mode(&vault(), &path, Duration::from_millis(20)))
            .await
            .unwrap();
        // A non-empty directory where the file should be makes the rename fail
        tokio::fs::create_dir_all(path.join("child")).await.unwrap();

        insert(&table, note("a", u64::MAX)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(table.last_error().await.is_some());
        assert!(table.flush().await.is_err());
    }

    #[tokio::test]
    async fn memory_mode_never_touches_disk() {
        let table = Table::<Note>::memory();
        insert(&table, note("a", u64::MAX)).await;
        table.flush().await.unwrap();
        assert!(table.path().is_none());
        assert!(table.last_error().await.is_none());
    }
}
