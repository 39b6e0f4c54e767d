use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{as_number, merge_values, now_ms, numeric_value, Entry, StateStore, StoreError};

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Base path; the store writes `<base>.log` and `<base>.snapshot`.
    pub path: PathBuf,
    /// Cadence of background compaction. Zero disables the background task.
    pub compaction_interval: Duration,
    /// Compact (snapshot + truncate) on `close()`.
    pub snapshot_on_shutdown: bool,
}

impl FileStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compaction_interval: Duration::from_secs(60),
            snapshot_on_shutdown: true,
        }
    }
}

/// One mutation record in the append log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogRecord {
    timestamp: i64,
    operation: LogOp,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogOp {
    Set,
    Patch,
    Increment,
    Del,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    key: String,
    entry: Entry,
}

/// Append-log file backend.
///
/// Reads are served from the in-process map and never touch the disk. Each
/// mutation appends one NDJSON record followed by a durable sync. Compaction
/// writes a fresh snapshot to a temp file, renames it over the live snapshot
/// atomically, then truncates the log. Startup loads the snapshot and
/// replays the log in order, skipping entries whose computed absolute expiry
/// has already passed.
pub struct FileStore {
    inner: Arc<Mutex<FileInner>>,
    config: FileStoreConfig,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

struct FileInner {
    map: HashMap<String, Entry>,
    log: File,
    snapshot_path: PathBuf,
}

impl FileStore {
    pub fn open(config: FileStoreConfig) -> Result<Self, StoreError> {
        let log_path = sibling(&config.path, "log");
        let snapshot_path = sibling(&config.path, "snapshot");
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut map = HashMap::new();
        let now = now_ms();
        load_snapshot(&snapshot_path, &mut map, now)?;
        replay_log(&log_path, &mut map, now)?;

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let inner = Arc::new(Mutex::new(FileInner {
            map,
            log,
            snapshot_path,
        }));

        let compactor = spawn_compactor(&inner, config.compaction_interval);

        tracing::info!(
            path = %config.path.display(),
            entries = inner.lock().map.len(),
            "file store opened"
        );

        Ok(Self {
            inner,
            config,
            compactor: Mutex::new(compactor),
        })
    }

    fn compact_now(&self) -> Result<(), StoreError> {
        compact(&self.inner)
    }
}

fn sibling(base: &Path, ext: &str) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

fn load_snapshot(
    path: &Path,
    map: &mut HashMap<String, Entry>,
    now: i64,
) -> Result<(), StoreError> {
    let Ok(file) = File::open(path) else {
        return Ok(());
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SnapshotRecord = serde_json::from_str(&line)?;
        if !record.entry.is_expired(now) {
            map.insert(record.key, record.entry);
        }
    }
    Ok(())
}

fn replay_log(path: &Path, map: &mut HashMap<String, Entry>, now: i64) -> Result<(), StoreError> {
    let Ok(file) = File::open(path) else {
        return Ok(());
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line)?;
        apply_record(map, record, now);
    }
    Ok(())
}

fn apply_record(map: &mut HashMap<String, Entry>, record: LogRecord, now: i64) {
    match record.operation {
        LogOp::Set => {
            let entry = Entry::new(
                record.value.unwrap_or(Value::Null),
                record.ttl,
                record.timestamp,
            );
            if entry.is_expired(now) {
                map.remove(&record.key);
            } else {
                map.insert(record.key, entry);
            }
        }
        LogOp::Patch => {
            let incoming = record.value.unwrap_or(Value::Null);
            match map.get_mut(&record.key) {
                Some(existing) => {
                    existing.value = merge_values(&existing.value, incoming);
                    existing.updated_at = record.timestamp;
                }
                None => {
                    map.insert(record.key, Entry::new(incoming, None, record.timestamp));
                }
            }
        }
        LogOp::Increment => {
            let by = record.value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
            match map.get_mut(&record.key) {
                Some(existing) => {
                    existing.value = numeric_value(as_number(Some(&existing.value)) + by);
                    existing.updated_at = record.timestamp;
                }
                None => {
                    map.insert(
                        record.key,
                        Entry::new(numeric_value(by), None, record.timestamp),
                    );
                }
            }
        }
        LogOp::Del => {
            map.remove(&record.key);
        }
    }
}

/// Append one record and sync. Runs under the same lock as the map update
/// so the log order always matches the applied order.
fn append_locked(inner: &FileInner, record: &LogRecord) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut log = &inner.log;
    log.write_all(line.as_bytes())?;
    log.sync_data()?;
    Ok(())
}

/// Snapshot to `<snapshot>.tmp`, fsync, atomic rename, then truncate the log.
fn compact(inner: &Arc<Mutex<FileInner>>) -> Result<(), StoreError> {
    let now = now_ms();
    let inner = inner.lock();

    let tmp_path = sibling(&inner.snapshot_path, "tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for (key, entry) in &inner.map {
            if entry.is_expired(now) {
                continue;
            }
            let record = SnapshotRecord {
                key: key.clone(),
                entry: entry.clone(),
            };
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            tmp.write_all(line.as_bytes())?;
        }
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, &inner.snapshot_path)?;

    inner.log.set_len(0)?;
    inner.log.sync_all()?;
    tracing::debug!(entries = inner.map.len(), "file store compacted");
    Ok(())
}

fn spawn_compactor(
    inner: &Arc<Mutex<FileInner>>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let weak = Arc::downgrade(inner);
    Some(handle.spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // immediate first tick
        loop {
            tick.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            if let Err(e) = compact(&inner) {
                tracing::warn!(error = %e, "periodic compaction failed");
            }
        }
    }))
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock();
        if matches!(inner.map.get(key), Some(e) if e.is_expired(now)) {
            inner.map.remove(key);
            return Ok(None);
        }
        Ok(inner.map.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock();
        append_locked(
            &inner,
            &LogRecord {
                timestamp: now,
                operation: LogOp::Set,
                key: key.to_string(),
                value: Some(value.clone()),
                ttl,
            },
        )?;
        inner.map.insert(key.to_string(), Entry::new(value, ttl, now));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        append_locked(
            &inner,
            &LogRecord {
                timestamp: now_ms(),
                operation: LogOp::Del,
                key: key.to_string(),
                value: None,
                ttl: None,
            },
        )?;
        inner.map.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock();
        append_locked(
            &inner,
            &LogRecord {
                timestamp: now,
                operation: LogOp::Increment,
                key: key.to_string(),
                value: Some(numeric_value(by)),
                ttl: None,
            },
        )?;
        if matches!(inner.map.get(key), Some(e) if e.is_expired(now)) {
            inner.map.remove(key);
        }
        let new_value = match inner.map.get_mut(key) {
            Some(entry) => {
                let updated = numeric_value(as_number(Some(&entry.value)) + by);
                entry.value = updated.clone();
                entry.updated_at = now;
                updated
            }
            None => {
                let value = numeric_value(by);
                inner
                    .map
                    .insert(key.to_string(), Entry::new(value.clone(), None, now));
                value
            }
        };
        Ok(new_value)
    }

    async fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock();
        append_locked(
            &inner,
            &LogRecord {
                timestamp: now,
                operation: LogOp::Patch,
                key: key.to_string(),
                value: Some(value.clone()),
                ttl: None,
            },
        )?;
        if matches!(inner.map.get(key), Some(e) if e.is_expired(now)) {
            inner.map.remove(key);
        }
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.value = merge_values(&entry.value, value);
                entry.updated_at = now;
            }
            None => {
                inner.map.insert(key.to_string(), Entry::new(value, None, now));
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(handle) = self.compactor.lock().take() {
            handle.abort();
        }
        if self.config.snapshot_on_shutdown {
            self.compact_now()?;
        } else {
            self.inner.lock().log.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn config(dir: &tempfile::TempDir) -> FileStoreConfig {
        FileStoreConfig {
            path: dir.path().join("state"),
            compaction_interval: Duration::ZERO,
            snapshot_on_shutdown: true,
        }
    }

    #[tokio::test]
    async fn survives_reopen_via_log_replay() {
        let dir = tempdir().unwrap();
        {
            let s = FileStore::open(config(&dir)).unwrap();
            s.set("user:1", json!({ "name": "Ada" }), None).await.unwrap();
            s.increment("count", 2.0).await.unwrap();
            s.patch("user:1", json!({ "role": "admin" })).await.unwrap();
            s.del("gone").await.unwrap();
            // dropped without close(): only the log survives
        }

        let s = FileStore::open(config(&dir)).unwrap();
        assert_eq!(
            s.get("user:1").await.unwrap(),
            Some(json!({ "name": "Ada", "role": "admin" }))
        );
        assert_eq!(s.get("count").await.unwrap(), Some(json!(2)));
        assert_eq!(s.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_log_entries_are_skipped_on_replay() {
        let dir = tempdir().unwrap();
        {
            let s = FileStore::open(config(&dir)).unwrap();
            s.set("ephemeral", json!(1), Some(0)).await.unwrap();
            s.set("durable", json!(2), None).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let s = FileStore::open(config(&dir)).unwrap();
        assert_eq!(s.get("ephemeral").await.unwrap(), None);
        assert_eq!(s.get("durable").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn close_compacts_snapshot_and_truncates_log() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        let log_path = sibling(&cfg.path, "log");
        let snapshot_path = sibling(&cfg.path, "snapshot");

        let s = FileStore::open(cfg.clone()).unwrap();
        s.set("k", json!("v"), None).await.unwrap();
        s.close().await.unwrap();

        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);
        let snapshot = std::fs::read_to_string(&snapshot_path).unwrap();
        assert!(snapshot.contains("\"k\""));

        // reopen from the snapshot alone
        let s = FileStore::open(cfg).unwrap();
        assert_eq!(s.get("k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn log_records_are_ndjson_with_expected_fields() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        let s = FileStore::open(cfg.clone()).unwrap();
        s.set("k", json!(1), Some(30)).await.unwrap();

        let raw = std::fs::read_to_string(sibling(&cfg.path, "log")).unwrap();
        let line: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(line["operation"], json!("set"));
        assert_eq!(line["key"], json!("k"));
        assert_eq!(line["value"], json!(1));
        assert_eq!(line["ttl"], json!(30));
        assert!(line["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn set_after_close_still_appends() {
        // close() releases the background task but the handle stays usable
        // until dropped; a second close is a no-op.
        let dir = tempdir().unwrap();
        let s = FileStore::open(config(&dir)).unwrap();
        s.close().await.unwrap();
        s.set("k", json!(1), None).await.unwrap();
        s.close().await.unwrap();
    }
}
