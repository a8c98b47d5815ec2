//! Canonical hashing, the hash chain, and the pluggable `AuditStore`
//! backend (§4.8).
//!
//! The hashing algorithm is ported algorithm-for-algorithm from the
//! reference source's `governance/audit/store.py` (`_serialize_for_hash`,
//! `_create_hash_chain_entry`, `append_entry`, `verify_integrity`). The
//! trait shape mirrors `weavegraph`'s `Checkpointer` async trait
//! (`save`/`load_latest`/`list_sessions`), restated as
//! `append`/`get_entries`/`verify_integrity`.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use fs2::FileExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::entry::AuditEntry;
use crate::errors::DecisionError;

/// Re-sorts every object's keys, recursively, so that serializing the
/// result always produces the same byte string for logically-equal data
/// (§4.8 "canonical serialization for hashing").
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::to_value(sorted).expect("BTreeMap<String, Value> always serializes")
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_json_for_hash(entry: &AuditEntry) -> String {
    let mut value = serde_json::to_value(entry).expect("AuditEntry always serializes");
    if let Value::Object(map) = &mut value {
        map.insert("entry_hash".to_string(), Value::Null);
    }
    serde_json::to_string(&canonicalize(&value)).expect("canonical value always serializes")
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Chains `entry` onto `previous_hash`, filling in `previous_hash` and
/// `entry_hash` in place.
fn chain(entry: &mut AuditEntry, previous_hash: Option<String>) {
    entry.previous_hash = previous_hash;
    entry.entry_hash = None;
    let hash = sha256_hex(&canonical_json_for_hash(entry));
    entry.entry_hash = Some(hash);
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub date: Option<NaiveDate>,
    pub event_type: Option<super::entry::AuditEventType>,
    pub decision_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl EntryFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(event_type) = self.event_type {
            if entry.event_type != event_type {
                return false;
            }
        }
        if let Some(decision_id) = &self.decision_id {
            if &entry.decision_id != decision_id {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if &entry.session_id != session_id {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if &entry.user_id != user_id {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityViolation {
    pub entry_id: String,
    pub line: usize,
    pub detail: String,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<AuditEntry, DecisionError>;
    async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<AuditEntry>, DecisionError>;
    async fn verify_integrity(&self, date: NaiveDate) -> Result<(), IntegrityViolation>;
    async fn get_last_hash(&self, date: NaiveDate) -> Option<String>;
    async fn get_log_files(&self) -> Vec<PathBuf>;
    async fn get_entry_count(&self, date: NaiveDate) -> usize;
}

fn verify_entries(entries: &[AuditEntry]) -> Result<(), IntegrityViolation> {
    let mut previous: Option<String> = None;
    for (line, entry) in entries.iter().enumerate() {
        if entry.previous_hash != previous {
            return Err(IntegrityViolation {
                entry_id: entry.entry_id.clone(),
                line,
                detail: "previous_hash does not match predecessor's entry_hash".to_string(),
            });
        }
        let stored_hash = entry.entry_hash.clone();
        let mut recomputed = entry.clone();
        chain(&mut recomputed, entry.previous_hash.clone());
        if recomputed.entry_hash != stored_hash {
            return Err(IntegrityViolation {
                entry_id: entry.entry_id.clone(),
                line,
                detail: "entry_hash does not match recomputed hash".to_string(),
            });
        }
        previous = entry.entry_hash.clone();
    }
    Ok(())
}

/// Test/in-process backend, grounded in `weavegraph`'s
/// `InMemoryCheckpointer`'s `RwLock<FxHashMap<_>>` pattern.
#[derive(Default)]
pub struct InMemoryAuditStore {
    partitions: Mutex<FxHashMap<NaiveDate, Vec<AuditEntry>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry, DecisionError> {
        let date = entry.timestamp.date_naive();
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(date).or_default();
        let previous_hash = partition.last().and_then(|e| e.entry_hash.clone());
        chain(&mut entry, previous_hash);
        partition.push(entry.clone());
        Ok(entry)
    }

    async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<AuditEntry>, DecisionError> {
        let partitions = self.partitions.lock().await;
        let candidates: Vec<&AuditEntry> = match filter.date {
            Some(date) => partitions.get(&date).map(|v| v.iter().collect()).unwrap_or_default(),
            None => partitions.values().flatten().collect(),
        };
        Ok(candidates.into_iter().filter(|e| filter.matches(e)).cloned().collect())
    }

    async fn verify_integrity(&self, date: NaiveDate) -> Result<(), IntegrityViolation> {
        let partitions = self.partitions.lock().await;
        let Some(entries) = partitions.get(&date) else {
            return Ok(());
        };
        verify_entries(entries)
    }

    async fn get_last_hash(&self, date: NaiveDate) -> Option<String> {
        let partitions = self.partitions.lock().await;
        partitions.get(&date).and_then(|v| v.last()).and_then(|e| e.entry_hash.clone())
    }

    async fn get_log_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn get_entry_count(&self, date: NaiveDate) -> usize {
        let partitions = self.partitions.lock().await;
        partitions.get(&date).map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PartitionMeta {
    last_hash: Option<String>,
    entry_count: usize,
    updated_at: chrono::DateTime<Utc>,
}

/// Normative one-file-per-partition backend (§6), grounded in the
/// reference source's `FileAuditStore`. Exclusive locking is held only for
/// the duration of a single append (§5).
pub struct FileAuditStore {
    base_dir: PathBuf,
    meta_cache: Mutex<FxHashMap<NaiveDate, PartitionMeta>>,
}

impl FileAuditStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            meta_cache: Mutex::new(FxHashMap::default()),
        }
    }

    fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.base_dir.join(format!("{date}.jsonl"))
    }

    fn meta_path(&self, date: NaiveDate) -> PathBuf {
        self.base_dir.join(format!("{date}.jsonl.meta"))
    }

    fn read_partition(path: &Path) -> std::io::Result<Vec<AuditEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry, DecisionError> {
        let date = entry.timestamp.date_naive();
        let path = self.partition_path(date);
        let meta_path = self.meta_path(date);
        std::fs::create_dir_all(&self.base_dir).map_err(|e| DecisionError::Audit(e.to_string()))?;

        let mut options = OpenOptions::new();
        options.create(true).append(true).read(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(|e| DecisionError::Audit(e.to_string()))?;
        file.lock_exclusive().map_err(|e| DecisionError::Audit(e.to_string()))?;

        let previous_hash = {
            let mut cache = self.meta_cache.lock().await;
            if let Some(meta) = cache.get(&date) {
                meta.last_hash.clone()
            } else {
                let existing = Self::read_partition(&path).map_err(|e| DecisionError::Audit(e.to_string()))?;
                let last_hash = existing.last().and_then(|e| e.entry_hash.clone());
                cache.insert(
                    date,
                    PartitionMeta {
                        last_hash: last_hash.clone(),
                        entry_count: existing.len(),
                        updated_at: Utc::now(),
                    },
                );
                last_hash
            }
        };

        chain(&mut entry, previous_hash);

        let line = serde_json::to_string(&entry).map_err(|e| DecisionError::Audit(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| DecisionError::Audit(e.to_string()))?;
        fs2::FileExt::unlock(&file).ok();

        let mut cache = self.meta_cache.lock().await;
        let meta = cache.entry(date).or_insert(PartitionMeta {
            last_hash: None,
            entry_count: 0,
            updated_at: Utc::now(),
        });
        meta.last_hash = entry.entry_hash.clone();
        meta.entry_count += 1;
        meta.updated_at = Utc::now();
        let meta_json = serde_json::to_string(meta).map_err(|e| DecisionError::Audit(e.to_string()))?;
        std::fs::write(&meta_path, meta_json).map_err(|e| DecisionError::Audit(e.to_string()))?;

        Ok(entry)
    }

    async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<AuditEntry>, DecisionError> {
        let dates: Vec<NaiveDate> = match filter.date {
            Some(date) => vec![date],
            None => self
                .get_log_files()
                .await
                .into_iter()
                .filter_map(|p| {
                    p.file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.trim_end_matches(".jsonl").parse().ok())
                })
                .collect(),
        };
        let mut results = Vec::new();
        for date in dates {
            let entries = Self::read_partition(&self.partition_path(date)).map_err(|e| DecisionError::Audit(e.to_string()))?;
            results.extend(entries.into_iter().filter(|e| filter.matches(e)));
        }
        Ok(results)
    }

    async fn verify_integrity(&self, date: NaiveDate) -> Result<(), IntegrityViolation> {
        let entries = Self::read_partition(&self.partition_path(date)).map_err(|e| IntegrityViolation {
            entry_id: "<partition>".to_string(),
            line: 0,
            detail: e.to_string(),
        })?;
        verify_entries(&entries)
    }

    async fn get_last_hash(&self, date: NaiveDate) -> Option<String> {
        let cache = self.meta_cache.lock().await;
        if let Some(meta) = cache.get(&date) {
            return meta.last_hash.clone();
        }
        drop(cache);
        Self::read_partition(&self.partition_path(date)).ok()?.last()?.entry_hash.clone()
    }

    async fn get_log_files(&self) -> Vec<PathBuf> {
        let Ok(read_dir) = std::fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .collect()
    }

    async fn get_entry_count(&self, date: NaiveDate) -> usize {
        Self::read_partition(&self.partition_path(date)).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::AuditEventType;
    use chrono::Utc;

    fn sample_entry(id: &str) -> AuditEntry {
        AuditEntry {
            entry_id: id.to_string(),
            timestamp: Utc::now(),
            event_type: AuditEventType::Decision,
            decision_id: "d-1".to_string(),
            session_id: "s-1".to_string(),
            user_id: "u-1".to_string(),
            action: None,
            confidence: Some(0.9),
            decided_by: None,
            policy_version: "v1".to_string(),
            agent_outputs: Value::Null,
            metadata: Value::Null,
            previous_hash: None,
            entry_hash: None,
        }
    }

    #[tokio::test]
    async fn in_memory_store_chains_entries() {
        let store = InMemoryAuditStore::new();
        let first = store.append(sample_entry("a")).await.unwrap();
        let second = store.append(sample_entry("b")).await.unwrap();
        assert!(first.previous_hash.is_none());
        assert_eq!(second.previous_hash, first.entry_hash);
        let date = first.timestamp.date_naive();
        assert!(store.verify_integrity(date).await.is_ok());
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let store = InMemoryAuditStore::new();
        store.append(sample_entry("a")).await.unwrap();
        {
            let mut partitions = store.partitions.lock().await;
            for entries in partitions.values_mut() {
                for entry in entries.iter_mut() {
                    entry.confidence = Some(0.1);
                }
            }
        }
        let date = Utc::now().date_naive();
        assert!(store.verify_integrity(date).await.is_err());
    }

    #[tokio::test]
    async fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::new(dir.path());
        let first = store.append(sample_entry("a")).await.unwrap();
        let second = store.append(sample_entry("b")).await.unwrap();
        assert_eq!(second.previous_hash, first.entry_hash);
        let date = first.timestamp.date_naive();
        assert!(store.verify_integrity(date).await.is_ok());
        assert_eq!(store.get_entry_count(date).await, 2);
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let entry = sample_entry("a");
        let text = canonical_json_for_hash(&entry);
        let user_idx = text.find("\"user_id\"").unwrap();
        let event_idx = text.find("\"event_type\"").unwrap();
        assert!(event_idx < user_idx, "keys must be lexicographically sorted");
    }
}
