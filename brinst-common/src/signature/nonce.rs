//! Local record of consumed nonces.
//!
//! Records live in memory and, when a path is configured, in a JSONL file
//! that survives across runs. Entries older than the retention window are
//! pruned on every insert.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

/// One consumed `(subjectId, nonce)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    pub key: String,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NonceStoreError {
    #[error("nonce store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode nonce record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of [`NonceStore::check_and_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    /// First use; the nonce is now recorded.
    Fresh,
    /// Already recorded at the given time.
    Replayed { first_used: DateTime<Utc> },
}

pub struct NonceStore {
    path: Option<PathBuf>,
    retention: Duration,
    records: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NonceStore {
    pub fn in_memory(retention_days: u32) -> Self {
        Self {
            path: None,
            retention: Duration::days(i64::from(retention_days)),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Open or create a persistent store. Unreadable lines are skipped.
    pub fn open(path: &Path, retention_days: u32) -> Result<Self, NonceStoreError> {
        let mut records = HashMap::new();
        match fs::read_to_string(path) {
            Ok(content) => {
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<NonceRecord>(line) {
                        Ok(record) => {
                            records.insert(record.key, record.used_at);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), line = line_no + 1, error = %e, "Skipping unreadable nonce record")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(NonceStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
        debug!(path = %path.display(), records = records.len(), "Opened nonce store");

        Ok(Self {
            path: Some(path.to_path_buf()),
            retention: Duration::days(i64::from(retention_days)),
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically test for `key` and record it if absent.
    ///
    /// Pruning, lookup, insert and persistence all happen under one lock.
    pub fn check_and_insert(&self, key: &str, now: DateTime<Utc>) -> Result<NonceCheck, NonceStoreError> {
        let mut records = self.lock();

        let cutoff = now - self.retention;
        let before = records.len();
        records.retain(|_, used_at| *used_at >= cutoff);
        let pruned = before - records.len();
        if pruned > 0 {
            debug!(pruned, "Pruned expired nonce records");
        }

        if let Some(first_used) = records.get(key) {
            return Ok(NonceCheck::Replayed {
                first_used: *first_used,
            });
        }

        records.insert(key.to_string(), now);
        let record = NonceRecord {
            key: key.to_string(),
            used_at: now,
        };

        if let Some(path) = &self.path {
            let result = if pruned > 0 {
                rewrite(path, &records)
            } else {
                append(path, &record)
            };
            if let Err(e) = result {
                // Not persisted means not consumed.
                records.remove(key);
                return Err(e);
            }
        }

        Ok(NonceCheck::Fresh)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> NonceStoreError + '_ {
    move |source| NonceStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn append(path: &Path, record: &NonceRecord) -> Result<(), NonceStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(path))?;
    }
    let line = serde_json::to_string(record)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    writeln!(file, "{line}").map_err(io_err(path))
}

fn rewrite(path: &Path, records: &HashMap<String, DateTime<Utc>>) -> Result<(), NonceStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(path))?;
    }
    let mut entries: Vec<_> = records.iter().collect();
    entries.sort_by_key(|(_, used_at)| **used_at);

    let mut content = String::new();
    for (key, used_at) in entries {
        let record = NonceRecord {
            key: key.clone(),
            used_at: *used_at,
        };
        content.push_str(&serde_json::to_string(&record)?);
        content.push('\n');
    }

    let tmp = path.with_extension("jsonl.tmp");
    fs::write(&tmp, content).map_err(io_err(path))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_second_use_is_replay() {
        let store = NonceStore::in_memory(7);
        let now = Utc::now();
        assert_eq!(store.check_and_insert("s:n1", now).unwrap(), NonceCheck::Fresh);
        assert_eq!(
            store.check_and_insert("s:n1", now).unwrap(),
            NonceCheck::Replayed { first_used: now }
        );
        assert_eq!(store.check_and_insert("s:n2", now).unwrap(), NonceCheck::Fresh);
    }

    #[test]
    fn test_entries_expire_after_retention() {
        let store = NonceStore::in_memory(7);
        let then = Utc::now() - Duration::days(8);
        store.check_and_insert("s:old", then).unwrap();
        assert!(store.contains("s:old"));

        let now = Utc::now();
        assert_eq!(store.check_and_insert("s:old", now).unwrap(), NonceCheck::Fresh);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("nonces.jsonl");
        let now = Utc::now();

        let store = NonceStore::open(&path, 7).unwrap();
        store.check_and_insert("s:n1", now).unwrap();
        drop(store);

        let reopened = NonceStore::open(&path, 7).unwrap();
        assert!(matches!(
            reopened.check_and_insert("s:n1", now).unwrap(),
            NonceCheck::Replayed { .. }
        ));
    }

    #[test]
    fn test_prune_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.jsonl");
        let store = NonceStore::open(&path, 7).unwrap();

        store
            .check_and_insert("s:old", Utc::now() - Duration::days(30))
            .unwrap();
        store.check_and_insert("s:new", Utc::now()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("s:new"));
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.jsonl");
        let good = serde_json::to_string(&NonceRecord {
            key: "s:n1".into(),
            used_at: Utc::now(),
        })
        .unwrap();
        fs::write(&path, format!("not json\n{good}\n")).unwrap();

        let store = NonceStore::open(&path, 7).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains("s:n1"));
    }

    #[test]
    fn test_concurrent_inserts_admit_exactly_one() {
        let store = Arc::new(NonceStore::in_memory(7));
        let now = Utc::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.check_and_insert("s:race", now).unwrap())
            })
            .collect();
        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c == NonceCheck::Fresh)
            .count();
        assert_eq!(fresh, 1);
    }
}
