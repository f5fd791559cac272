//! Keyed record persistence.
//!
//! Core logic only talks to [`RecordStore`]; the encoding on disk belongs to
//! the implementations. Keys are namespaced by entity (`station/`,
//! `registry/`, `session/`).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub type Record = serde_json::Value;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub trait RecordStore: Send + Sync {
    fn put(&self, key: &str, record: Record) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;
    /// All records whose key starts with `prefix`, ordered by key.
    fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError>;
    /// Returns whether a record was present.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

pub fn put_typed<T: Serialize>(
    store: &dyn RecordStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.put(key, serde_json::to_value(value)?)
}

pub fn get_typed<T: DeserializeOwned>(
    store: &dyn RecordStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    store
        .get(key)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(StoreError::from)
}

pub fn list_typed<T: DeserializeOwned>(
    store: &dyn RecordStore,
    prefix: &str,
) -> Result<Vec<T>, StoreError> {
    store
        .list(prefix)?
        .into_iter()
        .map(|(_, record)| serde_json::from_value(record).map_err(StoreError::from))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn collect_prefix(index: &BTreeMap<String, Record>, prefix: &str) -> Vec<(String, Record)> {
    index
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, record)| (key.clone(), record.clone()))
        .collect()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, key: &str, record: Record) -> Result<(), StoreError> {
        lock(&self.records).insert(key.to_string(), record);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(lock(&self.records).get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError> {
        Ok(collect_prefix(&lock(&self.records), prefix))
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.records).remove(key).is_some())
    }
}

/// One line of the append-only log. A line without a record is a removal.
#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record: Option<Record>,
}

struct JsonlState {
    file: File,
    index: BTreeMap<String, Record>,
}

/// Append-only JSON-lines store; the last line for a key wins.
pub struct JsonlStore {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut index = BTreeMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogLine>(&line) {
                    Ok(LogLine {
                        key,
                        record: Some(record),
                    }) => {
                        index.insert(key, record);
                    }
                    Ok(LogLine { key, record: None }) => {
                        index.remove(&key);
                    }
                    Err(error) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %error,
                            "skipping malformed record line"
                        );
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), records = index.len(), "record store opened");

        Ok(JsonlStore {
            path,
            state: Mutex::new(JsonlState { file, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(state: &mut JsonlState, line: &LogLine) -> Result<(), StoreError> {
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');
        state.file.write_all(&encoded)?;
        state.file.flush()?;
        Ok(())
    }
}

impl RecordStore for JsonlStore {
    fn put(&self, key: &str, record: Record) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let line = LogLine {
            key: key.to_string(),
            record: Some(record),
        };
        Self::append(&mut state, &line)?;
        if let Some(record) = line.record {
            state.index.insert(line.key, record);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(lock(&self.state).index.get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError> {
        Ok(collect_prefix(&lock(&self.state).index, prefix))
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        if !state.index.contains_key(key) {
            return Ok(false);
        }
        Self::append(
            &mut state,
            &LogLine {
                key: key.to_string(),
                record: None,
            },
        )?;
        state.index.remove(key);
        Ok(true)
    }
}
