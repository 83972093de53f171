//! Entity-keyed persistence of extracted event rows.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::extract::EventRecord;

const FILE_PREFIX: &str = "git_data_";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid entity key '{0}'")]
    InvalidKey(String),
    #[error("no records stored for entity '{0}'")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Whole-unit storage of one record sequence per entity.
pub trait RecordStore {
    /// Replaces any sequence previously stored for `entity_id`.
    fn write(&self, entity_id: &str, records: &[EventRecord]) -> Result<(), StoreError>;
    fn read(&self, entity_id: &str) -> Result<Vec<EventRecord>, StoreError>;
    /// Sorted entity ids.
    fn list_keys(&self) -> Result<Vec<String>, StoreError>;
    /// Drops the stored sequence; `Ok(false)` when nothing was stored.
    fn remove(&self, entity_id: &str) -> Result<bool, StoreError>;
}

fn validate_key(entity_id: &str) -> Result<(), StoreError> {
    let invalid = entity_id.is_empty()
        || entity_id == "."
        || entity_id == ".."
        || entity_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidKey(entity_id.to_string()));
    }
    Ok(())
}

/// One pretty-printed JSON array per entity, `git_data_<entity_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_for(&self, entity_id: &str) -> PathBuf {
        self.root
            .join(format!("{FILE_PREFIX}{entity_id}{FILE_SUFFIX}"))
    }
}

impl RecordStore for JsonDirStore {
    fn write(&self, entity_id: &str, records: &[EventRecord]) -> Result<(), StoreError> {
        validate_key(entity_id)?;
        let mut bytes = serde_json::to_vec_pretty(records)?;
        bytes.push(b'\n');
        let path = self.path_for(entity_id);
        write_atomic(&path, &bytes)?;
        debug!(
            component = "store",
            event = "store.write",
            entity_id,
            path = %path.display(),
            record_count = records.len()
        );
        Ok(())
    }

    fn read(&self, entity_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        validate_key(entity_id)?;
        let path = self.path_for(entity_id);
        if !path.exists() {
            return Err(StoreError::NotFound(entity_id.to_string()));
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                if !key.is_empty() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, entity_id: &str) -> Result<bool, StoreError> {
        validate_key(entity_id)?;
        match fs::remove_file(self.path_for(entity_id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Same JSON payload as [`JsonDirStore`], one row per entity.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                entity_id TEXT NOT NULL PRIMARY KEY,
                record_count INTEGER NOT NULL,
                payload TEXT NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        info!(
            component = "store",
            event = "store.sqlite.ready",
            table = "records"
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl RecordStore for SqliteRecordStore {
    fn write(&self, entity_id: &str, records: &[EventRecord]) -> Result<(), StoreError> {
        validate_key(entity_id)?;
        let payload = serde_json::to_string(records)?;
        self.conn()?.execute(
            "
            INSERT INTO records (entity_id, record_count, payload)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_id) DO UPDATE SET
                record_count = excluded.record_count,
                payload = excluded.payload
            ",
            params![entity_id, records.len() as i64, payload],
        )?;
        Ok(())
    }

    fn read(&self, entity_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        validate_key(entity_id)?;
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload FROM records WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()?;
        let payload = payload.ok_or_else(|| StoreError::NotFound(entity_id.to_string()))?;
        Ok(serde_json::from_str(&payload)?)
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT entity_id FROM records ORDER BY entity_id ASC")?;
        let mut rows = stmt.query([])?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            keys.push(row.get(0)?);
        }
        Ok(keys)
    }

    fn remove(&self, entity_id: &str) -> Result<bool, StoreError> {
        validate_key(entity_id)?;
        let deleted = self.conn()?.execute(
            "DELETE FROM records WHERE entity_id = ?1",
            params![entity_id],
        )?;
        Ok(deleted > 0)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    entries: Mutex<BTreeMap<String, Vec<EventRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn write(&self, entity_id: &str, records: &[EventRecord]) -> Result<(), StoreError> {
        validate_key(entity_id)?;
        self.entries
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(entity_id.to_string(), records.to_vec());
        Ok(())
    }

    fn read(&self, entity_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(entity_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(entity_id.to_string()))
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .keys()
            .cloned()
            .collect())
    }

    fn remove(&self, entity_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .remove(entity_id)
            .is_some())
    }
}
