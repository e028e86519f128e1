//! Durable key/value media for scalar settings.
//!
//! Absent keys read as `0` / `false`. The file-backed medium rewrites its
//! whole document on every mutation using write-to-temp-then-rename, so a
//! crash mid-write leaves the previous document intact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// A flat store of named scalar values.
pub trait KeyValueMedium: Send {
    fn get_int(&self, key: &str) -> i64;
    fn get_bool(&self, key: &str) -> bool;
    fn contains(&self, key: &str) -> bool;
    fn set_int(&mut self, key: &str, value: i64);
    fn set_bool(&mut self, key: &str, value: bool);
    /// Erase every persisted key.
    fn remove_all(&mut self);
}

fn read_int(values: &BTreeMap<String, Value>, key: &str) -> i64 {
    values.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn read_bool(values: &BTreeMap<String, Value>, key: &str) -> bool {
    values.get(key).and_then(Value::as_bool).unwrap_or(false)
}

// ============================================================================
// In-memory medium
// ============================================================================

/// Process-local medium. Counts mutations so callers can assert that an
/// operation performed no writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryMedium {
    values: BTreeMap<String, Value>,
    writes: u64,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls since creation.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KeyValueMedium for MemoryMedium {
    fn get_int(&self, key: &str) -> i64 {
        read_int(&self.values, key)
    }

    fn get_bool(&self, key: &str) -> bool {
        read_bool(&self.values, key)
    }

    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn set_int(&mut self, key: &str, value: i64) {
        self.writes += 1;
        self.values.insert(key.to_string(), Value::from(value));
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.writes += 1;
        self.values.insert(key.to_string(), Value::from(value));
    }

    fn remove_all(&mut self) {
        self.writes += 1;
        self.values.clear();
    }
}

// ============================================================================
// JSON file medium
// ============================================================================

/// Medium persisted as a single JSON object (`settings.json`).
///
/// The document is loaded once at open and kept in memory; reads never
/// touch the disk. Write failures are logged and the in-memory value is
/// kept, so the session continues with the new value even if it could not
/// be persisted.
#[derive(Debug)]
pub struct JsonFileMedium {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl JsonFileMedium {
    /// Open (or lazily create) the medium at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = Self::load(&path);
        Self { path, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> BTreeMap<String, Value> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                log::error!("Error reading {}: {}", path.display(), e);
                return BTreeMap::new();
            }
        };

        match serde_json::from_str::<BTreeMap<String, Value>>(&contents) {
            Ok(values) => values,
            Err(e) => {
                log::error!("Error parsing {}: {}", path.display(), e);
                backup_corrupt_file(path);
                BTreeMap::new()
            }
        }
    }

    /// Atomically rewrite the document.
    fn persist(&self) {
        if let Err(e) = self.try_persist() {
            log::error!("Failed to persist settings to {}: {}", self.path.display(), e);
        }
    }

    fn try_persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self.values)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(())
    }
}

/// Move a corrupt document aside to `<file>.bad-<timestamp>`.
fn backup_corrupt_file(path: &Path) {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let backup_path = PathBuf::from(format!("{}.bad-{}", path.display(), timestamp));
    match fs::rename(path, &backup_path) {
        Ok(()) => log::warn!("Corrupt settings backed up to {}", backup_path.display()),
        Err(e) => {
            log::error!("Failed to back up corrupt settings: {}", e);
            let _ = fs::remove_file(path);
        }
    }
}

impl KeyValueMedium for JsonFileMedium {
    fn get_int(&self, key: &str) -> i64 {
        read_int(&self.values, key)
    }

    fn get_bool(&self, key: &str) -> bool {
        read_bool(&self.values, key)
    }

    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn set_int(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), Value::from(value));
        self.persist();
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), Value::from(value));
        self.persist();
    }

    fn remove_all(&mut self) {
        self.values.clear();
        self.persist();
    }
}
