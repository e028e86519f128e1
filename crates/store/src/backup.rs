//! Backup archives: export the whole store, import a foreign one.
//!
//! Export takes a compacted point-in-time copy with `VACUUM INTO` on its own
//! connection, so the writer is never blocked for longer than SQLite's
//! read snapshot. Import is all-or-nothing: the archive is checked, written
//! to a sibling temp file, synced and validated there, and only then renamed
//! over the live file. Any failure before the rename leaves the store as it
//! was.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags};

use crate::error::{ImportError, ImportIoError, ImportValidationError};
use crate::lifecycle::LifecycleState;
use crate::paths::{discard_staged, export_staging_path, import_staging_path, remove_if_exists, sidecar_paths};
use crate::schema::read_user_version;
use crate::shared::{open_existing, open_writer, StoreShared};

/// Content tag every exported archive carries and every import requires.
pub const BACKUP_CONTENT_TYPE: &str = "application/x-vitalog-backup";

const UNTAGGED_CONTENT_TYPE: &str = "application/octet-stream";
const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

/// A complete store snapshot plus its declared content tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    content_type: String,
    bytes: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl BackupArchive {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { content_type: content_type.into(), bytes, created_at: Utc::now() }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `vitalog-backup-2024-03-01.vitabak`
    pub fn suggested_file_name(&self, extension: &str) -> String {
        format!("vitalog-backup-{}.{}", self.created_at.format("%Y-%m-%d"), extension)
    }

    /// Load an archive from disk. Files with the backup extension are tagged
    /// as backups; anything else gets a generic tag and will be rejected
    /// by import.
    pub fn from_file(path: &Path, backup_extension: &str) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        let is_backup = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(backup_extension));
        let content_type = if is_backup { BACKUP_CONTENT_TYPE } else { UNTAGGED_CONTENT_TYPE };
        Ok(Self::new(content_type, bytes))
    }

    /// Write the archive bytes atomically (temp file + rename).
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let temp_path = path.with_extension("partial");
        if let Err(e) = write_synced(&temp_path, &self.bytes) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        if let Err(e) = replace_file(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(())
    }
}

/// Export and import for one store.
#[derive(Clone)]
pub struct BackupService {
    shared: Arc<StoreShared>,
}

impl BackupService {
    pub(crate) fn new(shared: Arc<StoreShared>) -> Self {
        Self { shared }
    }

    /// Export on the calling thread. `None` if the copy failed.
    pub fn export_now(&self) -> Option<BackupArchive> {
        match self.try_export() {
            Ok(archive) => {
                log::info!("Exported backup ({} bytes)", archive.len());
                Some(archive)
            }
            Err(e) => {
                log::error!("Export failed: {}", e);
                None
            }
        }
    }

    /// Export on a worker thread and hand the result to `on_complete` there.
    pub fn export<F>(&self, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(Option<BackupArchive>) + Send + 'static,
    {
        let service = self.clone();
        std::thread::spawn(move || on_complete(service.export_now()))
    }

    pub fn try_export(&self) -> Result<BackupArchive, String> {
        if self.shared.status().state != LifecycleState::Ready {
            return Err("store is not open".to_string());
        }

        let staging = export_staging_path(&self.shared.path);
        let result = self.vacuum_into(&staging);
        discard_staged(&staging);
        result.map(|bytes| BackupArchive::new(BACKUP_CONTENT_TYPE, bytes))
    }

    fn vacuum_into(&self, staging: &Path) -> Result<Vec<u8>, String> {
        let conn = open_existing(&self.shared.path, self.shared.busy_timeout).map_err(|e| e.to_string())?;
        conn.execute("VACUUM INTO ?1", params![staging.to_string_lossy().into_owned()])
            .map_err(|e| e.to_string())?;
        drop(conn);
        fs::read(staging).map_err(|e| e.to_string())
    }

    /// Replace the store with `archive`. Logs and returns `false` on failure.
    pub fn import(&self, archive: &BackupArchive) -> bool {
        match self.try_import(archive) {
            Ok(()) => true,
            Err(ImportError::Validation(e)) => {
                log::warn!("Import rejected: {}", e);
                false
            }
            Err(e) => {
                log::error!("{}", e);
                false
            }
        }
    }

    /// Replace the store with `archive`.
    ///
    /// On success every handle is invalidated and the lifecycle is back to
    /// `NotTouched`; touch again before reading or writing.
    pub fn try_import(&self, archive: &BackupArchive) -> Result<(), ImportError> {
        self.import_with(archive, replace_file)
    }

    fn import_with<R>(&self, archive: &BackupArchive, replace: R) -> Result<(), ImportError>
    where
        R: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        if archive.content_type() != BACKUP_CONTENT_TYPE {
            return Err(ImportValidationError::ContentType {
                expected: BACKUP_CONTENT_TYPE.to_string(),
                found: archive.content_type().to_string(),
            }
            .into());
        }
        if !archive.bytes().starts_with(SQLITE_HEADER) {
            return Err(ImportValidationError::NotAStore.into());
        }

        let staging = import_staging_path(&self.shared.path);
        let result = self.stage_and_swap(archive, &staging, replace);
        // On success the staged file itself is gone; this clears its sidecars
        discard_staged(&staging);

        if result.is_ok() {
            log::info!("Imported backup ({} bytes) into {}", archive.len(), self.shared.path.display());
        }
        result
    }

    fn stage_and_swap<R>(&self, archive: &BackupArchive, staging: &Path, replace: R) -> Result<(), ImportError>
    where
        R: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let path = &self.shared.path;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ImportIoError::Stage(e.to_string()))?;
            }
        }
        write_synced(staging, archive.bytes()).map_err(|e| ImportIoError::Stage(e.to_string()))?;
        self.validate_staged(staging)?;

        let mut slot = self.shared.lock_writer();
        let was_ready = slot.is_some();

        // Fold the WAL into the main file so nothing outlives the swap
        if let Some(conn) = slot.as_ref() {
            checkpoint(conn).map_err(ImportIoError::Swap)?;
        } else if path.exists() {
            let folded = open_existing(path, self.shared.busy_timeout)
                .map_err(|e| e.to_string())
                .and_then(|conn| checkpoint(&conn));
            if let Err(e) = folded {
                log::warn!("Could not checkpoint closed store before import: {}", e);
            }
        }

        self.shared.tear_down(&mut slot, LifecycleState::NotTouched);

        if let Err(e) = replace(staging, path) {
            if was_ready {
                // Original file untouched; put it back in service
                match open_writer(path, self.shared.busy_timeout) {
                    Ok(conn) => self.shared.install(&mut slot, conn),
                    Err(reopen) => log::error!("Could not reopen store after failed import: {}", reopen),
                }
            }
            return Err(ImportIoError::Swap(e.to_string()).into());
        }

        // Stale sidecars would be replayed into the new file
        for sidecar in sidecar_paths(path) {
            if let Err(e) = remove_if_exists(&sidecar) {
                log::warn!("Failed to remove {}: {}", sidecar.display(), e);
            }
        }

        Ok(())
    }

    /// Open the staged copy and check it is a healthy store this build can
    /// migrate.
    fn validate_staged(&self, staging: &Path) -> Result<(), ImportError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(staging, flags).map_err(|e| ImportIoError::Stage(e.to_string()))?;

        let verdict: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(validation_error)?;
        if verdict != "ok" {
            return Err(ImportValidationError::Corrupt(verdict).into());
        }

        let found = read_user_version(&conn).map_err(validation_error)?;
        let supported = self.shared.expected_version();
        if found > supported {
            return Err(ImportValidationError::NewerSchema { found, supported }.into());
        }

        let has_records: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'records'",
                [],
                |row| row.get(0),
            )
            .map_err(validation_error)?;
        if found == 0 || !has_records {
            return Err(ImportValidationError::NotAStore.into());
        }

        if let Err((_, e)) = conn.close() {
            return Err(ImportIoError::Stage(e.to_string()).into());
        }
        Ok(())
    }
}

/// The staged file was written and synced by us, so a failing query means
/// the payload is bad.
fn validation_error(e: rusqlite::Error) -> ImportError {
    match e.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) => ImportValidationError::NotAStore.into(),
        _ => ImportValidationError::Corrupt(e.to_string()).into(),
    }
}

/// `PRAGMA wal_checkpoint(TRUNCATE)`; fails if readers keep it from completing.
fn checkpoint(conn: &Connection) -> Result<(), String> {
    let busy: i64 = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if busy != 0 {
        return Err("store is busy; close open readers and retry".to_string());
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Rename `from` over `to`.
/// On Windows, rename fails if the target exists, so the target is moved
/// aside first and restored if the rename fails.
fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(target_os = "windows")]
    {
        let backup_path = to.with_extension("bak");
        let had_existing = to.exists();
        if had_existing {
            fs::rename(to, &backup_path)?;
        }
        if let Err(e) = fs::rename(from, to) {
            if had_existing {
                let _ = fs::rename(&backup_path, to);
            }
            return Err(e);
        }
        if had_existing {
            let _ = fs::remove_file(&backup_path);
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    {
        fs::rename(from, to)
    }
}
