// Store file layout: canonical file, SQLite sidecars, staging files

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// `store.sqlite` → `store.sqlite<suffix>`
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Files SQLite may keep next to the store.
pub(crate) fn sidecar_paths(store: &Path) -> Vec<PathBuf> {
    SIDECAR_SUFFIXES.iter().map(|suffix| with_suffix(store, suffix)).collect()
}

/// Unique temp file next to the store for an incoming archive.
/// Same directory, so the final rename never crosses filesystems.
pub(crate) fn import_staging_path(store: &Path) -> PathBuf {
    with_suffix(store, &format!(".import-{}.tmp", uuid::Uuid::new_v4()))
}

/// Unique temp file for an outgoing export.
pub(crate) fn export_staging_path(store: &Path) -> PathBuf {
    with_suffix(store, &format!(".export-{}.tmp", uuid::Uuid::new_v4()))
}

/// Remove a file, treating "not found" as success.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete the store file and every sidecar.
pub(crate) fn remove_store_files(store: &Path) -> io::Result<()> {
    remove_if_exists(store)?;
    for sidecar in sidecar_paths(store) {
        remove_if_exists(&sidecar)?;
    }
    Ok(())
}

/// Remove a staged file and whatever sidecars SQLite left for it.
pub(crate) fn discard_staged(path: &Path) {
    if let Err(e) = remove_store_files(path) {
        log::warn!("Failed to clean up {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sidecars_append_to_full_name() {
        let sidecars = sidecar_paths(Path::new("/data/vitalog.sqlite"));
        assert_eq!(sidecars[0], PathBuf::from("/data/vitalog.sqlite-wal"));
        assert_eq!(sidecars[1], PathBuf::from("/data/vitalog.sqlite-shm"));
        assert_eq!(sidecars[2], PathBuf::from("/data/vitalog.sqlite-journal"));
    }

    #[test]
    fn test_staging_paths_are_siblings_and_unique() {
        let store = Path::new("/data/vitalog.sqlite");
        let a = import_staging_path(store);
        let b = import_staging_path(store);
        assert_ne!(a, b);
        assert_eq!(a.parent(), store.parent());
        assert!(a.to_string_lossy().ends_with(".tmp"));
        assert!(export_staging_path(store).to_string_lossy().contains(".export-"));
    }

    #[test]
    fn test_remove_store_files_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("vitalog.sqlite");
        fs::write(&store, b"x").unwrap();
        fs::write(with_suffix(&store, "-wal"), b"x").unwrap();

        remove_store_files(&store).unwrap();
        assert!(!store.exists());
        assert!(!with_suffix(&store, "-wal").exists());

        // Second call: nothing left, still fine
        remove_store_files(&store).unwrap();
    }
}
