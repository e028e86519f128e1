// Export/import tests, including the full install → backup → restore scenario.
// Run with: cargo test -p vitalog-store --test backup_roundtrip

use std::fs;
use std::sync::mpsc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use vitalog_config::{Scenario, StorageConfig};
use vitalog_store::{
    BackupArchive, ImportError, ImportIoError, ImportValidationError, LifecycleState, Persistence, ReadError,
    Record, RecordKey, StoreSnapshot, TouchState, BACKUP_CONTENT_TYPE,
};

fn touched(dir: &TempDir, scenario: Option<Scenario>) -> Persistence {
    let p = Persistence::new(StorageConfig::in_dir(dir.path()));
    p.lifecycle().touch(scenario, |_| {}).unwrap();
    p
}

fn snapshot(p: &Persistence) -> StoreSnapshot {
    p.read_handle().unwrap().snapshot().unwrap()
}

#[test]
fn install_backup_reset_restore_scenario() {
    let dir = TempDir::new().unwrap();
    let p = Persistence::new(StorageConfig::in_dir(dir.path()));

    let mut signals = Vec::new();
    p.lifecycle().touch(None, |s| signals.push(s)).unwrap();
    assert_eq!(signals, vec![TouchState::BeginMigration, TouchState::Finished]);

    let seeded = RecordKey::new("profile", "self");
    assert!(snapshot(&p).contains(&seeded));

    let written = Record::new("appointments", "a1", json!({ "title": "Cardiology" }));
    assert!(p.writer().write(|txn| txn.insert(&written)));

    let (tx, rx) = mpsc::channel();
    p.backup().export(move |archive| {
        let _ = tx.send(archive);
    });
    let archive = rx.recv_timeout(Duration::from_secs(10)).unwrap().expect("export");
    assert_eq!(archive.content_type(), BACKUP_CONTENT_TYPE);

    p.lifecycle().reset().unwrap();
    assert!(!p.config().store_path().exists());

    assert!(p.backup().import(&archive));
    assert_eq!(p.lifecycle().state(), LifecycleState::NotTouched);

    let mut signals = Vec::new();
    p.lifecycle().touch(None, |s| signals.push(s)).unwrap();
    assert_eq!(signals, vec![TouchState::Finished]);

    let restored = snapshot(&p);
    assert!(restored.contains(&seeded));
    let a1 = p.read_handle().unwrap().get(&written.key()).unwrap().unwrap();
    assert_eq!(a1.body, written.body);
}

#[test]
fn export_import_round_trip_is_idempotent() {
    let source_dir = TempDir::new().unwrap();
    let source = touched(&source_dir, Some(Scenario::Populated));
    source.writer().write(|txn| txn.insert(&Record::new("diagnoses", "d2", json!({ "label": "Asthma" }))));
    let original = snapshot(&source);
    let archive = source.backup().export_now().unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = touched(&target_dir, Some(Scenario::Empty));
    assert!(target.backup().import(&archive));
    target.lifecycle().touch(None, |_| {}).unwrap();

    let restored = snapshot(&target);
    assert_eq!(restored, original);
    assert_eq!(restored.fingerprint(), original.fingerprint());

    // And again, from the restored store
    let second = target.backup().export_now().unwrap();
    assert!(target.backup().import(&second));
    target.lifecycle().touch(None, |_| {}).unwrap();
    assert_eq!(snapshot(&target).fingerprint(), original.fingerprint());
}

#[test]
fn wrong_content_tag_is_rejected_without_touching_store() {
    let dir = TempDir::new().unwrap();
    let p = touched(&dir, Some(Scenario::Populated));
    let before = snapshot(&p);

    let genuine = p.backup().export_now().unwrap();
    let mislabeled = BackupArchive::new("application/zip", genuine.bytes().to_vec());

    let result = p.backup().try_import(&mislabeled);
    assert!(matches!(
        result,
        Err(ImportError::Validation(ImportValidationError::ContentType { .. }))
    ));
    assert!(!p.backup().import(&mislabeled));

    assert_eq!(p.lifecycle().state(), LifecycleState::Ready);
    assert_eq!(snapshot(&p), before);
}

#[test]
fn payload_that_is_not_a_store_is_rejected() {
    let dir = TempDir::new().unwrap();
    let p = touched(&dir, None);
    let before = snapshot(&p);

    let junk = BackupArchive::new(BACKUP_CONTENT_TYPE, b"PK\x03\x04 definitely a zip".to_vec());
    assert_eq!(
        p.backup().try_import(&junk),
        Err(ImportError::Validation(ImportValidationError::NotAStore))
    );

    // Right header, truncated body
    let real = p.backup().export_now().unwrap();
    let truncated = BackupArchive::new(BACKUP_CONTENT_TYPE, real.bytes()[..100].to_vec());
    assert!(p.backup().try_import(&truncated).unwrap_err().is_validation());

    assert_eq!(snapshot(&p), before);
    // No staging leftovers
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".import-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn foreign_sqlite_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let p = touched(&dir, None);

    let foreign_path = dir.path().join("other.sqlite");
    {
        let conn = rusqlite::Connection::open(&foreign_path).unwrap();
        conn.execute_batch("CREATE TABLE songs (title TEXT);").unwrap();
    }
    let foreign = BackupArchive::new(BACKUP_CONTENT_TYPE, fs::read(&foreign_path).unwrap());

    assert_eq!(
        p.backup().try_import(&foreign),
        Err(ImportError::Validation(ImportValidationError::NotAStore))
    );
}

#[test]
fn newer_backup_is_rejected() {
    let dir = TempDir::new().unwrap();
    let p = touched(&dir, None);

    let future_path = dir.path().join("future.sqlite");
    {
        let conn = rusqlite::Connection::open(&future_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE records (collection TEXT, id TEXT, body TEXT, updated_at TEXT);
             PRAGMA user_version = 42;",
        )
        .unwrap();
    }
    let future = BackupArchive::new(BACKUP_CONTENT_TYPE, fs::read(&future_path).unwrap());

    assert_eq!(
        p.backup().try_import(&future),
        Err(ImportError::Validation(ImportValidationError::NewerSchema { found: 42, supported: 1 }))
    );
}

#[test]
fn import_invalidates_open_handles() {
    let dir = TempDir::new().unwrap();
    let p = touched(&dir, None);
    let archive = p.backup().export_now().unwrap();
    let handle = p.read_handle().unwrap();

    assert!(p.backup().import(&archive));
    assert!(!handle.is_valid());
    assert_eq!(handle.count("profile"), Err(ReadError::Invalidated));
    assert!(!p.writer().write(|_| Ok(())));

    p.lifecycle().touch(None, |_| {}).unwrap();
    assert_eq!(p.read_handle().unwrap().count("profile").unwrap(), 1);
}

#[test]
fn import_while_reader_holds_snapshot_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig { busy_timeout_ms: 50, ..StorageConfig::in_dir(dir.path()) };
    let p = Persistence::new(config);
    p.lifecycle().touch(None, |_| {}).unwrap();
    p.writer().write(|txn| txn.insert(&Record::new("contacts", "c1", json!({}))));
    let archive = p.backup().export_now().unwrap();
    let handle = p.read_handle().unwrap();

    let result = handle
        .read(|view| {
            let count = view.count("contacts")?;
            // A later commit the open snapshot cannot see keeps the WAL pinned
            p.writer().write(|txn| txn.insert(&Record::new("contacts", "c2", json!({}))));
            Ok((count, p.backup().try_import(&archive)))
        })
        .unwrap();

    assert_eq!(result.0, 1);
    assert!(matches!(result.1, Err(ImportError::Io(ImportIoError::Swap(_)))));
    assert_eq!(p.lifecycle().state(), LifecycleState::Ready);
    assert_eq!(p.read_handle().unwrap().count("contacts").unwrap(), 2);
}

#[test]
fn export_before_touch_reports_none() {
    let dir = TempDir::new().unwrap();
    let p = Persistence::new(StorageConfig::in_dir(dir.path()));
    assert!(p.backup().export_now().is_none());
}

#[test]
fn archive_survives_a_trip_through_the_filesystem() {
    let dir = TempDir::new().unwrap();
    let p = touched(&dir, Some(Scenario::Populated));
    let before = snapshot(&p);
    let archive = p.backup().export_now().unwrap();

    let out = TempDir::new().unwrap();
    let file = out.path().join(archive.suggested_file_name(&p.config().backup_extension));
    archive.write_to(&file).unwrap();

    let loaded = BackupArchive::from_file(&file, &p.config().backup_extension).unwrap();
    assert_eq!(loaded.content_type(), BACKUP_CONTENT_TYPE);
    assert_eq!(loaded.bytes(), archive.bytes());

    p.lifecycle().reset().unwrap();
    assert!(p.backup().import(&loaded));
    p.lifecycle().touch(None, |_| {}).unwrap();
    assert_eq!(snapshot(&p), before);
}
