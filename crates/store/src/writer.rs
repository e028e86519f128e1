//! Transactional writes.
//!
//! Every write unit runs inside one `BEGIN IMMEDIATE` transaction on the
//! single writer connection. A unit that returns an error or panics is
//! rolled back in full; a unit that succeeds is committed and its net change
//! is broadcast to observers before the writer lock is released.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};

use crate::error::WriteError;
use crate::events::ChangeSet;
use crate::record::{fetch_many, fetch_one, now_timestamp, Record, RecordKey, SELECT_COLLECTION};
use crate::shared::StoreShared;

/// A write unit queued for the background writer.
pub type WriteUnit = Box<dyn FnOnce(&mut WriteTxn<'_>) -> Result<(), WriteError> + Send>;

/// Mutations available to a write unit. Reads see the transaction's own
/// uncommitted changes.
pub struct WriteTxn<'a> {
    conn: &'a Connection,
    stamp: String,
    changes: ChangeSet,
}

impl<'a> WriteTxn<'a> {
    fn new(conn: &'a Connection) -> Self {
        Self { conn, stamp: now_timestamp(), changes: ChangeSet::default() }
    }

    /// Insert a new record. Fails with `AlreadyExists` if the key is taken.
    ///
    /// Every record written in one transaction is stamped with the same
    /// `updated_at`; the caller's stamp is ignored.
    pub fn insert(&mut self, record: &Record) -> Result<(), WriteError> {
        let body = serde_json::to_string(&record.body)?;
        let result = self.conn.execute(
            "INSERT INTO records (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![record.collection, record.id, body, self.stamp],
        );
        match result {
            Ok(_) => {
                self.changes.record_insert(record.key());
                Ok(())
            }
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Err(WriteError::AlreadyExists(record.key()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the body of an existing record. Fails with `NotFound`.
    pub fn update(&mut self, record: &Record) -> Result<(), WriteError> {
        let body = serde_json::to_string(&record.body)?;
        let rows = self.conn.execute(
            "UPDATE records SET body = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4",
            params![body, self.stamp, record.collection, record.id],
        )?;
        if rows == 0 {
            return Err(WriteError::NotFound(record.key()));
        }
        self.changes.record_update(record.key());
        Ok(())
    }

    /// Insert or replace.
    pub fn upsert(&mut self, record: &Record) -> Result<(), WriteError> {
        let key = record.key();
        if fetch_one(self.conn, &key)?.is_some() {
            self.update(record)
        } else {
            self.insert(record)
        }
    }

    /// Delete a record. Returns whether it existed.
    pub fn delete(&mut self, key: &RecordKey) -> Result<bool, WriteError> {
        let rows = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![key.collection, key.id],
        )?;
        if rows > 0 {
            self.changes.record_delete(key.clone());
        }
        Ok(rows > 0)
    }

    pub fn get(&self, key: &RecordKey) -> Result<Option<Record>, WriteError> {
        match fetch_one(self.conn, key)? {
            Some(raw) => Ok(Some(raw.decode()?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, collection: &str) -> Result<Vec<Record>, WriteError> {
        fetch_many(self.conn, SELECT_COLLECTION, params![collection])?
            .into_iter()
            .map(|raw| raw.decode().map_err(WriteError::from))
            .collect()
    }

    fn into_changes(self) -> ChangeSet {
        self.changes
    }
}

enum Job {
    Write(WriteUnit),
    Flush(Sender<()>),
}

struct BackgroundWriter {
    jobs: Sender<Job>,
    handle: JoinHandle<()>,
}

/// Runs write units synchronously or on a background writer thread.
pub struct TransactionalWriter {
    shared: Arc<StoreShared>,
    background: Mutex<Option<BackgroundWriter>>,
}

impl TransactionalWriter {
    pub(crate) fn new(shared: Arc<StoreShared>) -> Self {
        Self { shared, background: Mutex::new(None) }
    }

    /// Run `unit` in one transaction on the calling thread.
    ///
    /// Blocks while another write is committing. Returns the unit's value
    /// once the commit has succeeded.
    pub fn try_write<T, F>(&self, unit: F) -> Result<T, WriteError>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T, WriteError>,
    {
        run_unit(&self.shared, unit)
    }

    /// Run `unit` and report only whether it was committed. Failures are logged.
    pub fn write<F>(&self, unit: F) -> bool
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<(), WriteError>,
    {
        match self.try_write(unit) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Write failed: {}", e);
                false
            }
        }
    }

    /// Queue `unit` on the background writer. Units run one at a time in
    /// submission order; failures are logged.
    pub fn write_in_background<F>(&self, unit: F)
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<(), WriteError> + Send + 'static,
    {
        let job = Job::Write(Box::new(unit));
        let mut background = self.background.lock();

        let job = match background.as_ref() {
            Some(worker) => match worker.jobs.send(job) {
                Ok(()) => return,
                Err(mpsc::SendError(job)) => {
                    log::warn!("Background writer stopped; restarting");
                    job
                }
            },
            None => job,
        };

        match spawn_background(Arc::clone(&self.shared)) {
            Ok(worker) => {
                // A fresh receiver is alive until the sender is dropped
                let _ = worker.jobs.send(job);
                *background = Some(worker);
            }
            Err(e) => {
                log::error!("Could not start background writer ({}); writing inline", e);
                if let Job::Write(unit) = job {
                    if let Err(e) = run_unit(&self.shared, unit) {
                        log::error!("Background write failed: {}", e);
                    }
                }
            }
        }
    }

    /// Block until every unit queued before this call has finished.
    pub fn flush(&self) {
        let background = self.background.lock();
        let Some(worker) = background.as_ref() else {
            return;
        };
        let (tx, rx) = mpsc::channel();
        if worker.jobs.send(Job::Flush(tx)).is_ok() {
            drop(background);
            let _ = rx.recv();
        }
    }
}

impl Drop for TransactionalWriter {
    fn drop(&mut self) {
        if let Some(worker) = self.background.get_mut().take() {
            drop(worker.jobs);
            if worker.handle.join().is_err() {
                log::error!("Background writer panicked");
            }
        }
    }
}

fn spawn_background(shared: Arc<StoreShared>) -> std::io::Result<BackgroundWriter> {
    let (jobs, rx) = mpsc::channel::<Job>();
    let handle = std::thread::Builder::new()
        .name("vitalog-writer".to_string())
        .spawn(move || {
            for job in rx {
                match job {
                    Job::Write(unit) => {
                        if let Err(e) = run_unit(&shared, unit) {
                            log::error!("Background write failed: {}", e);
                        }
                    }
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::debug!("Background writer exiting");
        })?;
    Ok(BackgroundWriter { jobs, handle })
}

fn run_unit<T, F>(shared: &StoreShared, unit: F) -> Result<T, WriteError>
where
    F: FnOnce(&mut WriteTxn<'_>) -> Result<T, WriteError>,
{
    let mut slot = shared.lock_writer();
    let conn = slot.as_mut().ok_or(WriteError::NotReady)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut txn = WriteTxn::new(&tx);

    // Dropping `tx` on any early return rolls the transaction back
    let value = match panic::catch_unwind(AssertUnwindSafe(|| unit(&mut txn))) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => return Err(e),
        Err(payload) => return Err(WriteError::Aborted(panic_message(payload.as_ref()))),
    };

    let changes = txn.into_changes();
    tx.commit()?;

    if !changes.is_empty() {
        let change = changes.into_change(shared.next_revision());
        log::debug!("Committed revision {} ({} changes)", change.revision, change.len());
        shared.changes.broadcast(&change);
    }

    Ok(value)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("write unit panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("write unit panicked: {msg}")
    } else {
        "write unit panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::StoreLifecycle;
    use crate::schema::default_migrations;
    use serde_json::json;
    use tempfile::TempDir;
    use vitalog_config::StorageConfig;

    fn ready_store(dir: &TempDir) -> (StoreLifecycle, TransactionalWriter) {
        let config = StorageConfig::in_dir(dir.path());
        let shared = Arc::new(StoreShared::new(&config, default_migrations()));
        let lifecycle = StoreLifecycle::new(Arc::clone(&shared));
        lifecycle.touch(None, |_| {}).unwrap();
        (lifecycle, TransactionalWriter::new(shared))
    }

    fn appointment(id: &str, title: &str) -> Record {
        Record::new("appointments", id, json!({ "title": title }))
    }

    #[test]
    fn test_write_before_touch_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::in_dir(dir.path());
        let writer = TransactionalWriter::new(Arc::new(StoreShared::new(&config, default_migrations())));

        let result = writer.try_write(|txn| txn.insert(&appointment("a1", "Checkup")));
        assert_eq!(result, Err(WriteError::NotReady));
        assert!(!writer.write(|_| Ok(())));
    }

    #[test]
    fn test_insert_then_get() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);

        assert!(writer.write(|txn| txn.insert(&appointment("a1", "Checkup"))));
        let stored = writer
            .try_write(|txn| txn.get(&RecordKey::new("appointments", "a1")))
            .unwrap()
            .unwrap();
        assert_eq!(stored.body, json!({ "title": "Checkup" }));
    }

    #[test]
    fn test_duplicate_insert_and_missing_update() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);
        writer.write(|txn| txn.insert(&appointment("a1", "Checkup")));

        let dup = writer.try_write(|txn| txn.insert(&appointment("a1", "Again")));
        assert_eq!(dup, Err(WriteError::AlreadyExists(RecordKey::new("appointments", "a1"))));

        let missing = writer.try_write(|txn| txn.update(&appointment("nope", "x")));
        assert_eq!(missing, Err(WriteError::NotFound(RecordKey::new("appointments", "nope"))));
    }

    #[test]
    fn test_failed_unit_rolls_back_everything() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);

        let ok = writer.write(|txn| {
            txn.insert(&appointment("a1", "First"))?;
            txn.insert(&appointment("a2", "Second"))?;
            Err(WriteError::abort("user cancelled"))
        });
        assert!(!ok);

        let listed = writer.try_write(|txn| txn.list("appointments")).unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn test_panicking_unit_is_aborted_and_writer_survives() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);

        let result: Result<(), WriteError> = writer.try_write(|txn| {
            txn.insert(&appointment("a1", "First"))?;
            panic!("boom");
        });
        assert!(matches!(result, Err(WriteError::Aborted(msg)) if msg.contains("boom")));

        // The lock was released and nothing was committed
        assert!(writer.write(|txn| txn.insert(&appointment("a1", "Retry"))));
    }

    #[test]
    fn test_upsert_and_delete() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);

        writer.write(|txn| txn.upsert(&appointment("a1", "v1")));
        writer.write(|txn| txn.upsert(&appointment("a1", "v2")));
        let listed = writer.try_write(|txn| txn.list("appointments")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].body["title"], "v2");

        let key = RecordKey::new("appointments", "a1");
        assert!(writer.try_write(|txn| txn.delete(&key)).unwrap());
        assert!(!writer.try_write(|txn| txn.delete(&key)).unwrap());
    }

    #[test]
    fn test_committed_write_broadcasts_once() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);
        let sub = writer.shared.changes.register();

        writer.write(|txn| {
            txn.insert(&appointment("a1", "x"))?;
            txn.insert(&appointment("a2", "y"))
        });
        // Failed and empty writes stay silent
        writer.write(|_| Err(WriteError::abort("no")));
        writer.write(|_| Ok(()));

        let changes = sub.drain();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].inserted.len(), 2);
    }

    #[test]
    fn test_background_writes_run_in_order() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);

        for i in 0..20 {
            writer.write_in_background(move |txn| txn.upsert(&appointment("counter", &i.to_string())));
        }
        writer.flush();

        let last = writer
            .try_write(|txn| txn.get(&RecordKey::new("appointments", "counter")))
            .unwrap()
            .unwrap();
        assert_eq!(last.body["title"], "19");
    }

    #[test]
    fn test_flush_without_background_writes_returns() {
        let dir = TempDir::new().unwrap();
        let (_lifecycle, writer) = ready_store(&dir);
        writer.flush();
    }
}
