//! Read handles and live queries.
//!
//! A `ReadHandle` owns a read-only connection. Each call runs in its own
//! read transaction, so it sees one committed state from start to finish
//! even while the writer commits. Handles remember the store generation
//! they were opened at and refuse to read once the store has been reset or
//! replaced by an import.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::ReadError;
use crate::events::{ChangeSubscription, StoreChange};
use crate::lifecycle::LifecycleState;
use crate::record::{fetch_many, fetch_one, Record, RecordKey, SELECT_ALL, SELECT_COLLECTION};
use crate::schema::read_user_version;
use crate::shared::{open_reader, StoreShared};

/// Queries available inside one read transaction.
pub struct ReadView<'a> {
    conn: &'a Connection,
}

impl ReadView<'_> {
    pub fn get(&self, key: &RecordKey) -> Result<Option<Record>, ReadError> {
        match fetch_one(self.conn, key)? {
            Some(raw) => Ok(Some(raw.decode()?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, collection: &str) -> Result<Vec<Record>, ReadError> {
        decode_all(fetch_many(self.conn, SELECT_COLLECTION, params![collection])?)
    }

    pub fn count(&self, collection: &str) -> Result<usize, ReadError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Names of every non-empty collection, sorted.
    pub fn collections(&self) -> Result<Vec<String>, ReadError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT collection FROM records ORDER BY collection")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn schema_version(&self) -> Result<i64, ReadError> {
        Ok(read_user_version(self.conn)?)
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, ReadError> {
        Ok(StoreSnapshot {
            schema_version: self.schema_version()?,
            records: decode_all(fetch_many(self.conn, SELECT_ALL, [])?)?,
        })
    }
}

fn decode_all(raw: Vec<crate::record::RawRecord>) -> Result<Vec<Record>, ReadError> {
    raw.into_iter().map(|r| r.decode().map_err(ReadError::from)).collect()
}

pub struct ReadHandle {
    shared: Arc<StoreShared>,
    generation: u64,
    conn: Connection,
}

impl ReadHandle {
    pub(crate) fn open(shared: Arc<StoreShared>) -> Result<Self, ReadError> {
        let status = shared.status();
        if status.state != LifecycleState::Ready {
            return Err(ReadError::NotReady);
        }
        let conn = open_reader(&shared.path, shared.busy_timeout)?;
        Ok(Self { shared, generation: status.generation, conn })
    }

    /// False once the store this handle was opened on has been closed,
    /// reset or replaced.
    pub fn is_valid(&self) -> bool {
        let status = self.shared.status();
        status.state == LifecycleState::Ready && status.generation == self.generation
    }

    /// Run several queries against one consistent snapshot.
    pub fn read<T, F>(&self, f: F) -> Result<T, ReadError>
    where
        F: FnOnce(&ReadView<'_>) -> Result<T, ReadError>,
    {
        if !self.is_valid() {
            return Err(ReadError::Invalidated);
        }
        // Read-only: dropping the transaction just ends the snapshot
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&ReadView { conn: &tx });
        result
    }

    pub fn get(&self, key: &RecordKey) -> Result<Option<Record>, ReadError> {
        self.read(|view| view.get(key))
    }

    pub fn list(&self, collection: &str) -> Result<Vec<Record>, ReadError> {
        self.read(|view| view.list(collection))
    }

    pub fn count(&self, collection: &str) -> Result<usize, ReadError> {
        self.read(|view| view.count(collection))
    }

    pub fn collections(&self) -> Result<Vec<String>, ReadError> {
        self.read(|view| view.collections())
    }

    pub fn schema_version(&self) -> Result<i64, ReadError> {
        self.read(|view| view.schema_version())
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, ReadError> {
        self.read(|view| view.snapshot())
    }
}

/// Logical content of the store at one instant, independent of page layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: i64,
    /// Sorted by collection, then id.
    pub records: Vec<Record>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.iter().any(|r| r.collection == key.collection && r.id == key.id)
    }

    /// blake3 hex digest of the content. Equal snapshots have equal
    /// fingerprints regardless of how the file was laid out.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.schema_version.to_le_bytes());
        for record in &self.records {
            for field in [&record.collection, &record.id, &record.body.to_string(), &record.updated_at] {
                hasher.update(field.as_bytes());
                hasher.update(&[0]);
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Auto-updating view of one collection.
///
/// Subscribes before loading, so no commit can fall between the initial
/// load and the first notification. `refresh` applies pending changes
/// incrementally by re-reading only the affected records.
pub struct LiveQuery {
    handle: ReadHandle,
    collection: String,
    subscription: ChangeSubscription,
    records: BTreeMap<String, Record>,
    revision: u64,
}

impl LiveQuery {
    pub(crate) fn open(shared: Arc<StoreShared>, collection: &str) -> Result<Self, ReadError> {
        let subscription = shared.changes.register();
        let revision = shared.current_revision();
        let handle = ReadHandle::open(shared)?;
        let records = handle
            .list(collection)?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        Ok(Self {
            handle,
            collection: collection.to_string(),
            subscription,
            records,
            revision,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Revision of the last change applied.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Current records, ordered by id.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Apply every pending change. Returns whether this collection changed.
    pub fn refresh(&mut self) -> Result<bool, ReadError> {
        let pending = self.subscription.drain();
        self.apply(pending)
    }

    /// Wait up to `timeout` for a change, then apply it and anything else
    /// pending. Returns whether this collection changed.
    pub fn wait_for_change(&mut self, timeout: Duration) -> Result<bool, ReadError> {
        match self.subscription.recv_timeout(timeout) {
            Some(first) => {
                let mut pending = vec![first];
                pending.extend(self.subscription.drain());
                self.apply(pending)
            }
            None => Ok(false),
        }
    }

    fn apply(&mut self, pending: Vec<StoreChange>) -> Result<bool, ReadError> {
        let mut changed = false;
        for change in pending {
            self.revision = self.revision.max(change.revision);
            if !change.touches(&self.collection) {
                continue;
            }

            for key in change.deleted.iter().filter(|k| k.collection == self.collection) {
                changed |= self.records.remove(&key.id).is_some();
            }

            let upserted = change.inserted.iter().chain(&change.updated);
            for key in upserted.filter(|k| k.collection == self.collection) {
                match self.handle.get(key)? {
                    Some(record) => {
                        self.records.insert(key.id.clone(), record);
                    }
                    // Deleted again by a later commit still in the queue
                    None => {
                        self.records.remove(&key.id);
                    }
                }
                changed = true;
            }
        }
        Ok(changed)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.handle.shared.changes.unregister(self.subscription.id());
    }
}
