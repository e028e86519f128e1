// Process-wide store state shared by the lifecycle, writer, readers and backup

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use vitalog_config::StorageConfig;

use crate::events::ChangeRegistry;
use crate::lifecycle::LifecycleState;
use crate::schema::{ladder_version, StoreMigration};

/// Lifecycle state plus the generation of the open store.
///
/// The generation changes every time a connection is installed or torn
/// down; read handles remember the generation they were opened at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreStatus {
    pub state: LifecycleState,
    pub generation: u64,
}

pub(crate) struct StoreShared {
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub migrations: Vec<StoreMigration>,
    /// The single writer connection. `Some` only while Ready.
    /// Holding this lock is what makes a writer the only writer.
    writer: Mutex<Option<Connection>>,
    status: Mutex<StoreStatus>,
    revision: AtomicU64,
    pub changes: ChangeRegistry,
}

impl StoreShared {
    pub(crate) fn new(config: &StorageConfig, migrations: Vec<StoreMigration>) -> Self {
        Self {
            path: config.store_path(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            migrations,
            writer: Mutex::new(None),
            status: Mutex::new(StoreStatus {
                state: LifecycleState::NotTouched,
                generation: 0,
            }),
            revision: AtomicU64::new(0),
            changes: ChangeRegistry::new(),
        }
    }

    /// Schema version the code expects on disk.
    pub(crate) fn expected_version(&self) -> i64 {
        ladder_version(&self.migrations)
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, Option<Connection>> {
        self.writer.lock()
    }

    pub(crate) fn status(&self) -> StoreStatus {
        *self.status.lock()
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.status.lock().state = state;
    }

    /// Install a freshly opened connection and mark the store Ready.
    /// The caller holds the writer lock.
    pub(crate) fn install(&self, slot: &mut Option<Connection>, conn: Connection) {
        *slot = Some(conn);
        let mut status = self.status.lock();
        status.generation += 1;
        status.state = LifecycleState::Ready;
    }

    /// Close the writer connection (if any) and invalidate every handle.
    /// The caller holds the writer lock.
    pub(crate) fn tear_down(&self, slot: &mut Option<Connection>, state: LifecycleState) {
        if let Some(conn) = slot.take() {
            if let Err((_, e)) = conn.close() {
                log::warn!("Error closing store connection: {}", e);
            }
        }
        let mut status = self.status.lock();
        status.generation += 1;
        status.state = state;
    }

    pub(crate) fn current_revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub(crate) fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Open a read-write connection with the store's runtime pragmas.
pub(crate) fn open_writer(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    // WAL lets readers keep their snapshot while the writer commits
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    Ok(conn)
}

/// Open a connection to an existing file without creating it.
pub(crate) fn open_existing(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Open a read-only connection for a reader.
pub(crate) fn open_reader(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}
