//! Store lifecycle: open, create, migrate, reset.
//!
//! A touch reports its outcome as a short signal stream:
//!
//! - `[Finished]` when the file was already current,
//! - `[BeginMigration, Finished]` when a new file was created and seeded or
//!   an old file was upgraded,
//! - `[InitError]` when the file could not be opened,
//! - `[BeginMigration, InitError]` when a migration or seed step failed; the
//!   transaction is rolled back and the file is left as it was.
//!
//! `BeginMigration` is delivered as soon as the file is known to need work,
//! before the ladder runs, while the writer lock is held: a callback must not
//! call back into the store on that signal. `Finished` and `InitError` are
//! delivered after the lock is released, so a callback may start writing as
//! soon as it sees `Finished`.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use vitalog_config::Scenario;

use crate::error::InitError;
use crate::paths::remove_store_files;
use crate::schema::{read_user_version, run_migrations, write_meta};
use crate::seed;
use crate::shared::{open_writer, StoreShared};

/// Signals emitted by a touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    BeginMigration,
    Finished,
    InitError,
}

impl TouchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TouchState::BeginMigration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotTouched,
    Migrating,
    Ready,
    Failed,
}

/// What a successful touch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// The file was already at the expected version.
    Current,
    /// A new file was created and seeded with `seeded` records.
    Created { seeded: usize },
    /// An existing file was upgraded.
    Migrated { from: i64, to: i64 },
}

impl TouchOutcome {
    /// Whether the touch reported `BeginMigration`.
    pub fn migrated(&self) -> bool {
        !matches!(self, TouchOutcome::Current)
    }

    /// The signal stream this outcome corresponds to.
    pub fn signals(&self) -> &'static [TouchState] {
        if self.migrated() {
            &[TouchState::BeginMigration, TouchState::Finished]
        } else {
            &[TouchState::Finished]
        }
    }
}

/// Owns opening, creating, migrating and resetting the store file.
#[derive(Clone)]
pub struct StoreLifecycle {
    shared: Arc<StoreShared>,
}

impl StoreLifecycle {
    pub(crate) fn new(shared: Arc<StoreShared>) -> Self {
        Self { shared }
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    pub fn store_path(&self) -> &Path {
        &self.shared.path
    }

    /// Open (or create, or migrate) the store on the calling thread.
    ///
    /// With a scenario the store file is deleted first and the new file is
    /// seeded for that scenario. `on_signal` receives the signal stream;
    /// the same outcome is returned as a `Result`. See the module docs for
    /// when each signal is delivered.
    pub fn touch<F>(&self, reset: Option<Scenario>, mut on_signal: F) -> Result<TouchOutcome, InitError>
    where
        F: FnMut(TouchState),
    {
        let result = {
            let mut slot = self.shared.lock_writer();
            self.open_and_prepare(&mut slot, reset, &mut on_signal)
        };

        match &result {
            Ok(outcome) => {
                log::info!("Store ready at {} ({:?})", self.shared.path.display(), outcome);
                on_signal(TouchState::Finished);
            }
            Err(e) => {
                log::error!("Store init failed for {}: {}", self.shared.path.display(), e);
                self.shared.set_state(LifecycleState::Failed);
                on_signal(TouchState::InitError);
            }
        }

        result
    }

    /// Touch on a worker thread, delivering signals to `on_signal` there.
    pub fn touch_async<F>(&self, reset: Option<Scenario>, on_signal: F) -> JoinHandle<Result<TouchOutcome, InitError>>
    where
        F: FnMut(TouchState) + Send + 'static,
    {
        let lifecycle = self.clone();
        std::thread::spawn(move || lifecycle.touch(reset, on_signal))
    }

    /// Touch on a worker thread; signals are collected on a channel.
    pub fn touch_in_background(&self, reset: Option<Scenario>) -> TouchTask {
        let (tx, rx) = mpsc::channel();
        let handle = self.touch_async(reset, move |signal| {
            let _ = tx.send(signal);
        });
        TouchTask { signals: rx, handle }
    }

    /// Delete the store file and its sidecars. Every handle is invalidated
    /// and the store must be touched again.
    pub fn reset(&self) -> Result<(), InitError> {
        let mut slot = self.shared.lock_writer();
        self.shared.tear_down(&mut slot, LifecycleState::NotTouched);
        remove_store_files(&self.shared.path).map_err(|e| InitError::Io(e.to_string()))?;
        log::info!("Store reset: {}", self.shared.path.display());
        Ok(())
    }

    fn open_and_prepare(
        &self,
        slot: &mut Option<Connection>,
        reset: Option<Scenario>,
        on_signal: &mut dyn FnMut(TouchState),
    ) -> Result<TouchOutcome, InitError> {
        let path = &self.shared.path;

        if slot.is_some() {
            log::info!("Closing open store before re-touch");
        }
        self.shared.tear_down(slot, LifecycleState::NotTouched);

        if let Some(scenario) = reset {
            log::info!("Resetting store for scenario '{}'", scenario);
            remove_store_files(path).map_err(|e| InitError::Io(e.to_string()))?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| InitError::Io(e.to_string()))?;
            }
        }

        // An empty file is what SQLite leaves after an interrupted create
        let fresh = match fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(InitError::Io(e.to_string())),
        };

        let result = self.open_and_migrate(slot, fresh, reset, on_signal);
        if result.is_err() && fresh {
            // Don't leave a half-created file that would later pass as an old store
            let _ = remove_store_files(path);
        }
        result
    }

    fn open_and_migrate(
        &self,
        slot: &mut Option<Connection>,
        fresh: bool,
        reset: Option<Scenario>,
        on_signal: &mut dyn FnMut(TouchState),
    ) -> Result<TouchOutcome, InitError> {
        let mut conn = open_writer(&self.shared.path, self.shared.busy_timeout)?;
        let on_disk = read_user_version(&conn)?;
        let expected = self.shared.expected_version();

        if on_disk > expected {
            return Err(InitError::NewerSchema { found: on_disk, supported: expected });
        }

        if on_disk == expected && !fresh {
            self.shared.install(slot, conn);
            return Ok(TouchOutcome::Current);
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        self.shared.set_state(LifecycleState::Migrating);
        log::info!("Store migration starting (on disk {}, expected {})", on_disk, expected);
        on_signal(TouchState::BeginMigration);

        let to = run_migrations(&tx, &self.shared.migrations, on_disk)
            .map_err(|(version, message)| InitError::Migration { version, message })?;

        let outcome = if fresh {
            let seeded = seed::populate(&tx, reset).map_err(InitError::Seed)?;
            write_meta(&tx, "created_at", &crate::record::now_timestamp()).map_err(InitError::Seed)?;
            TouchOutcome::Created { seeded }
        } else {
            TouchOutcome::Migrated { from: on_disk, to }
        };
        tx.commit()?;

        self.shared.install(slot, conn);
        Ok(outcome)
    }
}

/// A touch running on a worker thread.
pub struct TouchTask {
    signals: Receiver<TouchState>,
    handle: JoinHandle<Result<TouchOutcome, InitError>>,
}

impl TouchTask {
    /// Next signal, if one arrives within `timeout`.
    pub fn next_signal(&self, timeout: Duration) -> Option<TouchState> {
        match self.signals.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the touch completes; returns every signal it emitted
    /// that has not already been taken with `next_signal`, plus the outcome.
    pub fn wait(self) -> (Vec<TouchState>, Result<TouchOutcome, InitError>) {
        let result = self.handle.join().unwrap_or(Err(InitError::WorkerLost));
        let signals = self.signals.try_iter().collect();
        (signals, result)
    }
}
