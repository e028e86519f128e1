//! Local persistence engine.
//!
//! One SQLite file holds every record collection. The pieces:
//!
//! - [`StoreLifecycle`] opens, creates, migrates and resets the file and
//!   reports progress as [`TouchState`] signals.
//! - [`TransactionalWriter`] runs caller-supplied mutations atomically,
//!   on the caller's thread or on a background writer thread.
//! - [`ReadHandle`] and [`LiveQuery`] read committed state; live queries
//!   follow [`StoreChange`] notifications incrementally.
//! - [`BackupService`] exports the store as a [`BackupArchive`] and swaps
//!   in a foreign archive all-or-nothing.
//!
//! [`Persistence`] wires all of them to one shared store.

mod backup;
mod error;
mod events;
mod lifecycle;
mod paths;
mod persistence;
mod read;
mod record;
mod schema;
mod seed;
mod shared;
mod writer;

pub use backup::{BackupArchive, BackupService, BACKUP_CONTENT_TYPE};
pub use error::{ImportError, ImportIoError, ImportValidationError, InitError, ReadError, WriteError};
pub use events::{ChangeSubscription, StoreChange};
pub use lifecycle::{LifecycleState, StoreLifecycle, TouchOutcome, TouchState, TouchTask};
pub use persistence::Persistence;
pub use read::{LiveQuery, ReadHandle, ReadView, StoreSnapshot};
pub use record::{new_record_id, Record, RecordKey};
pub use schema::{default_migrations, MigrationContext, StoreMigration, STORE_SCHEMA_VERSION};
pub use seed::{baseline_records, demo_records};
pub use writer::{TransactionalWriter, WriteTxn, WriteUnit};
