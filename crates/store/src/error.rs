use std::fmt;

use rusqlite::ErrorCode;

use crate::record::RecordKey;

/// The store could not be opened, created or migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// Filesystem error around the store file (directory creation, reset).
    Io(String),
    /// SQLite refused to open the file.
    Open(String),
    /// The file exists but is not a store.
    NotADatabase,
    /// The file was written by a newer build.
    NewerSchema { found: i64, supported: i64 },
    /// A migration step failed; the store was rolled back.
    Migration { version: i64, message: String },
    /// First-run seed population failed; the store was rolled back.
    Seed(String),
    /// The background touch worker died before reporting.
    WorkerLost,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "store I/O error: {msg}"),
            Self::Open(msg) => write!(f, "cannot open store: {msg}"),
            Self::NotADatabase => write!(f, "store file is corrupt or not a store"),
            Self::NewerSchema { found, supported } => {
                write!(f, "store schema version {found} is newer than supported version {supported}")
            }
            Self::Migration { version, message } => {
                write!(f, "store migration {version} failed: {message}")
            }
            Self::Seed(msg) => write!(f, "seeding new store failed: {msg}"),
            Self::WorkerLost => write!(f, "store open was interrupted"),
        }
    }
}

impl std::error::Error for InitError {}

impl From<rusqlite::Error> for InitError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::NotADatabase) => Self::NotADatabase,
            _ => Self::Open(e.to_string()),
        }
    }
}

/// A single write transaction failed. Nothing from it was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// No store is open (not touched yet, failed, or replaced by import).
    NotReady,
    /// The write unit gave up; carries its reason.
    Aborted(String),
    /// Insert of an existing record.
    AlreadyExists(RecordKey),
    /// Update of a missing record.
    NotFound(RecordKey),
    /// A record body could not be encoded or decoded.
    Serialize(String),
    /// SQLite error, including a failed commit.
    Sqlite(String),
}

impl WriteError {
    /// Convenience for write units that want to abort with a reason.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "store is not open"),
            Self::Aborted(reason) => write!(f, "write aborted: {reason}"),
            Self::AlreadyExists(key) => write!(f, "record {key} already exists"),
            Self::NotFound(key) => write!(f, "record {key} does not exist"),
            Self::Serialize(msg) => write!(f, "record encoding error: {msg}"),
            Self::Sqlite(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<rusqlite::Error> for WriteError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for WriteError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The store is not open.
    NotReady,
    /// The handle predates an import or reset; acquire a new one.
    Invalidated,
    /// A stored body is not valid JSON.
    Decode(String),
    Sqlite(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "store is not open"),
            Self::Invalidated => write!(f, "read handle is stale; the store was replaced"),
            Self::Decode(msg) => write!(f, "record decode error: {msg}"),
            Self::Sqlite(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<rusqlite::Error> for ReadError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for ReadError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// The archive was rejected before any data was touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportValidationError {
    ContentType { expected: String, found: String },
    /// Payload does not carry a store header.
    NotAStore,
    /// Payload has a store header but fails the integrity check.
    Corrupt(String),
    NewerSchema { found: i64, supported: i64 },
}

impl fmt::Display for ImportValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentType { expected, found } => {
                write!(f, "not a valid backup file (content type '{found}', expected '{expected}')")
            }
            Self::NotAStore => write!(f, "not a valid backup file (unrecognised payload)"),
            Self::Corrupt(msg) => write!(f, "backup file is damaged: {msg}"),
            Self::NewerSchema { found, supported } => write!(
                f,
                "backup was made by a newer version (schema {found}, this build supports {supported})"
            ),
        }
    }
}

/// Staging or swapping failed; the existing store file is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportIoError {
    Stage(String),
    Swap(String),
}

impl fmt::Display for ImportIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(msg) => write!(f, "could not stage backup: {msg}"),
            Self::Swap(msg) => write!(f, "could not replace store: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    Validation(ImportValidationError),
    Io(ImportIoError),
}

impl ImportError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => e.fmt(f),
            Self::Io(e) => write!(f, "import failed: {e}"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<ImportValidationError> for ImportError {
    fn from(e: ImportValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<ImportIoError> for ImportError {
    fn from(e: ImportIoError) -> Self {
        Self::Io(e)
    }
}
