//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract — scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain    | Description                                   |
//! |---------|-----------|-----------------------------------------------|
//! | 0       | Universal | Success                                       |
//! | 1       | Universal | General error (unspecified)                   |
//! | 2       | Universal | CLI usage error (bad args, missing file)      |
//! | 10-19   | store     | Store open, write, import and export failures |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into the relevant command's error handling

use vitalog_store::{ImportError, InitError, WriteError};

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing input file, invalid JSON body.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Store (10-19)
// =============================================================================

/// Store could not be opened, created or migrated (touch emitted initError).
pub const EXIT_STORE_INIT: u8 = 10;

/// A write transaction failed and was rolled back.
pub const EXIT_STORE_WRITE: u8 = 11;

/// Import rejected before touching data (wrong content tag, not a store,
/// damaged, or made by a newer version).
pub const EXIT_IMPORT_INVALID: u8 = 12;

/// Import failed while staging or swapping; the existing store is unchanged.
pub const EXIT_IMPORT_IO: u8 = 13;

/// Export produced no archive.
pub const EXIT_EXPORT_FAILED: u8 = 14;

pub fn init_exit_code(_err: &InitError) -> u8 {
    EXIT_STORE_INIT
}

pub fn write_exit_code(err: &WriteError) -> u8 {
    match err {
        WriteError::NotReady => EXIT_STORE_INIT,
        _ => EXIT_STORE_WRITE,
    }
}

pub fn import_exit_code(err: &ImportError) -> u8 {
    match err {
        ImportError::Validation(_) => EXIT_IMPORT_INVALID,
        ImportError::Io(_) => EXIT_IMPORT_IO,
    }
}
