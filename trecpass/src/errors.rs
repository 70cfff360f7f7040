//! Errors that can abort an instrumentation job.
//!
//! Every variant is fatal to the compilation unit: without the catalog the
//! engine cannot allocate consistent identifiers, and an identifier that
//! does not fit its bit budget cannot be embedded in a probe.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog directory or one of its files could not be accessed.
    #[error("catalog I/O error: {0}")]
    Io(#[from] io::Error),
    /// A statement against one of the catalog relations failed.
    #[error("catalog store error: {0}")]
    Sql(#[from] rusqlite::Error),
    /// The advisory lock on the manager store could not be taken or dropped.
    #[error("manager lock error: {0}")]
    SlotLock(io::Error),
    /// An identifier component fell outside its bit budget.
    #[error("identifier {what} value {value} outside [1, {max}]")]
    IdOverflow {
        what: &'static str,
        value: u64,
        max: u64,
    },
    /// `TREC_DATABASE_DIR` is not set.
    #[error("environment variable {0} is not set")]
    EnvMissing(&'static str),
}
