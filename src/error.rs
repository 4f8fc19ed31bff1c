use std::io;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the write path.
///
/// `Error` is cheap to clone so a single background error can be handed to
/// every writer that observes it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed batch encoding, record-count mismatch or WAL checksum failure.
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Resource exhausted: the caller asked not to block on backpressure.
    #[error("Incomplete: {0}")]
    Incomplete(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Memory limit exceeded")]
    MemoryLimit,

    /// The memtable refused an entry because key and sequence already exist.
    #[error("Try again: {0}")]
    TryAgain(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    pub fn is_try_again(&self) -> bool {
        matches!(self, Error::TryAgain(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}
