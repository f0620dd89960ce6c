//! Error and Result types for row store operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for row store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for row store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A required configuration option is missing or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The store directory could not be created or listed at open.
    #[error("unable to initialize store directory {path:?}: {source}")]
    Dir {
        /// The configured store directory.
        path: PathBuf,
        /// The underlying filesystem error.
        source: io::Error,
    },

    /// The durable file violated the record framing mid-stream.
    #[error("corrupt file store: unexpected error reading {context}: {source}")]
    Corrupt {
        /// Which part of the record frame was being read.
        context: &'static str,
        /// The underlying read error.
        source: io::Error,
    },

    /// The store has been closed and no longer accepts operations.
    #[error("row store is closed")]
    Closed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Wraps a framing read error with the record part being read.
    pub(crate) fn corrupt(context: &'static str) -> impl FnOnce(io::Error) -> StoreError {
        move |source| StoreError::Corrupt { context, source }
    }
}
