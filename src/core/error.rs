//! Defines the custom error type for the `core` module.

use std::path::PathBuf;
use thiserror::Error;

/// The primary error type for the `core` module.
///
/// Only conditions that abort an operation live here. Unreadable subtrees,
/// broken links and symlink cycles are reported as [`ScanWarning`]s instead.
///
/// [`ScanWarning`]: super::ScanWarning
#[derive(Debug, Error)]
pub enum CoreError {
    /// The scan root is missing or is not a directory.
    #[error("Path does not exist or is not a directory: {0}")]
    InvalidRoot(PathBuf),

    /// Represents an I/O error, typically from file system operations.
    #[error("I/O error for path {1}: {0}")]
    Io(#[source] std::io::Error, PathBuf),

    /// The OS-level watch could not be created for a root.
    #[error("Failed to watch {root}: {source}")]
    WatchEstablishment {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// A triggered rebuild failed. The previous snapshot stays in place.
    #[error("Rescan of {root} failed: {message}")]
    Rescan { root: PathBuf, message: String },

    /// Represents an error that occurred when a Tokio task was joined.
    /// This is often due to a task panicking or being cancelled.
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The operation was cancelled, e.g. because the watch was stopped.
    #[error("Operation was cancelled")]
    Cancelled,
}
