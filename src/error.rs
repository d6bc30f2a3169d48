//! Error types for the log reader library.

use thiserror::Error;

/// The main error type for log reader operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors when reading segments or the active file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File watching errors from the notify crate.
    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// A complete line that is not a valid JSON log record.
    #[error("Malformed log record: {0}")]
    Decode(#[from] serde_json::Error),

    /// The active log file could not be opened; the read request is aborted.
    #[error("Failed to open active log file {path}: {source}")]
    OpenActive {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A rotated segment exists but could not be opened.
    #[error("Failed to open rotated segment {path}: {source}")]
    OpenSegment {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File path errors.
    #[error("Invalid file path: {message}")]
    InvalidPath { message: String },
}

impl Error {
    /// Whether this error means the read descriptor went stale underneath us,
    /// which happens when the file is rotated away while being read.
    pub fn is_stale_handle(&self) -> bool {
        match self {
            Error::Io(e) => is_bad_descriptor(e),
            _ => false,
        }
    }
}

fn is_bad_descriptor(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(nix::errno::Errno::EBADF as i32) {
        return true;
    }
    err.to_string()
        .to_ascii_lowercase()
        .contains("bad file descriptor")
}

/// A convenient Result type for log reader operations.
pub type Result<T> = std::result::Result<T, Error>;
