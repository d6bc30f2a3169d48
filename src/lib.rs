//! A reader for rotated JSON-lines log files.
//!
//! Each line of the log is a JSON record `{"log": ..., "stream": ..., "time": ...}`.
//! The active file lives at a fixed path and older data has been rotated
//! into `<path>.1` (newest) through `<path>.<max_files - 1>` (oldest).
//! A read request replays history across every retained file, optionally
//! only the last few lines or only records since an instant, and can then
//! keep following the active file through rotations.
//!
//! # Example
//!
//! ```rust,no_run
//! use jsonlog_reader::{ReadConfig, Tail, watch_log};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReadConfig {
//!         tail: Tail::Last(10),
//!         follow: true,
//!         ..Default::default()
//!     };
//!     let mut watcher = watch_log("app.log", 3, config)?;
//!
//!     while let Some(message) = watcher.next().await {
//!         println!("{} {}", message.timestamp, String::from_utf8_lossy(&message.line));
//!     }
//!
//!     Ok(())
//! }
//! ```

mod config;
mod decoder;
mod error;
mod follow;
mod notifier;
mod reader;
mod segments;
mod stream;
mod tail;
mod watcher;
mod writer;

#[cfg(test)]
mod test_helpers;

// Public API exports
pub use config::{
    DEFAULT_MESSAGE_BUFFER, DEFAULT_POLL_INTERVAL, ReadConfig, ReaderOptions, Tail,
};
pub use decoder::Message;
pub use error::{Error, Result};
pub use notifier::{Notifier, Subscription, SubscriptionId};
pub use reader::JsonLogReader;
pub use segments::segment_path;
pub use stream::LogWatcher;
pub use writer::{LogFileWriter, WatchedLogFile};

use std::path::Path;
use std::sync::Arc;

/// Read a log that another process writes, watching the filesystem for
/// writes and rotations.
///
/// Must be called from within a tokio runtime. The watch stays alive for as
/// long as the returned watcher's request is running.
///
/// # Example
///
/// ```rust,no_run
/// use jsonlog_reader::{ReadConfig, watch_log};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut watcher = watch_log("app.log", 1, ReadConfig::default())?;
///
///     while let Some(message) = watcher.next_message().await {
///         println!("{}", String::from_utf8_lossy(&message.line));
///     }
///
///     Ok(())
/// }
/// ```
pub fn watch_log<P: AsRef<Path>>(
    path: P,
    max_files: usize,
    config: ReadConfig,
) -> Result<LogWatcher> {
    watch_log_with_options(path, max_files, config, ReaderOptions::default())
}

/// [`watch_log`] with explicit reader options.
pub fn watch_log_with_options<P: AsRef<Path>>(
    path: P,
    max_files: usize,
    config: ReadConfig,
    options: ReaderOptions,
) -> Result<LogWatcher> {
    let files = WatchedLogFile::new(path, max_files)?;
    let reader = JsonLogReader::with_options(Arc::new(files), options);
    Ok(reader.read_logs(config))
}
