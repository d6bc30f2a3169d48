//! The write-side collaborator the reader depends on.

use crate::error::{Error, Result};
use crate::notifier::{Notifier, Subscription, SubscriptionId};
use crate::watcher::{FileEvent, FileWatcher, classify_event};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What the reader needs from whoever writes and rotates the log.
///
/// The active file lives at [`log_path`](Self::log_path); rotated
/// predecessors live at `<path>.1` (newest) through `<path>.<max_files - 1>`.
pub trait LogFileWriter: Send + Sync {
    fn log_path(&self) -> PathBuf;

    /// Number of files retained, counting the active one.
    fn max_files(&self) -> usize;

    /// Subscribe to rotation events.
    fn notify_rotate(&self) -> Subscription;

    fn notify_rotate_evict(&self, id: SubscriptionId);

    /// Subscribe to completed appends.
    fn notify_write(&self) -> Subscription;

    fn notify_write_evict(&self, id: SubscriptionId);
}

/// A log written by another process, observed through filesystem events.
///
/// Data changes on the log path publish write notifications; creating or
/// renaming the log path publishes a rotation.
pub struct WatchedLogFile {
    path: PathBuf,
    max_files: usize,
    writes: Arc<Notifier>,
    rotations: Arc<Notifier>,
    task: JoinHandle<()>,
}

impl WatchedLogFile {
    /// Start watching `path`. Must be called from within a tokio runtime.
    pub fn new<P: AsRef<Path>>(path: P, max_files: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidPath {
                message: format!("{} does not name a file", path.display()),
            })?;

        let mut watcher = FileWatcher::new(&path)?;
        watcher.start_watching()?;

        let writes = Arc::new(Notifier::new());
        let rotations = Arc::new(Notifier::new());
        let task = tokio::spawn(bridge_events(
            watcher,
            file_name,
            Arc::clone(&writes),
            Arc::clone(&rotations),
        ));

        Ok(Self {
            path,
            max_files: max_files.max(1),
            writes,
            rotations,
            task,
        })
    }
}

async fn bridge_events(
    mut watcher: FileWatcher,
    file_name: String,
    writes: Arc<Notifier>,
    rotations: Arc<Notifier>,
) {
    while let Some(event) = watcher.next_event().await {
        match event {
            Ok(event) => match classify_event(&event, &file_name) {
                Some(FileEvent::Written) => writes.publish(),
                Some(FileEvent::Rotated) => {
                    debug!(path = %watcher.file_path().display(), "Log file rotated");
                    rotations.publish();
                }
                None => {}
            },
            Err(e) => {
                warn!(path = %watcher.file_path().display(), error = %e, "File watch error");
            }
        }
    }
}

impl LogFileWriter for WatchedLogFile {
    fn log_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn max_files(&self) -> usize {
        self.max_files
    }

    fn notify_rotate(&self) -> Subscription {
        self.rotations.subscribe()
    }

    fn notify_rotate_evict(&self, id: SubscriptionId) {
        self.rotations.evict(id);
    }

    fn notify_write(&self) -> Subscription {
        self.writes.subscribe()
    }

    fn notify_write_evict(&self, id: SubscriptionId) {
        self.writes.evict(id);
    }
}

impl Drop for WatchedLogFile {
    fn drop(&mut self) {
        self.task.abort();
        self.writes.close();
        self.rotations.close();
    }
}
