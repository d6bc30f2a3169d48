//! Filesystem event watching using the notify crate.

use crate::error::Result;
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// What happened to the watched log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileEvent {
    /// Data was appended.
    Written,
    /// The path was created, renamed, or replaced.
    Rotated,
}

/// Watches the directory of one file and yields raw notify events.
pub(crate) struct FileWatcher {
    watcher: RecommendedWatcher,
    receiver: mpsc::UnboundedReceiver<notify::Result<Event>>,
    file_path: PathBuf,
}

impl FileWatcher {
    pub(crate) fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;

        Ok(Self {
            watcher,
            receiver: rx,
            file_path,
        })
    }

    /// Start watching. The parent directory is watched so that the file
    /// being renamed away and recreated is observed.
    pub(crate) fn start_watching(&mut self) -> Result<()> {
        let watch_path = match self.file_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        self.watcher.watch(watch_path, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    pub(crate) async fn next_event(&mut self) -> Option<notify::Result<Event>> {
        self.receiver.recv().await
    }

    pub(crate) fn file_path(&self) -> &Path {
        &self.file_path
    }
}

/// Check if a notify event is relevant to a specific file
pub(crate) fn is_event_relevant_to_file(event: &Event, target_file_name: &str) -> bool {
    event.paths.iter().any(|path| {
        path.file_name()
            .map(|name| name.to_string_lossy() == target_file_name)
            .unwrap_or(false)
    })
}

/// Classify an event for the file named `target_file_name`.
pub(crate) fn classify_event(event: &Event, target_file_name: &str) -> Option<FileEvent> {
    if !is_event_relevant_to_file(event, target_file_name) {
        return None;
    }
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => Some(FileEvent::Rotated),
        EventKind::Modify(_) => Some(FileEvent::Written),
        _ => None,
    }
}
