//! Serving read requests against a rotated JSON log.

use crate::config::{ReadConfig, ReaderOptions, Tail};
use crate::error::Result;
use crate::follow::{FollowStart, follow_logs};
use crate::segments::{SegmentReader, open_segments};
use crate::stream::{LogWatcher, Output};
use crate::tail::{Replay, tail_file, tail_lines};
use crate::writer::LogFileWriter;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncSeekExt;
use tokio::sync::watch;
use tracing::debug;

/// Reads the logs of one writer. Each call to [`read_logs`](Self::read_logs)
/// is served by its own task with its own file handles.
pub struct JsonLogReader {
    writer: Arc<dyn LogFileWriter>,
    readers: Arc<ReaderRegistry>,
    options: ReaderOptions,
}

/// Followers currently attached to the log, keyed by an internal id.
#[derive(Default)]
struct ReaderRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Arc<watch::Sender<bool>>>>,
}

impl ReaderRegistry {
    fn register(&self, close: Arc<watch::Sender<bool>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, close);
        id
    }

    fn deregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<watch::Sender<bool>>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JsonLogReader {
    pub fn new(writer: Arc<dyn LogFileWriter>) -> Self {
        Self::with_options(writer, ReaderOptions::default())
    }

    pub fn with_options(writer: Arc<dyn LogFileWriter>, options: ReaderOptions) -> Self {
        Self {
            writer,
            readers: Arc::new(ReaderRegistry::default()),
            options,
        }
    }

    /// Start serving a read request.
    ///
    /// Returns immediately; all I/O happens on a spawned task, so this must
    /// be called from within a tokio runtime.
    pub fn read_logs(&self, config: ReadConfig) -> LogWatcher {
        let (watcher, out, close) = LogWatcher::channel(self.options.message_buffer);
        let request = ReadRequest {
            writer: Arc::clone(&self.writer),
            readers: Arc::clone(&self.readers),
            options: self.options.clone(),
            close_signal: watcher.close_signal(),
        };
        tokio::spawn(request.run(config, out, close));
        watcher
    }

    /// Number of requests currently in follow mode.
    pub fn active_readers(&self) -> usize {
        self.readers.lock().len()
    }

    /// Ask every following request to stop. Each one still flushes the
    /// records already written before its message stream ends.
    pub fn close_readers(&self) {
        for close in self.readers.lock().values() {
            close.send_replace(true);
        }
    }
}

struct ReadRequest {
    writer: Arc<dyn LogFileWriter>,
    readers: Arc<ReaderRegistry>,
    options: ReaderOptions,
    close_signal: Arc<watch::Sender<bool>>,
}

impl ReadRequest {
    /// The message channel closes when `out` is dropped at the end of this
    /// function, whichever way it returns.
    async fn run(self, config: ReadConfig, out: Output, close: watch::Receiver<bool>) {
        let path = self.writer.log_path();
        let mut segments = match open_segments(&path, self.writer.max_files(), &out).await {
            Ok(segments) => segments,
            Err(e) => {
                out.error(e);
                return;
            }
        };

        let replay = tail_file(
            &mut segments,
            config.tail,
            config.since.as_ref(),
            config.follow,
            &out,
        )
        .await;

        if !config.follow || out.is_closed() {
            return;
        }

        let start = match follow_start(segments, config.tail, replay).await {
            Ok(start) => start,
            Err(e) => {
                out.error(e);
                return;
            }
        };

        let id = self.readers.register(Arc::clone(&self.close_signal));
        let rotations = self.writer.notify_rotate();
        let rotate_id = rotations.id();

        follow_logs(
            start,
            self.writer.as_ref(),
            rotations,
            close,
            config.since,
            self.options.poll_interval,
            &out,
        )
        .await;

        self.readers.deregister(id);
        self.writer.notify_rotate_evict(rotate_id);
        debug!(path = %path.display(), "Read request finished");
    }
}

/// Work out where following picks up after the historical phase.
///
/// A fully drained `Tail::All` replay continues exactly where it stopped.
/// Otherwise following starts after the last complete line that existed
/// when the segments were opened, so nothing replayed is delivered twice.
async fn follow_start(
    mut segments: SegmentReader,
    tail: Tail,
    replay: Replay,
) -> Result<FollowStart> {
    if let (Tail::All, Replay::Drained(pending)) = (tail, replay) {
        let mut file = segments.into_active()?;
        let position = file.stream_position().await?;
        return Ok(FollowStart {
            file,
            pending,
            position,
        });
    }

    let end = tail_lines(&mut segments, 0).await?.end;
    let position = end.saturating_sub(segments.active_base());
    let mut file = segments.into_active()?;
    file.seek(SeekFrom::Start(position)).await?;
    Ok(FollowStart {
        file,
        pending: Vec::new(),
        position,
    })
}
