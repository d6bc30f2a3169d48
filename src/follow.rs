//! Live follow of the active log file across rotations.

use crate::config::accepts;
use crate::decoder::RecordDecoder;
use crate::error::{Error, Result};
use crate::notifier::Subscription;
use crate::stream::Output;
use crate::writer::LogFileWriter;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::BufReader;
use tokio::sync::{Notify, watch};
use tracing::{debug, trace, warn};

/// Where following starts: the active file positioned at `position`, plus
/// the bytes of a partial record already read from it.
pub(crate) struct FollowStart {
    pub(crate) file: File,
    pub(crate) pending: Vec<u8>,
    pub(crate) position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Waiting,
    Rotating,
    Closing { flush: bool },
    Done,
}

enum Wake {
    Close,
    Rotation,
    Write,
    Poll,
}

enum Reopen {
    Reopened,
    /// The path still names the file already open.
    Unchanged,
    /// The path does not exist yet; the writer is mid-rotation.
    NotYet,
}

/// Identity of an open file, used to tell a rotated-in file from the one
/// already being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &Metadata) -> Option<Self> {
        None
    }
}

/// Detect if the file was truncated by comparing current size with last position.
fn detect_file_truncation(current_size: u64, last_position: u64) -> bool {
    current_size < last_position
}

struct Follower {
    path: PathBuf,
    file_id: Option<FileId>,
    decoder: RecordDecoder<BufReader<File>>,
    since: Option<DateTime<Utc>>,
    poll_interval: Duration,
    /// Records consumed since following began. Wraps.
    read_index: u64,
    /// Write notifications received. Wraps.
    write_index: Arc<AtomicU64>,
    wake: Arc<Notify>,
    /// Records may be readable regardless of what the indexes say.
    maybe_more: bool,
    reopen_pending: bool,
    truncated: bool,
    rotated: bool,
}

/// Follow the active log file until close is requested, the consumer goes
/// away, or an unrecoverable error occurs.
pub(crate) async fn follow_logs(
    start: FollowStart,
    writer: &dyn LogFileWriter,
    mut rotations: Subscription,
    mut close: watch::Receiver<bool>,
    since: Option<DateTime<Utc>>,
    poll_interval: Duration,
    out: &Output,
) {
    let path = writer.log_path();
    let mut follower = match Follower::new(path, start, since, poll_interval).await {
        Ok(follower) => follower,
        Err(e) => {
            out.error(e);
            return;
        }
    };

    let writes = writer.notify_write();
    let write_id = writes.id();
    let counter = tokio::spawn(count_writes(
        writes,
        Arc::clone(&follower.write_index),
        Arc::clone(&follower.wake),
    ));

    follower.run(&mut rotations, &mut close, out).await;

    writer.notify_write_evict(write_id);
    counter.abort();
    debug!(
        path = %follower.path.display(),
        rotated = follower.rotated,
        "Stopped following log file"
    );
}

/// Translate write notifications into the shared write index.
async fn count_writes(mut writes: Subscription, write_index: Arc<AtomicU64>, wake: Arc<Notify>) {
    while writes.recv().await.is_some() {
        write_index.fetch_add(1, Ordering::Release);
        wake.notify_one();
    }
}

impl Follower {
    async fn new(
        path: PathBuf,
        start: FollowStart,
        since: Option<DateTime<Utc>>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let file_id = FileId::of(&start.file.metadata().await?);
        debug!(path = %path.display(), position = start.position, "Following log file");

        let reader = BufReader::new(start.file);
        Ok(Self {
            path,
            file_id,
            decoder: RecordDecoder::resume(reader, start.pending, start.position),
            since,
            poll_interval,
            read_index: 0,
            write_index: Arc::new(AtomicU64::new(0)),
            wake: Arc::new(Notify::new()),
            maybe_more: true,
            reopen_pending: false,
            truncated: false,
            rotated: false,
        })
    }

    async fn run(
        &mut self,
        rotations: &mut Subscription,
        close: &mut watch::Receiver<bool>,
        out: &Output,
    ) {
        let mut state = State::Reading;
        loop {
            trace!(?state, "Follower transition");
            state = match state {
                State::Reading => self.read(rotations, close, out).await,
                State::Waiting => self.wait(rotations, close).await,
                State::Rotating => self.rotate(out).await,
                State::Closing { flush } => {
                    if flush {
                        if let Err(e) = self.drain(out).await {
                            out.error(e);
                        }
                    }
                    State::Done
                }
                State::Done => return,
            };
        }
    }

    async fn read(
        &mut self,
        rotations: &mut Subscription,
        close: &watch::Receiver<bool>,
        out: &Output,
    ) -> State {
        if *close.borrow() {
            return State::Closing { flush: true };
        }
        if self.reopen_pending || rotations.try_recv() {
            return State::Rotating;
        }

        let written = self.write_index.load(Ordering::Acquire);
        if self.read_index == written && !self.maybe_more {
            return State::Waiting;
        }

        match self.decoder.decode().await {
            Ok(Some(message)) => {
                self.read_index = self.read_index.wrapping_add(1);
                self.maybe_more = true;
                if accepts(self.since.as_ref(), &message.timestamp) && !out.emit(message).await {
                    return State::Done;
                }
                State::Reading
            }
            Ok(None) => {
                self.read_index = written;
                self.maybe_more = false;
                State::Waiting
            }
            Err(e) => self.read_failed(e, out),
        }
    }

    /// A stale handle means the file was rotated out from under the read and
    /// is recovered by reopening. Any other error ends the follow.
    fn read_failed(&self, error: Error, out: &Output) -> State {
        if error.is_stale_handle() {
            debug!(path = %self.path.display(), "Read handle went stale, reopening");
            State::Rotating
        } else {
            out.error(error);
            State::Closing { flush: false }
        }
    }

    async fn wait(
        &mut self,
        rotations: &mut Subscription,
        close: &mut watch::Receiver<bool>,
    ) -> State {
        let wake = tokio::select! {
            biased;
            _ = close.changed() => Wake::Close,
            Some(()) = rotations.recv() => Wake::Rotation,
            _ = self.wake.notified() => Wake::Write,
            _ = tokio::time::sleep(self.poll_interval) => Wake::Poll,
        };

        match wake {
            Wake::Close => State::Closing { flush: true },
            Wake::Rotation => State::Rotating,
            Wake::Write => State::Reading,
            Wake::Poll => {
                self.maybe_more = true;
                self.inspect_path().await
            }
        }
    }

    /// Poll-time check for changes that arrive without any notification:
    /// the path replaced by a new file, or the file truncated in place.
    async fn inspect_path(&mut self) -> State {
        let Ok(meta) = fs::metadata(&self.path).await else {
            return State::Reading;
        };
        let current = FileId::of(&meta);
        if current.is_some() && self.file_id.is_some() && current != self.file_id {
            debug!(path = %self.path.display(), "Log file replaced without a rotation signal");
            return State::Rotating;
        }
        if detect_file_truncation(meta.len(), self.decoder.position()) {
            warn!(
                path = %self.path.display(),
                size = meta.len(),
                position = self.decoder.position(),
                "Log file truncated, restarting from the beginning"
            );
            self.truncated = true;
            return State::Rotating;
        }
        State::Reading
    }

    async fn rotate(&mut self, out: &Output) -> State {
        // Whatever reached the old file before it was rotated away is still
        // readable through the stale handle.
        if !self.truncated {
            match self.drain(out).await {
                Ok(true) => {}
                Ok(false) => return State::Done,
                Err(e) => {
                    out.error(e);
                    return State::Closing { flush: false };
                }
            }
        }

        match self.reopen().await {
            Ok(Reopen::Reopened) => {
                debug!(path = %self.path.display(), "Reopened log file after rotation");
                self.reopen_pending = false;
                State::Reading
            }
            Ok(Reopen::Unchanged) => {
                self.reopen_pending = false;
                State::Reading
            }
            Ok(Reopen::NotYet) => {
                trace!(path = %self.path.display(), "Rotated log file not created yet");
                self.reopen_pending = true;
                State::Waiting
            }
            Err(e) => {
                out.error(e);
                State::Closing { flush: false }
            }
        }
    }

    async fn reopen(&mut self) -> Result<Reopen> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Reopen::NotYet),
            Err(e) => return Err(e.into()),
        };
        let id = FileId::of(&file.metadata().await?);

        if !self.truncated && id.is_some() && id == self.file_id {
            return Ok(Reopen::Unchanged);
        }

        let incomplete = self.decoder.take_pending();
        if !incomplete.is_empty() {
            debug!(
                path = %self.path.display(),
                bytes = incomplete.len(),
                "Discarding incomplete record left in the previous file"
            );
        }

        self.decoder = RecordDecoder::new(BufReader::new(file));
        self.file_id = id;
        self.truncated = false;
        self.rotated = true;
        self.maybe_more = true;
        Ok(Reopen::Reopened)
    }

    /// Emit every record that is already readable, without waiting for more.
    /// Returns `Ok(false)` if the consumer has gone away. A stale handle ends
    /// the drain quietly; a malformed record is returned as an error.
    async fn drain(&mut self, out: &Output) -> Result<bool> {
        loop {
            match self.decoder.decode().await {
                Ok(Some(message)) => {
                    self.read_index = self.read_index.wrapping_add(1);
                    if accepts(self.since.as_ref(), &message.timestamp)
                        && !out.emit(message).await
                    {
                        return Ok(false);
                    }
                }
                Ok(None) => return Ok(true),
                Err(e) if e.is_stale_handle() => {
                    debug!(path = %self.path.display(), "Read handle went stale while draining");
                    return Ok(true);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
