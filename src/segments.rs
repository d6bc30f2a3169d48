//! Presents rotated segments plus the active file as one continuous stream.

use crate::error::{Error, Result};
use crate::stream::Output;
use std::ffi::OsString;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tracing::debug;

/// Path of the `index`-th rotated predecessor of `path` (`path.1` is the
/// most recently rotated).
pub fn segment_path(path: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Open every retained segment, oldest first, followed by the active file.
///
/// Segments already pruned by rotation are skipped. Other failures to open a
/// rotated segment are reported on the error channel and the segment is
/// skipped.
/// Failing to open the active file fails the whole read.
pub(crate) async fn open_segments(
    path: &Path,
    max_files: usize,
    out: &Output,
) -> Result<SegmentReader> {
    let mut files = Vec::new();

    for index in (1..max_files).rev() {
        let rotated = segment_path(path, index);
        match File::open(&rotated).await {
            Ok(file) => files.push(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %rotated.display(), "Skipping pruned segment");
            }
            Err(source) => {
                out.error(Error::OpenSegment {
                    path: rotated.display().to_string(),
                    source,
                });
            }
        }
    }

    let active = File::open(path).await.map_err(|source| Error::OpenActive {
        path: path.display().to_string(),
        source,
    })?;
    files.push(active);

    Ok(SegmentReader::new(files).await?)
}

struct Segment {
    file: File,
    len: u64,
    /// The handle is known to sit at offset 0.
    at_start: bool,
}

/// Read-seekable concatenation of segment files.
///
/// Segment lengths are captured when the reader is built. Seeks resolve
/// against those lengths, while forward reads of the last (active) segment
/// continue past it as long as the file keeps growing.
pub(crate) struct SegmentReader {
    segments: Vec<Segment>,
    current: usize,
    pos: u64,
    seek: SeekState,
}

enum SeekState {
    Idle,
    /// A seek to `local` within segment `index` is in flight; it completes at
    /// absolute offset `target`.
    Pending { index: usize, local: u64, target: u64 },
    /// The current segment is being rewound before it is read.
    Rewinding,
}

impl SegmentReader {
    pub(crate) async fn new(files: Vec<File>) -> io::Result<Self> {
        let mut segments = Vec::with_capacity(files.len());
        for file in files {
            let len = file.metadata().await?.len();
            segments.push(Segment {
                file,
                len,
                at_start: true,
            });
        }
        Ok(Self {
            segments,
            current: 0,
            pos: 0,
            seek: SeekState::Idle,
        })
    }

    /// Total length of the segment set as captured at construction.
    pub(crate) fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Absolute offset at which the active segment begins.
    pub(crate) fn active_base(&self) -> u64 {
        let older = self.segments.len().saturating_sub(1);
        self.segments[..older].iter().map(|s| s.len).sum()
    }

    /// Release the older segments and hand back the active file handle at
    /// whatever position it was last left.
    pub(crate) fn into_active(mut self) -> io::Result<File> {
        self.segments
            .pop()
            .map(|s| s.file)
            .ok_or_else(|| io::Error::other("segment set has no active file"))
    }

    /// Find the segment holding absolute offset `target` and the offset
    /// within it. Offsets past the end land in the last segment.
    fn locate(&self, target: u64) -> (usize, u64) {
        let mut base = 0;
        let last = self.segments.len().saturating_sub(1);
        for (index, segment) in self.segments.iter().enumerate() {
            if target < base + segment.len || index == last {
                return (index, target - base);
            }
            base += segment.len;
        }
        (0, target)
    }
}

impl AsyncRead for SegmentReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let count = this.segments.len();

        loop {
            if this.current >= count {
                return Poll::Ready(Ok(()));
            }
            let segment = &mut this.segments[this.current];

            if matches!(this.seek, SeekState::Rewinding) {
                ready!(Pin::new(&mut segment.file).poll_complete(cx))?;
                this.seek = SeekState::Idle;
                segment.at_start = true;
            }

            let before = buf.filled().len();
            ready!(Pin::new(&mut segment.file).poll_read(cx, buf))?;
            let read = buf.filled().len() - before;

            if read > 0 {
                segment.at_start = false;
                this.pos += read as u64;
                return Poll::Ready(Ok(()));
            }
            if buf.remaining() == 0 || this.current + 1 >= count {
                return Poll::Ready(Ok(()));
            }

            this.current += 1;
            let next = &mut this.segments[this.current];
            if !next.at_start {
                Pin::new(&mut next.file).start_seek(SeekFrom::Start(0))?;
                this.seek = SeekState::Rewinding;
            }
        }
    }
}

impl AsyncSeek for SegmentReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if !matches!(this.seek, SeekState::Idle) {
            return Err(io::Error::other("another seek is in progress"));
        }

        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => this.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => this.pos.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;

        if this.segments.is_empty() {
            this.pos = target;
            return Ok(());
        }

        let (index, local) = this.locate(target);
        Pin::new(&mut this.segments[index].file).start_seek(SeekFrom::Start(local))?;
        this.seek = SeekState::Pending {
            index,
            local,
            target,
        };
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        match this.seek {
            SeekState::Pending {
                index,
                local,
                target,
            } => {
                let segment = &mut this.segments[index];
                ready!(Pin::new(&mut segment.file).poll_complete(cx))?;
                segment.at_start = local == 0;
                this.current = index;
                this.pos = target;
                this.seek = SeekState::Idle;
                Poll::Ready(Ok(target))
            }
            _ => Poll::Ready(Ok(this.pos)),
        }
    }
}
