//! Decoding of JSON-lines log records.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::borrow::Cow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One log entry as delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The stream the line was written to, e.g. `stdout` or `stderr`.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// The raw log line, including any trailing newline the writer stored.
    pub line: Vec<u8>,
}

/// On-disk shape of a record. Borrows from the scratch line where it can.
#[derive(Deserialize)]
struct RawRecord<'a> {
    #[serde(borrow)]
    log: Cow<'a, str>,
    #[serde(borrow)]
    stream: Cow<'a, str>,
    time: DateTime<Utc>,
}

/// Streaming decoder that pulls one newline-terminated record at a time.
///
/// A line without its terminating newline is kept as pending input and
/// completed by later reads, so a decoder sitting on a file that is still
/// being appended never reports a half-written record as malformed.
pub(crate) struct RecordDecoder<R> {
    reader: R,
    line: Vec<u8>,
    position: u64,
}

impl<R: AsyncBufRead + Unpin> RecordDecoder<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self::resume(reader, Vec::new(), 0)
    }

    /// Continue decoding from `reader`, which sits at byte `position` of its
    /// file, with `pending` holding an already-read partial line.
    pub(crate) fn resume(reader: R, pending: Vec<u8>, position: u64) -> Self {
        Self {
            reader,
            line: pending,
            position,
        }
    }

    /// Decode the next complete record.
    ///
    /// Returns `Ok(None)` once no complete record is available.
    pub(crate) async fn decode(&mut self) -> Result<Option<Message>> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.line).await?;
            self.position += read as u64;

            if !self.line.ends_with(b"\n") {
                return Ok(None);
            }
            if self.line.trim_ascii().is_empty() {
                self.line.clear();
                continue;
            }

            let decoded = decode_line(&self.line);
            self.line.clear();
            return decoded.map(Some);
        }
    }

    /// Decode a final record that lacks its terminating newline.
    ///
    /// Only meaningful once the input is known to be complete.
    pub(crate) fn finish(&mut self) -> Result<Option<Message>> {
        if self.line.trim_ascii().is_empty() {
            self.line.clear();
            return Ok(None);
        }
        let decoded = decode_line(&self.line);
        self.line.clear();
        decoded.map(Some)
    }

    /// Byte offset in the underlying file up to which input has been read.
    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// Remove and return the bytes of an incomplete trailing line.
    pub(crate) fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.line)
    }
}

fn decode_line(line: &[u8]) -> Result<Message> {
    let record: RawRecord<'_> = serde_json::from_slice(line.trim_ascii())?;
    Ok(Message {
        source: record.stream.into_owned(),
        timestamp: record.time,
        line: record.log.into_owned().into_bytes(),
    })
}
