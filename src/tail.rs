//! Historical replay: locating the tail of a log and emitting it.

use crate::config::{Tail, accepts};
use crate::decoder::RecordDecoder;
use crate::error::Result;
use crate::stream::Output;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, BufReader};
use tracing::trace;

const BLOCK_SIZE: u64 = 4096;

/// The last complete lines of a stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct TailRegion {
    /// The selected lines, each newline-terminated.
    pub(crate) bytes: Vec<u8>,
    /// Absolute offset just past the last complete line.
    pub(crate) end: u64,
}

/// Find the last `count` newline-terminated lines by scanning backwards from
/// the end of the stream in fixed-size blocks.
///
/// Bytes after the final newline belong to a record still being written and
/// are excluded. With `count == 0` only `end` is computed.
pub(crate) async fn tail_lines<R>(reader: &mut R, count: usize) -> Result<TailRegion>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let size = reader.seek(SeekFrom::End(0)).await?;
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    let mut start = size;
    let mut end = None;
    let mut begin = None;
    let mut newlines = 0;

    while start > 0 && begin.is_none() {
        let len = BLOCK_SIZE.min(start);
        start -= len;

        let mut block = vec![0; len as usize];
        reader.seek(SeekFrom::Start(start)).await?;
        reader.read_exact(&mut block).await?;

        for (i, byte) in block.iter().enumerate().rev() {
            if *byte != b'\n' {
                continue;
            }
            let after = start + i as u64 + 1;
            if end.is_none() {
                end = Some(after);
                if count == 0 {
                    begin = Some(after);
                    break;
                }
            } else {
                newlines += 1;
                if newlines == count {
                    begin = Some(after);
                    break;
                }
            }
        }
        blocks.push(block);
    }

    let end = end.unwrap_or(0);
    let begin = begin.unwrap_or(0).min(end);

    // `blocks` holds [start, size) back to front.
    let mut bytes = Vec::with_capacity((size - start) as usize);
    for block in blocks.into_iter().rev() {
        bytes.extend_from_slice(&block);
    }
    let from = (begin - start) as usize;
    let to = (end - start) as usize;
    bytes.drain(to..);
    bytes.drain(..from);

    trace!(count, begin, end, "Located tail region");
    Ok(TailRegion { bytes, end })
}

/// How the historical phase ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Replay {
    /// The stream was decoded to its end. Holds the trailing bytes of a
    /// record that had not been completely written yet.
    Drained(Vec<u8>),
    /// Replay stopped early on an error or a closed consumer.
    Stopped,
}

/// Replay history from `stream` to `out`.
///
/// With `Tail::Last` only the tail region is materialized and decoded. With
/// `Tail::All` the stream is decoded from its current position forward.
/// Records stamped before `since` are dropped. A malformed record is
/// reported on the error channel and ends the replay.
pub(crate) async fn tail_file<R>(
    stream: &mut R,
    tail: Tail,
    since: Option<&DateTime<Utc>>,
    follow: bool,
    out: &Output,
) -> Replay
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    match tail {
        Tail::None => Replay::Drained(Vec::new()),
        Tail::Last(count) => match tail_lines(stream, count).await {
            Ok(region) => {
                let mut decoder = RecordDecoder::new(region.bytes.as_slice());
                replay(&mut decoder, since, false, out).await
            }
            Err(e) => {
                out.error(e);
                Replay::Stopped
            }
        },
        Tail::All => {
            let mut decoder = RecordDecoder::new(BufReader::new(stream));
            replay(&mut decoder, since, !follow, out).await
        }
    }
}

async fn replay<R>(
    decoder: &mut RecordDecoder<R>,
    since: Option<&DateTime<Utc>>,
    finish: bool,
    out: &Output,
) -> Replay
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let decoded = match decoder.decode().await {
            Ok(None) if finish => decoder.finish(),
            other => other,
        };
        match decoded {
            Ok(Some(message)) => {
                if !accepts(since, &message.timestamp) {
                    continue;
                }
                if !out.emit(message).await {
                    return Replay::Stopped;
                }
            }
            Ok(None) => {
                return Replay::Drained(decoder.take_pending());
            }
            Err(e) => {
                out.error(e);
                return Replay::Stopped;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::stream::LogWatcher;
    use crate::test_helpers::record;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap()
    }

    fn log_of(lines: &[&str]) -> String {
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| record(line, at(i as u32)))
            .collect()
    }

    async fn replayed(
        content: &str,
        tail: Tail,
        since: Option<DateTime<Utc>>,
    ) -> (Vec<String>, Vec<Error>, Replay) {
        let (mut watcher, out, _close) = LogWatcher::channel(1024);
        let mut stream = Cursor::new(content.as_bytes().to_vec());
        let replay = tail_file(&mut stream, tail, since.as_ref(), false, &out).await;
        drop(out);

        let mut lines = Vec::new();
        while let Some(message) = watcher.next_message().await {
            lines.push(String::from_utf8(message.line).unwrap());
        }
        let mut errors = Vec::new();
        while let Some(error) = watcher.try_next_error() {
            errors.push(error);
        }
        (lines, errors, replay)
    }

    #[tokio::test]
    async fn test_tail_lines_selects_last_complete_lines() {
        let mut stream = Cursor::new(b"one\ntwo\nthree\npart".to_vec());
        let region = tail_lines(&mut stream, 2).await.unwrap();

        assert_eq!(region.bytes, b"two\nthree\n");
        assert_eq!(region.end, 14);
    }

    #[tokio::test]
    async fn test_tail_lines_with_fewer_lines_than_requested() {
        let mut stream = Cursor::new(b"one\ntwo\n".to_vec());
        let region = tail_lines(&mut stream, 10).await.unwrap();

        assert_eq!(region.bytes, b"one\ntwo\n");
        assert_eq!(region.end, 8);
    }

    #[tokio::test]
    async fn test_tail_lines_zero_only_finds_boundary() {
        let mut stream = Cursor::new(b"one\ntwo\nhalf".to_vec());
        let region = tail_lines(&mut stream, 0).await.unwrap();

        assert!(region.bytes.is_empty());
        assert_eq!(region.end, 8);
    }

    #[tokio::test]
    async fn test_tail_lines_empty_and_unterminated_streams() {
        let mut empty = Cursor::new(Vec::new());
        assert_eq!(
            tail_lines(&mut empty, 3).await.unwrap(),
            TailRegion { bytes: Vec::new(), end: 0 }
        );

        let mut partial = Cursor::new(b"no newline yet".to_vec());
        assert_eq!(
            tail_lines(&mut partial, 3).await.unwrap(),
            TailRegion { bytes: Vec::new(), end: 0 }
        );
    }

    #[tokio::test]
    async fn test_tail_lines_spans_many_blocks() {
        let content: String = (0..2000).map(|i| format!("line {i}\n")).collect();
        let mut stream = Cursor::new(content.into_bytes());

        let region = tail_lines(&mut stream, 1500).await.unwrap();
        let text = String::from_utf8(region.bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines.len(), 1500);
        assert_eq!(lines[0], "line 500");
        assert_eq!(lines[1499], "line 1999");
    }

    #[tokio::test]
    async fn test_replay_all_in_order() {
        let content = log_of(&["a", "b", "c"]);
        let (lines, errors, replay) = replayed(&content, Tail::All, None).await;

        assert_eq!(lines, vec!["a", "b", "c"]);
        assert!(errors.is_empty());
        assert_eq!(replay, Replay::Drained(Vec::new()));
    }

    #[tokio::test]
    async fn test_replay_last_records() {
        let content = log_of(&["a", "b", "c", "d"]);
        let (lines, _, _) = replayed(&content, Tail::Last(2), None).await;
        assert_eq!(lines, vec!["c", "d"]);

        let (lines, _, _) = replayed(&content, Tail::Last(10), None).await;
        assert_eq!(lines, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_replay_none_emits_nothing() {
        let content = log_of(&["a"]);
        let (lines, _, _) = replayed(&content, Tail::None, None).await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_replay_drops_records_before_since() {
        let content = log_of(&["a", "b", "c", "d"]);
        let (lines, _, _) = replayed(&content, Tail::All, Some(at(2))).await;
        assert_eq!(lines, vec!["c", "d"]);

        let (lines, _, _) = replayed(&content, Tail::Last(3), Some(at(2))).await;
        assert_eq!(lines, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_replay_all_decodes_unterminated_last_record() {
        let mut content = log_of(&["a"]);
        content.push_str(record("b", at(1)).trim_end());

        let (lines, _, _) = replayed(&content, Tail::All, None).await;
        assert_eq!(lines, vec!["a", "b"]);

        // The tail count only covers complete lines.
        let (lines, _, _) = replayed(&content, Tail::Last(5), None).await;
        assert_eq!(lines, vec!["a"]);
    }

    #[tokio::test]
    async fn test_replay_stops_at_malformed_record() {
        let content = format!("{}garbage\n{}", record("a", at(0)), record("b", at(1)));
        let (lines, errors, replay) = replayed(&content, Tail::All, None).await;

        assert_eq!(lines, vec!["a"]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Decode(_)));
        assert_eq!(replay, Replay::Stopped);
    }

    #[tokio::test]
    async fn test_follow_replay_keeps_partial_record_pending() {
        let full = record("b", at(1));
        let content = format!("{}{}", record("a", at(0)), &full[..12]);
        let (mut watcher, out, _close) = LogWatcher::channel(8);
        let mut stream = Cursor::new(content.into_bytes());

        let replay = tail_file(&mut stream, Tail::All, None, true, &out).await;

        assert_eq!(replay, Replay::Drained(full.as_bytes()[..12].to_vec()));
        assert_eq!(watcher.next_message().await.unwrap().line, b"a");
    }
}
