//! Per-request read configuration and reader-wide options.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default interval between disk polls while a follower is caught up.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default capacity of a watcher's message channel.
pub const DEFAULT_MESSAGE_BUFFER: usize = 64;

/// How much history to replay before (optionally) following.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tail {
    /// No historical replay.
    None,
    /// Replay everything in every retained segment.
    #[default]
    All,
    /// Replay the last `n` lines.
    Last(usize),
}

impl From<i64> for Tail {
    /// `0` means none, negative means all, positive means the last `n` lines.
    fn from(value: i64) -> Self {
        match value {
            0 => Tail::None,
            n if n < 0 => Tail::All,
            n => Tail::Last(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }
}

/// A single read request.
#[derive(Debug, Clone, Default)]
pub struct ReadConfig {
    pub tail: Tail,
    /// Records stamped before this instant are dropped.
    pub since: Option<DateTime<Utc>>,
    pub follow: bool,
}

impl ReadConfig {
    pub fn accepts(&self, timestamp: &DateTime<Utc>) -> bool {
        accepts(self.since.as_ref(), timestamp)
    }
}

pub(crate) fn accepts(since: Option<&DateTime<Utc>>, timestamp: &DateTime<Utc>) -> bool {
    since.is_none_or(|since| timestamp >= since)
}

/// Options shared by every read request served by one reader.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Upper bound on how long a caught-up follower sleeps before it
    /// looks at the file again, even without a write notification.
    pub poll_interval: Duration,
    /// Capacity of each watcher's message channel. A full channel blocks
    /// the producing task until the consumer catches up.
    pub message_buffer: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            message_buffer: DEFAULT_MESSAGE_BUFFER,
        }
    }
}
