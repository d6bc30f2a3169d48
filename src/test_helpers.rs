//! Test utilities for creating rotating log directories and a stand-in writer.

use crate::notifier::{Notifier, Subscription, SubscriptionId};
use crate::segments::segment_path;
use crate::writer::LogFileWriter;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One encoded record line, newline included.
pub fn record(log: &str, time: DateTime<Utc>) -> String {
    let value = serde_json::json!({
        "log": log,
        "stream": "stdout",
        "time": time.to_rfc3339_opts(SecondsFormat::Nanos, true),
    });
    format!("{value}\n")
}

fn append(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    file.flush()
}

/// Shift `path` to `path.1`, `path.1` to `path.2` and so on, dropping
/// whatever falls beyond `max_files`, then start a fresh empty `path`.
fn rotate_files(path: &Path, max_files: usize) -> std::io::Result<()> {
    if max_files > 1 {
        let _ = fs::remove_file(segment_path(path, max_files - 1));
        for index in (1..max_files - 1).rev() {
            let from = segment_path(path, index);
            if from.exists() {
                fs::rename(&from, segment_path(path, index + 1))?;
            }
        }
        fs::rename(path, segment_path(path, 1))?;
    }
    File::create(path)?;
    Ok(())
}

pub struct TempLogDir {
    pub path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TempLogDir {
    /// Create a directory holding an empty active log file
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("test.log");
        File::create(&path)?;

        Ok(Self {
            path,
            _temp_dir: temp_dir,
        })
    }

    /// Create a directory whose active log holds exactly `content`
    pub fn with_content(content: &str) -> std::io::Result<Self> {
        let dir = Self::new()?;
        dir.append_raw(content)?;
        Ok(dir)
    }

    pub fn append_raw(&self, content: &str) -> std::io::Result<()> {
        append(&self.path, content)
    }

    pub fn append_record(&self, log: &str, time: DateTime<Utc>) -> std::io::Result<()> {
        self.append_raw(&record(log, time))
    }

    /// Write the rotated segment `path.<index>`
    pub fn write_segment(&self, index: usize, content: &str) -> std::io::Result<()> {
        fs::write(segment_path(&self.path, index), content)
    }

    pub fn rotate(&self, max_files: usize) -> std::io::Result<()> {
        rotate_files(&self.path, max_files)
    }

    /// Truncate the active file in place
    pub fn truncate(&self) -> std::io::Result<()> {
        OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A writer that appends records and rotates on demand, notifying
/// subscribers the way a real writer would.
pub struct TestWriter {
    path: PathBuf,
    max_files: usize,
    writes: Notifier,
    rotations: Notifier,
}

impl TestWriter {
    pub fn new(path: &Path, max_files: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            max_files,
            writes: Notifier::new(),
            rotations: Notifier::new(),
        }
    }

    pub fn write(&self, log: &str, time: DateTime<Utc>) {
        self.write_quietly(log, time);
        self.signal_write();
    }

    /// Append without publishing a write notification
    pub fn write_quietly(&self, log: &str, time: DateTime<Utc>) {
        append(&self.path, &record(log, time)).expect("append record");
    }

    pub fn rotate(&self) {
        rotate_files(&self.path, self.max_files).expect("rotate log files");
        self.signal_rotation();
    }

    pub fn signal_write(&self) {
        self.writes.publish();
    }

    pub fn signal_rotation(&self) {
        self.rotations.publish();
    }

    pub fn write_subscribers(&self) -> usize {
        self.writes.subscriber_count()
    }

    pub fn rotate_subscribers(&self) -> usize {
        self.rotations.subscriber_count()
    }
}

impl LogFileWriter for TestWriter {
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_is_one_json_line() {
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let line = record("hello", time);

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["log"], "hello");
    }

    #[test]
    fn test_rotate_shifts_segments() {
        let dir = TempLogDir::with_content("a\n").unwrap();
        dir.rotate(3).unwrap();
        dir.append_raw("b\n").unwrap();
        dir.rotate(3).unwrap();
        dir.append_raw("c\n").unwrap();
        dir.rotate(3).unwrap();

        assert!(!segment_path(dir.path(), 3).exists());
        assert_eq!(fs::read_to_string(segment_path(dir.path(), 2)).unwrap(), "b\n");
        assert_eq!(fs::read_to_string(segment_path(dir.path(), 1)).unwrap(), "c\n");
        assert_eq!(fs::read_to_string(dir.path()).unwrap(), "");
    }

    #[test]
    fn test_rotate_with_single_file_truncates() {
        let dir = TempLogDir::with_content("a\n").unwrap();
        dir.rotate(1).unwrap();
        assert_eq!(fs::read_to_string(dir.path()).unwrap(), "");
    }
}
