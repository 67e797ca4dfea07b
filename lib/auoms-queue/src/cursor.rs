//! Per-consumer read position (spec.md §3 "Cursor", §4.5 "Cursor
//! durability", "Crash recovery invariants").

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use snafu::{ResultExt, Snafu};

use crate::file_format::{self, CURSOR_HEADER_SIZE};

pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_SAVE_RETRY_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum CursorError {
    #[snafu(display("failed to read cursor file {}: {}", path.display(), source))]
    Read { path: PathBuf, source: io::Error },

    #[snafu(display("failed to write cursor file {}: {}", path.display(), source))]
    Write { path: PathBuf, source: io::Error },
}

/// Per-priority read/commit counters plus the soft-save state machine
/// (spec.md §3 "Cursor": "a soft-save state machine (dirty flag, last-save
/// time, last-write-success flag)").
pub struct CursorState {
    pub path: PathBuf,
    /// In-memory only: the last sequence handed out to the consumer,
    /// per priority. Not persisted; on reopen it is seeded from
    /// `last_committed`.
    pub last_consumed: Vec<u64>,
    /// Durable: the last sequence the consumer has acknowledged as
    /// processed, per priority.
    pub last_committed: Vec<u64>,
    dirty: bool,
    last_save_time: Option<Instant>,
    last_save_failed: bool,
}

impl CursorState {
    pub fn new_empty(path: PathBuf, num_priorities: usize) -> Self {
        CursorState {
            path,
            last_consumed: vec![0; num_priorities],
            last_committed: vec![0; num_priorities],
            dirty: false,
            last_save_time: None,
            last_save_failed: false,
        }
    }

    /// Loads a cursor file if present; otherwise starts fresh. `max_seq`
    /// gives the current per-priority maximum sequence in the queue, used
    /// to clamp a stale cursor (spec.md §4.5 "A cursor file with a newer
    /// sequence than the current maximum ... is clamped down").
    pub fn open(path: PathBuf, num_priorities: usize, max_seq: &[u64]) -> Result<Self, CursorError> {
        if !path.exists() {
            return Ok(Self::new_empty(path, num_priorities));
        }
        let mut file = File::open(&path).context(ReadSnafu { path: path.clone() })?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw).context(ReadSnafu { path: path.clone() })?;

        let declared = match file_format::decode_cursor_header(&raw) {
            Some(n) => n as usize,
            None => {
                tracing::warn!(path = %path.display(), "cursor file failed header checks, starting fresh");
                return Ok(Self::new_empty(path, num_priorities));
            }
        };

        let mut last_committed = vec![0u64; num_priorities];
        let n = declared.min(num_priorities);
        for i in 0..n {
            let offset = CURSOR_HEADER_SIZE + i * 8;
            if raw.len() < offset + 8 {
                break;
            }
            let mut value = LittleEndian::read_u64(&raw[offset..offset + 8]);
            if let Some(&max) = max_seq.get(i) {
                if value > max {
                    value = max;
                }
            }
            last_committed[i] = value;
        }

        Ok(CursorState {
            path,
            last_consumed: last_committed.clone(),
            last_committed,
            dirty: false,
            last_save_time: None,
            last_save_failed: false,
        })
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether this cursor is due for a save right now (spec.md §4.5
    /// "Cursor durability").
    pub fn should_save(&self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        match self.last_save_time {
            None => true,
            Some(last) if self.last_save_failed => now.duration_since(last) >= DEFAULT_SAVE_RETRY_WAIT,
            Some(last) => now.duration_since(last) >= DEFAULT_SAVE_DELAY,
        }
    }

    pub fn save(&mut self, now: Instant) -> Result<(), CursorError> {
        let result = self.write_to_disk();
        self.last_save_time = Some(now);
        match &result {
            Ok(()) => {
                self.dirty = false;
                self.last_save_failed = false;
            }
            Err(_) => {
                self.last_save_failed = true;
            }
        }
        result
    }

    fn write_to_disk(&self) -> Result<(), CursorError> {
        let mut buf = Vec::with_capacity(CURSOR_HEADER_SIZE + self.last_committed.len() * 8);
        buf.extend_from_slice(&file_format::encode_cursor_header(self.last_committed.len() as u32));
        for &value in &self.last_committed {
            let mut entry = [0u8; 8];
            LittleEndian::write_u64(&mut entry, value);
            buf.extend_from_slice(&entry);
        }

        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context(WriteSnafu { path: self.path.clone() })?;
        }
        let mut file = File::create(&tmp_path).context(WriteSnafu { path: tmp_path.clone() })?;
        file.write_all(&buf).context(WriteSnafu { path: self.path.clone() })?;
        file.sync_all().context(WriteSnafu { path: self.path.clone() })?;
        drop(file);
        fs::rename(&tmp_path, &self.path).context(WriteSnafu { path: self.path.clone() })?;
        Ok(())
    }

    pub fn remove_file(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Lists the cursor names already persisted under `<dir>/cursors`, so
/// `Queue::open` can rebuild committed positions (spec.md §4.5 `Open`:
/// "Reads every cursor file to restore committed positions").
pub fn list_cursor_files(cursors_dir: &Path) -> io::Result<Vec<String>> {
    if !cursors_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(cursors_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cursor_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorState::open(dir.path().join("a"), 4, &[0, 0, 0, 0]).unwrap();
        assert_eq!(cursor.last_committed, vec![0, 0, 0, 0]);
    }

    #[test]
    fn cursor_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer-a");
        let mut cursor = CursorState::new_empty(path.clone(), 3);
        cursor.last_committed = vec![10, 0, 5];
        cursor.mark_dirty();
        cursor.save(Instant::now()).unwrap();

        let reopened = CursorState::open(path, 3, &[100, 100, 100]).unwrap();
        assert_eq!(reopened.last_committed, vec![10, 0, 5]);
        assert_eq!(reopened.last_consumed, vec![10, 0, 5]);
    }

    #[test]
    fn stale_cursor_is_clamped_to_current_max() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer-b");
        let mut cursor = CursorState::new_empty(path.clone(), 2);
        cursor.last_committed = vec![500, 0];
        cursor.mark_dirty();
        cursor.save(Instant::now()).unwrap();

        let reopened = CursorState::open(path, 2, &[50, 0]).unwrap();
        assert_eq!(reopened.last_committed[0], 50);
    }

    #[test]
    fn should_save_waits_for_the_dirty_delay() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = CursorState::new_empty(dir.path().join("c"), 1);
        assert!(!cursor.should_save(Instant::now()));
        cursor.mark_dirty();
        assert!(cursor.should_save(Instant::now()));
    }
}
