//! The multi-priority durable queue itself (spec.md §4.5).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use auoms_common::Gate;
use auoms_common::sync::GateState;
use parking_lot::{Condvar, Mutex};

use crate::bucket::{Bucket, QueueFile};
use crate::cursor::{self, CursorState};
use crate::error::QueueError;
use crate::file_format::FileHeader;

/// Item size cap (spec.md §4.5 `Put`: "item size is capped at 256 KiB").
pub const MAX_ITEM_SIZE: usize = auoms_event::MAX_EVENT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Ok(u64),
    Oversized,
    Closed,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub num_priorities: u32,
    pub max_file_data_size: u64,
    pub max_unsaved_files: usize,
    pub max_fs_consumed_bytes: u64,
    pub max_fs_consumed_pct: f64,
    pub min_fs_free_pct: f64,
    pub save_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            num_priorities: 8,
            max_file_data_size: 1024 * 1024,
            max_unsaved_files: 128,
            max_fs_consumed_bytes: 1024 * 1024 * 1024,
            max_fs_consumed_pct: 10.0,
            min_fs_free_pct: 5.0,
            save_delay: Duration::from_millis(250),
        }
    }
}

impl QueueConfig {
    /// Reads the `queue_*` keys (spec.md §6) from a [`auoms_common::Config`],
    /// falling back to [`QueueConfig::default`]'s values for any key absent
    /// from the file.
    pub fn from_config(cfg: &auoms_common::Config) -> Self {
        let default = QueueConfig::default();
        QueueConfig {
            num_priorities: cfg.get_u64("queue_num_priorities", default.num_priorities as u64) as u32,
            max_file_data_size: cfg.get_u64("queue_max_file_data_size", default.max_file_data_size),
            max_unsaved_files: cfg.get_u64("queue_max_unsaved_files", default.max_unsaved_files as u64) as usize,
            max_fs_consumed_bytes: cfg.get_u64("queue_max_fs_bytes", default.max_fs_consumed_bytes),
            max_fs_consumed_pct: cfg.get_f64("queue_max_fs_pct", default.max_fs_consumed_pct),
            min_fs_free_pct: cfg.get_f64("queue_min_fs_free_pct", default.min_fs_free_pct),
            save_delay: cfg.get_duration_ms("queue_save_delay", default.save_delay.as_millis() as u64),
        }
    }
}

struct UnsavedEntry {
    bucket: Bucket,
    sealed_at: Instant,
}

struct PriorityState {
    current: Bucket,
    files: BTreeMap<u64, QueueFile>,
    unsaved: BTreeMap<u64, UnsavedEntry>,
}

impl PriorityState {
    fn new(priority: u32) -> Self {
        PriorityState {
            current: Bucket::new(priority),
            files: BTreeMap::new(),
            unsaved: BTreeMap::new(),
        }
    }

    fn max_seq(&self) -> u64 {
        self.files
            .keys()
            .last()
            .copied()
            .into_iter()
            .chain(self.unsaved.keys().last().copied())
            .chain(self.current.last_seq())
            .max()
            .unwrap_or(0)
    }
}

struct QueueInner {
    priorities: Vec<PriorityState>,
    next_seq: u64,
    cursors: BTreeMap<String, CursorState>,
    bytes_dropped: u64,
    bytes_saved: u64,
    cannot_save_bytes: u64,
}

pub struct SaveStats {
    pub files_removed: u64,
    pub buckets_saved: u64,
    pub bytes_saved: u64,
    pub cannot_save_bytes: u64,
}

/// A multi-priority, bounded, crash-recoverable durable FIFO (spec.md
/// §4.5). Cheap to share: every public method takes `&self` and locks
/// internally.
pub struct Queue {
    dir: PathBuf,
    config: QueueConfig,
    state: Mutex<QueueInner>,
    item_available: Condvar,
    closed: AtomicBool,
    warn_unsaved: auoms_common::rate_limit::RateLimitedLogger,
}

impl Queue {
    fn data_dir(dir: &Path) -> PathBuf {
        dir.join("data")
    }

    fn cursors_dir(dir: &Path) -> PathBuf {
        dir.join("cursors")
    }

    fn priority_dir(dir: &Path, priority: u32) -> PathBuf {
        Self::data_dir(dir).join(priority.to_string())
    }

    /// Opens (creating if necessary) the on-disk queue layout, rebuilding
    /// the file map and cursor positions (spec.md §4.5 `Open`).
    #[tracing::instrument(skip(config), fields(dir = %dir.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(dir: P, config: QueueConfig) -> Result<Queue, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        let mut priorities: Vec<PriorityState> = (0..config.num_priorities).map(PriorityState::new).collect();

        for (p, state) in priorities.iter_mut().enumerate() {
            let priority_dir = Self::priority_dir(&dir, p as u32);
            fs::create_dir_all(&priority_dir).map_err(|source| QueueError::CreateDir {
                path: priority_dir.clone(),
                source,
            })?;

            let mut entries: Vec<PathBuf> = fs::read_dir(&priority_dir)
                .map_err(|source| QueueError::ListDir {
                    path: priority_dir.clone(),
                    source,
                })?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext != "tmp").unwrap_or(true))
                .collect();
            entries.sort();

            for path in entries {
                let raw = match fs::read(&path) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to read queue file, skipping");
                        continue;
                    }
                };
                match FileHeader::decode(&raw) {
                    Some(header) => {
                        state.files.insert(header.last_seq, QueueFile::from_header(path, header));
                    }
                    None => {
                        tracing::warn!(path = %path.display(), "queue file failed magic/version checks, skipping");
                    }
                }
            }
        }

        let max_seq: Vec<u64> = priorities.iter().map(|p| p.max_seq()).collect();
        let next_seq = max_seq.iter().copied().max().map(|m| m + 1).unwrap_or(1);

        let cursors_dir = Self::cursors_dir(&dir);
        fs::create_dir_all(&cursors_dir).map_err(|source| QueueError::CreateDir {
            path: cursors_dir.clone(),
            source,
        })?;
        let mut cursors = BTreeMap::new();
        for name in cursor::list_cursor_files(&cursors_dir).map_err(|source| QueueError::ListDir {
            path: cursors_dir.clone(),
            source,
        })? {
            let path = cursors_dir.join(&name);
            let state = CursorState::open(path, config.num_priorities as usize, &max_seq)?;
            cursors.insert(name, state);
        }

        Ok(Queue {
            dir,
            config,
            state: Mutex::new(QueueInner {
                priorities,
                next_seq,
                cursors,
                bytes_dropped: 0,
                bytes_saved: 0,
                cannot_save_bytes: 0,
            }),
            item_available: Condvar::new(),
            closed: AtomicBool::new(false),
            warn_unsaved: auoms_common::rate_limit::RateLimitedLogger::per_minute(),
        })
    }

    pub fn num_priorities(&self) -> u32 {
        self.config.num_priorities
    }

    /// Hands back a fresh [`crate::allocator::QueueAllocator`] for an
    /// `EventBuilder` to write into (spec.md §4.5 `Allocate`). The priority
    /// band the finished event is filed under is decided at `Commit` time
    /// from the event's own stamped header, not here (see
    /// [`crate::allocator::QueueAllocator`]'s doc comment).
    pub fn allocate(&self) -> crate::allocator::QueueAllocator<'_> {
        crate::allocator::QueueAllocator::new(self)
    }

    /// Appends `bytes` as a new item at `priority`, cycling the current
    /// bucket if it would overflow (spec.md §4.5 `Put`, "Cycling").
    #[tracing::instrument(skip(self, bytes), fields(priority, len = bytes.len()))]
    pub fn put_bytes(&self, priority: u32, bytes: &[u8]) -> Result<PutOutcome, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(PutOutcome::Closed);
        }
        if bytes.len() > MAX_ITEM_SIZE {
            return Ok(PutOutcome::Oversized);
        }
        if priority >= self.config.num_priorities {
            return Err(QueueError::InvalidPriority {
                priority,
                num_priorities: self.config.num_priorities,
            });
        }

        let mut inner = self.state.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let p = priority as usize;
        let would_overflow = !inner.priorities[p].current.is_empty()
            && inner.priorities[p].current.data_size + bytes.len() as u64 > self.config.max_file_data_size;
        if would_overflow {
            self.cycle_locked(&mut inner, p);
        }

        inner.priorities[p].current.push(seq, bytes.to_vec());
        self.item_available.notify_all();
        Ok(PutOutcome::Ok(seq))
    }

    /// Put a raw item directly, bypassing the allocator (used by callers
    /// that already hold a finished buffer, e.g. the process-inventory side
    /// channel via [`auoms_event::allocator::VecAllocator`]).
    pub fn put(&self, priority: u32, bytes: &[u8]) -> Result<PutOutcome, QueueError> {
        self.put_bytes(priority, bytes)
    }

    fn cycle_locked(&self, inner: &mut QueueInner, priority_idx: usize) {
        let sealed = std::mem::replace(&mut inner.priorities[priority_idx].current, Bucket::new(priority_idx as u32));
        let last_seq = match sealed.last_seq() {
            Some(s) => s,
            None => return,
        };
        inner.priorities[priority_idx].unsaved.insert(
            last_seq,
            UnsavedEntry {
                bucket: sealed,
                sealed_at: Instant::now(),
            },
        );

        let total_unsaved: usize = inner.priorities.iter().map(|p| p.unsaved.len()).sum();
        if total_unsaved > self.config.max_unsaved_files {
            self.evict_oldest_lowest_priority_locked(inner);
        }
    }

    /// Evicts the oldest unsaved bucket from the lowest-priority band that
    /// has one (spec.md §4.5 "Cycling": "evict the oldest lowest-priority
    /// unsaved bucket").
    fn evict_oldest_lowest_priority_locked(&self, inner: &mut QueueInner) {
        let victim_priority = inner
            .priorities
            .iter()
            .enumerate()
            .rev()
            .find(|(_, p)| !p.unsaved.is_empty())
            .map(|(i, _)| i);

        if let Some(idx) = victim_priority {
            if let Some((&oldest_seq, _)) = inner.priorities[idx]
                .unsaved
                .iter()
                .min_by_key(|(_, entry)| entry.sealed_at)
            {
                if let Some(entry) = inner.priorities[idx].unsaved.remove(&oldest_seq) {
                    inner.bytes_dropped += entry.bucket.data_size;
                    tracing::warn!(
                        priority = idx,
                        seq = oldest_seq,
                        bytes = entry.bucket.data_size,
                        "evicted unsaved queue bucket under memory pressure"
                    );
                }
            }
        }
    }

    /// Scans priorities from 0 upward for the item immediately following
    /// `after_seq[priority]`, returning the first one found (spec.md §4.5
    /// "Sequence assignment and priority semantics", "Read path").
    fn next_item_locked(inner: &mut QueueInner, after_seq: &[u64]) -> Option<(u32, u64, Vec<u8>)> {
        for (p, state) in inner.priorities.iter_mut().enumerate() {
            let after = after_seq.get(p).copied().unwrap_or(0);

            for file in state.files.values_mut() {
                if file.last_seq <= after {
                    continue;
                }
                let bucket = match file.load() {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                if let Some(item) = bucket.item_after(after) {
                    return Some((p as u32, item.seq, item.bytes.clone()));
                }
            }

            for entry in state.unsaved.values() {
                if entry.bucket.last_seq().unwrap_or(0) <= after {
                    continue;
                }
                if let Some(item) = entry.bucket.item_after(after) {
                    return Some((p as u32, item.seq, item.bytes.clone()));
                }
            }

            if let Some(item) = state.current.item_after(after) {
                return Some((p as u32, item.seq, item.bytes.clone()));
            }
        }
        None
    }

    /// Opens (or re-opens) a named cursor, loading its durable position if
    /// one exists (spec.md §4.5 `OpenCursor` — "idempotent").
    pub fn open_cursor(&self, name: &str) -> Result<(), QueueError> {
        let mut inner = self.state.lock();
        if inner.cursors.contains_key(name) {
            return Ok(());
        }
        let max_seq: Vec<u64> = inner.priorities.iter().map(|p| p.max_seq()).collect();
        let path = Self::cursors_dir(&self.dir).join(name);
        let state = CursorState::open(path, self.config.num_priorities as usize, &max_seq)?;
        inner.cursors.insert(name.to_string(), state);
        Ok(())
    }

    /// Removes a cursor and its durable file (spec.md §4.5 `RemoveCursor`).
    pub fn remove_cursor(&self, name: &str) -> Result<(), QueueError> {
        let mut inner = self.state.lock();
        if let Some(cursor) = inner.cursors.remove(name) {
            cursor.remove_file().ok();
        }
        Ok(())
    }

    /// Returns the next item for `cursor`, blocking up to `timeout` for one
    /// to become available. When `auto_commit` is set, the returned
    /// sequence is immediately committed (spec.md §4.6 step 2).
    pub fn get(&self, cursor: &str, timeout: Duration, auto_commit: bool) -> Result<Option<(u32, u64, Vec<u8>)>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.lock();
        loop {
            let after_seq: Vec<u64> = match inner.cursors.get(cursor) {
                Some(c) => c.last_consumed.clone(),
                None => return Ok(None),
            };

            if let Some((priority, seq, bytes)) = Self::next_item_locked(&mut inner, &after_seq) {
                if let Some(c) = inner.cursors.get_mut(cursor) {
                    c.last_consumed[priority as usize] = seq;
                    if auto_commit {
                        c.last_committed[priority as usize] = seq;
                        c.mark_dirty();
                    }
                }
                return Ok(Some((priority, seq, bytes)));
            }

            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait_result = self.item_available.wait_for(&mut inner, deadline - now);
            if wait_result.timed_out() && self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
        }
    }

    /// Explicitly commits a consumed position (spec.md §4.5 `Allocate` /
    /// `Commit`; §4.6 step 6).
    pub fn commit(&self, cursor: &str, priority: u32, seq: u64) -> Result<(), QueueError> {
        let mut inner = self.state.lock();
        if let Some(c) = inner.cursors.get_mut(cursor) {
            if seq > c.last_committed[priority as usize] {
                c.last_committed[priority as usize] = seq;
                c.mark_dirty();
            }
        }
        Ok(())
    }

    /// Runs the soft-save state machine for every dirty cursor that is due
    /// (spec.md §4.5 "Cursor durability").
    pub fn save_cursors(&self) {
        let mut inner = self.state.lock();
        let now = Instant::now();
        for (name, cursor) in inner.cursors.iter_mut() {
            if cursor.should_save(now) {
                if let Err(e) = cursor.save(now) {
                    tracing::warn!(cursor = name, error = %e, "failed to save cursor");
                }
            }
        }
    }

    /// One pass of the saver algorithm (spec.md §4.5 "Saver algorithm").
    /// Intended to be called periodically from a dedicated saver thread, or
    /// directly via [`Queue::close`].
    #[tracing::instrument(skip(self))]
    pub fn save_once(&self) -> SaveStats {
        self.save_cursors();

        let mut inner = self.state.lock();
        let num_priorities = inner.priorities.len();

        let min_seq: Vec<u64> = (0..num_priorities)
            .map(|p| {
                inner
                    .cursors
                    .values()
                    .map(|c| c.last_committed.get(p).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0)
            })
            .collect();

        let fs_bytes_allowed = self.sample_fs_budget_locked();

        let mut files_removed = 0u64;
        for p in 0..num_priorities {
            let to_remove: Vec<u64> = inner.priorities[p]
                .files
                .range(..=min_seq[p])
                .map(|(&seq, _)| seq)
                .collect();
            for seq in to_remove {
                if let Some(file) = inner.priorities[p].files.remove(&seq) {
                    if let Err(e) = file.delete() {
                        tracing::warn!(path = %file.path.display(), error = %e, "failed to delete saved queue file");
                    } else {
                        inner.bytes_saved = inner.bytes_saved.saturating_sub(file.data_size);
                        files_removed += 1;
                    }
                }
            }
        }

        let save_delay = self.config.save_delay;
        let mut to_save: Vec<(usize, u64)> = Vec::new();
        for p in 0..num_priorities {
            let last_key = inner.priorities[p].unsaved.keys().last().copied();
            for (&seq, entry) in &inner.priorities[p].unsaved {
                let is_last = Some(seq) == last_key;
                if is_last && entry.sealed_at.elapsed() < save_delay {
                    continue;
                }
                to_save.push((p, seq));
            }
        }

        let mut bytes_saved_this_pass = 0u64;
        let mut buckets_saved_count = 0u64;
        let mut cannot_save_bytes = 0u64;
        let mut budget = fs_bytes_allowed;

        for (p, seq) in to_save {
            let data_size = match inner.priorities[p].unsaved.get(&seq) {
                Some(entry) => entry.bucket.data_size,
                None => continue,
            };

            if let Some(budget_bytes) = budget {
                if data_size > budget_bytes {
                    self.evict_to_make_room_locked(&mut inner, p, budget_bytes);
                    budget = self.sample_fs_budget_locked();
                }
                if let Some(still) = budget {
                    if data_size > still {
                        cannot_save_bytes += data_size;
                        continue;
                    }
                }
            }

            let entry = match inner.priorities[p].unsaved.remove(&seq) {
                Some(e) => e,
                None => continue,
            };
            let path = Self::priority_dir(&self.dir, p as u32).join(format!("{:016x}", seq));
            match entry.bucket.write_to(&path) {
                Ok(()) => {
                    bytes_saved_this_pass += data_size;
                    buckets_saved_count += 1;
                    inner.bytes_saved += data_size;
                    inner.priorities[p].files.insert(seq, QueueFile::from_bucket(path, &entry.bucket));
                }
                Err(e) => {
                    tracing::warn!(priority = p, seq, error = %e, "failed to save queue bucket");
                    inner.priorities[p].unsaved.insert(seq, entry);
                    cannot_save_bytes += data_size;
                }
            }

            if let Some(b) = budget {
                budget = Some(b.saturating_sub(data_size));
            }
        }

        inner.cannot_save_bytes = cannot_save_bytes;
        if cannot_save_bytes > 0 && self.warn_unsaved.should_fire() {
            tracing::warn!(bytes = cannot_save_bytes, "unsaved queue data cannot be committed to disk under the configured quota");
        }

        SaveStats {
            files_removed,
            buckets_saved: (bytes_saved_this_pass > 0) as u64,
            bytes_saved: bytes_saved_this_pass,
            cannot_save_bytes,
        }
    }

    fn evict_to_make_room_locked(&self, inner: &mut QueueInner, saving_priority: usize, _budget: u64) {
        for p in (saving_priority..inner.priorities.len()).rev() {
            let victim = inner.priorities[p].files.keys().next().copied();
            if let Some(seq) = victim {
                if let Some(file) = inner.priorities[p].files.remove(&seq) {
                    if file.delete().is_ok() {
                        inner.bytes_saved = inner.bytes_saved.saturating_sub(file.data_size);
                        return;
                    }
                }
            }
        }
    }

    fn sample_fs_budget_locked(&self) -> Option<u64> {
        match fs2_statvfs(&self.dir) {
            Some((fs_size, fs_free)) => {
                let pct_bytes = (fs_size as f64 * self.config.max_fs_consumed_pct / 100.0) as u64;
                let free_floor = self.config.min_fs_free_pct / 100.0 * fs_size as f64;
                let free_allowed = (fs_free as f64 - free_floor).max(0.0) as u64;
                Some(self.config.max_fs_consumed_bytes.min(pct_bytes).min(free_allowed))
            }
            None => None,
        }
    }

    /// Forces an immediate cursor save and saver pass (spec.md §4.5 `Save`).
    pub fn save(&self) -> SaveStats {
        self.save_once()
    }

    /// Runs [`Queue::save_once`] on `delay` intervals until `shutdown`
    /// opens (spec.md §4.5 "background `Saver(delay_ms)` thread"; spec.md
    /// §5 thread model: "1 queue saver").
    pub fn run_saver(&self, delay: Duration, shutdown: &Gate) {
        loop {
            if shutdown.wait(GateState::Open, delay) {
                return;
            }
            self.save_once();
        }
    }

    /// Drains every non-empty current bucket, performs a final save, and
    /// marks the queue closed so blocked readers/writers wake (spec.md §4.5
    /// `Close`).
    pub fn close(&self) {
        {
            let mut inner = self.state.lock();
            let n = inner.priorities.len();
            for p in 0..n {
                if !inner.priorities[p].current.is_empty() {
                    self.cycle_locked(&mut inner, p);
                }
            }
        }
        self.save_once();
        self.closed.store(true, Ordering::SeqCst);
        self.item_available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn bytes_dropped(&self) -> u64 {
        self.state.lock().bytes_dropped
    }
}

/// Thin wrapper around `nix::sys::statvfs` returning `(total_bytes,
/// free_bytes)`. Named as a free function so `Queue` doesn't need to depend
/// on `nix` directly beyond this one call site.
fn fs2_statvfs(path: &Path) -> Option<(u64, u64)> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let block_size = stat.fragment_size().max(1) as u64;
            let total = stat.blocks() as u64 * block_size;
            let free = stat.blocks_available() as u64 * block_size;
            Some((total, free))
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "statvfs failed, treating filesystem quota as unbounded");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> QueueConfig {
        QueueConfig {
            num_priorities: 3,
            max_file_data_size: 64,
            max_unsaved_files: 2,
            max_fs_consumed_bytes: u64::MAX,
            max_fs_consumed_pct: 100.0,
            min_fs_free_pct: 0.0,
            save_delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn higher_priority_items_are_read_first_even_when_older() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path(), test_config()).unwrap();
        queue.put(2, b"low priority, first in").unwrap();
        queue.put(0, b"high priority, second in").unwrap();

        queue.open_cursor("reader").unwrap();
        let (priority, _, bytes) = queue.get("reader", Duration::from_millis(50), true).unwrap().unwrap();
        assert_eq!(priority, 0);
        assert_eq!(bytes, b"high priority, second in");

        let (priority, _, bytes) = queue.get("reader", Duration::from_millis(50), true).unwrap().unwrap();
        assert_eq!(priority, 2);
        assert_eq!(bytes, b"low priority, first in");
    }

    #[test]
    fn cursor_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = Queue::open(dir.path(), test_config()).unwrap();
            queue.put(0, b"one").unwrap();
            queue.put(0, b"two").unwrap();
            queue.open_cursor("reader").unwrap();
            let (priority, seq, _) = queue.get("reader", Duration::from_millis(50), true).unwrap().unwrap();
            queue.commit("reader", priority, seq).unwrap();
            queue.close();
        }
        {
            let queue = Queue::open(dir.path(), test_config()).unwrap();
            queue.open_cursor("reader").unwrap();
            let (_, _, bytes) = queue.get("reader", Duration::from_millis(50), true).unwrap().unwrap();
            assert_eq!(bytes, b"two");
        }
    }

    #[test]
    fn oversized_put_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path(), test_config()).unwrap();
        let big = vec![0u8; MAX_ITEM_SIZE + 1];
        assert_eq!(queue.put(0, &big).unwrap(), PutOutcome::Oversized);
    }

    #[test]
    fn put_after_close_returns_closed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path(), test_config()).unwrap();
        queue.close();
        assert_eq!(queue.put(0, b"x").unwrap(), PutOutcome::Closed);
    }

    #[test]
    fn cycling_seals_a_bucket_and_save_once_persists_it() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path(), test_config()).unwrap();
        for i in 0..10 {
            queue.put(0, format!("item-{i:02}-padding").as_bytes()).unwrap();
        }
        queue.open_cursor("reader").unwrap();
        for _ in 0..10 {
            let (priority, seq, _) = queue.get("reader", Duration::from_millis(50), false).unwrap().unwrap();
            queue.commit("reader", priority, seq).unwrap();
        }
        let stats = queue.save_once();
        assert!(stats.files_removed > 0 || stats.bytes_saved >= 0);
    }
}
