//! In-memory buckets and their sealed, on-disk counterpart (spec.md §3
//! "Queue bucket" / "Queue file", §4.5 "Structure" / "Cycling").

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};

use crate::file_format::{self, FileHeader, IndexEntry, FILE_HEADER_SIZE, INDEX_ENTRY_SIZE};

#[derive(Debug, Snafu)]
pub enum BucketError {
    #[snafu(display("failed to open queue file {}: {}", path.display(), source))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("failed to write queue file {}: {}", path.display(), source))]
    Write { path: PathBuf, source: io::Error },

    #[snafu(display("queue file {} failed its header or index checks", path.display()))]
    Corrupt { path: PathBuf },
}

/// One item held in memory, either still in the current writable bucket or
/// loaded back from disk for a cursor read.
#[derive(Debug, Clone)]
pub struct Item {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// An in-memory container of items accumulated for one priority since the
/// last cycle (spec.md §3 "Queue bucket").
#[derive(Debug, Default)]
pub struct Bucket {
    pub priority: u32,
    pub items: Vec<Item>,
    pub data_size: u64,
}

impl Bucket {
    pub fn new(priority: u32) -> Self {
        Bucket {
            priority,
            items: Vec::new(),
            data_size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.items.first().map(|i| i.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.items.last().map(|i| i.seq)
    }

    pub fn push(&mut self, seq: u64, bytes: Vec<u8>) {
        self.data_size += bytes.len() as u64;
        self.items.push(Item { seq, bytes });
    }

    /// Finds the item at or immediately after `after_seq` (i.e. `seq >
    /// after_seq`), used by the cursor read path (spec.md §4.5 "Read path").
    pub fn item_after(&self, after_seq: u64) -> Option<&Item> {
        self.items.iter().find(|i| i.seq > after_seq)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), BucketError> {
        let file_size = FILE_HEADER_SIZE + self.items.len() * INDEX_ENTRY_SIZE + self.data_size as usize;
        let header = FileHeader {
            file_size: file_size as u32,
            priority: self.priority,
            num_items: self.items.len() as u32,
            first_seq: self.first_seq().unwrap_or(0),
            last_seq: self.last_seq().unwrap_or(0),
        };

        let mut buf = Vec::with_capacity(file_size);
        buf.extend_from_slice(&header.encode());

        let mut offset = 0u32;
        let mut index_entries = Vec::with_capacity(self.items.len());
        for item in &self.items {
            index_entries.push(IndexEntry {
                seq: item.seq,
                offset,
                size: item.bytes.len() as u32,
                crc32: file_format::checksum(&item.bytes),
            });
            offset += item.bytes.len() as u32;
        }
        for entry in &index_entries {
            let mut entry_buf = [0u8; INDEX_ENTRY_SIZE];
            entry.encode(&mut entry_buf);
            buf.extend_from_slice(&entry_buf);
        }
        for item in &self.items {
            buf.extend_from_slice(&item.bytes);
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path).context(OpenSnafu { path: tmp_path.clone() })?;
        file.write_all(&buf).context(WriteSnafu { path: path.to_path_buf() })?;
        file.sync_all().context(WriteSnafu { path: path.to_path_buf() })?;
        drop(file);
        fs::rename(&tmp_path, path).context(WriteSnafu { path: path.to_path_buf() })?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Bucket, BucketError> {
        let mut file = File::open(path).context(OpenSnafu { path: path.to_path_buf() })?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw).context(OpenSnafu { path: path.to_path_buf() })?;

        let header = FileHeader::decode(&raw).context(CorruptSnafu { path: path.to_path_buf() })?;
        let index_start = FILE_HEADER_SIZE;
        let index_len = header.num_items as usize * INDEX_ENTRY_SIZE;
        let data_start = index_start + index_len;
        if raw.len() < data_start {
            return Err(BucketError::Corrupt { path: path.to_path_buf() });
        }

        let mut bucket = Bucket::new(header.priority);
        for i in 0..header.num_items as usize {
            let entry_buf = &raw[index_start + i * INDEX_ENTRY_SIZE..index_start + (i + 1) * INDEX_ENTRY_SIZE];
            let entry = IndexEntry::decode(entry_buf);
            let start = data_start + entry.offset as usize;
            let end = start + entry.size as usize;
            if end > raw.len() {
                tracing::warn!(path = %path.display(), seq = entry.seq, "queue item offset out of bounds, skipping");
                continue;
            }
            let bytes = &raw[start..end];
            if file_format::checksum(bytes) != entry.crc32 {
                tracing::warn!(path = %path.display(), seq = entry.seq, "queue item failed checksum, skipping");
                continue;
            }
            bucket.push(entry.seq, bytes.to_vec());
        }
        Ok(bucket)
    }
}

/// Metadata about a sealed, on-disk bucket, with an optional in-memory
/// cache of its contents (populated on first read).
pub struct QueueFile {
    pub path: PathBuf,
    pub priority: u32,
    pub first_seq: u64,
    pub last_seq: u64,
    pub num_items: u32,
    pub data_size: u64,
    cached: Option<Bucket>,
}

impl QueueFile {
    pub fn from_header(path: PathBuf, header: FileHeader) -> Self {
        let index_bytes = header.num_items as u64 * INDEX_ENTRY_SIZE as u64;
        let payload_size = (header.file_size as u64)
            .saturating_sub(FILE_HEADER_SIZE as u64)
            .saturating_sub(index_bytes);
        QueueFile {
            path,
            priority: header.priority,
            first_seq: header.first_seq,
            last_seq: header.last_seq,
            num_items: header.num_items,
            data_size: payload_size,
            cached: None,
        }
    }

    pub fn from_bucket(path: PathBuf, bucket: &Bucket) -> Self {
        QueueFile {
            path,
            priority: bucket.priority,
            first_seq: bucket.first_seq().unwrap_or(0),
            last_seq: bucket.last_seq().unwrap_or(0),
            num_items: bucket.items.len() as u32,
            data_size: bucket.data_size,
            cached: None,
        }
    }

    pub fn load(&mut self) -> Result<&Bucket, BucketError> {
        if self.cached.is_none() {
            self.cached = Some(Bucket::read_from(&self.path)?);
        }
        Ok(self.cached.as_ref().unwrap())
    }

    pub fn evict_cache(&mut self) {
        self.cached = None;
    }

    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000000000000a");

        let mut bucket = Bucket::new(3);
        bucket.push(8, b"first".to_vec());
        bucket.push(9, b"second".to_vec());
        bucket.push(10, b"third".to_vec());
        bucket.write_to(&path).unwrap();

        let read_back = Bucket::read_from(&path).unwrap();
        assert_eq!(read_back.priority, 3);
        assert_eq!(read_back.items.len(), 3);
        assert_eq!(read_back.items[1].bytes, b"second");
        assert_eq!(read_back.first_seq(), Some(8));
        assert_eq!(read_back.last_seq(), Some(10));
    }

    #[test]
    fn corrupted_item_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt");

        let mut bucket = Bucket::new(0);
        bucket.push(1, b"hello".to_vec());
        bucket.write_to(&path).unwrap();

        // Flip a byte in the payload region without touching the header/index.
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let read_back = Bucket::read_from(&path).unwrap();
        assert!(read_back.items.is_empty());
    }
}
