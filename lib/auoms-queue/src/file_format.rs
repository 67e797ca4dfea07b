//! On-disk layout for sealed queue files and cursor files (spec.md §3
//! "Queue file", §6 "Queue file header" / "Cursor file header").
//!
//! A queue file is a fixed header, a flat index of `(seq, offset, size)`
//! triples, then the concatenated item bytes the index points into. Each
//! index entry also carries a trailing CRC32 of its item bytes: spec.md §1
//! says corruption is detected, not authenticated, and a bad checksum
//! causes the item to be skipped and logged, not a hard failure of the
//! whole file (spec.md §9, grounded on `original_source/PriorityQueue.h`'s
//! `QueueFile::FileHeader`/`IndexEntry`).

use byteorder::{ByteOrder, LittleEndian};

/// `QUEUEFIL` read as a little-endian `u64` (spec.md §6: "ASCII `ELIFQUEU`
/// little-endian = `0x5155455546494C45`").
pub const FILE_MAGIC: u64 = 0x5155_4555_4649_4C45;
pub const FILE_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 40;
pub const INDEX_ENTRY_SIZE: usize = 20;

/// `CURSFILE` read as a little-endian `u64` (spec.md §6: "magic `CURSFILE`
/// (`ELIFSRUC` little-endian)").
pub const CURSOR_MAGIC: u64 = 0x4355_5253_4649_4C45;
pub const CURSOR_VERSION: u32 = 1;
pub const CURSOR_HEADER_SIZE: usize = 16;

/// Queue file header: magic, version, file_size, priority, num_items,
/// first_seq, last_seq (spec.md §3 "Queue file", §6 "Queue file header" —
/// field set and widths grounded on `original_source/PriorityQueue.h`'s
/// `QueueFile::FileHeader`). `file_size` is the total on-disk size of the
/// file (header + index + item bytes), not just the item payload.
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    pub file_size: u32,
    pub priority: u32,
    pub num_items: u32,
    pub first_seq: u64,
    pub last_seq: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], FILE_MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], FILE_VERSION);
        LittleEndian::write_u32(&mut buf[12..16], self.file_size);
        LittleEndian::write_u32(&mut buf[16..20], self.priority);
        LittleEndian::write_u32(&mut buf[20..24], self.num_items);
        LittleEndian::write_u64(&mut buf[24..32], self.first_seq);
        LittleEndian::write_u64(&mut buf[32..40], self.last_seq);
        buf
    }

    /// Parses a header, validating magic and version. Returns `None` on
    /// mismatch (spec.md §4.5 "A queue file that fails magic/version/size
    /// checks is logged and skipped").
    pub fn decode(buf: &[u8]) -> Option<FileHeader> {
        if buf.len() < FILE_HEADER_SIZE {
            return None;
        }
        let magic = LittleEndian::read_u64(&buf[0..8]);
        let version = LittleEndian::read_u32(&buf[8..12]);
        if magic != FILE_MAGIC || version != FILE_VERSION {
            return None;
        }
        Some(FileHeader {
            file_size: LittleEndian::read_u32(&buf[12..16]),
            priority: LittleEndian::read_u32(&buf[16..20]),
            num_items: LittleEndian::read_u32(&buf[20..24]),
            first_seq: LittleEndian::read_u64(&buf[24..32]),
            last_seq: LittleEndian::read_u64(&buf[32..40]),
        })
    }
}

/// Per-item index entry: `(seq, offset, size)` per spec.md §3/§6, plus a
/// trailing `crc32` of the item's bytes (§1's "corruption is detected, not
/// authenticated" — the extra column is additive, not a substitute for the
/// documented triple).
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    pub seq: u64,
    pub offset: u32,
    pub size: u32,
    pub crc32: u32,
}

impl IndexEntry {
    pub fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_u64(&mut out[0..8], self.seq);
        LittleEndian::write_u32(&mut out[8..12], self.offset);
        LittleEndian::write_u32(&mut out[12..16], self.size);
        LittleEndian::write_u32(&mut out[16..20], self.crc32);
    }

    pub fn decode(buf: &[u8]) -> IndexEntry {
        IndexEntry {
            seq: LittleEndian::read_u64(&buf[0..8]),
            offset: LittleEndian::read_u32(&buf[8..12]),
            size: LittleEndian::read_u32(&buf[12..16]),
            crc32: LittleEndian::read_u32(&buf[16..20]),
        }
    }
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Fixed-size cursor file header: magic, version, per-priority array length
/// (spec.md §6 "Cursor file header").
pub fn encode_cursor_header(num_priorities: u32) -> [u8; CURSOR_HEADER_SIZE] {
    let mut buf = [0u8; CURSOR_HEADER_SIZE];
    LittleEndian::write_u64(&mut buf[0..8], CURSOR_MAGIC);
    LittleEndian::write_u32(&mut buf[8..12], CURSOR_VERSION);
    LittleEndian::write_u32(&mut buf[12..16], num_priorities);
    buf
}

pub fn decode_cursor_header(buf: &[u8]) -> Option<u32> {
    if buf.len() < CURSOR_HEADER_SIZE {
        return None;
    }
    let magic = LittleEndian::read_u64(&buf[0..8]);
    let version = LittleEndian::read_u32(&buf[8..12]);
    if magic != CURSOR_MAGIC || version != CURSOR_VERSION {
        return None;
    }
    Some(LittleEndian::read_u32(&buf[12..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_round_trips() {
        let header = FileHeader {
            file_size: 4096 + FILE_HEADER_SIZE as u32,
            priority: 2,
            num_items: 10,
            first_seq: 100,
            last_seq: 109,
        };
        let encoded = header.encode();
        let decoded = FileHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.priority, 2);
        assert_eq!(decoded.first_seq, 100);
        assert_eq!(decoded.last_seq, 109);
        assert_eq!(decoded.file_size, header.file_size);
    }

    #[test]
    fn file_header_rejects_bad_magic() {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], 0xDEAD_BEEF_DEAD_BEEF);
        assert!(FileHeader::decode(&buf).is_none());
    }

    #[test]
    fn index_entry_round_trips() {
        let entry = IndexEntry {
            seq: 55,
            offset: 128,
            size: 64,
            crc32: 0xABCD_1234,
        };
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        entry.encode(&mut buf);
        let decoded = IndexEntry::decode(&buf);
        assert_eq!(decoded.seq, 55);
        assert_eq!(decoded.crc32, 0xABCD_1234);
    }
}
