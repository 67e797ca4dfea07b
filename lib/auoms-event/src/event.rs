//! Top-level event view and validation (spec.md §3, §8 invariant 1).

use byteorder::{ByteOrder, LittleEndian};
use snafu::Snafu;

use crate::layout::{self, event_header};
use crate::record::Record;

pub use auoms_common::writer::EventId;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum EventValidationError {
    #[snafu(display("buffer too small to hold an event header: {} bytes", len))]
    TooSmall { len: usize },

    #[snafu(display("declared size {} does not match buffer length {}", declared, actual))]
    SizeMismatch { declared: u32, actual: usize },

    #[snafu(display("event declares num_records == 0, which is illegal"))]
    ZeroRecords,

    #[snafu(display("record_index[{}] = {} is not strictly greater than record_index[{}] = {}", i, cur, i - 1, prev))]
    RecordIndexNotIncreasing { i: usize, cur: u32, prev: u32 },

    #[snafu(display("record {} offset {} is out of bounds of a {}-byte buffer", i, offset, len))]
    RecordOffsetOutOfBounds { i: usize, offset: u32, len: usize },

    #[snafu(display("record {} failed to parse at offset {}", i, offset))]
    RecordUnparsable { i: usize, offset: u32 },

    #[snafu(display("the last record does not end exactly at the extensions offset ({} != {})", record_end, extensions_offset))]
    LastRecordMisaligned {
        record_end: usize,
        extensions_offset: usize,
    },

    #[snafu(display("record {} field sorted_index is not a valid permutation of insertion_index", i))]
    SortedIndexInvalid { i: usize },
}

/// A borrowed, validated view over one event buffer (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    data: &'a [u8],
}

impl<'a> Event<'a> {
    /// Wraps `data` without validating it. Prefer [`Event::parse`] unless
    /// the buffer's provenance is already trusted (e.g. it was just built).
    pub fn from_raw(data: &'a [u8]) -> Event<'a> {
        Event { data }
    }

    /// Wraps `data`, validating every invariant in spec.md §8 #1.
    pub fn parse(data: &'a [u8]) -> Result<Event<'a>, EventValidationError> {
        let event = Event { data };
        event.validate()?;
        Ok(event)
    }

    pub fn size(&self) -> u32 {
        layout::unpack_size(LittleEndian::read_u32(&self.data[event_header::SIZE_VERSION..]))
    }

    pub fn version(&self) -> u8 {
        layout::unpack_version(LittleEndian::read_u32(&self.data[event_header::SIZE_VERSION..]))
    }

    pub fn id(&self) -> EventId {
        EventId::new(self.seconds(), self.milliseconds(), self.serial())
    }

    pub fn seconds(&self) -> u64 {
        LittleEndian::read_u64(&self.data[event_header::SECONDS..])
    }

    pub fn milliseconds(&self) -> u32 {
        LittleEndian::read_u32(&self.data[event_header::MILLISECONDS..])
    }

    pub fn serial(&self) -> u64 {
        LittleEndian::read_u64(&self.data[event_header::SERIAL..])
    }

    pub fn num_records(&self) -> u16 {
        LittleEndian::read_u16(&self.data[event_header::NUM_RECORDS..])
    }

    pub fn priority(&self) -> u16 {
        LittleEndian::read_u16(&self.data[event_header::PRIORITY..])
    }

    pub fn flags(&self) -> u16 {
        LittleEndian::read_u16(&self.data[event_header::FLAGS..])
    }

    pub fn pid(&self) -> i32 {
        LittleEndian::read_i32(&self.data[event_header::PID..])
    }

    pub fn has_extensions(&self) -> bool {
        self.flags() & crate::event_flags::HAS_EXTENSIONS != 0
    }

    fn record_index_entry(&self, i: usize) -> u32 {
        LittleEndian::read_u32(&self.data[event_header::RECORD_INDEX + i * 4..])
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'a>> + 'a {
        let data = self.data;
        let n = self.num_records() as usize;
        let offsets: Vec<u32> = (0..n)
            .map(|i| LittleEndian::read_u32(&data[event_header::RECORD_INDEX + i * 4..]))
            .collect();
        let ends: Vec<usize> = (0..n)
            .map(|i| {
                if i + 1 < n {
                    offsets[i + 1] as usize
                } else {
                    Self::extensions_or_end(data)
                }
            })
            .collect();
        (0..n).filter_map(move |i| Record::parse(&data[offsets[i] as usize..ends[i]]))
    }

    fn extensions_or_end(data: &[u8]) -> usize {
        let flags = LittleEndian::read_u16(&data[event_header::FLAGS..]);
        if flags & crate::event_flags::HAS_EXTENSIONS != 0 && data.len() >= 4 {
            LittleEndian::read_u32(&data[data.len() - 4..]) as usize
        } else {
            data.len()
        }
    }

    /// Extensions sub-header: `(extension_type, payload)` pairs, present
    /// only when [`Event::has_extensions`] is set.
    pub fn extensions(&self) -> Vec<(u32, &'a [u8])> {
        if !self.has_extensions() {
            return Vec::new();
        }
        let offset = LittleEndian::read_u32(&self.data[self.data.len() - 4..]) as usize;
        if offset + 4 > self.data.len() {
            return Vec::new();
        }
        let count = LittleEndian::read_u32(&self.data[offset..]) as usize;
        let mut out = Vec::with_capacity(count);
        let mut cursor = offset + 4;
        for _ in 0..count {
            if cursor + 8 > self.data.len() {
                break;
            }
            let ext_type = LittleEndian::read_u32(&self.data[cursor..]);
            let size = LittleEndian::read_u32(&self.data[cursor + 4..]) as usize;
            let payload_start = cursor + 8;
            if payload_start + size > self.data.len() {
                break;
            }
            out.push((ext_type, &self.data[payload_start..payload_start + size]));
            cursor = payload_start + size;
        }
        out
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Validates every offset and size declared in the buffer (spec.md §8
    /// invariant 1).
    pub fn validate(&self) -> Result<(), EventValidationError> {
        let len = self.data.len();
        if len < event_header::FIXED_SIZE {
            return Err(EventValidationError::TooSmall { len });
        }

        let declared = self.size();
        if declared as usize != len {
            return Err(EventValidationError::SizeMismatch {
                declared,
                actual: len,
            });
        }

        let num_records = self.num_records();
        if num_records == 0 {
            return Err(EventValidationError::ZeroRecords);
        }

        if len < event_header::FIXED_SIZE + num_records as usize * 4 {
            return Err(EventValidationError::TooSmall { len });
        }

        let mut prev: Option<u32> = None;
        for i in 0..num_records as usize {
            let offset = self.record_index_entry(i);
            if let Some(prev_offset) = prev {
                if offset <= prev_offset {
                    return Err(EventValidationError::RecordIndexNotIncreasing {
                        i,
                        cur: offset,
                        prev: prev_offset,
                    });
                }
            }
            if offset as usize >= len {
                return Err(EventValidationError::RecordOffsetOutOfBounds { i, offset, len });
            }
            prev = Some(offset);
        }

        let extensions_or_end = Self::extensions_or_end(self.data);

        let mut last_record_end = 0usize;
        for (i, record) in self.records().enumerate() {
            let _ = &record;
            let offset = self.record_index_entry(i) as usize;
            let end = if i + 1 < num_records as usize {
                self.record_index_entry(i + 1) as usize
            } else {
                extensions_or_end
            };
            if Record::parse(&self.data[offset..end]).is_none() {
                return Err(EventValidationError::RecordUnparsable {
                    i,
                    offset: offset as u32,
                });
            }
            if !Record::parse(&self.data[offset..end]).unwrap().validate_sorted_index() {
                return Err(EventValidationError::SortedIndexInvalid { i });
            }
            last_record_end = end;
        }

        if last_record_end != extensions_or_end {
            return Err(EventValidationError::LastRecordMisaligned {
                record_end: last_record_end,
                extensions_offset: extensions_or_end,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EventBuilder;
    use crate::field::FieldType;
    use crate::prioritizer::DefaultPrioritizer;
    use crate::allocator::VecAllocator;

    #[test]
    fn validate_accepts_a_well_formed_single_record_event() {
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));
        builder.begin_event(100, 500, 42, 1).unwrap();
        builder.begin_record(1300, "SYSCALL", "", 1).unwrap();
        builder.add_field("uid", "0", None, FieldType::Uid).unwrap();
        builder.end_record().unwrap();
        builder.end_event().unwrap();

        let bytes = alloc.committed().unwrap();
        let event = Event::parse(bytes).unwrap();
        assert_eq!(event.id(), EventId::new(100, 500, 42));
        assert_eq!(event.num_records(), 1);
        let record = event.records().next().unwrap();
        assert_eq!(record.record_type, 1300);
        assert_eq!(record.find_field("uid").unwrap().raw(), "0");
    }

    #[test]
    fn validate_rejects_truncated_buffer() {
        let err = Event::parse(&[0u8; 4]).unwrap_err();
        assert_eq!(err, EventValidationError::TooSmall { len: 4 });
    }
}
