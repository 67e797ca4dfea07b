//! Record parsing (spec.md §3 "Each record").
//!
//! `insertion_index`/`sorted_index` entries are byte offsets relative to the
//! *record's* own start (not the event buffer start), matching the
//! original's `FIELD_TYPE(data, record_offset, field_offset)` addressing
//! scheme.

use byteorder::{ByteOrder, LittleEndian};

use crate::field::Field;
use crate::layout::record_header;

#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub record_type: u32,
    num_fields: u16,
    insertion_index: &'a [u8],
    sorted_index: &'a [u8],
    name_raw: &'a [u8],
    text_raw: &'a [u8],
    record_start: &'a [u8],
}

impl<'a> Record<'a> {
    /// Parses a record occupying `buf[0..record_len]`, where `buf` begins
    /// exactly at the record's start.
    pub fn parse(buf: &'a [u8]) -> Option<Record<'a>> {
        if buf.len() < record_header::FIXED_SIZE {
            return None;
        }
        let record_type = LittleEndian::read_u32(&buf[record_header::RECORD_TYPE..]);
        let num_fields = LittleEndian::read_u16(&buf[record_header::NUM_FIELDS..]);
        let name_size = LittleEndian::read_u16(&buf[record_header::NAME_SIZE..]) as usize;
        let text_size = LittleEndian::read_u16(&buf[record_header::TEXT_SIZE..]) as usize;

        let index_bytes = 4usize * num_fields as usize;
        let insertion_start = record_header::INSERTION_INDEX;
        let sorted_start = insertion_start + index_bytes;
        let name_start = sorted_start + index_bytes;
        let text_start = name_start + name_size;
        let fields_start = text_start + text_size;

        if buf.len() < fields_start {
            return None;
        }

        Some(Record {
            record_type,
            num_fields,
            insertion_index: &buf[insertion_start..sorted_start],
            sorted_index: &buf[sorted_start..name_start],
            name_raw: strip_nul(&buf[name_start..text_start]),
            text_raw: strip_nul(&buf[text_start..fields_start]),
            record_start: buf,
        })
    }

    pub fn num_fields(&self) -> u16 {
        self.num_fields
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(self.name_raw).unwrap_or("")
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(self.text_raw).unwrap_or("")
    }

    fn field_offset(index_table: &[u8], i: usize) -> usize {
        LittleEndian::read_u32(&index_table[i * 4..]) as usize
    }

    /// Iterates fields in the order they were added to the builder.
    pub fn fields_in_insertion_order(&self) -> impl Iterator<Item = Field<'a>> + '_ {
        (0..self.num_fields as usize).filter_map(move |i| {
            let offset = Self::field_offset(self.insertion_index, i);
            Field::parse(&self.record_start[offset..]).map(|(f, _)| f)
        })
    }

    /// Iterates fields in name-sorted order (spec.md §3 `sorted_index`).
    pub fn fields_in_sorted_order(&self) -> impl Iterator<Item = Field<'a>> + '_ {
        (0..self.num_fields as usize).filter_map(move |i| {
            let offset = Self::field_offset(self.sorted_index, i);
            Field::parse(&self.record_start[offset..]).map(|(f, _)| f)
        })
    }

    /// Binary-searches `sorted_index` for a field by name (spec.md §3:
    /// "sorted ... for binary search").
    pub fn find_field(&self, name: &str) -> Option<Field<'a>> {
        let n = self.num_fields as usize;
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let offset = Self::field_offset(self.sorted_index, mid);
            let (field, _) = Field::parse(&self.record_start[offset..])?;
            match field.name().cmp(name) {
                std::cmp::Ordering::Equal => return Some(field),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// Validates that `sorted_index` is a permutation of `insertion_index`
    /// ordered lexicographically by field name (spec.md §8 invariant 2).
    pub fn validate_sorted_index(&self) -> bool {
        let mut insertion_offsets: Vec<usize> = (0..self.num_fields as usize)
            .map(|i| Self::field_offset(self.insertion_index, i))
            .collect();
        let mut sorted_offsets: Vec<usize> = (0..self.num_fields as usize)
            .map(|i| Self::field_offset(self.sorted_index, i))
            .collect();
        insertion_offsets.sort_unstable();
        sorted_offsets.sort_unstable();
        if insertion_offsets != sorted_offsets {
            return false;
        }

        let mut prev: Option<String> = None;
        for field in self.fields_in_sorted_order() {
            if let Some(p) = &prev {
                if p.as_str() > field.name() {
                    return false;
                }
            }
            prev = Some(field.name().to_string());
        }
        true
    }
}

fn strip_nul(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(pos) => &buf[..pos],
        None => buf,
    }
}
