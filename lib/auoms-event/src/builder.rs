//! Streaming event construction (spec.md §4.1).
//!
//! The builder appends directly to the backing [`EventAllocator`]'s
//! growable buffer, patching offset tables in place as each record/field is
//! added, then finalizes the size word and (optionally) the priority at
//! [`EventBuilder::end_event`]. This mirrors the original `EventBuilder`'s
//! incremental-allocate-and-patch approach but without manual pointer
//! arithmetic: every write goes through small helpers that operate on
//! `Vec<u8>` offsets.

use byteorder::{ByteOrder, LittleEndian};
use snafu::Snafu;

use crate::field::FieldType;
use crate::layout::{self, event_header, field_header, record_header};
use crate::prioritizer::{EventDraftSummary, Prioritizer};
use crate::MAX_EVENT_SIZE;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum BuilderError {
    #[snafu(display("BeginEvent called while an event was already in progress"))]
    AlreadyStarted,

    #[snafu(display("operation requires an event to have been started with BeginEvent"))]
    NotStarted,

    #[snafu(display("operation requires a record to have been started with BeginRecord"))]
    NoRecordInProgress,

    #[snafu(display("BeginRecord called with num_fields == 0"))]
    ZeroFields,

    #[snafu(display("EndEvent called with num_records == 0"))]
    ZeroRecords,

    #[snafu(display("record name or text exceeds 65535 bytes including the terminating NUL"))]
    NameOrTextTooLong,

    #[snafu(display("field name exceeds 65535 bytes including the terminating NUL"))]
    FieldNameTooLong,

    #[snafu(display("EndRecord called after {} of {} declared fields were added", added, declared))]
    RecordCountMismatch { added: u16, declared: u16 },

    #[snafu(display("EndEvent called after {} of {} declared records were added", added, declared))]
    EventRecordCountMismatch { added: u16, declared: u16 },

    #[snafu(display("AddField called after all {} declared fields were already added", declared))]
    TooManyFields { declared: u16 },

    #[snafu(display("BeginRecord called after all {} declared records were already added", declared))]
    TooManyRecords { declared: u16 },

    #[snafu(display("event would exceed the {} byte item size limit", limit))]
    ItemTooLarge { limit: usize },

    #[snafu(display("extensions may only be added after all records have been ended"))]
    ExtensionsBeforeRecordsComplete,

    #[snafu(display("EndExtensions called after {} of {} declared extensions were added", added, declared))]
    ExtensionCountMismatch { added: u16, declared: u16 },

    #[snafu(display("the allocator reported the queue is closed"))]
    QueueClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InEvent,
    InRecord,
    AfterRecords,
    InExtensions,
}

struct RecordScratch {
    roffset: usize,
    num_fields_declared: u16,
    fields_added: u16,
    insertion_offsets: Vec<u32>,
}

pub struct EventBuilder<'a, A, P> {
    allocator: &'a mut A,
    prioritizer: P,
    state: State,
    num_records_declared: u16,
    records_added: u16,
    record_index_offsets: Vec<usize>, // byte position of each record_index[i] slot in the buffer
    record: Option<RecordScratch>,
    summary: EventDraftSummary,
    extensions_offset: usize,
    num_extensions_declared: u16,
    extensions_added: u16,
}

impl<'a, A, P> EventBuilder<'a, A, P>
where
    A: crate::allocator::EventAllocator,
    P: Prioritizer,
{
    pub fn new(allocator: &'a mut A, prioritizer: P) -> Self {
        EventBuilder {
            allocator,
            prioritizer,
            state: State::Idle,
            num_records_declared: 0,
            records_added: 0,
            record_index_offsets: Vec::new(),
            record: None,
            summary: EventDraftSummary::default(),
            extensions_offset: 0,
            num_extensions_declared: 0,
            extensions_added: 0,
        }
    }

    fn buf(&mut self) -> &mut Vec<u8> {
        self.allocator.buffer_mut()
    }

    pub fn begin_event(
        &mut self,
        seconds: u64,
        milliseconds: u32,
        serial: u64,
        num_records: u16,
    ) -> Result<(), BuilderError> {
        if self.state != State::Idle {
            return Err(BuilderError::AlreadyStarted);
        }
        if num_records == 0 {
            return Err(BuilderError::ZeroRecords);
        }

        self.buf().clear();
        self.num_records_declared = num_records;
        self.records_added = 0;
        self.record_index_offsets.clear();
        self.record = None;
        self.summary = EventDraftSummary::default();
        self.extensions_offset = 0;
        self.num_extensions_declared = 0;
        self.extensions_added = 0;

        {
            let buf = self.buf();
            buf.resize(event_header::FIXED_SIZE, 0);
            // size+version patched in end_event; write version now so a
            // reader inspecting an unfinished (size=0) tombstone still sees it.
            LittleEndian::write_u32(
                &mut buf[event_header::SIZE_VERSION..],
                layout::pack_size_version(0, layout::VERSION),
            );
            LittleEndian::write_u64(&mut buf[event_header::SECONDS..], seconds);
            LittleEndian::write_u32(&mut buf[event_header::MILLISECONDS..], milliseconds);
            LittleEndian::write_u64(&mut buf[event_header::SERIAL..], serial);
            LittleEndian::write_u16(&mut buf[event_header::NUM_RECORDS..], num_records);
            LittleEndian::write_u16(&mut buf[event_header::PRIORITY..], 0);
            LittleEndian::write_u16(&mut buf[event_header::FLAGS..], 0);
            LittleEndian::write_i32(&mut buf[event_header::PID..], -1);

            for i in 0..num_records as usize {
                let offset = event_header::RECORD_INDEX + i * 4;
                self.record_index_offsets.push(offset);
            }
            buf.resize(event_header::RECORD_INDEX + num_records as usize * 4, 0);
        }

        self.state = State::InEvent;
        Ok(())
    }

    pub fn set_event_priority(&mut self, priority: u16) -> Result<(), BuilderError> {
        self.require_started()?;
        let buf = self.buf();
        LittleEndian::write_u16(&mut buf[event_header::PRIORITY..], priority);
        Ok(())
    }

    pub fn add_event_flags(&mut self, flags: u16) -> Result<(), BuilderError> {
        self.require_started()?;
        let buf = self.buf();
        let current = LittleEndian::read_u16(&buf[event_header::FLAGS..]);
        LittleEndian::write_u16(&mut buf[event_header::FLAGS..], current | flags);
        Ok(())
    }

    pub fn set_event_pid(&mut self, pid: i32) -> Result<(), BuilderError> {
        self.require_started()?;
        let buf = self.buf();
        LittleEndian::write_i32(&mut buf[event_header::PID..], pid);
        Ok(())
    }

    fn require_started(&self) -> Result<(), BuilderError> {
        if self.state == State::Idle {
            return Err(BuilderError::NotStarted);
        }
        Ok(())
    }

    pub fn begin_record(
        &mut self,
        record_type: u32,
        name: &str,
        text: &str,
        num_fields: u16,
    ) -> Result<(), BuilderError> {
        match self.state {
            State::InEvent | State::AfterRecords => {}
            State::Idle => return Err(BuilderError::NotStarted),
            _ => return Err(BuilderError::NoRecordInProgress),
        }
        if num_fields == 0 {
            return Err(BuilderError::ZeroFields);
        }
        if self.records_added >= self.num_records_declared {
            return Err(BuilderError::TooManyRecords {
                declared: self.num_records_declared,
            });
        }

        let name_size = name.len() + 1;
        let text_size = text.len() + 1;
        if name_size > u16::MAX as usize || text_size > u16::MAX as usize {
            return Err(BuilderError::NameOrTextTooLong);
        }

        self.summary.record_types.push(record_type);
        if name.eq_ignore_ascii_case("SYSCALL") {
            // syscall name is filled in once the `syscall` field is added.
        }

        let roffset;
        {
            let buf = self.buf();
            roffset = buf.len();

            let index_bytes = 4usize * num_fields as usize;
            let header_len = record_header::FIXED_SIZE + 2 * index_bytes + name_size + text_size;
            buf.resize(roffset + header_len, 0);

            LittleEndian::write_u32(&mut buf[roffset + record_header::RECORD_TYPE..], record_type);
            LittleEndian::write_u16(&mut buf[roffset + record_header::NUM_FIELDS..], num_fields);
            LittleEndian::write_u16(&mut buf[roffset + record_header::NAME_SIZE..], name_size as u16);
            LittleEndian::write_u16(&mut buf[roffset + record_header::TEXT_SIZE..], text_size as u16);

            let name_start = roffset + record_header::INSERTION_INDEX + 2 * index_bytes;
            buf[name_start..name_start + name.len()].copy_from_slice(name.as_bytes());
            buf[name_start + name_size - 1] = 0;

            let text_start = name_start + name_size;
            buf[text_start..text_start + text.len()].copy_from_slice(text.as_bytes());
            buf[text_start + text_size - 1] = 0;
        }

        if let Some(offset) = self.record_index_offsets.get(self.records_added as usize).copied() {
            let buf = self.buf();
            LittleEndian::write_u32(&mut buf[offset..], roffset as u32);
        }

        self.record = Some(RecordScratch {
            roffset,
            num_fields_declared: num_fields,
            fields_added: 0,
            insertion_offsets: Vec::with_capacity(num_fields as usize),
        });
        self.state = State::InRecord;
        Ok(())
    }

    pub fn add_field(
        &mut self,
        name: &str,
        raw: &str,
        interp: Option<&str>,
        field_type: FieldType,
    ) -> Result<(), BuilderError> {
        if self.state != State::InRecord {
            return Err(BuilderError::NoRecordInProgress);
        }

        let name_size = name.len() + 1;
        if name_size > u16::MAX as usize {
            return Err(BuilderError::FieldNameTooLong);
        }
        let raw_size = raw.len() + 1;
        let interp_size = interp.map(|s| s.len() + 1).unwrap_or(0);

        {
            let record = self.record.as_mut().expect("InRecord state implies record scratch");
            if record.fields_added >= record.num_fields_declared {
                return Err(BuilderError::TooManyFields {
                    declared: record.num_fields_declared,
                });
            }
        }

        let roffset = self.record.as_ref().unwrap().roffset;
        let field_offset;
        {
            let buf = self.buf();
            field_offset = buf.len() - roffset;
            let total = field_header::FIXED_SIZE + name_size + raw_size + interp_size;
            let start = buf.len();
            buf.resize(start + total, 0);

            LittleEndian::write_u16(&mut buf[start + field_header::FIELD_TYPE..], field_type.to_wire());
            LittleEndian::write_u16(&mut buf[start + field_header::NAME_SIZE..], name_size as u16);
            LittleEndian::write_u32(&mut buf[start + field_header::RAW_SIZE..], raw_size as u32);
            LittleEndian::write_u32(&mut buf[start + field_header::INTERP_SIZE..], interp_size as u32);

            let name_start = start + field_header::FIXED_SIZE;
            buf[name_start..name_start + name.len()].copy_from_slice(name.as_bytes());
            buf[name_start + name_size - 1] = 0;

            let raw_start = name_start + name_size;
            buf[raw_start..raw_start + raw.len()].copy_from_slice(raw.as_bytes());
            buf[raw_start + raw_size - 1] = 0;

            if let Some(interp) = interp {
                let interp_start = raw_start + raw_size;
                buf[interp_start..interp_start + interp.len()].copy_from_slice(interp.as_bytes());
                buf[interp_start + interp_size - 1] = 0;
            }

            if self.allocator.buffer_mut().len() > MAX_EVENT_SIZE {
                return Err(BuilderError::ItemTooLarge { limit: MAX_EVENT_SIZE });
            }
        }

        if name.eq_ignore_ascii_case("syscall") {
            self.summary.syscall_name = Some(raw.to_string());
        }

        let record = self.record.as_mut().unwrap();
        let idx_slot = roffset + record_header::INSERTION_INDEX + record.fields_added as usize * 4;
        {
            let buf = self.buf();
            LittleEndian::write_u32(&mut buf[idx_slot..], field_offset as u32);
        }
        record.insertion_offsets.push(field_offset as u32);
        record.fields_added += 1;

        Ok(())
    }

    pub fn end_record(&mut self) -> Result<(), BuilderError> {
        let record = match self.record.take() {
            Some(r) => r,
            None => return Err(BuilderError::NoRecordInProgress),
        };
        if record.fields_added != record.num_fields_declared {
            self.record = Some(record);
            let (added, declared) = {
                let r = self.record.as_ref().unwrap();
                (r.fields_added, r.num_fields_declared)
            };
            return Err(BuilderError::RecordCountMismatch { added, declared });
        }

        let roffset = record.roffset;
        let mut sorted: Vec<(u32, String)> = {
            let buf = self.buf();
            record
                .insertion_offsets
                .iter()
                .map(|&off| {
                    let name = read_field_name(buf, roffset, off as usize);
                    (off, name)
                })
                .collect()
        };
        // Stable sort by field name, mirroring the original's `strcmp`
        // comparator over a copy of the insertion index.
        sorted.sort_by(|a, b| a.1.cmp(&b.1));

        let num_fields = record.num_fields_declared as usize;
        let sorted_index_start = roffset + record_header::INSERTION_INDEX + num_fields * 4;
        let buf = self.buf();
        for (i, (offset, _)) in sorted.into_iter().enumerate() {
            LittleEndian::write_u32(&mut buf[sorted_index_start + i * 4..], offset);
        }

        self.records_added += 1;
        self.state = if self.records_added == self.num_records_declared {
            State::AfterRecords
        } else {
            State::InEvent
        };
        Ok(())
    }

    pub fn begin_extensions(&mut self, num_extensions: u16) -> Result<(), BuilderError> {
        if self.state != State::AfterRecords {
            return Err(BuilderError::ExtensionsBeforeRecordsComplete);
        }
        let buf = self.buf();
        self.extensions_offset = buf.len();
        buf.extend_from_slice(&num_extensions.to_le_bytes());
        buf.extend_from_slice(&[0, 0]); // pad to 4-byte count field matching `u32` count on wire
        self.num_extensions_declared = num_extensions;
        self.extensions_added = 0;
        self.state = State::InExtensions;
        Ok(())
    }

    pub fn add_extension(&mut self, ext_type: u32, payload: &[u8]) -> Result<(), BuilderError> {
        if self.state != State::InExtensions {
            return Err(BuilderError::ExtensionsBeforeRecordsComplete);
        }
        if self.extensions_added >= self.num_extensions_declared {
            return Err(BuilderError::ExtensionCountMismatch {
                added: self.extensions_added,
                declared: self.num_extensions_declared,
            });
        }
        let buf = self.buf();
        buf.extend_from_slice(&ext_type.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        self.extensions_added += 1;
        Ok(())
    }

    pub fn end_extensions(&mut self) -> Result<(), BuilderError> {
        if self.state != State::InExtensions {
            return Err(BuilderError::ExtensionsBeforeRecordsComplete);
        }
        if self.extensions_added != self.num_extensions_declared {
            return Err(BuilderError::ExtensionCountMismatch {
                added: self.extensions_added,
                declared: self.num_extensions_declared,
            });
        }
        self.add_event_flags(crate::event_flags::HAS_EXTENSIONS)?;
        // The trailing u32 at `event_size - 4` always holds the byte offset
        // of the extensions sub-header (spec.md §9 open question).
        let offset = self.extensions_offset as u32;
        let buf = self.buf();
        buf.extend_from_slice(&offset.to_le_bytes());
        self.state = State::AfterRecords;
        Ok(())
    }

    pub fn end_event(&mut self) -> Result<(), BuilderError> {
        if self.state != State::AfterRecords {
            if self.records_added != self.num_records_declared {
                return Err(BuilderError::EventRecordCountMismatch {
                    added: self.records_added,
                    declared: self.num_records_declared,
                });
            }
            return Err(BuilderError::NoRecordInProgress);
        }

        let size = self.allocator.buffer_mut().len();
        if size > MAX_EVENT_SIZE {
            return Err(BuilderError::ItemTooLarge { limit: MAX_EVENT_SIZE });
        }

        let priority = self.prioritizer.prioritize(&self.summary);
        {
            let buf = self.buf();
            LittleEndian::write_u32(
                &mut buf[event_header::SIZE_VERSION..],
                layout::pack_size_version(size as u32, layout::VERSION),
            );
            LittleEndian::write_u16(&mut buf[event_header::PRIORITY..], priority);
        }

        self.allocator.commit().map_err(|_| BuilderError::QueueClosed)?;
        self.state = State::Idle;
        Ok(())
    }

    pub fn cancel_event(&mut self) {
        if self.state == State::Idle {
            return;
        }
        {
            let buf = self.buf();
            if buf.len() >= event_header::SIZE_VERSION + 4 {
                LittleEndian::write_u32(&mut buf[event_header::SIZE_VERSION..], 0);
            }
        }
        self.allocator.rollback();
        self.state = State::Idle;
        self.record = None;
    }
}

fn read_field_name(buf: &[u8], roffset: usize, field_offset: usize) -> String {
    let start = roffset + field_offset + field_header::FIXED_SIZE;
    let name_size = LittleEndian::read_u16(&buf[roffset + field_offset + field_header::NAME_SIZE..]) as usize;
    let end = (start + name_size).min(buf.len());
    let raw = &buf[start..end];
    let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..nul]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::VecAllocator;
    use crate::event::Event;
    use crate::prioritizer::DefaultPrioritizer;

    fn build_simple() -> Vec<u8> {
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));
        builder.begin_event(1, 2, 3, 1).unwrap();
        builder.begin_record(1300, "SYSCALL", "raw text", 2).unwrap();
        builder.add_field("zeta", "1", None, FieldType::Unclassified).unwrap();
        builder.add_field("alpha", "2", None, FieldType::Unclassified).unwrap();
        builder.end_record().unwrap();
        builder.end_event().unwrap();
        alloc.take_committed().unwrap()
    }

    #[test]
    fn zero_records_is_rejected() {
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));
        assert_eq!(builder.begin_event(1, 0, 1, 0), Err(BuilderError::ZeroRecords));
    }

    #[test]
    fn end_event_finalizes_a_valid_buffer() {
        let bytes = build_simple();
        let event = Event::parse(&bytes).unwrap();
        assert_eq!(event.num_records(), 1);
        let record = event.records().next().unwrap();
        assert_eq!(record.num_fields(), 2);
        // sorted_index places "alpha" before "zeta" though it was added second
        let mut names: Vec<&str> = record.fields_in_sorted_order().map(|f| f.name()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        names.clear();
    }

    #[test]
    fn record_count_mismatch_is_rejected() {
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));
        builder.begin_event(1, 0, 1, 2).unwrap();
        builder.begin_record(1, "A", "", 1).unwrap();
        builder.add_field("f", "v", None, FieldType::Unclassified).unwrap();
        builder.end_record().unwrap();
        assert_eq!(
            builder.end_event(),
            Err(BuilderError::EventRecordCountMismatch { added: 1, declared: 2 })
        );
    }

    #[test]
    fn cancel_event_writes_size_zero_and_rolls_back() {
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));
        builder.begin_event(1, 0, 1, 1).unwrap();
        builder.cancel_event();
        assert!(alloc.committed().is_none());
    }
}
