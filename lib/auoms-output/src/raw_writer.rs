//! The `raw` `EventWriter` (spec.md §6 "Output socket protocol (raw)").
//!
//! Every message is a full event buffer (spec.md §3) prefixed by its own
//! size in the first 4 bytes; an ack is 20 bytes: `u64 sec || u32 msec ||
//! u64 serial`, acknowledging all events with id `<=` this. The JSON/
//! msgpack/syslog/fluent flavors spec.md §1 lists as out of scope are
//! siblings of this type behind the same [`EventWriter`] trait, not
//! subclasses of it (spec.md §9 redesign note on "multiple inheritance of
//! writer bases").

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use auoms_common::writer::{EventId, EventWriter, WriteOutcome};
use auoms_event::Event;

/// Byte length of the raw ack frame (spec.md §6).
pub const ACK_FRAME_SIZE: usize = 20;
/// Byte length of the size prefix on each framed event.
const SIZE_PREFIX_LEN: usize = 4;

#[derive(Debug, Default)]
pub struct RawEventWriter {
    /// Optional per-output filter; `None` passes everything through
    /// (spec.md §4.6 step 3).
    filter: Option<Box<dyn Fn(Event<'_>) -> bool + Send>>,
}

impl RawEventWriter {
    pub fn new() -> Self {
        RawEventWriter { filter: None }
    }

    pub fn with_filter(filter: impl Fn(Event<'_>) -> bool + Send + 'static) -> Self {
        RawEventWriter {
            filter: Some(Box::new(filter)),
        }
    }
}

impl EventWriter for RawEventWriter {
    fn supports_ack_mode(&self) -> bool {
        true
    }

    fn write_event(&mut self, event: &[u8], sink: &mut dyn Write) -> io::Result<WriteOutcome> {
        if let Some(filter) = &self.filter {
            match Event::parse(event) {
                Ok(parsed) if !filter(parsed) => return Ok(WriteOutcome::Noop),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%err, "dropping unparsable event instead of writing it");
                    return Ok(WriteOutcome::Noop);
                }
            }
        }

        let mut prefix = [0u8; SIZE_PREFIX_LEN];
        LittleEndian::write_u32(&mut prefix, event.len() as u32);
        if let Err(err) = sink.write_all(&prefix).and_then(|_| sink.write_all(event)) {
            tracing::debug!(%err, "write_event failed, treating transport as disconnected");
            return Ok(WriteOutcome::Failed);
        }
        Ok(WriteOutcome::Ok(prefix.len() + event.len()))
    }

    fn read_ack(&mut self, source: &mut dyn Read) -> io::Result<EventId> {
        let mut buf = [0u8; ACK_FRAME_SIZE];
        source.read_exact(&mut buf)?;
        let seconds = LittleEndian::read_u64(&buf[0..8]);
        let milliseconds = LittleEndian::read_u32(&buf[8..12]);
        let serial = LittleEndian::read_u64(&buf[12..20]);
        Ok(EventId::new(seconds, milliseconds, serial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_ack_bytes(id: EventId) -> [u8; ACK_FRAME_SIZE] {
        let mut buf = [0u8; ACK_FRAME_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], id.seconds);
        LittleEndian::write_u32(&mut buf[8..12], id.milliseconds);
        LittleEndian::write_u64(&mut buf[12..20], id.serial);
        buf
    }

    #[test]
    fn write_event_prefixes_with_its_own_length() {
        let mut writer = RawEventWriter::new();
        let event = b"not-really-an-event-but-bytes-are-bytes";
        let mut sink = Vec::new();
        let outcome = writer.write_event(event, &mut sink).unwrap();
        assert_eq!(outcome, WriteOutcome::Ok(4 + event.len()));
        assert_eq!(LittleEndian::read_u32(&sink[0..4]) as usize, event.len());
        assert_eq!(&sink[4..], event);
    }

    #[test]
    fn read_ack_decodes_sec_msec_serial() {
        let mut writer = RawEventWriter::new();
        let id = EventId::new(1521757638, 392, 262332);
        let bytes = sample_ack_bytes(id);
        let mut cursor = Cursor::new(bytes);
        let decoded = writer.read_ack(&mut cursor).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn write_event_reports_failed_on_broken_pipe() {
        struct AlwaysFails;
        impl Write for AlwaysFails {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut writer = RawEventWriter::new();
        let mut sink = AlwaysFails;
        let outcome = writer.write_event(b"event", &mut sink).unwrap();
        assert_eq!(outcome, WriteOutcome::Failed);
    }
}
