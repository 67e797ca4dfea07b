//! The `EventWriter` capability contract (spec.md §6).
//!
//! The original source expresses `RawEventWriter`, `OMSEventWriter`,
//! `SyslogEventWriter` and `FluentEventWriter` as siblings under a
//! multiple-inheritance `WriterBase`/`IEventWriter` hierarchy. Per spec.md
//! §9's redesign note, we replace that with one trait implemented by sibling
//! types; this crate ships only the `raw` flavor (the JSON/syslog/fluent
//! flavors are named out of scope in spec.md §1).

use std::io::{self, Write};

/// `(seconds, milliseconds, serial)` — unique per host, monotonically
/// non-decreasing (spec.md §3 "Event identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub seconds: u64,
    pub milliseconds: u32,
    pub serial: u64,
}

impl EventId {
    pub const fn new(seconds: u64, milliseconds: u32, serial: u64) -> Self {
        EventId {
            seconds,
            milliseconds,
            serial,
        }
    }
}

/// Outcome of [`EventWriter::write_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Bytes were written successfully.
    Ok(usize),
    /// The writer filtered the event; it was not written, and no ack slot
    /// should be consumed for it.
    Noop,
    /// The write failed; the output should treat its transport as
    /// disconnected and reconnect.
    Failed,
}

/// Implemented by every output wire format. One `EventWriter` instance is
/// owned by one [`crate::Gate`]-guarded `Output` loop (see `auoms-output`).
pub trait EventWriter: Send {
    /// Whether this writer's peer protocol supports acknowledgements.
    fn supports_ack_mode(&self) -> bool;

    /// Writes one event buffer (spec.md §3 layout) to `sink`.
    fn write_event(&mut self, event: &[u8], sink: &mut dyn Write) -> io::Result<WriteOutcome>;

    /// Reads one acknowledgement from `source`. Only called when
    /// [`EventWriter::supports_ack_mode`] returns `true`.
    fn read_ack(&mut self, source: &mut dyn io::Read) -> io::Result<EventId>;
}
