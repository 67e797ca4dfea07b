//! Optional per-output filter (spec.md §4.6 step 3: "If filtered (optional
//! per-output filter), drop without consuming ack slot").
//!
//! Distinct from an [`auoms_common::writer::EventWriter`]'s own `Noop`
//! outcome (spec.md §4.6 step 4: "writer filtered"): this filter runs
//! *before* the writer is ever invoked, so a dropped event never reaches
//! the wire format at all and, in ack mode, never occupies an ack slot
//! either way — both paths end up not consuming one, but this one is
//! configured on the `Output` itself rather than on the writer.

use auoms_event::Event;

/// Decides whether an event reaches the writer at all.
pub trait OutputFilter: Send {
    /// Returns `true` to keep (write) the event, `false` to drop it.
    fn keep(&self, event: Event<'_>) -> bool;
}

/// Keeps everything; the default when an output has no filter configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFilter;

impl OutputFilter for NullFilter {
    fn keep(&self, _event: Event<'_>) -> bool {
        true
    }
}

/// Drops events whose priority is numerically greater than (i.e. lower
/// priority than) `max_priority`. Grounded in the original's per-output
/// `MaxPriority` filter knob.
#[derive(Debug, Clone, Copy)]
pub struct MaxPriorityFilter {
    pub max_priority: u16,
}

impl OutputFilter for MaxPriorityFilter {
    fn keep(&self, event: Event<'_>) -> bool {
        event.priority() <= self.max_priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_filter_keeps_everything() {
        let event_bytes = minimal_event_bytes(3);
        let event = Event::from_raw(&event_bytes);
        assert!(NullFilter.keep(event));
    }

    #[test]
    fn max_priority_filter_drops_lower_priority_events() {
        let event_bytes = minimal_event_bytes(5);
        let event = Event::from_raw(&event_bytes);
        let filter = MaxPriorityFilter { max_priority: 2 };
        assert!(!filter.keep(event));
    }

    /// Builds just enough of a header for `.priority()` to be readable;
    /// not a valid full event (tests here don't call `.validate()`).
    fn minimal_event_bytes(priority: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 40];
        buf[26] = (priority & 0xFF) as u8;
        buf[27] = (priority >> 8) as u8;
        buf
    }
}
