//! Fan-out of queued events to downstream consumers over UNIX-domain
//! sockets (spec.md §4.6 "Output & Ack").
//!
//! One [`Output`] owns a durable [`auoms_queue::Queue`] cursor, an
//! [`auoms_common::writer::EventWriter`], a [`socket::UnixDomainWriter`],
//! and an optional [`ack::AckQueue`] for in-flight acknowledgement
//! tracking. [`raw_writer::RawEventWriter`] is the one wire format this
//! crate ships (spec.md §6 "raw"); JSON/msgpack/syslog/fluent flavors are
//! sibling `EventWriter` impls spec.md §1 puts out of scope.

pub mod ack;
pub mod error;
pub mod filter;
pub mod output;
pub mod raw_writer;
pub mod socket;

pub use ack::{AckQueue, PendingAck};
pub use error::OutputError;
pub use filter::{MaxPriorityFilter, NullFilter, OutputFilter};
pub use output::{Output, OutputConfig, OutputHandle};
pub use raw_writer::RawEventWriter;
pub use socket::UnixDomainWriter;
