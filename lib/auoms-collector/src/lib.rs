//! Raw audit record intake: the SPSC hand-off queue, the accumulator that
//! turns raw kernel records into built events, and the two collectors
//! (netlink and stdin) that feed it (spec.md §4.2, §4.3, §4.4).

pub mod accumulator;
pub mod audit_line;
pub mod netlink;
pub mod parser;
pub mod spsc;
pub mod stdin_source;

pub use accumulator::{Accumulator, AccumulatorConfig, AccumulatorError};
pub use netlink::{NetlinkCollector, NetlinkConfig, NetlinkError};
pub use spsc::SpscQueue;
