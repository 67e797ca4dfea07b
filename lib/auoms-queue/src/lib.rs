//! Multi-priority, bounded, crash-recoverable durable FIFO queue (spec.md
//! §4.5) with multiple independent reader cursors (spec.md §4.5 "Cursor
//! durability") and filesystem-quota-aware spill (spec.md §4.5 "Saver
//! algorithm").
//!
//! [`Queue`] implements [`auoms_event::EventAllocator`] via
//! [`allocator::QueueAllocator`], so an `EventBuilder` can write directly
//! into it as its backing store.

pub mod allocator;
pub mod bucket;
pub mod cursor;
pub mod error;
pub mod file_format;
pub mod queue;

pub use allocator::QueueAllocator;
pub use error::QueueError;
pub use queue::{PutOutcome, Queue, QueueConfig, SaveStats, MAX_ITEM_SIZE};
