//! The growable-byte-region seam the [`crate::builder::EventBuilder`]
//! writes into (spec.md §4.1 intro: "a streaming API backed by an
//! allocator that returns a growable byte region").
//!
//! `auoms-queue` implements this trait directly against a bucket's backing
//! storage so that a built event lands in the queue without an extra copy;
//! tests and the process-inventory side channel use [`VecAllocator`], a
//! plain in-memory implementation.

use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
pub enum AllocatorError {
    #[snafu(display("queue is closed"))]
    QueueClosed,
}

/// Backing store for one in-progress event.
///
/// The builder appends bytes to [`EventAllocator::buffer_mut`] as it goes;
/// [`EventAllocator::commit`] publishes the buffer's current contents as a
/// finished item, and [`EventAllocator::rollback`] discards them.
pub trait EventAllocator {
    type Error: std::fmt::Debug;

    /// The growable scratch buffer for the event currently under
    /// construction. Implementations should clear it lazily on the next
    /// `begin`, not eagerly on `commit`/`rollback`, so a caller can inspect
    /// a just-committed buffer's bytes (tests rely on this).
    fn buffer_mut(&mut self) -> &mut Vec<u8>;

    /// Commits the buffer's current contents as a finished item.
    fn commit(&mut self) -> Result<(), Self::Error>;

    /// Discards whatever has been written since the buffer was last reset.
    fn rollback(&mut self);
}

/// A plain `Vec<u8>`-backed allocator. Used by tests and by the
/// process-inventory side channel, which builds events destined for the
/// same queue `Put` path as everything else rather than a zero-copy slot.
#[derive(Default)]
pub struct VecAllocator {
    buffer: Vec<u8>,
    committed: Option<Vec<u8>>,
}

impl VecAllocator {
    pub fn committed(&self) -> Option<&[u8]> {
        self.committed.as_deref()
    }

    pub fn take_committed(&mut self) -> Option<Vec<u8>> {
        self.committed.take()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.committed = None;
    }
}

impl EventAllocator for VecAllocator {
    type Error = AllocatorError;

    fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        self.committed = Some(std::mem::take(&mut self.buffer));
        Ok(())
    }

    fn rollback(&mut self) {
        self.buffer.clear();
    }
}
