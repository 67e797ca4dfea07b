//! Queue-wide error type (spec.md §7: "`QueueClosed` is a first-class
//! variant on `QueueError` ... not a sentinel").

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

use crate::bucket::BucketError;
use crate::cursor::CursorError;

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("the queue has been closed"))]
    QueueClosed,

    #[snafu(display("item of {} bytes exceeds the 256 KiB item size limit", size))]
    ItemTooLarge { size: usize },

    #[snafu(display("priority {} is out of range (queue has {} priorities)", priority, num_priorities))]
    InvalidPriority { priority: u32, num_priorities: u32 },

    #[snafu(display("failed to create queue directory {}: {}", path.display(), source))]
    CreateDir { path: PathBuf, source: io::Error },

    #[snafu(display("failed to list queue directory {}: {}", path.display(), source))]
    ListDir { path: PathBuf, source: io::Error },

    #[snafu(display("queue bucket I/O failed: {}", source))]
    Bucket { source: BucketError },

    #[snafu(display("queue cursor I/O failed: {}", source))]
    Cursor { source: CursorError },

    #[snafu(display("failed to sample filesystem usage at {}: {}", path.display(), source))]
    Statvfs { path: PathBuf, source: io::Error },
}

impl From<BucketError> for QueueError {
    fn from(source: BucketError) -> Self {
        QueueError::Bucket { source }
    }
}

impl From<CursorError> for QueueError {
    fn from(source: CursorError) -> Self {
        QueueError::Cursor { source }
    }
}
