//! Output-loop error type (spec.md §7: "Outputs surface only `QueueClosed`
//! and disconnected socket to their controller; all content errors become
//! writer logs").

use snafu::Snafu;

use auoms_queue::QueueError;

#[derive(Debug, Snafu)]
pub enum OutputError {
    #[snafu(display("the priority queue has been closed"))]
    QueueClosed,

    #[snafu(display("queue operation failed: {}", source))]
    Queue { source: QueueError },

    #[snafu(display("failed to clone output socket fd for the ack reader: {}", source))]
    CloneSocket { source: std::io::Error },
}

impl From<QueueError> for OutputError {
    fn from(source: QueueError) -> Self {
        match source {
            QueueError::QueueClosed => OutputError::QueueClosed,
            other => OutputError::Queue { source: other },
        }
    }
}
