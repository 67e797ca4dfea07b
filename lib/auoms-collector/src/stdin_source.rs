//! Alternative intake for "audit dispatcher" mode: newline-delimited raw
//! records read from file descriptor 0 instead of the netlink socket
//! (spec.md §4.4 "Alternative intake: stdin").
//!
//! `auditd`'s dispatcher plugin protocol appends an auparse-interpreted copy
//! of the line after a `0x1D` (group separator) byte; we only want the raw
//! half, so everything from the first `0x1D` onward is dropped before the
//! line is handed to the SPSC queue.

use std::io::{BufRead, BufReader, Read};

use crate::spsc::SpscQueue;

const GROUP_SEPARATOR: u8 = 0x1D;

/// Reads newline-delimited records from `source` until EOF or `should_stop`
/// returns true, pushing each stripped record into `queue`. Unlike the
/// netlink collector's tagged frames, stdin records carry no leading type
/// tag: the accumulator is expected to parse the `audit(...)` header itself
/// for record typing in this mode (the type name follows the header as
/// `type=...` is not guaranteed present on every line, so callers running in
/// stdin mode configure the accumulator to derive type from context instead
/// of the prefix byte).
pub fn run<R: Read>(source: R, queue: &SpscQueue, should_stop: impl Fn() -> bool) {
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();

    loop {
        if should_stop() {
            return;
        }
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return, // EOF
            Ok(_) => {
                let record = strip_interpreted_suffix(&line);
                if record.is_empty() {
                    continue;
                }
                if !queue.put(record) {
                    tracing::trace!("dropped stdin record: SPSC queue closed");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed, stopping stdin collector");
                return;
            }
        }
    }
}

/// Trims the trailing newline and everything from the first `0x1D` onward.
fn strip_interpreted_suffix(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    match line.iter().position(|&b| b == GROUP_SEPARATOR) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn strips_trailing_newline_with_no_interpreted_suffix() {
        assert_eq!(strip_interpreted_suffix(b"audit(1.0:1): a=b\n"), b"audit(1.0:1): a=b");
    }

    #[test]
    fn strips_the_group_separator_delimited_interpreted_copy() {
        let raw = b"audit(1.0:1): a=b\x1Dtype=SYSCALL msg=audit(1.0:1): a=b\n";
        assert_eq!(strip_interpreted_suffix(raw), b"audit(1.0:1): a=b");
    }

    #[test]
    fn run_forwards_each_line_as_one_queue_item() {
        let queue = SpscQueue::new(3, 256);
        let input = b"audit(1.0:1): a=b\naudit(2.0:2): c=d\n".as_slice();
        run(input, &queue, || false);

        let first = queue.get(Duration::from_millis(10)).unwrap();
        assert_eq!(&first[..], b"audit(1.0:1): a=b");
        first.release();

        let second = queue.get(Duration::from_millis(10)).unwrap();
        assert_eq!(&second[..], b"audit(2.0:2): c=d");
        second.release();
    }

    #[test]
    fn blank_lines_are_skipped() {
        let queue = SpscQueue::new(3, 256);
        let input = b"\naudit(1.0:1): a=b\n".as_slice();
        run(input, &queue, || false);
        let item = queue.get(Duration::from_millis(10)).unwrap();
        assert_eq!(&item[..], b"audit(1.0:1): a=b");
    }
}
