//! The parser thread: drains the SPSC queue, decodes each frame back into a
//! `(record_type, text)` pair, and feeds it to the [`Accumulator`] (spec.md
//! §5 "1 parser").
//!
//! Two wire shapes reach here depending on which collector is active
//! (spec.md §4.4): netlink frames carry a raw `u16` type tag prepended by
//! [`crate::netlink::forward_record`]; stdin (audit dispatcher) frames carry
//! no tag at all, just the dispatcher's own `type=NAME msg=audit(...): ...`
//! text, which [`decode_frame`] picks apart instead.

use std::time::Duration;

use auoms_common::config::Config;
use auoms_common::redactor::CmdlineRedactor;
use auoms_common::resolver::NameResolver;
use auoms_event::allocator::EventAllocator;
use auoms_event::builder::EventBuilder;
use auoms_event::prioritizer::Prioritizer;

use crate::accumulator::{Accumulator, AccumulatorError};
use crate::spsc::SpscQueue;

/// How long [`run`] blocks on an empty queue before re-checking `should_stop`
/// and the process-inventory timer.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Drains `queue` into `accumulator`/`builder` until `should_stop` returns
/// true or the queue closes permanently. Runs on its own thread; the caller
/// owns `builder`'s backing allocator (typically a `QueueAllocator` over the
/// durable priority queue).
pub fn run<A, P, R, C>(
    queue: &SpscQueue,
    accumulator: &mut Accumulator<R, C>,
    builder: &mut EventBuilder<'_, A, P>,
    should_stop: impl Fn() -> bool,
) where
    A: EventAllocator,
    P: Prioritizer,
    R: NameResolver,
    C: CmdlineRedactor,
{
    loop {
        if should_stop() {
            return;
        }

        match queue.get(POLL_TIMEOUT) {
            Some(item) => {
                let frame = item.to_vec();
                item.release();
                if let Some((record_type, text)) = decode_frame(&frame) {
                    if let Err(AccumulatorError::QueueClosed) = accumulator.process_record(record_type, text, builder) {
                        tracing::info!("output queue closed; stopping parser thread");
                        return;
                    }
                }
            }
            None => {
                if queue.is_closed() {
                    return;
                }
            }
        }

        if let Err(AccumulatorError::QueueClosed) = accumulator.run_process_inventory(builder) {
            tracing::info!("output queue closed; stopping parser thread");
            return;
        }
    }
}

/// Splits one raw SPSC frame back into `(record_type, text)`.
fn decode_frame(frame: &[u8]) -> Option<(u32, &str)> {
    if let Some(text) = std::str::from_utf8(frame).ok().filter(|t| t.starts_with("type=")) {
        return decode_dispatcher_frame(text);
    }
    if frame.len() < 2 {
        return None;
    }
    let record_type = u16::from_le_bytes([frame[0], frame[1]]) as u32;
    let text = std::str::from_utf8(&frame[2..]).ok()?;
    Some((record_type, text))
}

/// Parses the auditd dispatcher plugin's `type=NAME msg=audit(...): ...`
/// framing, used only in stdin intake mode (spec.md §4.4).
fn decode_dispatcher_frame(text: &str) -> Option<(u32, &str)> {
    let rest = text.strip_prefix("type=")?;
    let (name, rest) = rest.split_once(' ')?;
    let rest = rest.strip_prefix("msg=")?;
    Some((type_name_to_number(name), rest))
}

fn type_name_to_number(name: &str) -> u32 {
    match name {
        "SYSCALL" => 1300,
        "PATH" => 1302,
        "CWD" => 1307,
        "EXECVE" => 1309,
        "EOE" => 1320,
        "PROCTITLE" => 1327,
        "USER_AUTH" => 1106,
        "USER_ACCT" => 1108,
        "USER_LOGIN" => 1112,
        "USER_START" => 1130,
        "USER_END" => 1131,
        other => other
            .strip_prefix("UNKNOWN[")
            .and_then(|s| s.strip_suffix(']'))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    }
}

/// Reads `accumulator_*`-prefixed keys used by callers that need to size
/// queues before constructing an [`Accumulator`]; kept here rather than on
/// `Accumulator` itself since it's only needed by wiring code, not the
/// grouping logic.
pub fn configured_max_in_flight(cfg: &Config) -> usize {
    cfg.get_u64("accumulator_max_in_flight", 4096) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_netlink_tagged_frames() {
        let mut frame = 1300u16.to_le_bytes().to_vec();
        frame.extend_from_slice(b"audit(1.0:1): pid=1");
        let (record_type, text) = decode_frame(&frame).unwrap();
        assert_eq!(record_type, 1300);
        assert_eq!(text, "audit(1.0:1): pid=1");
    }

    #[test]
    fn decodes_dispatcher_style_frames() {
        let frame = b"type=SYSCALL msg=audit(1.0:1): pid=1";
        let (record_type, text) = decode_frame(frame).unwrap();
        assert_eq!(record_type, 1300);
        assert_eq!(text, "audit(1.0:1): pid=1");
    }
}
