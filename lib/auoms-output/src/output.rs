//! The output loop (spec.md §4.6): drains a cursor, writes each event
//! through an [`EventWriter`], and, in ack mode, runs a sibling reader
//! thread that matches peer acks back to cursor commits.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use auoms_common::writer::{EventWriter, WriteOutcome};
use auoms_event::Event;
use auoms_queue::Queue;

use crate::ack::{AckQueue, PendingAck};
use crate::error::OutputError;
use crate::filter::{NullFilter, OutputFilter};
use crate::socket::UnixDomainWriter;

/// How long the ack reader thread's socket read blocks before it re-checks
/// the exit flag.
const ACK_READ_POLL: Duration = Duration::from_millis(500);
/// How long [`Output::run`]'s `Get` call blocks per iteration (spec.md
/// §4.6 step 2: "`Get(100 ms, ...)`").
const DEFAULT_GET_TIMEOUT: Duration = Duration::from_millis(100);
/// Spec.md §6 default `ack_queue_size`.
const DEFAULT_ACK_QUEUE_SIZE: usize = 100;
/// How long `close` waits for in-flight acks to drain (spec.md §4.6
/// "Stopping ... waits briefly for in-flight acks").
const ACK_DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct OutputConfig {
    pub cursor_name: String,
    pub socket_path: PathBuf,
    pub ack_mode: bool,
    pub ack_queue_size: usize,
    pub get_timeout: Duration,
}

impl OutputConfig {
    /// Reads the per-output config keys named in spec.md §6
    /// (`enable_ack_mode`, `ack_queue_size`, `output_socket`).
    pub fn from_config(cfg: &auoms_common::Config, cursor_name: impl Into<String>) -> Self {
        OutputConfig {
            cursor_name: cursor_name.into(),
            socket_path: PathBuf::from(cfg.get_string("output_socket", "/var/run/auoms/auoms.sock")),
            ack_mode: cfg.get_bool("enable_ack_mode", false),
            ack_queue_size: cfg.get_u64("ack_queue_size", DEFAULT_ACK_QUEUE_SIZE as u64) as usize,
            get_timeout: DEFAULT_GET_TIMEOUT,
        }
    }
}

/// A cloneable handle that can request an [`Output::run`] loop running on
/// another thread to stop, without needing `&mut` access to the `Output`
/// itself.
#[derive(Clone)]
pub struct OutputHandle(Arc<AtomicBool>);

impl OutputHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A single running output: one cursor, one wire format, one socket.
pub struct Output {
    queue: Arc<Queue>,
    config: OutputConfig,
    socket: UnixDomainWriter,
    writer: Arc<Mutex<Box<dyn EventWriter>>>,
    filter: Box<dyn OutputFilter>,
    ack_queue: Option<Arc<AckQueue>>,
    ack_reader: Option<JoinHandle<()>>,
    exit_flag: Arc<AtomicBool>,
}

impl Output {
    pub fn new(queue: Arc<Queue>, config: OutputConfig, writer: Box<dyn EventWriter>) -> Result<Self, OutputError> {
        Self::with_filter(queue, config, writer, Box::new(NullFilter))
    }

    pub fn with_filter(
        queue: Arc<Queue>,
        config: OutputConfig,
        writer: Box<dyn EventWriter>,
        filter: Box<dyn OutputFilter>,
    ) -> Result<Self, OutputError> {
        queue.open_cursor(&config.cursor_name)?;
        let ack_queue = if config.ack_mode && writer.supports_ack_mode() {
            Some(Arc::new(AckQueue::new(config.ack_queue_size)))
        } else {
            None
        };
        let socket = UnixDomainWriter::new(config.socket_path.clone());
        Ok(Output {
            queue,
            config,
            socket,
            writer: Arc::new(Mutex::new(writer)),
            filter,
            ack_queue,
            ack_reader: None,
            exit_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Signals [`Output::run`] to return at its next poll.
    pub fn request_stop(&self) {
        self.exit_flag.store(true, Ordering::SeqCst);
    }

    /// A cloneable stop signal usable from another thread (e.g. the signal
    /// handler) while `run()` is blocking on this `Output` elsewhere.
    pub fn handle(&self) -> OutputHandle {
        OutputHandle(self.exit_flag.clone())
    }

    fn should_stop(&self) -> bool {
        self.exit_flag.load(Ordering::SeqCst)
    }

    /// Runs the main loop (spec.md §4.6 steps 1-5) until `request_stop` is
    /// called or the queue closes permanently.
    pub fn run(&mut self) {
        let auto_commit = !(self.config.ack_mode && self.ack_queue.is_some());
        while !self.should_stop() {
            if !self.socket.ensure_connected() {
                // `ensure_connected` returns immediately once the backoff
                // deadline hasn't elapsed; without a pause here this would
                // busy-spin until it has.
                std::thread::sleep(self.config.get_timeout);
                continue;
            }
            self.spawn_ack_reader_if_needed();

            let item = self.queue.get(&self.config.cursor_name, self.config.get_timeout, auto_commit);
            let (priority, seq, bytes) = match item {
                Ok(Some(item)) => item,
                Ok(None) => {
                    if self.queue.is_closed() {
                        return;
                    }
                    continue;
                }
                Err(_) => return,
            };

            let event_id = match Event::parse(&bytes) {
                Ok(parsed) => {
                    if !self.filter.keep(parsed) {
                        continue;
                    }
                    parsed.id()
                }
                Err(err) => {
                    tracing::warn!(%err, "dropping unparsable event instead of writing it");
                    continue;
                }
            };

            let outcome = {
                let mut writer = self.writer.lock();
                writer.write_event(&bytes, &mut self.socket)
            };

            match outcome {
                Ok(WriteOutcome::Ok(_)) => {
                    if let Some(ack_queue) = &self.ack_queue {
                        if !ack_queue.push(PendingAck { id: event_id, priority, seq }) {
                            return;
                        }
                    }
                }
                Ok(WriteOutcome::Noop) => {}
                Ok(WriteOutcome::Failed) | Err(_) => {
                    self.disconnect();
                }
            }
        }
    }

    fn spawn_ack_reader_if_needed(&mut self) {
        let Some(ack_queue) = self.ack_queue.clone() else { return };
        if self.ack_reader.is_some() {
            return;
        }
        let Some(stream) = self.socket.reader() else { return };
        let read_half = match stream.try_clone() {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(%err, "failed to clone output socket for ack reader");
                return;
            }
        };
        if let Err(err) = read_half.set_read_timeout(Some(ACK_READ_POLL)) {
            tracing::warn!(%err, "failed to set ack reader read timeout");
        }

        let writer = self.writer.clone();
        let queue = self.queue.clone();
        let cursor_name = self.config.cursor_name.clone();
        let exit_flag = self.exit_flag.clone();
        self.ack_reader = Some(std::thread::spawn(move || {
            run_ack_reader(read_half, writer, queue, cursor_name, ack_queue, exit_flag);
        }));
    }

    fn disconnect(&mut self) {
        self.socket.disconnect();
        if let Some(handle) = self.ack_reader.take() {
            let _ = handle.join();
        }
    }

    /// Stops the loop (if still running), closes the transport, and waits
    /// briefly for in-flight acks before joining the ack reader (spec.md
    /// §4.6 "Stopping").
    pub fn close(&mut self) {
        self.request_stop();
        if let Some(ack_queue) = &self.ack_queue {
            ack_queue.wait_drained(ACK_DRAIN_GRACE);
            ack_queue.close();
        }
        self.disconnect();
    }
}

/// The ack-reader sibling thread (spec.md §4.6 step 6).
fn run_ack_reader(
    mut read_half: std::os::unix::net::UnixStream,
    writer: Arc<Mutex<Box<dyn EventWriter>>>,
    queue: Arc<Queue>,
    cursor_name: String,
    ack_queue: Arc<AckQueue>,
    exit_flag: Arc<AtomicBool>,
) {
    while !exit_flag.load(Ordering::SeqCst) {
        let ack_id = {
            let mut writer = writer.lock();
            writer.read_ack(&mut read_half)
        };
        match ack_id {
            Ok(id) => {
                for acked in ack_queue.ack_up_to(id) {
                    if let Err(err) = queue.commit(&cursor_name, acked.priority, acked.seq) {
                        tracing::warn!(%err, priority = acked.priority, seq = acked.seq, "failed to commit acked cursor position");
                    }
                }
            }
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(_) => {
                // Peer disconnected mid-stream (spec.md §8 Scenario F): the
                // cursor's committed position stays at the largest acked id
                // seen so far; unacked entries are simply dropped from the
                // in-flight ring on the next connect.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_writer::RawEventWriter;
    use auoms_queue::QueueConfig;
    use std::os::unix::net::UnixListener;

    fn open_queue(dir: &std::path::Path) -> Arc<Queue> {
        Arc::new(Queue::open(dir, QueueConfig::default()).unwrap())
    }

    #[test]
    fn non_ack_output_drains_items_to_a_connected_peer() {
        let data_dir = tempfile::tempdir().unwrap();
        let sock_dir = tempfile::tempdir().unwrap();
        let sock_path = sock_dir.path().join("out.sock");

        let queue = open_queue(data_dir.path());
        queue.put(0, b"event-one").unwrap();
        queue.put(0, b"event-two").unwrap();

        let listener = UnixListener::bind(&sock_path).unwrap();
        let accepted = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut total = Vec::new();
            use std::io::Read;
            // Read until the writer closes or we've gathered both frames.
            let mut buf = [0u8; 256];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        total.extend_from_slice(&buf[..n]);
                        if total.len() >= (4 + b"event-one".len()) + (4 + b"event-two".len()) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            total
        });

        let mut config = OutputConfig::from_config(&auoms_common::Config::empty(), "test-cursor");
        config.socket_path = sock_path;
        config.get_timeout = Duration::from_millis(50);
        let mut output = Output::new(queue, config, Box::new(RawEventWriter::new())).unwrap();
        let stop_handle = output.handle();

        let run_handle = std::thread::spawn(move || output.run());

        let received = accepted.join().unwrap();
        assert!(received.len() >= 4 + b"event-one".len());

        stop_handle.request_stop();
        run_handle.join().unwrap();
    }
}
