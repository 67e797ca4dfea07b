//! Exclusive-acquisition AUDIT netlink collector (spec.md §4.4).
//!
//! There is no retrieval-pack precedent for talking to `NETLINK_AUDIT`
//! (netlink's custom-protocol framing isn't something any crate in the
//! corpus models; `nix`'s netlink support covers `NETLINK_ROUTE`-shaped
//! address families, not arbitrary message structs), so this module goes
//! straight to the syscalls: a small `unsafe` core opens/binds/sends/receives
//! on an `AF_NETLINK` socket with `libc`, and everything above that core is
//! ordinary safe Rust matching the rest of this crate's style (`snafu`
//! errors, `tracing` instrumentation, a `Gate`-driven exit check).

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use auoms_common::config::Config;
use snafu::Snafu;

use crate::spsc::SpscQueue;

const NETLINK_AUDIT: libc::c_int = 9;

const AUDIT_GET: u16 = 1000;
const AUDIT_SET: u16 = 1001;
/// First user-space-originated message type (spec.md §4.4 "Record intake").
const AUDIT_FIRST_USER_MSG: u16 = 1100;
/// Sent by a competing collector announcing it is taking over; never
/// forwarded downstream (spec.md §4.4).
const AUDIT_REPLACE: u16 = 1329;

const AUDIT_STATUS_ENABLED: u32 = 0x0001;
const AUDIT_STATUS_PID: u32 = 0x0002;
const AUDIT_STATUS_RATE_LIMIT: u32 = 0x0004;
const AUDIT_STATUS_BACKLOG_LIMIT: u32 = 0x0008;
const AUDIT_STATUS_BACKLOG_WAIT_TIME: u32 = 0x0010;

const NLMSG_HDRLEN: usize = 16;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;

#[derive(Debug, Snafu)]
pub enum NetlinkError {
    #[snafu(display("failed to open AUDIT netlink socket: {}", source))]
    Open { source: io::Error },

    #[snafu(display("netlink send failed: {}", source))]
    Send { source: io::Error },

    #[snafu(display("netlink receive failed: {}", source))]
    Recv { source: io::Error },

    #[snafu(display("kernel reported audit_pid {} already held by a running process", pid))]
    AlreadyClaimed { pid: i32 },

    #[snafu(display("audit_pid was reassigned to another process"))]
    Preempted,

    #[snafu(display("audit_pid was cleared by another party"))]
    Restart,

    #[snafu(display("another auditd binary appeared in /sbin; yielding"))]
    Superseded,

    #[snafu(display("gave up waiting for AUDIT_SET(our_pid) to take effect after {} attempts", attempts))]
    ClaimTimedOut { attempts: u32 },
}

/// Wire layout of `struct audit_status` (the fixed, pre-feature-bitmap
/// fields every kernel since the audit subsystem's introduction has
/// supported). Newer optional fields (`feature_bitmap`, `backlog_wait_time_actual`)
/// are out of scope here; we only ever set bits this struct covers.
#[derive(Debug, Clone, Copy, Default)]
struct AuditStatus {
    mask: u32,
    enabled: u32,
    failure: u32,
    pid: u32,
    rate_limit: u32,
    backlog_limit: u32,
    lost: u32,
    backlog: u32,
}

const AUDIT_STATUS_SIZE: usize = 32;

impl AuditStatus {
    fn encode(&self) -> [u8; AUDIT_STATUS_SIZE] {
        let mut buf = [0u8; AUDIT_STATUS_SIZE];
        buf[0..4].copy_from_slice(&self.mask.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.enabled.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.failure.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.pid.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.rate_limit.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.backlog_limit.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.lost.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.backlog.to_ne_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < AUDIT_STATUS_SIZE {
            return None;
        }
        let word = |off: usize| u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
        Some(AuditStatus {
            mask: word(0),
            enabled: word(4),
            failure: word(8),
            pid: word(12),
            rate_limit: word(16),
            backlog_limit: word(20),
            lost: word(24),
            backlog: word(28),
        })
    }
}

/// Config-driven knobs applied once the collector holds `audit_pid`
/// (spec.md §4.4 "Backlog parameters").
pub struct NetlinkConfig {
    pub backlog_limit: u32,
    pub backlog_wait_time: Option<u32>,
    pub poll_interval: Duration,
    pub claim_retry_limit: u32,
}

impl NetlinkConfig {
    pub fn from_config(cfg: &Config) -> Self {
        NetlinkConfig {
            backlog_limit: cfg.get_u64("audit_backlog_limit", 8192) as u32,
            backlog_wait_time: {
                let v = cfg.get_u64("audit_backlog_wait_time", 0);
                if v == 0 { None } else { Some(v as u32) }
            },
            poll_interval: cfg.get_duration_ms("netlink_poll_interval_ms", 10_000),
            claim_retry_limit: cfg.get_u64("netlink_claim_retries", 5) as u32,
        }
    }
}

/// A raw `AF_NETLINK`/`NETLINK_AUDIT` socket. Owns the fd; closes it on drop.
struct NetlinkSocket {
    fd: RawFd,
    seq: u32,
}

impl NetlinkSocket {
    fn open() -> Result<Self, NetlinkError> {
        // SAFETY: a plain `socket(2)` call; the fd is owned exclusively by
        // the returned value and closed in `Drop`.
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, NETLINK_AUDIT) };
        if fd < 0 {
            return Err(NetlinkError::Open { source: io::Error::last_os_error() });
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0; // let the kernel assign our port id
        addr.nl_groups = 0;

        // SAFETY: `addr` is a valid, fully initialized `sockaddr_nl` of the
        // size `bind(2)` expects for this address family.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetlinkError::Open { source: err });
        }

        set_recv_timeout(fd, Duration::from_secs(5));
        Ok(NetlinkSocket { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    /// Sends one netlink message addressed to the kernel (`nl_pid == 0`).
    fn send(&mut self, msg_type: u16, flags: u16, payload: &[u8]) -> Result<u32, NetlinkError> {
        let seq = self.next_seq();
        let total_len = NLMSG_HDRLEN + payload.len();
        let mut buf = vec![0u8; total_len];
        buf[0..4].copy_from_slice(&(total_len as u32).to_ne_bytes());
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
        buf[6..8].copy_from_slice(&flags.to_ne_bytes());
        buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        buf[12..16].copy_from_slice(&0u32.to_ne_bytes()); // nl_pid: kernel fills in on delivery
        buf[NLMSG_HDRLEN..].copy_from_slice(payload);

        let mut kernel_addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        kernel_addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        // SAFETY: `buf` is a valid, fully initialized byte slice of the
        // length passed; `kernel_addr` is a valid `sockaddr_nl`.
        let rc = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &kernel_addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(NetlinkError::Send { source: io::Error::last_os_error() });
        }
        Ok(seq)
    }

    /// Reads one datagram (one or more concatenated netlink messages) into
    /// `buf`, returning the number of bytes received.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetlinkError> {
        // SAFETY: `buf` is a valid mutable byte slice of the length passed.
        let rc = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if rc < 0 {
            return Err(NetlinkError::Recv { source: io::Error::last_os_error() });
        }
        Ok(rc as usize)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn set_recv_timeout(fd: RawFd, timeout: Duration) {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: `tv` is a valid, fully initialized `timeval`.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
    }
}

/// One parsed netlink message header plus its payload slice.
struct NlMsg<'a> {
    msg_type: u16,
    payload: &'a [u8],
}

fn parse_messages(buf: &[u8]) -> Vec<NlMsg<'_>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
        out.push(NlMsg {
            msg_type,
            payload: &buf[offset + NLMSG_HDRLEN..offset + len],
        });
        // netlink messages are 4-byte aligned
        offset += (len + 3) & !3;
    }
    out
}

fn query_audit_status(sock: &mut NetlinkSocket) -> Result<AuditStatus, NetlinkError> {
    sock.send(AUDIT_GET, NLM_F_REQUEST | NLM_F_ACK, &[])?;
    let mut buf = [0u8; 4096];
    loop {
        let n = sock.recv(&mut buf)?;
        for msg in parse_messages(&buf[..n]) {
            if msg.msg_type == AUDIT_GET {
                if let Some(status) = AuditStatus::decode(msg.payload) {
                    return Ok(status);
                }
            }
        }
    }
}

fn set_audit_status(sock: &mut NetlinkSocket, status: &AuditStatus) -> Result<(), NetlinkError> {
    sock.send(AUDIT_SET, NLM_F_REQUEST | NLM_F_ACK, &status.encode())?;
    Ok(())
}

/// Owns the exclusive-acquisition lifecycle and the streaming read loop
/// (spec.md §4.4 "States", "Transitions").
pub struct NetlinkCollector {
    config: NetlinkConfig,
    our_pid: i32,
    enabled_before_us: Option<bool>,
}

impl NetlinkCollector {
    pub fn new(config: NetlinkConfig) -> Self {
        NetlinkCollector {
            config,
            our_pid: std::process::id() as i32,
            enabled_before_us: None,
        }
    }

    /// Runs the full exclusive-acquisition protocol and then streams records
    /// into `queue` until told to stop, another collector preempts us, or
    /// the kernel clears `audit_pid`. `should_stop` is polled once per
    /// `poll_interval` and at the top of every receive timeout.
    #[tracing::instrument(skip(self, queue, should_stop))]
    pub fn run(&mut self, queue: &SpscQueue, should_stop: impl Fn() -> bool) -> Result<(), NetlinkError> {
        let mut sock = NetlinkSocket::open()?;

        let status = query_audit_status(&mut sock)?;
        if status.pid != 0 && Path::new(&format!("/proc/{}", status.pid)).exists() {
            return Err(NetlinkError::AlreadyClaimed { pid: status.pid as i32 });
        }

        self.claim_pid(&mut sock)?;
        tracing::info!(pid = self.our_pid, "acquired audit_pid");

        if status.enabled == 0 {
            self.enabled_before_us = Some(false);
            set_audit_status(
                &mut sock,
                &AuditStatus {
                    mask: AUDIT_STATUS_ENABLED,
                    enabled: 1,
                    ..Default::default()
                },
            )?;
        } else {
            self.enabled_before_us = Some(true);
        }

        set_audit_status(
            &mut sock,
            &AuditStatus {
                mask: AUDIT_STATUS_BACKLOG_LIMIT,
                backlog_limit: self.config.backlog_limit,
                ..Default::default()
            },
        )?;
        if let Some(wait) = self.config.backlog_wait_time {
            // Older kernels reject this mask bit; a failure here is
            // logged, not fatal (spec.md §4.4 "if supported").
            if let Err(e) = set_audit_status(
                &mut sock,
                &AuditStatus {
                    mask: AUDIT_STATUS_BACKLOG_WAIT_TIME,
                    backlog: wait,
                    ..Default::default()
                },
            ) {
                tracing::warn!(error = %e, "kernel did not accept backlog_wait_time");
            }
        }

        let watcher = watch_sbin_for_auditd();

        let result = self.stream(&mut sock, queue, &should_stop, watcher.is_some());
        let _ = watcher; // keep the watcher alive for the duration of `stream`

        self.release(&mut sock);
        result
    }

    fn claim_pid(&mut self, sock: &mut NetlinkSocket) -> Result<(), NetlinkError> {
        set_audit_status(
            sock,
            &AuditStatus {
                mask: AUDIT_STATUS_PID,
                pid: self.our_pid as u32,
                ..Default::default()
            },
        )?;

        for attempt in 0..self.config.claim_retry_limit {
            let status = query_audit_status(sock)?;
            if status.pid == self.our_pid as u32 {
                return Ok(());
            }
            tracing::debug!(attempt, observed_pid = status.pid, "audit_pid not yet ours, retrying");
            set_audit_status(
                sock,
                &AuditStatus {
                    mask: AUDIT_STATUS_PID,
                    pid: self.our_pid as u32,
                    ..Default::default()
                },
            )?;
        }
        Err(NetlinkError::ClaimTimedOut { attempts: self.config.claim_retry_limit })
    }

    fn stream(
        &mut self,
        sock: &mut NetlinkSocket,
        queue: &SpscQueue,
        should_stop: &impl Fn() -> bool,
        watching_sbin: bool,
    ) -> Result<(), NetlinkError> {
        let mut last_poll = Instant::now();
        let mut buf = vec![0u8; 1 << 16];
        set_recv_timeout(sock.fd, Duration::from_millis(500));

        loop {
            if should_stop() {
                return Ok(());
            }

            match sock.recv(&mut buf) {
                Ok(n) => {
                    for msg in parse_messages(&buf[..n]) {
                        if msg.msg_type < AUDIT_FIRST_USER_MSG || msg.msg_type == AUDIT_REPLACE {
                            continue;
                        }
                        forward_record(queue, msg.msg_type, msg.payload);
                    }
                }
                Err(NetlinkError::Recv { source }) if is_timeout(&source) => {}
                Err(e) => return Err(e),
            }

            if watching_sbin && auditd_binary_appeared() {
                tracing::info!("another auditd binary appeared in /sbin; releasing audit_pid");
                return Err(NetlinkError::Superseded);
            }

            if last_poll.elapsed() >= self.config.poll_interval {
                last_poll = Instant::now();
                let status = query_audit_status(sock)?;
                if status.pid == 0 {
                    return Err(NetlinkError::Restart);
                }
                if status.pid != self.our_pid as u32 {
                    return Err(NetlinkError::Preempted);
                }
            }
        }
    }

    fn release(&mut self, sock: &mut NetlinkSocket) {
        if self.enabled_before_us == Some(false) {
            let _ = set_audit_status(
                sock,
                &AuditStatus {
                    mask: AUDIT_STATUS_ENABLED,
                    enabled: 0,
                    ..Default::default()
                },
            );
        }
        let _ = set_audit_status(
            sock,
            &AuditStatus {
                mask: AUDIT_STATUS_PID,
                pid: 0,
                ..Default::default()
            },
        );
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}

/// Prepends the u16 type tag and hands the record off to the SPSC queue,
/// accounting loss via the queue's own metrics (spec.md §4.4 "Record
/// intake").
fn forward_record(queue: &SpscQueue, msg_type: u16, payload: &[u8]) {
    let mut bytes = Vec::with_capacity(2 + payload.len());
    bytes.extend_from_slice(&msg_type.to_le_bytes());
    bytes.extend_from_slice(payload);
    if !queue.put(&bytes) {
        tracing::trace!(msg_type, "dropped record: SPSC queue closed");
    }
}

/// Watches `/sbin` for the system's own `auditd` binary appearing, which
/// signals a higher-priority collector is taking over (spec.md §4.4 step 5).
/// Returns `None` if the watch could not be established; the polling loop in
/// `stream` then falls back to the 10s `audit_pid` poll alone.
fn watch_sbin_for_auditd() -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = match notify::recommended_watcher(|_res: notify::Result<notify::Event>| {}) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create /sbin watcher");
            return None;
        }
    };
    if let Err(e) = watcher.watch(Path::new("/sbin"), RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch /sbin for auditd");
        return None;
    }
    Some(watcher)
}

fn auditd_binary_appeared() -> bool {
    Path::new("/sbin/auditd").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_status_round_trips_through_wire_encoding() {
        let status = AuditStatus {
            mask: AUDIT_STATUS_PID | AUDIT_STATUS_RATE_LIMIT,
            pid: 4242,
            rate_limit: 10,
            ..Default::default()
        };
        let decoded = AuditStatus::decode(&status.encode()).unwrap();
        assert_eq!(decoded.pid, 4242);
        assert_eq!(decoded.rate_limit, 10);
    }

    #[test]
    fn parse_messages_splits_concatenated_aligned_frames() {
        let mut buf = Vec::new();
        for (msg_type, payload) in [(1100u16, &b"a"[..]), (1101u16, &b"bb"[..])] {
            let total = NLMSG_HDRLEN + payload.len();
            buf.extend_from_slice(&(total as u32).to_ne_bytes());
            buf.extend_from_slice(&msg_type.to_ne_bytes());
            buf.extend_from_slice(&0u16.to_ne_bytes());
            buf.extend_from_slice(&0u32.to_ne_bytes());
            buf.extend_from_slice(&0u32.to_ne_bytes());
            buf.extend_from_slice(payload);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        }
        let msgs = parse_messages(&buf);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].msg_type, 1100);
        assert_eq!(msgs[0].payload, b"a");
        assert_eq!(msgs[1].msg_type, 1101);
        assert_eq!(msgs[1].payload, b"bb");
    }

    #[test]
    fn forward_record_prefixes_the_type_tag() {
        let queue = SpscQueue::new(2, 64);
        forward_record(&queue, 1300, b"payload");
        let item = queue.get(Duration::from_millis(10)).unwrap();
        assert_eq!(&item[0..2], &1300u16.to_le_bytes());
        assert_eq!(&item[2..], b"payload");
    }
}
