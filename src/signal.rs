//! Process-wide signal handling (spec.md §5 "Cancellation", §5 "Locking
//! discipline" intro: "a process-wide exit flag set by the signal handler").
//!
//! `SIGTERM`/`SIGINT` flip a global exit flag every long-running thread
//! polls. `SIGQUIT` is reserved for forcing a *specific* worker thread out
//! of a blocking `read`/`write` syscall (spec.md §5: "Threads blocked in
//! `read()`/`write()` on sockets receive `SIGQUIT` via `pthread_kill`"):
//! it is blocked everywhere by default and only unblocked on the worker
//! threads that register themselves, so an accidental `kill -QUIT` aimed at
//! the whole process only interrupts the threads that opted in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nix::sys::signal::{self, SigHandler, SigSet, Signal};

static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_: libc::c_int) {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

extern "C" fn on_quit(_: libc::c_int) {
    // Intentionally empty: the only purpose of having a handler at all is
    // to stop SIGQUIT's default action (terminate + core dump) so that
    // `pthread_kill` can use it purely to break a thread out of a blocking
    // syscall with EINTR.
}

/// Installs the process-wide handlers. Must run before any worker thread
/// is spawned, on the main thread, before any other subsystem starts.
pub fn install() -> Result<(), nix::Error> {
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(on_term))?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(on_term))?;
        signal::signal(Signal::SIGQUIT, SigHandler::Handler(on_quit))?;
    }

    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGQUIT);
    signal::pthread_sigmask(signal::SigmaskHow::SIG_BLOCK, Some(&blocked), None)?;
    Ok(())
}

/// Whether `SIGTERM`/`SIGINT` has been received. Polled by every
/// long-running thread's suspension points (spec.md §5).
pub fn should_exit() -> bool {
    SHOULD_EXIT.load(Ordering::SeqCst)
}

/// The raw exit flag, for components (like [`auoms_common::proc_metrics::run_sampler_loop`])
/// that take `&AtomicBool` directly instead of a polling closure.
pub fn exit_flag() -> &'static AtomicBool {
    &SHOULD_EXIT
}

/// Sets the exit flag without delivering a real signal: used both by tests
/// simulating `SIGTERM`/`SIGINT` and by in-process fatal conditions (the
/// proc-metrics sampler's resource-limit callback, spec.md §5 "exceeding any
/// limit calls a fatal callback") that need the same shutdown path a signal
/// would trigger.
pub fn request_exit() {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

/// Unblocks `SIGQUIT` for the calling thread. Worker threads that do
/// blocking socket I/O (outputs, the ack reader) call this right after
/// spawning so a targeted `pthread_kill` can break them out of a stuck
/// `read`/`write` (spec.md §5: "SIGQUIT is unblocked on worker threads and
/// ignored elsewhere").
pub fn unblock_sigquit_on_current_thread() -> Result<(), nix::Error> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGQUIT);
    signal::pthread_sigmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&set), None)
}

/// A registry of worker thread ids willing to be interrupted by `SIGQUIT`,
/// used at shutdown to break any of them out of a blocked socket call.
#[derive(Default)]
pub struct InterruptRegistry {
    threads: Mutex<Vec<libc::pthread_t>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        InterruptRegistry::default()
    }

    /// Registers the calling thread (which must have already called
    /// [`unblock_sigquit_on_current_thread`]) as interruptible.
    pub fn register_current_thread(&self) {
        // SAFETY: `pthread_self` takes no arguments and cannot fail.
        let id = unsafe { libc::pthread_self() };
        self.threads.lock().unwrap().push(id);
    }

    /// Sends `SIGQUIT` to every registered thread, forcing any blocked
    /// `read`/`write` to return `EINTR`.
    pub fn interrupt_all(&self) {
        for &id in self.threads.lock().unwrap().iter() {
            // SAFETY: `id` was obtained from `pthread_self` by a thread that
            // registered itself and (by construction) is still part of this
            // process; sending a signal to a thread id that has since
            // exited is a documented-safe no-op/`ESRCH` on Linux.
            unsafe {
                libc::pthread_kill(id, libc::SIGQUIT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_records_the_calling_thread() {
        let registry = InterruptRegistry::new();
        registry.register_current_thread();
        assert_eq!(registry.threads.lock().unwrap().len(), 1);
    }
}
