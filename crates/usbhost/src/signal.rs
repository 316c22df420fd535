//! Real-time signal pool
//!
//! Each signal-monitored endpoint owns one real-time signal, raised by the
//! kernel when one of its URBs completes. The handler only records the signal
//! in a pending mask and pokes a self-pipe; all reaping happens on the main
//! flow when the pending signals are handled.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::{self, c_int, c_void};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Most signals the pool hands out
const POOL_SIZE: i32 = 64;

/// Bit n set: SIGRTMIN + n is in use
static ALLOCATED: AtomicU64 = AtomicU64::new(0);

/// Bit n set: SIGRTMIN + n was delivered and not yet handled
static PENDING: AtomicU64 = AtomicU64::new(0);

/// Cached SIGRTMIN, read by the handler
static BASE: AtomicI32 = AtomicI32::new(0);

/// Write end of the wake pipe, -1 until created
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);

static WAKE: OnceLock<WakePipe> = OnceLock::new();

struct WakePipe {
    read: File,
    _write: OwnedFd,
}

fn wake_pipe() -> Result<&'static WakePipe> {
    if let Some(pipe) = WAKE.get() {
        return Ok(pipe);
    }

    let (read, write) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
        .map_err(|e| Error::os("create wake pipe", e))?;
    let pipe = WakePipe {
        read: File::from(read),
        _write: write,
    };

    // A racing initializer wins; our pipe is simply dropped.
    let pipe = WAKE.get_or_init(|| pipe);
    WAKE_WRITE.store(pipe._write.as_raw_fd(), Ordering::SeqCst);
    Ok(pipe)
}

extern "C" fn on_signal(signal: c_int) {
    let saved = Errno::last_raw();

    let offset = signal - BASE.load(Ordering::Relaxed);
    if (0..POOL_SIZE).contains(&offset) {
        PENDING.fetch_or(1 << offset, Ordering::SeqCst);
    }

    let fd = WAKE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        // A full pipe already guarantees a wakeup.
        unsafe { libc::write(fd, &byte as *const u8 as *const c_void, 1) };
    }

    Errno::set_raw(saved);
}

fn install(signal: c_int, handler: SigHandler) -> Result<()> {
    let action = libc::sigaction::from(SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty()));

    // nix's Signal cannot name real-time signals, so the action goes in by number.
    Errno::result(unsafe { libc::sigaction(signal, &action, ptr::null_mut()) })
        .map(drop)
        .map_err(|e| Error::os("install signal handler", e))
}

/// A real-time signal reserved for one endpoint
///
/// Dropping it ignores the signal again, so a completion arriving after the
/// endpoint stopped cannot terminate the process.
#[derive(Debug)]
pub struct SignalRegistration {
    signal: c_int,
    bit: u64,
}

impl SignalRegistration {
    /// Reserve a free real-time signal and install the handler on it
    pub fn allocate() -> Result<Self> {
        wake_pipe()?;

        let base = libc::SIGRTMIN();
        let count = (libc::SIGRTMAX() - base + 1).clamp(0, POOL_SIZE);
        BASE.store(base, Ordering::SeqCst);

        for offset in 0..count {
            let bit = 1u64 << offset;
            if ALLOCATED.fetch_or(bit, Ordering::SeqCst) & bit != 0 {
                continue;
            }

            let signal = base + offset;
            PENDING.fetch_and(!bit, Ordering::SeqCst);
            if let Err(e) = install(signal, SigHandler::Handler(on_signal)) {
                ALLOCATED.fetch_and(!bit, Ordering::SeqCst);
                return Err(e);
            }

            debug!("Allocated real-time signal {}", signal);
            return Ok(Self { signal, bit });
        }

        Err(Error::Unsupported("no free real-time signal"))
    }

    pub fn signal(&self) -> c_int {
        self.signal
    }

    pub(crate) fn bit(&self) -> u64 {
        self.bit
    }
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        if let Err(e) = install(self.signal, SigHandler::SigIgn) {
            debug!("Could not ignore real-time signal {}: {}", self.signal, e);
        }
        PENDING.fetch_and(!self.bit, Ordering::SeqCst);
        ALLOCATED.fetch_and(!self.bit, Ordering::SeqCst);
        debug!("Released real-time signal {}", self.signal);
    }
}

/// Take the pending signals selected by `mask`, lowest first
pub(crate) fn take_pending(mask: u64) -> Vec<c_int> {
    let taken = PENDING.fetch_and(!mask, Ordering::SeqCst) & mask;
    let base = BASE.load(Ordering::SeqCst);
    (0..POOL_SIZE)
        .filter(|offset| taken & (1 << offset) != 0)
        .map(|offset| base + offset)
        .collect()
}

/// Descriptor that becomes readable when a signal arrives
pub(crate) fn wake_fd() -> Result<BorrowedFd<'static>> {
    Ok(wake_pipe()?.read.as_fd())
}

/// Empty the wake pipe
pub(crate) fn drain_wake() {
    let Some(pipe) = WAKE.get() else {
        return;
    };

    let mut buffer = [0u8; 64];
    loop {
        match (&pipe.read).read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => trace!("Drained {} signal wakeups", count),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_distinct_signals_and_release() {
        let first = SignalRegistration::allocate().unwrap();
        let second = SignalRegistration::allocate().unwrap();
        assert_ne!(first.signal(), second.signal());
        assert!(first.signal() >= libc::SIGRTMIN());
        assert!(second.signal() <= libc::SIGRTMAX());
        assert_eq!(first.bit() & second.bit(), 0);
    }

    #[test]
    fn test_delivered_signal_becomes_pending() {
        let registration = SignalRegistration::allocate().unwrap();
        let signal = registration.signal();

        // nix::sys::signal::raise only accepts the standard signals.
        Errno::result(unsafe { libc::raise(signal) }).unwrap();

        assert_eq!(take_pending(registration.bit()), vec![signal]);
        assert!(take_pending(registration.bit()).is_empty());
        drain_wake();
    }
}
