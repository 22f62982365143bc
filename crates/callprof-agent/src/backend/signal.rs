use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) type SigactionHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Install `handler` for `signo` with `SA_SIGINFO | SA_RESTART`.
///
/// Handlers are never reset to `SIG_DFL` afterwards: a `SIGPROF` still pending
/// at that point would terminate the process. Backends disarm through their
/// own flag instead and leave the handler in place.
pub(crate) fn install_handler(signo: libc::c_int, handler: SigactionHandler) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);

        if libc::sigaction(signo, &sa, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Counts handlers currently executing so teardown can wait them out.
pub(crate) struct HandlerGate {
    active: AtomicUsize,
}

impl HandlerGate {
    pub(crate) const fn new() -> Self {
        HandlerGate {
            active: AtomicUsize::new(0),
        }
    }

    pub(crate) fn enter(&self) -> GateGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        GateGuard { gate: self }
    }

    /// Yield until no handler is inside. Only called after disarming, so new
    /// entries bail out immediately and the wait is bounded by one handler run.
    pub(crate) fn drain(&self) {
        while self.active.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a HandlerGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Current OS thread id. Async-signal-safe.
#[cfg(target_os = "linux")]
pub(crate) fn gettid() -> super::Tid {
    unsafe { libc::syscall(libc::SYS_gettid) as super::Tid }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn gettid() -> super::Tid {
    0
}
