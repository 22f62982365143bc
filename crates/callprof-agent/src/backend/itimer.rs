//! Process-wide CPU-time sampling with `setitimer(ITIMER_PROF)`.
//!
//! The kernel delivers `SIGPROF` to whichever thread is consuming CPU when
//! the timer expires, so there is nothing to register per thread.

use super::signal::{self, HandlerGate};
use super::{SIGNAL_SINK, SampleSink, SamplingBackend};
use crate::args::{EventType, Mode};
use crate::context::SignalContext;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static ARMED: AtomicBool = AtomicBool::new(false);
static INTERVAL: AtomicU64 = AtomicU64::new(0);
static GATE: HandlerGate = HandlerGate::new();

extern "C" fn sigprof_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let _guard = GATE.enter();
    if !ARMED.load(Ordering::Acquire) {
        return;
    }
    let Some(sink) = SIGNAL_SINK.get() else {
        return;
    };

    let ctx = unsafe { SignalContext::from_ucontext(ucontext) };
    sink.record_sample(&ctx, INTERVAL.load(Ordering::Relaxed), 0, None);
}

#[derive(Debug, Default)]
pub struct ItimerBackend {
    armed: bool,
}

impl ItimerBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn set_timer(interval_ns: u64) {
    // Sub-microsecond intervals would round to 0, which disarms the timer.
    let usec_total = if interval_ns == 0 {
        0
    } else {
        (interval_ns / 1_000).max(1)
    };
    let tv = libc::timeval {
        tv_sec: (usec_total / 1_000_000) as libc::time_t,
        tv_usec: (usec_total % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: tv,
        it_value: tv,
    };
    unsafe {
        libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut());
    }
}

impl SamplingBackend for ItimerBackend {
    fn name(&self) -> &'static str {
        "itimer"
    }

    fn supports(&self, mode: Mode, event: EventType) -> bool {
        mode == Mode::Cpu && event == EventType::CpuClock
    }

    fn start(&mut self, interval: u64, event: EventType, sink: &'static dyn SampleSink) -> bool {
        if interval == 0 || !self.supports(Mode::Cpu, event) {
            return false;
        }

        SIGNAL_SINK.install(sink);
        INTERVAL.store(interval, Ordering::Relaxed);
        if let Err(e) = signal::install_handler(libc::SIGPROF, sigprof_handler) {
            log::warn!("Cannot install SIGPROF handler: {}", e);
            return false;
        }

        ARMED.store(true, Ordering::Release);
        // Replaces any timer already running, so a second start re-arms in place.
        set_timer(interval);
        self.armed = true;
        log::debug!("itimer armed with {} ns interval", interval);
        true
    }

    fn stop(&mut self) {
        set_timer(0);
        ARMED.store(false, Ordering::Release);
        GATE.drain();
        if self.armed {
            log::debug!("itimer disarmed");
        }
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_parameters() {
        struct Nothing;
        impl SampleSink for Nothing {
            fn record_sample(
                &self,
                _ctx: &dyn crate::context::ExecutionContext,
                _weight: u64,
                _counter_id: u32,
                _call_chain: Option<&[u64]>,
            ) {
            }
        }
        static SINK: Nothing = Nothing;

        let mut backend = ItimerBackend::new();
        assert!(!backend.start(0, EventType::CpuClock, &SINK));
        assert!(!backend.start(1_000_000, EventType::Cycles, &SINK));
        assert!(!backend.armed);
        // Stopping a backend that never started is a no-op.
        backend.stop();
    }
}
