//! Sampling backends: the platform drivers that turn timers, hardware
//! counters or allocations into calls to a [`SampleSink`].
//!
//! Backends hold no aggregate state. Signal-driven variants share one
//! process-wide [`SinkCell`] because `SIGPROF` has a single handler per
//! process; the coordinator guarantees only one backend is armed at a time.

mod alloc;
#[cfg(unix)]
mod itimer;
mod manual;
#[cfg(target_os = "linux")]
mod perf;
#[cfg(unix)]
mod signal;
mod unsupported;

pub use alloc::{AllocationBackend, SamplingAllocator, allocator_installed};
#[cfg(unix)]
pub use itimer::ItimerBackend;
pub use manual::ManualBackend;
#[cfg(target_os = "linux")]
pub use perf::PerfEventBackend;
pub use unsupported::UnsupportedBackend;

use crate::args::{EventType, Mode, SamplingConfig};
use crate::context::ExecutionContext;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// OS thread id, as returned by `gettid`.
pub type Tid = i32;

/// Id of the calling thread, 0 where the platform has none.
pub fn current_tid() -> Tid {
    #[cfg(unix)]
    {
        signal::gettid()
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Receiver of samples. Called from signal handlers and the allocator, so
/// implementations must not allocate, block or panic.
pub trait SampleSink: Sync {
    /// `weight` is the observed interval (ns, events or bytes) the sample stands
    /// for, `counter_id` identifies the hardware counter that fired (0 if not
    /// applicable) and `call_chain` is a stack already collected by the backend.
    fn record_sample(
        &self,
        ctx: &dyn ExecutionContext,
        weight: u64,
        counter_id: u32,
        call_chain: Option<&[u64]>,
    );
}

pub trait SamplingBackend: Send {
    fn name(&self) -> &'static str;

    /// One-time preparation. Idempotent and never fatal.
    fn init(&mut self) {}

    fn supports(&self, mode: Mode, event: EventType) -> bool;

    /// Install the handler and arm the trigger.
    ///
    /// Returns false without side effects when `interval` is 0 or `event` is
    /// not supported. Calling it while armed re-arms with the new parameters.
    fn start(&mut self, interval: u64, event: EventType, sink: &'static dyn SampleSink) -> bool;

    /// Disarm the trigger. Safe to call when never started.
    fn stop(&mut self);

    fn create_for_thread(&mut self, _tid: Tid) {}

    fn destroy_for_thread(&mut self, _tid: Tid) {}

    fn create_for_all_threads(&mut self) {}

    fn destroy_for_all_threads(&mut self) {}

    /// Stack collected by the backend for the current thread's latest sample,
    /// innermost first. 0 means unsupported: the caller unwinds by itself.
    fn call_chain(&self, _buf: &mut [u64]) -> usize {
        0
    }
}

/// Pick the backend for a configuration on this platform.
pub fn for_config(config: &SamplingConfig) -> Box<dyn SamplingBackend> {
    match (config.mode, config.event_type) {
        (Mode::Heap, _) => Box::new(AllocationBackend::new()),
        #[cfg(unix)]
        (Mode::Cpu, EventType::CpuClock) => Box::new(ItimerBackend::new()),
        #[cfg(target_os = "linux")]
        (Mode::Cpu, _) => Box::new(PerfEventBackend::new()),
        #[allow(unreachable_patterns)]
        _ => Box::new(UnsupportedBackend),
    }
}

/// Publication point for the sink that signal handlers deliver to.
///
/// The sink reference is boxed once so it fits in a single atomic pointer.
/// A replaced box is leaked rather than freed because a handler on another
/// thread may still be reading it; re-installing the same sink allocates
/// nothing, so a process with one coordinator leaks at most one box.
pub(crate) struct SinkCell {
    ptr: AtomicPtr<&'static dyn SampleSink>,
}

impl SinkCell {
    pub(crate) const fn new() -> Self {
        SinkCell {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn install(&self, sink: &'static dyn SampleSink) {
        if let Some(current) = self.get()
            && ptr::addr_eq(current as *const dyn SampleSink, sink as *const dyn SampleSink)
        {
            return;
        }
        let boxed = Box::into_raw(Box::new(sink));
        self.ptr.store(boxed, Ordering::Release);
    }

    /// Async-signal-safe: a single atomic load.
    pub(crate) fn get(&self) -> Option<&'static dyn SampleSink> {
        let p = self.ptr.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { *p })
        }
    }
}

/// Sink used by every signal-driven backend.
pub(crate) static SIGNAL_SINK: SinkCell = SinkCell::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyntheticContext;
    use std::sync::atomic::AtomicU64;

    struct CountingSink(AtomicU64);

    impl SampleSink for CountingSink {
        fn record_sample(
            &self,
            _ctx: &dyn ExecutionContext,
            weight: u64,
            _counter_id: u32,
            _call_chain: Option<&[u64]>,
        ) {
            self.0.fetch_add(weight, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_sink_cell_delivers_to_installed_sink() {
        static FIRST: CountingSink = CountingSink(AtomicU64::new(0));
        static SECOND: CountingSink = CountingSink(AtomicU64::new(0));

        let cell = SinkCell::new();
        assert!(cell.get().is_none());

        cell.install(&FIRST);
        let before = cell.ptr.load(Ordering::Relaxed);
        cell.install(&FIRST);
        assert_eq!(cell.ptr.load(Ordering::Relaxed), before);

        let ctx = SyntheticContext::new(&[1]);
        cell.get().unwrap().record_sample(&ctx, 3, 0, None);
        cell.install(&SECOND);
        cell.get().unwrap().record_sample(&ctx, 4, 0, None);

        assert_eq!(FIRST.0.load(Ordering::Relaxed), 3);
        assert_eq!(SECOND.0.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_backend_selection() {
        let heap = for_config(&SamplingConfig::new(Mode::Heap, 1024, 16));
        assert_eq!(heap.name(), "allocation");

        #[cfg(unix)]
        {
            let cpu = for_config(&SamplingConfig::default());
            assert_eq!(cpu.name(), "itimer");
        }

        #[cfg(target_os = "linux")]
        {
            let config = SamplingConfig::default().with_event(EventType::Cycles);
            assert_eq!(for_config(&config).name(), "perf_events");
        }
    }
}
