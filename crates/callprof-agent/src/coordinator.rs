//! The profiler state machine: IDLE --start--> RUNNING --stop--> IDLE.
//!
//! Control operations are serialized by a mutex. The sample path never takes
//! it: [`Coordinator::record_sample`] only bumps an in-flight counter, checks
//! the state, and records into the current table with atomics.

use crate::args::{CounterKind, Mode, SamplingConfig};
use crate::backend::{self, SampleSink, SamplingBackend};
use crate::context::ExecutionContext;
use crate::dump::{self, FrameResolver, RawAddresses, Snapshot};
use crate::error::{Error, Result};
use crate::table::{CallTraceTable, MAX_STACK_DEPTH, Recorded, UNKNOWN_FRAME};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

/// What [`Coordinator::status`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle { last_run: Option<Duration> },
    Running { config: SamplingConfig, elapsed: Duration },
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle { last_run: None } => write!(f, "Profiler is not active"),
            Status::Idle {
                last_run: Some(last),
            } => write!(
                f,
                "Profiler is not active (last run lasted {:.3} seconds)",
                last.as_secs_f64()
            ),
            Status::Running { config, elapsed } => {
                let what = match config.mode {
                    Mode::Cpu => config.event_type.name(),
                    Mode::Heap => "heap",
                };
                write!(
                    f,
                    "Profiling {} for {} seconds",
                    what,
                    elapsed.as_secs()
                )
            }
        }
    }
}

struct Control {
    backend: Option<Box<dyn SamplingBackend>>,
    /// Set by `with_backend`: keep the given backend instead of picking one per run.
    pinned: bool,
    config: Option<SamplingConfig>,
    started_at: Option<Instant>,
    last_run: Option<Duration>,
    resolver: Box<dyn FrameResolver>,
}

pub struct Coordinator {
    state: AtomicU8,
    in_flight: AtomicUsize,
    /// Replaced only under `control` while IDLE and drained.
    table: AtomicPtr<CallTraceTable>,
    truncated: AtomicU64,
    dropped: AtomicU64,
    control: Mutex<Control>,
}

impl Coordinator {
    /// A coordinator that picks the platform backend for each configuration.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A coordinator that always drives `backend`.
    pub fn with_backend(backend: impl SamplingBackend + 'static) -> Self {
        Self::build(Some(Box::new(backend)))
    }

    fn build(backend: Option<Box<dyn SamplingBackend>>) -> Self {
        Coordinator {
            state: AtomicU8::new(IDLE),
            in_flight: AtomicUsize::new(0),
            table: AtomicPtr::new(ptr::null_mut()),
            truncated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            control: Mutex::new(Control {
                pinned: backend.is_some(),
                backend,
                config: None,
                started_at: None,
                last_run: None,
                resolver: Box::new(RawAddresses),
            }),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Start a run with a fresh table.
    ///
    /// The coordinator hands itself to the backend as the sample sink, hence
    /// the `'static` receiver; use [`crate::api::profiler`] or leak a box.
    pub fn start(&'static self, config: SamplingConfig) -> Result<()> {
        config.validate()?;

        let mut control = self.control();
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        if !control.pinned {
            control.backend = Some(backend::for_config(&config));
        }
        let Some(backend) = control.backend.as_mut() else {
            return Err(Error::Unsupported {
                event: event_label(&config),
                backend: "none",
            });
        };
        backend.init();
        if !backend.supports(config.mode, config.event_type) {
            return Err(Error::Unsupported {
                event: event_label(&config),
                backend: backend.name(),
            });
        }

        // Samples of the previous run that are still inside record_sample
        // saw RUNNING before stop(); wait for them before freeing its table.
        // Samples of the new trigger see IDLE until the swap is done.
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }

        // A refused start keeps the previous run's table readable.
        let table = Box::new(CallTraceTable::new(config.framebuf));
        if !backend.start(config.interval, config.event_type, self) {
            return Err(Error::Unsupported {
                event: event_label(&config),
                backend: backend.name(),
            });
        }
        let backend_name = backend.name();

        let old = self.table.swap(Box::into_raw(table), Ordering::SeqCst);
        if !old.is_null() {
            drop(unsafe { Box::from_raw(old) });
        }
        self.truncated.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);

        control.config = Some(config);
        control.started_at = Some(Instant::now());
        self.state.store(RUNNING, Ordering::SeqCst);

        log::info!(
            "Profiling started: {} mode, event {}, interval {}, framebuf {} ({} backend)",
            config.mode,
            config.event_type,
            config.interval,
            config.framebuf,
            backend_name
        );
        Ok(())
    }

    /// Disarm sampling. No-op while IDLE; the table stays readable.
    pub fn stop(&self) {
        let mut control = self.control();
        if !self.is_running() {
            return;
        }
        self.state.store(IDLE, Ordering::SeqCst);
        if let Some(backend) = control.backend.as_mut() {
            backend.stop();
        }
        let elapsed = control.started_at.take().map(|t| t.elapsed());
        control.last_run = elapsed;

        log::info!(
            "Profiling stopped after {:.3}s, {} samples",
            elapsed.unwrap_or_default().as_secs_f64(),
            self.table_ref().map_or(0, |t| t.total_samples())
        );
    }

    pub fn status(&self) -> Status {
        let control = self.control();
        match (self.is_running(), control.config) {
            (true, Some(config)) => Status::Running {
                config,
                elapsed: control.started_at.map(|t| t.elapsed()).unwrap_or_default(),
            },
            _ => Status::Idle {
                last_run: control.last_run,
            },
        }
    }

    /// Register the calling thread with the backend (per-thread counters).
    pub fn thread_started(&self) {
        let mut control = self.control();
        if self.is_running()
            && let Some(active) = control.backend.as_mut()
        {
            active.create_for_thread(backend::current_tid());
        }
    }

    /// Unregister the calling thread before it exits.
    pub fn thread_ended(&self) {
        let mut control = self.control();
        if self.is_running()
            && let Some(active) = control.backend.as_mut()
        {
            active.destroy_for_thread(backend::current_tid());
        }
    }

    /// Resolver used by every dump from now on.
    pub fn set_resolver(&self, resolver: impl FrameResolver + 'static) {
        self.control().resolver = Box::new(resolver);
    }

    /// Must be called with `control` held, which keeps the table alive.
    fn table_ref(&self) -> Option<&CallTraceTable> {
        let table = self.table.load(Ordering::Acquire);
        unsafe { table.as_ref() }
    }

    pub fn total_samples(&self) -> u64 {
        let _control = self.control();
        self.table_ref().map_or(0, |t| t.total_samples())
    }

    pub fn snapshot(&self) -> Snapshot {
        let control = self.control();
        self.snapshot_locked(&control)
    }

    fn snapshot_locked(&self, control: &Control) -> Snapshot {
        Snapshot {
            mode: control.config.map(|c| c.mode).unwrap_or_default(),
            records: self.table_ref().map(|t| t.snapshot()).unwrap_or_default(),
            truncated: self.truncated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Run `render` over one snapshot and the current resolver, so several
    /// dumps of a running profile agree with each other.
    pub fn with_snapshot<R>(&self, render: impl FnOnce(&Snapshot, &dyn FrameResolver) -> R) -> R {
        let control = self.control();
        let snapshot = self.snapshot_locked(&control);
        render(&snapshot, control.resolver.as_ref())
    }

    pub fn dump_collapsed(&self, counter: CounterKind) -> String {
        let control = self.control();
        let snapshot = self.snapshot_locked(&control);
        dump::collapsed(&snapshot, counter, control.resolver.as_ref())
    }

    pub fn dump_summary(&self) -> String {
        let control = self.control();
        dump::summary(&self.snapshot_locked(&control))
    }

    pub fn dump_traces(&self, max: usize) -> String {
        let control = self.control();
        let snapshot = self.snapshot_locked(&control);
        dump::traces(&snapshot, max, control.resolver.as_ref())
    }

    pub fn dump_flat(&self, max: usize) -> String {
        let control = self.control();
        let snapshot = self.snapshot_locked(&control);
        dump::flat(&snapshot, max, control.resolver.as_ref())
    }

    fn record_into(
        &self,
        table: &CallTraceTable,
        ctx: &dyn ExecutionContext,
        weight: u64,
        call_chain: Option<&[u64]>,
    ) {
        let max_depth = table.max_depth();
        // One extra slot to tell a stack of exactly max_depth from a deeper one.
        let mut buf = [0u64; MAX_STACK_DEPTH + 1];
        let window = &mut buf[..max_depth + 1];

        let depth = match call_chain {
            Some(chain) if !chain.is_empty() => {
                let n = chain.len().min(window.len());
                window[..n].copy_from_slice(&chain[..n]);
                n
            }
            _ => ctx.walk(window),
        };

        let depth = if depth > max_depth {
            self.truncated.fetch_add(1, Ordering::Relaxed);
            max_depth
        } else {
            depth
        };

        let frames: &[u64] = if depth == 0 {
            &[UNKNOWN_FRAME]
        } else {
            &buf[..depth]
        };
        if table.record(frames, weight) == Recorded::Dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSink for Coordinator {
    /// Count one sample. Lock-free and allocation-free; samples arriving
    /// while IDLE are ignored. Runs use a single event, so `counter_id` does
    /// not split the data.
    fn record_sample(
        &self,
        ctx: &dyn ExecutionContext,
        weight: u64,
        _counter_id: u32,
        call_chain: Option<&[u64]>,
    ) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == RUNNING {
            let table = self.table.load(Ordering::Acquire);
            if let Some(table) = unsafe { table.as_ref() } {
                self.record_into(table, ctx, weight, call_chain);
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let table = self.table.swap(ptr::null_mut(), Ordering::SeqCst);
        if !table.is_null() {
            drop(unsafe { Box::from_raw(table) });
        }
    }
}

fn event_label(config: &SamplingConfig) -> &'static str {
    match config.mode {
        Mode::Cpu => config.event_type.name(),
        Mode::Heap => "heap",
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("running", &self.is_running())
            .field("truncated", &self.truncated.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
