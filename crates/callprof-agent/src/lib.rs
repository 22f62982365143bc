//! In-process statistical sampling profiler engine.
//!
//! A [`Coordinator`] owns a profiling run: it arms a sampling backend
//! (interval timer, perf counters or the sampling allocator), receives every
//! sample through [`SampleSink::record_sample`] and aggregates the stacks
//! into a lock-free [`CallTraceTable`]. Dumps render the table as collapsed
//! stacks, a summary, ranked traces or a flat profile.
//!
//! # Usage
//!
//! ```rust,ignore
//! callprof_agent::sampling_allocator!(); // only needed for heap mode
//!
//! callprof_agent::api::execute("start,cpu,interval=1000000")?;
//! run_workload();
//! let report = callprof_agent::api::execute("stop,summary,flat=20")?;
//! ```
//!
//! Build with frame pointers for complete stacks:
//! ```bash
//! RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release
//! ```

pub mod api;
pub mod args;
pub mod backend;
pub mod context;
pub mod coordinator;
pub mod dump;
pub mod error;
pub mod table;

pub use args::{Action, Arguments, CounterKind, EventType, Mode, SamplingConfig};
pub use backend::{SampleSink, SamplingAllocator, SamplingBackend};
pub use context::ExecutionContext;
pub use coordinator::{Coordinator, Status};
pub use dump::{FrameResolver, Location, RawAddresses, Snapshot};
pub use error::{Error, Result};
pub use table::{CallTraceTable, MAX_CALL_TRACES, MAX_STACK_DEPTH};

/// Install [`SamplingAllocator`] as the global allocator, enabling heap mode.
///
/// ```rust,ignore
/// callprof_agent::sampling_allocator!();
/// ```
#[macro_export]
macro_rules! sampling_allocator {
    () => {
        #[global_allocator]
        static __CALLPROF_ALLOC: $crate::SamplingAllocator = $crate::SamplingAllocator::new();
    };
}
