//! Heap-mode sampling driven by a wrapping global allocator.
//!
//! Every thread counts the bytes it allocates; once the configured interval
//! is crossed the allocation that crossed it is sampled with the current
//! thread's stack and weighted by the bytes accumulated since the previous
//! sample.

use super::{SampleSink, SamplingBackend, SinkCell};
use crate::args::{EventType, Mode};
use crate::context::CurrentContext;
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static ARMED: AtomicBool = AtomicBool::new(false);
static INTERVAL: AtomicU64 = AtomicU64::new(u64::MAX);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static ALLOC_SINK: SinkCell = SinkCell::new();

// Const-initialized and without Drop, so touching them never allocates.
thread_local! {
    static ALLOCATED: Cell<u64> = const { Cell::new(0) };
    static IN_SAMPLE: Cell<bool> = const { Cell::new(false) };
}

/// True once a [`SamplingAllocator`] has served an allocation in this process.
pub fn allocator_installed() -> bool {
    INSTALLED.load(Ordering::Relaxed)
}

/// Global allocator that forwards to [`System`] and feeds heap-mode samples.
///
/// Install it with [`sampling_allocator!`](crate::sampling_allocator). While
/// heap profiling is not running the only overhead is one relaxed load per
/// allocation.
pub struct SamplingAllocator;

impl SamplingAllocator {
    pub const fn new() -> Self {
        SamplingAllocator
    }
}

impl Default for SamplingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for SamplingAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        mark_installed();
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            maybe_sample(layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        mark_installed();
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            maybe_sample(layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() && new_size > layout.size() {
            maybe_sample(new_size - layout.size());
        }
        new_ptr
    }
}

#[inline(always)]
fn mark_installed() {
    if !INSTALLED.load(Ordering::Relaxed) {
        INSTALLED.store(true, Ordering::Relaxed);
    }
}

#[inline(always)]
fn maybe_sample(size: usize) {
    if !ARMED.load(Ordering::Relaxed) {
        return;
    }
    let due = ALLOCATED
        .try_with(|allocated| {
            let total = allocated.get().saturating_add(size as u64);
            if total < INTERVAL.load(Ordering::Relaxed) {
                allocated.set(total);
                0
            } else {
                allocated.set(0);
                total
            }
        })
        .unwrap_or(0);
    if due > 0 {
        record_allocation(due);
    }
}

#[inline(never)]
fn record_allocation(weight: u64) {
    // Thread-local storage may already be torn down on an exiting thread.
    let Ok(reentered) = IN_SAMPLE.try_with(|flag| flag.replace(true)) else {
        return;
    };
    if reentered {
        return;
    }
    if let Some(sink) = ALLOC_SINK.get() {
        let ctx = CurrentContext::capture();
        sink.record_sample(&ctx, weight, 0, None);
    }
    let _ = IN_SAMPLE.try_with(|flag| flag.set(false));
}

#[derive(Debug, Default)]
pub struct AllocationBackend {
    armed: bool,
}

impl AllocationBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SamplingBackend for AllocationBackend {
    fn name(&self) -> &'static str {
        "allocation"
    }

    fn supports(&self, mode: Mode, _event: EventType) -> bool {
        mode == Mode::Heap && allocator_installed()
    }

    fn start(&mut self, interval: u64, _event: EventType, sink: &'static dyn SampleSink) -> bool {
        if interval == 0 || !allocator_installed() {
            return false;
        }
        ALLOC_SINK.install(sink);
        INTERVAL.store(interval, Ordering::Relaxed);
        ARMED.store(true, Ordering::Release);
        self.armed = true;
        log::debug!("allocation sampling armed every {} bytes", interval);
        true
    }

    fn stop(&mut self) {
        ARMED.store(false, Ordering::Release);
        INTERVAL.store(u64::MAX, Ordering::Relaxed);
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_mode_only() {
        let backend = AllocationBackend::new();
        assert_eq!(
            backend.supports(Mode::Heap, EventType::CpuClock),
            allocator_installed()
        );
        assert!(!backend.supports(Mode::Cpu, EventType::CpuClock));
    }

    #[test]
    fn test_allocator_forwards_to_system() {
        let alloc = SamplingAllocator::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        unsafe {
            let ptr = alloc.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            assert!(std::slice::from_raw_parts(ptr, 64).iter().all(|&b| b == 0));
            let grown = alloc.realloc(ptr, layout, 128);
            assert!(!grown.is_null());
            alloc.dealloc(grown, Layout::from_size_align(128, 8).unwrap());
        }
    }
}
