//! Lock-free call-trace table shared by all sampled threads.
//!
//! Everything is allocated up front by [`CallTraceTable::new`]; recording a
//! sample only performs atomic loads, stores, CAS and fetch-adds on that
//! memory, so it is safe to call from a signal handler.
//!
//! A slot goes through three states:
//! - empty: `hash == 0`
//! - claimed: `hash != 0`, `depth == PENDING` (frames being copied)
//! - published: `hash != 0`, `depth` holds the trace length
//!
//! Slots are never released while the table lives, which is what makes
//! insertion exactly-once: racing writers of the same trace walk the same
//! probe sequence and only one CAS on a given empty slot can succeed.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Deepest stack the engine captures, regardless of the frame buffer size.
pub const MAX_STACK_DEPTH: usize = 1024;

/// Most distinct call traces a table can hold.
pub const MAX_CALL_TRACES: usize = 65536;

/// Frame id recorded when nothing could be unwound.
pub const UNKNOWN_FRAME: u64 = 0;

/// Frame id of the bucket collecting samples that did not fit the table.
pub const OVERFLOW_FRAME: u64 = u64::MAX;

/// Marker for a claimed slot whose frames are not yet visible.
const PENDING: u32 = u32::MAX;

/// How long a reader waits for a claimed slot to be published.
const PUBLISH_SPIN_LIMIT: u32 = 1 << 12;

/// Result of [`CallTraceTable::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Counted against the trace's own entry.
    Trace,
    /// The table is full; counted against the overflow bucket.
    Overflow,
    /// A matching slot stayed unpublished for the whole spin; not counted.
    Dropped,
}

struct TraceSlot {
    hash: AtomicU64,
    offset: AtomicUsize,
    depth: AtomicU32,
    samples: AtomicU64,
    total: AtomicU64,
}

impl TraceSlot {
    fn new() -> Self {
        TraceSlot {
            hash: AtomicU64::new(0),
            offset: AtomicUsize::new(0),
            depth: AtomicU32::new(PENDING),
            samples: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }
}

/// One distinct call trace copied out of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub hash: u64,
    /// Innermost first. `[OVERFLOW_FRAME]` for the overflow bucket.
    pub frames: Vec<u64>,
    pub samples: u64,
    pub total: u64,
}

impl TraceRecord {
    pub fn is_overflow(&self) -> bool {
        self.frames == [OVERFLOW_FRAME]
    }
}

pub struct CallTraceTable {
    slots: Box<[TraceSlot]>,
    frames: Box<[AtomicU64]>,
    frames_used: AtomicUsize,
    traces_used: AtomicUsize,
    max_traces: usize,
    max_depth: usize,
    overflow_samples: AtomicU64,
    overflow_total: AtomicU64,
}

impl CallTraceTable {
    /// Build a table whose frame arena holds `framebuf` frames.
    ///
    /// The dictionary tracks up to `min(framebuf, MAX_CALL_TRACES)` traces
    /// and keeps twice as many slots to keep probe sequences short.
    pub fn new(framebuf: usize) -> Self {
        let framebuf = framebuf.max(1);
        let max_traces = framebuf.min(MAX_CALL_TRACES);
        let slot_count = (max_traces * 2).next_power_of_two();

        CallTraceTable {
            slots: (0..slot_count).map(|_| TraceSlot::new()).collect(),
            frames: (0..framebuf).map(|_| AtomicU64::new(0)).collect(),
            frames_used: AtomicUsize::new(0),
            traces_used: AtomicUsize::new(0),
            max_traces,
            max_depth: framebuf.min(MAX_STACK_DEPTH),
            overflow_samples: AtomicU64::new(0),
            overflow_total: AtomicU64::new(0),
        }
    }

    /// Longest trace this table stores; deeper traces must be truncated by the caller.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn frame_capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn trace_capacity(&self) -> usize {
        self.max_traces
    }

    /// Number of distinct traces stored, not counting the overflow bucket.
    pub fn trace_count(&self) -> usize {
        self.traces_used.load(Ordering::Acquire)
    }

    pub fn overflow_samples(&self) -> u64 {
        self.overflow_samples.load(Ordering::Relaxed)
    }

    /// Count one sample of `weight` against `frames` (innermost first).
    ///
    /// `frames` must be non-empty and at most [`max_depth`](Self::max_depth) long.
    pub fn record(&self, frames: &[u64], weight: u64) -> Recorded {
        debug_assert!(!frames.is_empty() && frames.len() <= self.max_depth);

        let hash = signature(frames);
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        let mut probes = 0;

        while probes < self.slots.len() {
            let slot = &self.slots[idx];
            let stored = slot.hash.load(Ordering::Acquire);

            if stored == 0 {
                let Some(offset) = self.reserve(frames.len()) else {
                    return self.record_overflow(weight);
                };
                match slot
                    .hash
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        for (i, &frame) in frames.iter().enumerate() {
                            self.frames[offset + i].store(frame, Ordering::Relaxed);
                        }
                        slot.offset.store(offset, Ordering::Relaxed);
                        slot.depth.store(frames.len() as u32, Ordering::Release);
                        slot.samples.fetch_add(1, Ordering::Relaxed);
                        slot.total.fetch_add(weight, Ordering::Relaxed);
                        return Recorded::Trace;
                    }
                    Err(_) => {
                        // Lost the race: hand back the reservation, then look at
                        // the winner's entry before moving on.
                        self.release(offset, frames.len());
                        continue;
                    }
                }
            }

            if stored == hash {
                let Some(depth) = wait_published(slot) else {
                    return Recorded::Dropped;
                };
                if self.frames_equal(slot, depth, frames) {
                    slot.samples.fetch_add(1, Ordering::Relaxed);
                    slot.total.fetch_add(weight, Ordering::Relaxed);
                    return Recorded::Trace;
                }
            }

            idx = (idx + 1) & mask;
            probes += 1;
        }

        self.record_overflow(weight)
    }

    /// Claim a trace entry and `len` arena frames, or `None` when either is exhausted.
    fn reserve(&self, len: usize) -> Option<usize> {
        let mut traces = self.traces_used.load(Ordering::Relaxed);
        loop {
            if traces >= self.max_traces {
                return None;
            }
            match self.traces_used.compare_exchange_weak(
                traces,
                traces + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => traces = current,
            }
        }

        let mut used = self.frames_used.load(Ordering::Relaxed);
        loop {
            if used + len > self.frames.len() {
                // Give the dictionary entry back; the arena is what ran out.
                self.traces_used.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
            match self.frames_used.compare_exchange_weak(
                used,
                used + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(used),
                Err(current) => used = current,
            }
        }
    }

    /// Undo a [`reserve`](Self::reserve). Arena frames are only returned when no
    /// other reservation was made after this one; otherwise they stay unused.
    fn release(&self, offset: usize, len: usize) {
        self.traces_used.fetch_sub(1, Ordering::AcqRel);
        let _ = self.frames_used.compare_exchange(
            offset + len,
            offset,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn record_overflow(&self, weight: u64) -> Recorded {
        self.overflow_samples.fetch_add(1, Ordering::Relaxed);
        self.overflow_total.fetch_add(weight, Ordering::Relaxed);
        Recorded::Overflow
    }

    fn frames_equal(&self, slot: &TraceSlot, depth: usize, frames: &[u64]) -> bool {
        if depth != frames.len() {
            return false;
        }
        let offset = slot.offset.load(Ordering::Relaxed);
        frames
            .iter()
            .enumerate()
            .all(|(i, &f)| self.frames[offset + i].load(Ordering::Relaxed) == f)
    }

    /// Sum of sample counts over every entry, overflow bucket included.
    pub fn total_samples(&self) -> u64 {
        let traced: u64 = self
            .slots
            .iter()
            .map(|s| s.samples.load(Ordering::Relaxed))
            .sum();
        traced + self.overflow_samples.load(Ordering::Relaxed)
    }

    /// Copy out every published entry, sorted by signature then frames.
    ///
    /// The overflow bucket is appended last when it has samples.
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        let mut records: Vec<TraceRecord> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let hash = slot.hash.load(Ordering::Acquire);
                if hash == 0 {
                    return None;
                }
                let depth = slot.depth.load(Ordering::Acquire);
                if depth == PENDING {
                    return None;
                }
                let offset = slot.offset.load(Ordering::Relaxed);
                let frames = (0..depth as usize)
                    .map(|i| self.frames[offset + i].load(Ordering::Relaxed))
                    .collect();
                Some(TraceRecord {
                    hash,
                    frames,
                    samples: slot.samples.load(Ordering::Relaxed),
                    total: slot.total.load(Ordering::Relaxed),
                })
            })
            .collect();

        records.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.frames.cmp(&b.frames)));

        let overflow_samples = self.overflow_samples.load(Ordering::Relaxed);
        if overflow_samples > 0 {
            records.push(TraceRecord {
                hash: signature(&[OVERFLOW_FRAME]),
                frames: vec![OVERFLOW_FRAME],
                samples: overflow_samples,
                total: self.overflow_total.load(Ordering::Relaxed),
            });
        }

        records
    }
}

/// Spin until a claimed slot is published. Bounded so a handler that
/// interrupted the claiming writer on the same thread cannot hang.
fn wait_published(slot: &TraceSlot) -> Option<usize> {
    for _ in 0..PUBLISH_SPIN_LIMIT {
        let depth = slot.depth.load(Ordering::Acquire);
        if depth != PENDING {
            return Some(depth as usize);
        }
        std::hint::spin_loop();
    }
    None
}

/// FNV-1a over the frames and the trace length. Never 0, which marks an empty slot.
pub fn signature(frames: &[u64]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for &frame in frames {
        hash ^= frame;
        hash = hash.wrapping_mul(PRIME);
    }
    hash ^= frames.len() as u64;
    hash = hash.wrapping_mul(PRIME);

    if hash == 0 { 1 } else { hash }
}
