//! Text renderings of a call-trace table snapshot.
//!
//! All functions here are pure: they read a [`Snapshot`] and a
//! [`FrameResolver`] and never touch the live table.

use crate::args::{CounterKind, Mode};
use crate::table::{OVERFLOW_FRAME, TraceRecord, UNKNOWN_FRAME};
use std::collections::HashMap;
use std::fmt::Write;

/// Source location of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

/// Turns frame ids (instruction addresses) into names for dumps.
pub trait FrameResolver: Send + Sync {
    fn frame_name(&self, frame: u64) -> String;

    fn location(&self, _frame: u64) -> Option<Location> {
        None
    }

    /// Frames belonging to the profiler itself (allocator hooks, signal
    /// trampolines). They are left out of rendered stacks.
    fn is_hidden(&self, _frame: u64) -> bool {
        false
    }
}

/// Default resolver: hexadecimal addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawAddresses;

impl FrameResolver for RawAddresses {
    fn frame_name(&self, frame: u64) -> String {
        marker_name(frame)
            .map(str::to_string)
            .unwrap_or_else(|| format!("0x{:x}", frame))
    }
}

/// Name of the reserved frame ids, which no resolver is asked about.
pub fn marker_name(frame: u64) -> Option<&'static str> {
    match frame {
        UNKNOWN_FRAME => Some("[unknown]"),
        OVERFLOW_FRAME => Some("[overflow]"),
        _ => None,
    }
}

/// Table contents plus the run-level counters needed by the summary.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub mode: Mode,
    /// Sorted by signature then frames, overflow bucket last.
    pub records: Vec<TraceRecord>,
    pub truncated: u64,
    pub dropped: u64,
}

impl Snapshot {
    pub fn total_samples(&self) -> u64 {
        self.records.iter().map(|r| r.samples).sum()
    }

    pub fn total_metric(&self) -> u64 {
        self.records.iter().map(|r| r.total).sum()
    }

    /// Distinct traces, not counting the overflow bucket.
    pub fn trace_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_overflow()).count()
    }

    pub fn overflow_samples(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.is_overflow())
            .map(|r| r.samples)
            .sum()
    }
}

/// Memoizes resolver lookups for the duration of one dump.
struct Names<'a> {
    resolver: &'a dyn FrameResolver,
    cache: HashMap<u64, String>,
}

impl<'a> Names<'a> {
    fn new(resolver: &'a dyn FrameResolver) -> Self {
        Names {
            resolver,
            cache: HashMap::new(),
        }
    }

    fn name(&mut self, frame: u64) -> &str {
        let resolver = self.resolver;
        self.cache.entry(frame).or_insert_with(|| match marker_name(frame) {
            Some(marker) => marker.to_string(),
            None => resolver.frame_name(frame),
        })
    }

    /// Frames of `record` without hidden ones, innermost first.
    /// A trace made only of hidden frames is shown unfiltered.
    fn visible(&self, record: &TraceRecord) -> Vec<u64> {
        let visible: Vec<u64> = record
            .frames
            .iter()
            .copied()
            .filter(|&f| marker_name(f).is_some() || !self.resolver.is_hidden(f))
            .collect();
        if visible.is_empty() {
            record.frames.clone()
        } else {
            visible
        }
    }
}

/// Collapsed stacks: `root;...;leaf count`, one line per trace.
pub fn collapsed(snapshot: &Snapshot, counter: CounterKind, resolver: &dyn FrameResolver) -> String {
    let mut names = Names::new(resolver);
    let mut out = String::new();

    for record in &snapshot.records {
        let count = match counter {
            CounterKind::Samples => record.samples,
            CounterKind::Total => record.total,
        };
        if count == 0 {
            continue;
        }

        let frames = names.visible(record);
        for (i, &frame) in frames.iter().rev().enumerate() {
            if i > 0 {
                out.push(';');
            }
            push_sanitized(&mut out, names.name(frame));
        }
        let _ = writeln!(out, " {}", count);
    }

    out
}

/// Collapsed lines are split on `;` and line breaks.
fn push_sanitized(out: &mut String, name: &str) {
    for c in name.chars() {
        match c {
            ';' => out.push('_'),
            '\n' | '\r' | '\t' => out.push(' '),
            c => out.push(c),
        }
    }
}

pub fn summary(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let unit = snapshot.mode.metric_unit();

    let _ = writeln!(out, "--- Execution profile ({} mode) ---", snapshot.mode);
    let _ = writeln!(out, "Distinct traces    : {}", snapshot.trace_count());
    let _ = writeln!(out, "Total samples      : {}", snapshot.total_samples());
    let _ = writeln!(out, "Total {:<13}: {}", unit, snapshot.total_metric());
    let _ = writeln!(out, "Truncated traces   : {}", snapshot.truncated);
    let _ = writeln!(out, "Dropped samples    : {}", snapshot.dropped);
    let _ = writeln!(out, "Overflow samples   : {}", snapshot.overflow_samples());
    out
}

/// The `max` heaviest traces by sample count, innermost frame first.
pub fn traces(snapshot: &Snapshot, max: usize, resolver: &dyn FrameResolver) -> String {
    let mut names = Names::new(resolver);
    let mut out = String::new();
    let total_samples = snapshot.total_samples();
    let unit = snapshot.mode.metric_unit();

    let mut ranked: Vec<&TraceRecord> = snapshot.records.iter().filter(|r| r.samples > 0).collect();
    // Stable sort: ties keep signature order.
    ranked.sort_by(|a, b| b.samples.cmp(&a.samples));

    for (rank, record) in ranked.into_iter().take(max).enumerate() {
        let _ = writeln!(
            out,
            "--- {} samples ({:.2}%), {} {}, trace {} ---",
            record.samples,
            percent(record.samples, total_samples),
            record.total,
            unit,
            rank + 1
        );
        for (depth, frame) in names.visible(record).into_iter().enumerate() {
            let name = names.name(frame).to_string();
            match resolver.location(frame) {
                Some(loc) if loc.line > 0 => {
                    let _ = writeln!(out, "  [{:>3}] {} ({}:{})", depth, name, loc.file, loc.line);
                }
                Some(loc) => {
                    let _ = writeln!(out, "  [{:>3}] {} ({})", depth, name, loc.file);
                }
                None => {
                    let _ = writeln!(out, "  [{:>3}] {}", depth, name);
                }
            }
        }
        out.push('\n');
    }

    out
}

/// Per-frame counts aggregated by resolved name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub name: String,
    /// Samples where the frame was on top of the stack.
    pub self_samples: u64,
    /// Samples where the frame appeared at any depth, counted once per trace.
    pub inclusive_samples: u64,
}

/// Flat profile ranked by self samples, ties by name.
pub fn flat_entries(snapshot: &Snapshot, resolver: &dyn FrameResolver) -> Vec<FlatEntry> {
    let mut names = Names::new(resolver);
    let mut by_name: HashMap<String, FlatEntry> = HashMap::new();

    for record in snapshot.records.iter().filter(|r| r.samples > 0) {
        let frames = names.visible(record);
        let mut seen: Vec<String> = Vec::with_capacity(frames.len());

        for (depth, &frame) in frames.iter().enumerate() {
            let name = names.name(frame).to_string();
            let entry = by_name.entry(name.clone()).or_insert_with(|| FlatEntry {
                name: name.clone(),
                self_samples: 0,
                inclusive_samples: 0,
            });
            if depth == 0 {
                entry.self_samples += record.samples;
            }
            if !seen.contains(&name) {
                entry.inclusive_samples += record.samples;
                seen.push(name);
            }
        }
    }

    let mut entries: Vec<FlatEntry> = by_name.into_values().collect();
    entries.sort_by(|a, b| {
        b.self_samples
            .cmp(&a.self_samples)
            .then_with(|| a.name.cmp(&b.name))
    });
    entries
}

pub fn flat(snapshot: &Snapshot, max: usize, resolver: &dyn FrameResolver) -> String {
    let total_samples = snapshot.total_samples();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{:>10} {:>7} {:>10} {:>7}  FRAME",
        "SELF", "SELF%", "TOTAL", "TOTAL%"
    );
    for entry in flat_entries(snapshot, resolver).into_iter().take(max) {
        let _ = writeln!(
            out,
            "{:>10} {:>6.2}% {:>10} {:>6.2}%  {}",
            entry.self_samples,
            percent(entry.self_samples, total_samples),
            entry.inclusive_samples,
            percent(entry.inclusive_samples, total_samples),
            entry.name
        );
    }
    out
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: u64 = 0xa0;
    const B: u64 = 0xb0;
    const C: u64 = 0xc0;
    const D: u64 = 0xd0;

    struct Letters;

    impl FrameResolver for Letters {
        fn frame_name(&self, frame: u64) -> String {
            match frame {
                A => "A".to_string(),
                B => "B".to_string(),
                C => "C;c".to_string(),
                D => "D".to_string(),
                other => format!("f{:x}", other),
            }
        }

        fn is_hidden(&self, frame: u64) -> bool {
            frame == 0x1
        }
    }

    fn record(frames: &[u64], samples: u64, total: u64) -> TraceRecord {
        TraceRecord {
            hash: crate::table::signature(frames),
            frames: frames.to_vec(),
            samples,
            total,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            mode: Mode::Cpu,
            records: vec![
                record(&[A, B, C], 100, 100_000),
                record(&[A, D], 50, 50_000),
                record(&[B], 0, 0),
            ],
            truncated: 0,
            dropped: 0,
        }
    }

    #[test]
    fn test_collapsed_is_root_first() {
        let out = collapsed(&snapshot(), CounterKind::Samples, &Letters);
        assert_eq!(out, "C_c;B;A 100\nD;A 50\n");

        let out = collapsed(&snapshot(), CounterKind::Total, &Letters);
        assert!(out.contains("D;A 50000\n"));
    }

    #[test]
    fn test_collapsed_sums_to_total() {
        let snap = snapshot();
        let sum: u64 = collapsed(&snap, CounterKind::Samples, &RawAddresses)
            .lines()
            .map(|l| l.rsplit(' ').next().unwrap().parse::<u64>().unwrap())
            .sum();
        assert_eq!(sum, snap.total_samples());
    }

    #[test]
    fn test_hidden_frames_are_skipped() {
        let snap = Snapshot {
            records: vec![record(&[0x1, A], 3, 3), record(&[0x1], 2, 2)],
            ..Default::default()
        };
        let out = collapsed(&snap, CounterKind::Samples, &Letters);
        assert_eq!(out, "A 3\nf1 2\n");
    }

    #[test]
    fn test_traces_ranked_and_capped() {
        let out = traces(&snapshot(), 1, &Letters);
        assert!(out.starts_with("--- 100 samples (66.67%), 100000 ns, trace 1 ---\n"));
        assert!(out.contains("[  0] A\n"));
        assert!(!out.contains("trace 2"));

        let out = traces(&snapshot(), usize::MAX, &Letters);
        let first = out.find("trace 1").unwrap();
        let second = out.find("trace 2").unwrap();
        assert!(first < second);
        assert!(out[second..].contains("[  1] D"));
        // Zero-count entries are not listed.
        assert!(!out.contains("trace 3"));
    }

    #[test]
    fn test_flat_self_and_inclusive() {
        let entries = flat_entries(&snapshot(), &Letters);
        assert_eq!(entries[0].name, "A");
        assert_eq!(entries[0].self_samples, 150);
        assert_eq!(entries[0].inclusive_samples, 150);

        let b = entries.iter().find(|e| e.name == "B").unwrap();
        assert_eq!(b.self_samples, 0);
        assert_eq!(b.inclusive_samples, 100);

        let out = flat(&snapshot(), 1, &Letters);
        assert_eq!(out.lines().count(), 2);
        assert!(out.lines().nth(1).unwrap().ends_with("  A"));
    }

    #[test]
    fn test_flat_counts_recursion_once() {
        let snap = Snapshot {
            records: vec![record(&[A, B, A], 4, 4)],
            ..Default::default()
        };
        let entries = flat_entries(&snap, &Letters);
        let a = entries.iter().find(|e| e.name == "A").unwrap();
        assert_eq!(a.self_samples, 4);
        assert_eq!(a.inclusive_samples, 4);
    }

    #[test]
    fn test_summary_and_markers() {
        let snap = Snapshot {
            mode: Mode::Heap,
            records: vec![record(&[UNKNOWN_FRAME], 2, 64), record(&[OVERFLOW_FRAME], 1, 32)],
            truncated: 5,
            dropped: 1,
        };
        let out = summary(&snap);
        assert!(out.contains("Distinct traces    : 1\n"));
        assert!(out.contains("Total samples      : 3\n"));
        assert!(out.contains("Total bytes        : 96\n"));
        assert!(out.contains("Truncated traces   : 5\n"));
        assert!(out.contains("Overflow samples   : 1\n"));

        let out = collapsed(&snap, CounterKind::Samples, &RawAddresses);
        assert_eq!(out, "[unknown] 2\n[overflow] 1\n");
    }
}
