mod maps;

pub use maps::{MemoryMapping, MemoryMaps};

use std::fs;

/// Current kernel.perf_event_paranoid level, if readable.
pub fn perf_event_paranoid() -> Option<i32> {
    let content = fs::read_to_string("/proc/sys/kernel/perf_event_paranoid").ok()?;
    content.trim().parse().ok()
}
