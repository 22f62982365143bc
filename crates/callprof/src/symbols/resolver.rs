use super::dwarf::DebugInfo;
use crate::error::Result;
use crate::process::MemoryMaps;
use callprof_agent::{FrameResolver, Location};
use std::path::{Path, PathBuf};

/// Frames of the profiler and the allocator path it hooks. Samples are
/// attributed to the first frame below them.
const HIDDEN_FUNCTION_PATTERNS: &[&str] = &[
    // Sampling engine
    "callprof_agent::",
    "<callprof_agent::",
    // Rust allocator entry points
    "__rust_alloc",
    "__rust_realloc",
    "__rustc::",
    // Rust alloc crate internals
    "alloc::alloc::",
    "alloc::raw_vec::",
    "<alloc::alloc::Global as core::alloc::Allocator>",
];

/// Resolves sampled addresses of the current process to function names.
pub struct SymbolResolver {
    info: DebugInfo,
    maps: MemoryMaps,
    exe_path: PathBuf,
    /// Runtime address minus link-time address of the executable
    load_bias: u64,
}

impl SymbolResolver {
    /// Load symbols of the running executable.
    pub fn for_current_process() -> Result<Self> {
        let exe_path = std::env::current_exe()?;
        let info = DebugInfo::parse(&exe_path)?;
        let maps = MemoryMaps::for_self()?;
        Ok(Self::new(info, maps, exe_path))
    }

    pub fn new(info: DebugInfo, maps: MemoryMaps, exe_path: PathBuf) -> Self {
        let load_bias = maps.load_bias(&exe_path);
        SymbolResolver {
            info,
            maps,
            exe_path,
            load_bias,
        }
    }

    pub fn function_count(&self) -> usize {
        self.info.functions.len()
    }

    /// Number of address ranges loaded
    pub fn range_count(&self) -> usize {
        self.info.ranges.len()
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    fn in_executable(&self, addr: u64) -> bool {
        match self.maps.find(addr) {
            Some(mapping) => {
                mapping.pathname.as_deref().map(Path::new) == Some(self.exe_path.as_path())
            }
            // Unknown mappings (e.g. no /proc): assume the executable.
            None => self.maps.is_empty(),
        }
    }

    /// Function name for a runtime address in the executable.
    pub fn function_name(&self, addr: u64) -> Option<&str> {
        if !self.in_executable(addr) {
            return None;
        }
        let link_addr = addr.checked_sub(self.load_bias)?;
        self.info.function_at(link_addr).map(|f| f.name.as_str())
    }
}

impl FrameResolver for SymbolResolver {
    fn frame_name(&self, frame: u64) -> String {
        if let Some(name) = self.function_name(frame) {
            return name.to_string();
        }
        match self.maps.find(frame).and_then(|m| m.file_name()) {
            Some(file) => format!("[{}]", file),
            None => format!("0x{:x}", frame),
        }
    }

    fn location(&self, frame: u64) -> Option<Location> {
        if !self.in_executable(frame) {
            return None;
        }
        let range = self.info.range_at(frame.checked_sub(self.load_bias)?)?;
        Some(Location {
            file: simplify_path(&range.file),
            line: range.line,
        })
    }

    fn is_hidden(&self, frame: u64) -> bool {
        self.function_name(frame)
            .is_some_and(|name| HIDDEN_FUNCTION_PATTERNS.iter().any(|p| name.starts_with(p)))
    }
}

/// Simplify a file path for display
fn simplify_path(path: &str) -> String {
    // Standard library sources: keep the file name only
    if (path.contains("/rust/library/") || path.contains("/rustc/"))
        && let Some(filename) = path.rsplit('/').next()
    {
        return format!("<std>/{}", filename);
    }

    // Cargo dependencies: <crate-version>/path
    if path.contains("/.cargo/")
        && let Some(idx) = path.rfind("/src/")
    {
        let before_src = &path[..idx];
        if let Some(crate_start) = before_src.rfind('/') {
            return format!("<{}>/{}", &before_src[crate_start + 1..], &path[idx + 5..]);
        }
    }

    // Local paths: keep from src/
    if let Some(idx) = path.find("/src/") {
        return path[idx + 1..].to_string();
    }

    path.to_string()
}
