use crate::error::Result;
use std::fs;
use std::path::Path;

/// A parsed memory mapping from /proc/[pid]/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Last path component, e.g. `libc.so.6`.
    pub fn file_name(&self) -> Option<&str> {
        let path = self.pathname.as_deref()?;
        if path.starts_with('[') {
            return None;
        }
        path.rsplit('/').next()
    }
}

/// Collection of memory mappings for a process
#[derive(Debug, Clone, Default)]
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMaps {
    /// Parse /proc/self/maps
    pub fn for_self() -> Result<Self> {
        let content = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mappings = content.lines().filter_map(Self::parse_line).collect();
        MemoryMaps { mappings }
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let perms = parts[1].to_string();
        let offset = u64::from_str_radix(parts[2], 16).ok()?;

        // Pathname is the last field (if present)
        let pathname = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Load bias of the executable at `exe_path`: runtime address minus link address.
    ///
    /// The first mapping of the file has offset 0 and gives the true load
    /// base; the executable segment usually has a non-zero file offset.
    /// Non-PIE executables are not found by path and get 0.
    pub fn load_bias(&self, exe_path: &Path) -> u64 {
        let exe_str = exe_path.to_string_lossy();
        self.mappings
            .iter()
            .find(|m| m.pathname.as_deref() == Some(exe_str.as_ref()))
            .map_or(0, |m| m.start - m.offset)
    }

    /// Mapping containing `addr`.
    pub fn find(&self, addr: u64) -> Option<&MemoryMapping> {
        self.mappings.iter().find(|m| m.contains(addr))
    }

    pub fn executable_mappings(&self) -> impl Iterator<Item = &MemoryMapping> {
        self.mappings.iter().filter(|m| m.is_executable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d4c3a00000-55d4c3a1e000 r--p 00000000 08:01 1311 /usr/bin/app
55d4c3a1e000-55d4c3b0c000 r-xp 0001e000 08:01 1311 /usr/bin/app
55d4c4f7d000-55d4c4f9e000 rw-p 00000000 00:00 0 [heap]
7f1a2b400000-7f1a2b428000 r--p 00000000 08:01 2048 /usr/lib/x86_64-linux-gnu/libc.so.6
7f1a2b428000-7f1a2b5bd000 r-xp 00028000 08:01 2048 /usr/lib/x86_64-linux-gnu/libc.so.6
7ffd1c9e2000-7ffd1ca03000 rw-p 00000000 00:00 0
garbage line
";

    #[test]
    fn test_parse_maps() {
        let maps = MemoryMaps::parse(MAPS);
        assert_eq!(maps.len(), 6);
        assert_eq!(maps.executable_mappings().count(), 2);

        let heap = maps.find(0x55d4c4f80000).unwrap();
        assert_eq!(heap.pathname.as_deref(), Some("[heap]"));
        assert_eq!(heap.file_name(), None);
        assert!(maps.find(0x10).is_none());
    }

    #[test]
    fn test_load_bias_uses_first_mapping() {
        let maps = MemoryMaps::parse(MAPS);
        assert_eq!(maps.load_bias(Path::new("/usr/bin/app")), 0x55d4c3a00000);
        assert_eq!(maps.load_bias(Path::new("/usr/bin/other")), 0);

        let libc = maps.find(0x7f1a2b430000).unwrap();
        assert!(libc.is_executable());
        assert_eq!(libc.file_name(), Some("libc.so.6"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_self_maps_contain_code() {
        let maps = MemoryMaps::for_self().unwrap();
        let here = test_self_maps_contain_code as usize as u64;
        assert!(maps.find(here).unwrap().is_executable());
    }
}
