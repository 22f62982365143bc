use crate::error::{Error, Result};
use gimli::{EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol};
use std::fs::File;
use std::path::Path;

/// Symbols and line tables of one executable, in link-time addresses.
pub struct DebugInfo {
    /// Address ranges mapped to source locations, sorted by start
    pub ranges: Vec<AddressRange>,
    /// Function symbols, sorted by start
    pub functions: Vec<FunctionSymbol>,
}

/// An address range mapped to a source location
#[derive(Debug, Clone)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub start: u64,
    /// 0 when the symbol table does not record it
    pub size: u64,
    /// Demangled, without crate hashes
    pub name: String,
}

impl DebugInfo {
    /// Parse the symbol table and DWARF line info of an ELF file
    pub fn parse(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;

        let object = object::File::parse(&*mmap)
            .map_err(|e| Error::SymbolResolution(format!("Failed to parse ELF: {}", e)))?;

        let functions = Self::parse_functions(&object);
        let has_dwarf = object.section_by_name(".debug_info").is_some();
        if functions.is_empty() && !has_dwarf {
            return Err(Error::MissingDebugInfo {
                path: path.display().to_string(),
            });
        }

        let ranges = if has_dwarf {
            let endian = if object.is_little_endian() {
                RunTimeEndian::Little
            } else {
                RunTimeEndian::Big
            };
            Self::parse_line_info_from_object(&object, endian)?
        } else {
            log::warn!("{} has no DWARF line info, locations unavailable", path.display());
            Vec::new()
        };

        Ok(DebugInfo { ranges, functions })
    }

    /// Function containing `addr` (link-time address).
    pub fn function_at(&self, addr: u64) -> Option<&FunctionSymbol> {
        let idx = self.functions.partition_point(|f| f.start <= addr);
        let function = self.functions.get(idx.checked_sub(1)?)?;
        if function.size > 0 && addr >= function.start + function.size {
            return None;
        }
        Some(function)
    }

    /// Line range containing `addr` (link-time address).
    pub fn range_at(&self, addr: u64) -> Option<&AddressRange> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (addr < range.end).then_some(range)
    }

    fn parse_line_info_from_object(
        object: &object::File<'_>,
        endian: RunTimeEndian,
    ) -> Result<Vec<AddressRange>> {
        let load_section = |name: &str| -> &[u8] {
            object
                .section_by_name(name)
                .and_then(|s| s.data().ok())
                .unwrap_or(&[])
        };

        let dwarf = gimli::Dwarf {
            debug_abbrev: gimli::DebugAbbrev::new(load_section(".debug_abbrev"), endian),
            debug_info: gimli::DebugInfo::new(load_section(".debug_info"), endian),
            debug_line: gimli::DebugLine::new(load_section(".debug_line"), endian),
            debug_str: gimli::DebugStr::new(load_section(".debug_str"), endian),
            debug_line_str: gimli::DebugLineStr::new(load_section(".debug_line_str"), endian),
            ..Default::default()
        };

        Self::parse_line_info(&dwarf)
    }

    fn parse_line_info(
        dwarf: &gimli::Dwarf<EndianSlice<'_, RunTimeEndian>>,
    ) -> Result<Vec<AddressRange>> {
        let mut ranges = Vec::new();
        let mut units = dwarf.units();

        while let Ok(Some(header)) = units.next() {
            let unit = dwarf
                .unit(header)
                .map_err(|e| Error::SymbolResolution(format!("Failed to parse unit: {}", e)))?;

            let Some(program) = unit.line_program.clone() else {
                continue;
            };
            let mut rows = program.rows();
            let mut prev_row: Option<(u64, String, u32)> = None;

            while let Ok(Some((header, row))) = rows.next_row() {
                let addr = row.address();

                let file = row
                    .file(header)
                    .map(|f| {
                        let mut path = String::new();
                        if let Some(dir) = f.directory(header)
                            && let Ok(dir) = dwarf.attr_string(&unit, dir)
                            && let Ok(dir) = dir.to_string()
                        {
                            path.push_str(dir);
                            if !path.ends_with('/') {
                                path.push('/');
                            }
                        }
                        if let Ok(name) = dwarf.attr_string(&unit, f.path_name())
                            && let Ok(name) = name.to_string()
                        {
                            path.push_str(name);
                        }
                        path
                    })
                    .unwrap_or_default();
                let line = row.line().map(|l| l.get() as u32).unwrap_or(0);

                // Each row covers the addresses up to the next one
                if let Some((prev_addr, prev_file, prev_line)) = prev_row.take()
                    && addr > prev_addr
                    && !prev_file.is_empty()
                {
                    ranges.push(AddressRange {
                        start: prev_addr,
                        end: addr,
                        file: prev_file,
                        line: prev_line,
                    });
                }

                if !row.end_sequence() {
                    prev_row = Some((addr, file, line));
                }
            }
        }

        ranges.sort_by_key(|r| r.start);
        Ok(ranges)
    }

    fn parse_functions(object: &object::File<'_>) -> Vec<FunctionSymbol> {
        let mut functions: Vec<FunctionSymbol> = object
            .symbols()
            .filter(|s| s.kind() == object::SymbolKind::Text && s.address() != 0)
            .filter_map(|s| {
                let name = s.name().ok()?;
                Some(FunctionSymbol {
                    start: s.address(),
                    size: s.size(),
                    name: format!("{:#}", rustc_demangle::demangle(name)),
                })
            })
            .collect();

        functions.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| b.size.cmp(&a.size)));
        functions.dedup_by_key(|f| f.start);
        functions
    }
}
