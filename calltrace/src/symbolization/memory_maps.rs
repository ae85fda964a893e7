//! Memory mapping utilities for process address space analysis
//!
//! This module parses `/proc/<pid>/maps` to find where a traced module is
//! loaded in the live process. The lowest mapping of a module is its base
//! address, which is what static addresses are translated against.
//!
//! The individual mappings are kept as well. Each one says which file offset
//! sits at which address, so [`ModuleMapping::place`] can locate a symbol
//! without going through the load bias at all.

use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::Path;

use super::elf_image::LoadSegment;
use crate::domain::Pid;

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One file-backed line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub range: MemoryRange,
    pub offset: u64,
    pub executable: bool,
    pub path: String,
}

impl Mapping {
    /// Address at which file offset `file_offset` is mapped, if it is
    #[must_use]
    pub fn address_of(&self, file_offset: u64) -> Option<u64> {
        let len = self.range.end - self.range.start;
        (file_offset >= self.offset && file_offset - self.offset < len)
            .then(|| self.range.start + (file_offset - self.offset))
    }
}

/// All mappings of one module, merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMapping {
    pub path: String,
    pub range: MemoryRange,
    /// The mapping that starts at `range.start`, as `/proc/<pid>/map_files`
    /// names it
    pub first_segment: MemoryRange,
    /// Every mapping of the module, lowest first
    pub mappings: Vec<Mapping>,
}

impl ModuleMapping {
    /// Live address of a static address, found through the mapping that
    /// holds its file offset
    ///
    /// `segments` are the image's `PT_LOAD` headers. Executable mappings are
    /// preferred, since a data segment may share its first file page with
    /// the end of the text. Returns `None` for addresses outside every
    /// segment or whose page the process did not map.
    #[must_use]
    pub fn place(&self, segments: &[LoadSegment], address: u64) -> Option<u64> {
        let segment = segments.iter().find(|segment| segment.contains(address))?;
        let file_offset = address - segment.address + segment.file_offset;

        self.mappings
            .iter()
            .filter(|mapping| mapping.executable)
            .chain(self.mappings.iter().filter(|mapping| !mapping.executable))
            .find_map(|mapping| mapping.address_of(file_offset))
    }
}

/// Parse the contents of a maps file
///
/// Anonymous and pseudo mappings (`[heap]`, `[stack]`, ...) are skipped;
/// only lines naming an absolute path are kept.
#[must_use]
pub fn parse_maps(content: &str) -> Vec<Mapping> {
    content.lines().filter_map(parse_line).collect()
}

// "start-end perms offset dev inode pathname"
fn parse_line(line: &str) -> Option<Mapping> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    // Paths may contain spaces; everything after the inode is the path.
    let path = parts.collect::<Vec<_>>().join(" ");
    if !path.starts_with('/') {
        return None;
    }

    let (start, end) = range.split_once('-')?;
    Some(Mapping {
        range: MemoryRange {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
        },
        offset: u64::from_str_radix(offset, 16).ok()?,
        executable: perms.contains('x'),
        path,
    })
}

/// Find every mapping of `module` and merge them
///
/// `module` matches the full mapped path, its file name, or the file name
/// without `.so`, so `/system/lib64/libgui.so`, `libgui.so` and `libgui` all
/// work.
#[must_use]
pub fn find_module(mappings: &[Mapping], module: &str) -> Option<ModuleMapping> {
    let first = mappings.iter().find(|m| names_module(&m.path, module))?;

    let mut same_file: Vec<Mapping> =
        mappings.iter().filter(|m| m.path == first.path).cloned().collect();
    same_file.sort_by_key(|m| m.range.start);

    let lowest = same_file.first()?.range;
    let end = same_file.iter().map(|m| m.range.end).max().unwrap_or(lowest.end);

    Some(ModuleMapping {
        path: first.path.clone(),
        range: MemoryRange { start: lowest.start, end },
        first_segment: lowest,
        mappings: same_file,
    })
}

fn names_module(path: &str, module: &str) -> bool {
    if path == module {
        return true;
    }
    let Some(file_name) = Path::new(path).file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    file_name == module || file_name.strip_suffix(".so") == Some(module)
}

/// Read `/proc/<pid>/maps` and locate `module` in it
///
/// # Errors
/// Returns an error if the maps file cannot be read or the module is not mapped
pub fn read_module_mapping(pid: Pid, module: &str) -> Result<ModuleMapping> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;

    let found = find_module(&parse_maps(&maps), module)
        .with_context(|| format!("Could not find memory range for {module} in {pid}"))?;

    debug!(
        "{module} mapped at 0x{:x} - 0x{:x} (size: {} KB)",
        found.range.start,
        found.range.end,
        (found.range.end - found.range.start) / 1024
    );
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
5581e3a00000-5581e3a02000 r--p 00000000 fd:01 1048 /usr/bin/screenrecord
5581e3a02000-5581e3a08000 r-xp 00002000 fd:01 1048 /usr/bin/screenrecord
5581e3a08000-5581e3a09000 rw-p 00008000 fd:01 1048 /usr/bin/screenrecord
5581e4000000-5581e4021000 rw-p 00000000 00:00 0    [heap]
7f2a10000000-7f2a10040000 r--p 00000000 fd:01 2200 /system/lib64/libgui.so
7f2a10040000-7f2a10100000 r-xp 00040000 fd:01 2200 /system/lib64/libgui.so
7ffd5c000000-7ffd5c021000 rw-p 00000000 00:00 0    [stack]
";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert!(!range.contains(0x2001));
    }

    #[test]
    fn test_parse_maps_skips_pseudo_mappings() {
        let mappings = parse_maps(MAPS);
        assert_eq!(mappings.len(), 5);
        assert!(mappings.iter().all(|m| m.path.starts_with('/')));
        assert_eq!(mappings[1].offset, 0x2000);
    }

    #[test]
    fn test_find_module_by_file_name() {
        let module = find_module(&parse_maps(MAPS), "libgui.so").unwrap();
        assert_eq!(module.path, "/system/lib64/libgui.so");
        assert_eq!(module.range, MemoryRange { start: 0x7f2a_1000_0000, end: 0x7f2a_1010_0000 });
        assert_eq!(module.first_segment.end, 0x7f2a_1004_0000);
    }

    #[test]
    fn test_find_module_by_full_path() {
        let module = find_module(&parse_maps(MAPS), "/usr/bin/screenrecord").unwrap();
        assert_eq!(module.range.start, 0x5581_e3a0_0000);
        assert_eq!(module.range.end, 0x5581_e3a0_9000);
    }

    #[test]
    fn test_find_module_without_extension() {
        let module = find_module(&parse_maps(MAPS), "libgui").unwrap();
        assert_eq!(module.path, "/system/lib64/libgui.so");
        assert_eq!(module.mappings.len(), 2);
        assert!(module.mappings[1].executable);
        assert!(find_module(&parse_maps(MAPS), "libg").is_none());
    }

    #[test]
    fn test_place_uses_the_mapping_of_the_file_offset() {
        // Text at vaddr 0x42000 comes from file offset 0x40000.
        let segments = [
            LoadSegment { address: 0, size: 0x40000, file_offset: 0 },
            LoadSegment { address: 0x42000, size: 0x100000, file_offset: 0x40000 },
        ];
        let module = find_module(&parse_maps(MAPS), "libgui.so").unwrap();

        assert_eq!(module.place(&segments, 0x42010), Some(0x7f2a_1004_0010));
        assert_eq!(module.place(&segments, 0x100), Some(0x7f2a_1000_0100));
        // Inside a segment, but past what the process mapped
        assert_eq!(module.place(&segments, 0x105000), None);
        // Between segments
        assert_eq!(module.place(&segments, 0x41000), None);
    }

    #[test]
    fn test_find_module_missing() {
        assert!(find_module(&parse_maps(MAPS), "libEGL.so").is_none());
    }

    #[test]
    fn test_path_with_spaces() {
        let mappings = parse_maps("1000-2000 r-xp 00000000 fd:01 7 /opt/my app/bin\n");
        assert_eq!(mappings[0].path, "/opt/my app/bin");
    }

    #[test]
    fn test_read_module_mapping_self() {
        // Our own test binary is always mapped into our own process.
        let pid = Pid(std::process::id());
        let exe = std::env::current_exe().expect("Failed to get current exe");
        let exe_path = exe.to_str().expect("Failed to convert exe path to string");

        // /proc may be unavailable in some sandboxes
        if let Ok(mapping) = read_module_mapping(pid, exe_path) {
            assert!(mapping.range.start < mapping.range.end);
        }
    }
}
