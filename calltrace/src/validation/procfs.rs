//! Live-process view of a local Linux pid through `/proc`
//!
//! The module list comes from `/proc/<pid>/maps`. Build ids and function
//! lists are read from the file the process actually mapped, reached through
//! `/proc/<pid>/map_files` (or `/proc/<pid>/root` when that is not
//! readable), so a binary replaced on disk after the target started is not
//! mistaken for the loaded one.
//!
//! Addresses in the live view are placed through the mapping that holds each
//! symbol's file offset, never through the load bias and module base that
//! translation uses. The cross-check therefore compares two different
//! computations, and a wrong bias or base shows up as a mismatch.

use anyhow::{Context, Result};
use log::debug;
use std::path::PathBuf;

use crate::domain::{Pid, ValidationError};
use crate::engine::{RemoteFunction, RemoteModule, RemoteProcess};
use crate::symbolization::{
    read_module_mapping, BinaryImage, ElfImage, FunctionSymbol, LoadSegment, ModuleMapping,
};

#[derive(Debug, Clone, Copy)]
pub struct ProcfsProcess {
    pid: Pid,
}

impl ProcfsProcess {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    fn mapping(&self, name: &str) -> Result<ModuleMapping> {
        read_module_mapping(self.pid, name).map_err(|e| {
            debug!("{name} lookup in {} failed: {e:#}", self.pid);
            ValidationError::ModuleNotFound { module: name.to_string(), pid: self.pid }.into()
        })
    }

    /// Open the image exactly as the process mapped it
    fn mapped_image(&self, mapping: &ModuleMapping) -> Result<ElfImage> {
        let map_file = PathBuf::from(format!(
            "/proc/{}/map_files/{:x}-{:x}",
            self.pid.0, mapping.first_segment.start, mapping.first_segment.end
        ));
        if let Ok(image) = ElfImage::open(&map_file) {
            return Ok(image);
        }

        let root_path = PathBuf::from(format!("/proc/{}/root", self.pid.0))
            .join(mapping.path.trim_start_matches('/'));
        ElfImage::open(&root_path)
            .with_context(|| format!("Cannot read {} as mapped by {}", mapping.path, self.pid))
    }
}

impl ProcfsProcess {
    /// Runtime address of a symbol the module exports
    ///
    /// # Errors
    /// Returns an error if the module is not loaded or has no such export
    pub fn export_address(&self, module: &str, symbol: &str) -> Result<u64> {
        let mapping = self.mapping(module)?;
        let image = self.mapped_image(&mapping)?;
        let segments = image.load_segments()?;

        image
            .exported_functions()?
            .into_iter()
            .find(|export| export.name == symbol)
            .and_then(|export| mapping.place(&segments, export.address))
            .with_context(|| format!("{module} in {} does not export {symbol}", self.pid))
    }
}

impl RemoteProcess for ProcfsProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn module_by_name(&self, name: &str) -> Result<RemoteModule> {
        let mapping = self.mapping(name)?;
        let image = self.mapped_image(&mapping)?;
        Ok(RemoteModule {
            name: name.to_string(),
            path: PathBuf::from(&mapping.path),
            base_address: mapping.range.start,
            build_id: image.module_info().build_id,
        })
    }

    fn functions_of_module(&self, name: &str) -> Result<Vec<RemoteFunction>> {
        let mapping = self.mapping(name)?;
        let image = self.mapped_image(&mapping)?;
        let segments = image.load_segments()?;
        Ok(place_functions(&mapping, &segments, image.functions()?))
    }
}

/// Live addresses of `symbols`, dropping any the process has not mapped
fn place_functions(
    mapping: &ModuleMapping,
    segments: &[LoadSegment],
    symbols: Vec<FunctionSymbol>,
) -> Vec<RemoteFunction> {
    symbols
        .into_iter()
        .filter_map(|symbol| {
            let address = mapping.place(segments, symbol.address)?;
            Some(RemoteFunction { address, size: Some(symbol.size), name: symbol.name })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NativeCandidate, NativeFunction};
    use crate::symbolization::{Mapping, MemoryRange};
    use crate::validation::{cross_check, ModuleInfo};

    const BASE: u64 = 0x7f00_0000_0000;

    // Read-only headers at offset 0, text at file offset 0x1000 loaded at 0x2000
    fn segments() -> Vec<LoadSegment> {
        vec![
            LoadSegment { address: 0, size: 0x1000, file_offset: 0 },
            LoadSegment { address: 0x2000, size: 0x3000, file_offset: 0x1000 },
        ]
    }

    fn module_mapping() -> ModuleMapping {
        let path = "/system/lib64/librender.so".to_string();
        let mapping = |start, end, offset, executable| Mapping {
            range: MemoryRange { start, end },
            offset,
            executable,
            path: path.clone(),
        };
        ModuleMapping {
            path: path.clone(),
            range: MemoryRange { start: BASE, end: BASE + 0x5000 },
            first_segment: MemoryRange { start: BASE, end: BASE + 0x1000 },
            mappings: vec![
                mapping(BASE, BASE + 0x1000, 0, false),
                mapping(BASE + 0x2000, BASE + 0x5000, 0x1000, true),
            ],
        }
    }

    fn render() -> NativeCandidate {
        NativeCandidate {
            module: "librender.so".to_string(),
            name: "render".to_string(),
            demangled_name: None,
            static_address: 0x2400,
            size: 64,
            source: None,
        }
    }

    #[test]
    fn test_place_functions_skips_unmapped() {
        let symbols = vec![
            FunctionSymbol { name: "render".to_string(), address: 0x2400, size: 64 },
            FunctionSymbol { name: "gap".to_string(), address: 0x1800, size: 8 },
        ];

        let live = place_functions(&module_mapping(), &segments(), symbols);

        assert_eq!(live, [RemoteFunction { name: "render".to_string(), address: BASE + 0x2400, size: Some(64) }]);
    }

    #[test]
    fn test_wrong_load_bias_is_caught() {
        let symbols = vec![FunctionSymbol { name: "render".to_string(), address: 0x2400, size: 64 }];
        let live = place_functions(&module_mapping(), &segments(), symbols);

        let translated = |load_bias| {
            let module = ModuleInfo {
                name: "librender.so".to_string(),
                load_bias,
                base_address: BASE,
                build_id: None,
            };
            [NativeFunction { runtime_address: module.translate(0x2400), candidate: render() }]
        };

        assert!(cross_check("librender.so", &translated(0), &live).is_ok());
        assert!(matches!(
            cross_check("librender.so", &translated(0x1000), &live),
            Err(ValidationError::AddressMismatch { expected, actual, .. })
                if expected == BASE + 0x1400 && actual == BASE + 0x2400
        ));
    }

    #[test]
    fn test_missing_module_is_module_not_found() {
        let process = ProcfsProcess::new(Pid(std::process::id()));
        let err = process.module_by_name("libdefinitely-not-loaded.so").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::ModuleNotFound { .. })
        ));
    }

    #[test]
    fn test_own_executable_is_visible() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap().to_string();
        let process = ProcfsProcess::new(Pid(std::process::id()));

        // /proc may be restricted in some sandboxes
        let Ok(module) = process.module_by_name(&name) else { return };
        assert!(module.base_address > 0);

        let functions = process.functions_of_module(&name).unwrap();
        assert!(!functions.is_empty());
        assert!(functions.iter().all(|f| f.size.is_some()));
    }

    #[test]
    fn test_missing_export() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap().to_string();
        let process = ProcfsProcess::new(Pid(std::process::id()));

        assert!(process.export_address(&name, "calltrace_no_such_export").is_err());
    }
}
