use anyhow::{Context, Result};
use log::{debug, warn};
use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use super::reader::{BinaryImage, BinaryReader, FunctionSymbol, LocalModuleInfo};
use super::symbolizer::{SourceLocation, Symbolizer};

/// Page granularity used when rounding the lowest `PT_LOAD` down
const PAGE_MASK: u64 = !0xfff;

/// One `PT_LOAD` program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    /// Static virtual address
    pub address: u64,
    /// Size in memory
    pub size: u64,
    pub file_offset: u64,
}

impl LoadSegment {
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size
    }
}

/// A parsed ELF file plus its DWARF line tables
pub struct ElfImage {
    path: PathBuf,
    data: Vec<u8>,
    info: LocalModuleInfo,
    symbolizer: Option<Symbolizer>,
}

impl ElfImage {
    /// Read and parse the ELF file at `path`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not an object file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;

        let obj = object::File::parse(&*data)
            .with_context(|| format!("Failed to parse object file {}", path.display()))?;

        let info = LocalModuleInfo { load_bias: load_bias(&obj), build_id: build_id(&obj) };

        let symbolizer = match Symbolizer::from_object(&obj) {
            Ok(symbolizer) => Some(symbolizer),
            Err(e) => {
                warn!("No usable debug info in {}: {e}", path.display());
                None
            }
        };

        debug!(
            "Opened {} (load bias 0x{:x}, build id {})",
            path.display(),
            info.load_bias,
            info.build_id.as_deref().unwrap_or("<none>")
        );

        Ok(Self { path, data, info, symbolizer })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `PT_LOAD` headers, in file order
    ///
    /// # Errors
    /// Returns an error if the image no longer parses
    pub fn load_segments(&self) -> Result<Vec<LoadSegment>> {
        let obj = self.parse()?;
        Ok(obj
            .segments()
            .map(|segment| LoadSegment {
                address: segment.address(),
                size: segment.size(),
                file_offset: segment.file_range().0,
            })
            .collect())
    }

    fn parse(&self) -> Result<object::File<'_>> {
        object::File::parse(&*self.data)
            .with_context(|| format!("Failed to parse object file {}", self.path.display()))
    }
}

impl BinaryImage for ElfImage {
    fn module_info(&self) -> LocalModuleInfo {
        self.info.clone()
    }

    fn functions(&self) -> Result<Vec<FunctionSymbol>> {
        let obj = self.parse()?;
        let mut functions = collect_functions(obj.symbols());
        if functions.is_empty() {
            debug!("{} has no .symtab, falling back to .dynsym", self.path.display());
            functions = collect_functions(obj.dynamic_symbols());
        }
        Ok(functions)
    }

    /// Symbols from `.dynsym` only
    ///
    /// This is what a stripped library still exports, and what other
    /// modules bind to.
    fn exported_functions(&self) -> Result<Vec<FunctionSymbol>> {
        let obj = self.parse()?;
        Ok(collect_functions(obj.dynamic_symbols()))
    }

    /// Undefined `.dynsym` functions, resolved at load time through the
    /// PLT/GOT
    fn imported_functions(&self) -> Result<Vec<String>> {
        let obj = self.parse()?;
        let names: BTreeSet<String> = obj
            .dynamic_symbols()
            .filter(|sym| sym.is_undefined() && sym.kind() == SymbolKind::Text)
            .filter_map(|sym| sym.name().ok().filter(|name| !name.is_empty()).map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }

    fn source_location(&self, address: u64) -> Option<SourceLocation> {
        self.symbolizer.as_ref()?.source_location(address)
    }
}

fn collect_functions<'data, S: ObjectSymbol<'data>>(
    symbols: impl Iterator<Item = S>,
) -> Vec<FunctionSymbol> {
    symbols
        .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition())
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(FunctionSymbol { name: name.to_string(), address: sym.address(), size: sym.size() })
        })
        .collect()
}

/// Lowest `PT_LOAD` address, rounded down to a page
///
/// The loader maps that page at the module's base address, so
/// `runtime = static - load_bias + base`.
fn load_bias(obj: &object::File<'_>) -> u64 {
    obj.segments().map(|segment| segment.address()).min().unwrap_or(0) & PAGE_MASK
}

fn build_id(obj: &object::File<'_>) -> Option<String> {
    let bytes = obj.build_id().ok().flatten()?;
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    Some(hex)
}

/// [`BinaryReader`] for ELF files on the local filesystem
///
/// With a sysroot, the target's absolute paths are looked up underneath it,
/// so `/system/lib64/libgui.so` becomes `<sysroot>/system/lib64/libgui.so`.
#[derive(Debug, Clone, Default)]
pub struct ElfReader {
    sysroot: Option<PathBuf>,
}

impl ElfReader {
    #[must_use]
    pub fn new(sysroot: Option<PathBuf>) -> Self {
        Self { sysroot }
    }

    /// Where the local copy of a target path lives
    #[must_use]
    pub fn local_path(&self, path: &Path) -> PathBuf {
        match &self.sysroot {
            Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }
}

impl BinaryReader for ElfReader {
    type Image = ElfImage;

    fn open_image(&self, path: &Path) -> Result<ElfImage> {
        ElfImage::open(self.local_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_without_sysroot() {
        let reader = ElfReader::default();
        assert_eq!(
            reader.local_path(Path::new("/system/lib64/libgui.so")),
            PathBuf::from("/system/lib64/libgui.so")
        );
    }

    #[test]
    fn test_local_path_under_sysroot() {
        let reader = ElfReader::new(Some(PathBuf::from("/out/symbols")));
        assert_eq!(
            reader.local_path(Path::new("/system/lib64/libgui.so")),
            PathBuf::from("/out/symbols/system/lib64/libgui.so")
        );
    }

    #[test]
    fn test_open_missing_file() {
        assert!(ElfImage::open("/nonexistent/libnothing.so").is_err());
    }

    #[test]
    fn test_open_non_elf_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not an object file").unwrap();
        assert!(ElfImage::open(file.path()).is_err());
    }

    #[test]
    fn test_load_segments_contain_functions() {
        let exe = std::env::current_exe().unwrap();
        let image = ElfImage::open(&exe).unwrap();

        let segments = image.load_segments().unwrap();
        assert!(!segments.is_empty());
        assert_eq!(segments.iter().map(|s| s.address).min().unwrap() & PAGE_MASK, image.module_info().load_bias);

        let functions = image.functions().unwrap();
        assert!(functions.iter().filter(|f| f.size > 0).all(|f| segments.iter().any(|s| s.contains(f.address))));
    }

    #[test]
    fn test_current_exe_imports_from_libc() {
        let exe = std::env::current_exe().unwrap();
        let image = ElfImage::open(&exe).unwrap();

        let imports = image.imported_functions().unwrap();
        // Statically linked targets import nothing
        if imports.is_empty() {
            return;
        }
        assert!(imports.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(imports.iter().all(|name| !name.is_empty() && !name.contains('@')));
    }

    #[test]
    fn test_current_exe_has_functions() {
        let exe = std::env::current_exe().unwrap();
        let image = ElfImage::open(&exe).unwrap();

        let functions = image.functions().unwrap();
        assert!(!functions.is_empty());
        assert!(functions.iter().all(|f| !f.name.is_empty()));
        assert_eq!(image.module_info().load_bias & 0xfff, 0);
    }
}
