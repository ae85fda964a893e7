//! Offline binary reader interface
//!
//! The validator and the catalog never touch ELF directly; they go through
//! [`BinaryReader`] so a different object format (or a fake in tests) can be
//! plugged in.

use anyhow::Result;
use std::path::Path;

use super::symbolizer::{self, SourceLocation};

/// A function symbol as the static binary describes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    /// Raw (possibly mangled) symbol name
    pub name: String,
    /// Static address, before any load bias is applied
    pub address: u64,
    pub size: u64,
}

/// Module facts used by the build-id gate and address translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModuleInfo {
    pub load_bias: u64,
    /// Hex-encoded build id, if the image carries one
    pub build_id: Option<String>,
}

/// Opens local copies of the binaries loaded in the target
pub trait BinaryReader {
    type Image: BinaryImage;

    /// Open the local copy of `path`
    ///
    /// `path` is the path as the target process sees it; implementations may
    /// remap it (for example under a sysroot).
    ///
    /// # Errors
    /// Returns an error if the file is missing or not a readable image
    fn open_image(&self, path: &Path) -> Result<Self::Image>;

    /// Readable form of a mangled symbol, if it is mangled
    fn demangle(&self, name: &str) -> Option<String> {
        symbolizer::demangle(name)
    }
}

/// One opened binary image
pub trait BinaryImage {
    fn module_info(&self) -> LocalModuleInfo;

    /// Every defined function symbol of the image
    ///
    /// # Errors
    /// Returns an error if the symbol tables cannot be parsed
    fn functions(&self) -> Result<Vec<FunctionSymbol>>;

    /// Functions other modules can bind to
    ///
    /// # Errors
    /// Returns an error if the symbol tables cannot be parsed
    fn exported_functions(&self) -> Result<Vec<FunctionSymbol>> {
        self.functions()
    }

    /// Names of the functions this image expects another module to provide
    ///
    /// # Errors
    /// Returns an error if the symbol tables cannot be parsed
    fn imported_functions(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Source file and line of a static address
    fn source_location(&self, address: u64) -> Option<SourceLocation>;
}
