use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use rustc_demangle::try_demangle;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Symbolizer for resolving function addresses to source locations
///
/// Includes a cache so repeated lookups of the same address (aliases, or
/// re-reading a catalog) do not walk the DWARF line tables again.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// Cache of resolved locations by static address
    cache: RefCell<HashMap<u64, Option<SourceLocation>>>,
}

impl Symbolizer {
    /// Create a symbolizer from an already parsed object file
    ///
    /// # Errors
    /// Returns an error if the DWARF sections cannot be loaded
    pub fn from_object(obj: &object::File<'_>) -> Result<Self> {
        let endian =
            if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        Ok(Self { ctx, cache: RefCell::new(HashMap::new()) })
    }

    /// Source file and line of the instruction at `addr`
    ///
    /// `addr` is a static (file) address. Returns `None` when the line tables
    /// have nothing for it or name no file.
    pub fn source_location(&self, addr: u64) -> Option<SourceLocation> {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let location = match self.ctx.find_location(addr) {
            Ok(Some(loc)) => loc.file.map(|file| SourceLocation {
                file: file.to_string(),
                line: loc.line,
                column: loc.column,
            }),
            _ => None,
        };

        self.cache.borrow_mut().insert(addr, location.clone());
        location
    }
}

/// Source code location
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Demangle a Rust or Itanium C++ symbol name
///
/// Returns `None` when the name is not mangled (plain C symbols, or names
/// that are already readable).
#[must_use]
pub fn demangle(symbol: &str) -> Option<String> {
    if let Ok(rust) = try_demangle(symbol) {
        return Some(format!("{rust:#}"));
    }
    if symbol.starts_with("_Z") {
        return addr2line::demangle(symbol, gimli::DW_LANG_C_plus_plus);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_rust_symbol_drops_hash() {
        let name = demangle("_ZN4core3ptr13drop_in_place17h1234567890abcdefE").unwrap();
        assert_eq!(name, "core::ptr::drop_in_place");
    }

    #[test]
    fn test_demangle_cpp_symbol() {
        let name = demangle("_ZN7android7Surface5queueEv").unwrap();
        assert_eq!(name, "android::Surface::queue()");
    }

    #[test]
    fn test_plain_c_symbol_is_left_alone() {
        assert_eq!(demangle("eglSwapBuffers"), None);
    }
}
