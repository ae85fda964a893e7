//! # Offline Binary Analysis
//!
//! Everything the catalog needs to know about a traced module comes from a
//! local copy of its binary: the function symbols, where they sit in the
//! file, which source file they came from, and the build id that proves the
//! local copy is the one the target actually loaded.
//!
//! ## Static vs. Runtime Addresses
//!
//! Symbol tables describe **static** addresses, as laid out by the linker.
//! The loader maps the lowest `PT_LOAD` page at a randomized **base address**
//! (ASLR), so a function's live address is:
//!
//! ```text
//! runtime = static - load_bias + base
//!
//! load_bias = lowest PT_LOAD vaddr, page aligned  (from the ELF file)
//! base      = lowest mapping of the module        (from /proc/<pid>/maps)
//! ```
//!
//! Example for a PIE library:
//!
//! ```text
//! static 0x4a7c0, load_bias 0x0, base 0x7f2a10000000
//!   → runtime 0x7f2a1004a7c0
//! ```
//!
//! The translation is only meaningful when both sides are the same build, so
//! the validator compares build ids before it translates anything.
//!
//! ## DWARF
//!
//! Source locations come from the `.debug_line` tables via `addr2line`
//! (`gimli` underneath). A function without line info is usually compiler
//! or libc glue and gets filtered out of the catalog by default.
//!
//! **Libraries used**:
//! - `object`: ELF parsing (segments, symbol tables, build-id note)
//! - `gimli` / `addr2line`: DWARF line tables and C++ demangling
//! - `rustc-demangle`: Rust symbol demangling
//!
//! ## Module Structure
//!
//! - **`reader`**: [`BinaryReader`]/[`BinaryImage`] traits the rest of the
//!   crate depends on
//! - **`elf_image`**: ELF implementation of those traits
//! - **`symbolizer`**: DWARF source lookup with a per-address cache, and
//!   demangling
//! - **`memory_maps`**: `/proc/<pid>/maps` parsing to find module bases and
//!   to place file offsets in the live address space

pub mod elf_image;
pub mod memory_maps;
pub mod reader;
pub mod symbolizer;

pub use elf_image::{ElfImage, ElfReader, LoadSegment};
pub use memory_maps::{read_module_mapping, Mapping, MemoryRange, ModuleMapping};
pub use reader::{BinaryImage, BinaryReader, FunctionSymbol, LocalModuleInfo};
pub use symbolizer::{demangle, SourceLocation, Symbolizer};
