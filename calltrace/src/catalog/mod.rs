//! # Function Catalog & ID Allocator
//!
//! The catalog is the one table both ends of the wire agree on. Each traced
//! function gets a dense 16-bit id; the agent only ever sends that id, and
//! the host turns it back into a name when the trace is written.
//!
//! ## Id Layout
//!
//! ```text
//! 0 ............ J-1 | J ............... J+N-1
//!   managed methods  |   native functions
//! ```
//!
//! Managed methods always come first. The agent relies on this: it numbers
//! the managed overloads it hooks from zero and is told `J` as the offset for
//! the native attach plan.
//!
//! ## Lifecycle
//!
//! 1. [`CatalogBuilder`] collects managed methods and validated native
//!    functions. Native duplicates (aliases at the same runtime address) are
//!    collapsed.
//! 2. [`CatalogBuilder::build`] allocates ids and freezes the table. More
//!    than 65535 entries is a [`ConfigurationError`], raised before anything
//!    is attached.
//! 3. After freezing, only [`FunctionCatalog::annotate_demangled`] may touch
//!    records, and only their display name.

pub mod filter;
pub mod managed;
pub mod manifest;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::{ConfigurationError, FunctionId, Pid, SerializationError};
use crate::symbolization::SourceLocation;
use calltrace_common::FUNCTION_ID_SPACE;

pub use filter::{FilterPolicy, FilterStats, Rejection};
pub use managed::{select_methods, ClassMethods, ManagedMethod, MethodPattern};
pub use manifest::CatalogManifest;

/// A native function read from a local binary, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCandidate {
    pub module: String,
    pub name: String,
    pub demangled_name: Option<String>,
    pub static_address: u64,
    pub size: u64,
    pub source: Option<SourceLocation>,
}

/// A candidate whose runtime address has been confirmed in the live process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFunction {
    pub candidate: NativeCandidate,
    pub runtime_address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FunctionKind {
    Native { static_address: u64, runtime_address: u64, size: u64 },
    Managed { class: String, method: String, overload: Option<Vec<String>> },
}

/// One entry of the frozen catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionRecord {
    pub id: FunctionId,
    #[serde(flatten)]
    pub kind: FunctionKind,
    /// Raw symbol for native functions, qualified name for managed methods
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demangled_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocation>,
    /// Module name for native functions, declaring class for managed ones
    pub category: String,
}

impl FunctionRecord {
    /// Name shown in the trace viewer
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.demangled_name.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn runtime_address(&self) -> Option<u64> {
        match self.kind {
            FunctionKind::Native { runtime_address, .. } => Some(runtime_address),
            FunctionKind::Managed { .. } => None,
        }
    }
}

/// One entry of the native attach plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttachPoint {
    pub id: FunctionId,
    pub runtime_address: u64,
}

/// Collects functions before ids are handed out
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    managed: Vec<ManagedMethod>,
    native: Vec<NativeFunction>,
    seen_addresses: HashSet<u64>,
}

impl CatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_managed(&mut self, methods: impl IntoIterator<Item = ManagedMethod>) {
        self.managed.extend(methods);
    }

    /// Add native functions; a runtime address already present is skipped
    ///
    /// Returns how many were actually added.
    pub fn add_native(&mut self, functions: impl IntoIterator<Item = NativeFunction>) -> usize {
        let before = self.native.len();
        for function in functions {
            if self.seen_addresses.insert(function.runtime_address) {
                self.native.push(function);
            }
        }
        self.native.len() - before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.managed.len() + self.native.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate ids and freeze
    ///
    /// # Errors
    /// [`ConfigurationError::IdSpaceExhausted`] when managed and native
    /// together do not fit below [`FUNCTION_ID_SPACE`].
    pub fn build(self) -> Result<FunctionCatalog, ConfigurationError> {
        let (managed, native) = (self.managed.len(), self.native.len());
        if managed + native >= FUNCTION_ID_SPACE {
            return Err(ConfigurationError::IdSpaceExhausted { managed, native });
        }

        let managed_records = self.managed.into_iter().map(|method| {
            let name = method.qualified_name();
            let category = method.class.clone();
            (
                FunctionKind::Managed {
                    class: method.class,
                    method: method.method,
                    overload: method.overload,
                },
                name,
                None,
                None,
                category,
            )
        });

        let native_records = self.native.into_iter().map(|function| {
            let NativeFunction { candidate, runtime_address } = function;
            (
                FunctionKind::Native {
                    static_address: candidate.static_address,
                    runtime_address,
                    size: candidate.size,
                },
                candidate.name,
                candidate.demangled_name,
                candidate.source,
                candidate.module,
            )
        });

        let mut catalog = FunctionCatalog {
            records: Vec::with_capacity(managed + native),
            by_name: HashMap::new(),
            by_runtime_address: HashMap::new(),
            managed_count: managed,
        };

        for (index, (kind, name, demangled_name, source, category)) in
            managed_records.chain(native_records).enumerate()
        {
            let id = FunctionId::from_index(index).ok_or(ConfigurationError::IdSpaceExhausted {
                managed,
                native,
            })?;
            let record = FunctionRecord { id, kind, name, demangled_name, source, category };

            catalog.by_name.entry(record.name.clone()).or_insert(id);
            if let Some(address) = record.runtime_address() {
                catalog.by_runtime_address.insert(address, id);
            }
            catalog.records.push(record);
        }

        Ok(catalog)
    }
}

/// Frozen id → function table for one process
#[derive(Debug, Clone, Default)]
pub struct FunctionCatalog {
    records: Vec<FunctionRecord>,
    by_name: HashMap<String, FunctionId>,
    by_runtime_address: HashMap<u64, FunctionId>,
    managed_count: usize,
}

impl FunctionCatalog {
    #[must_use]
    pub fn get(&self, id: FunctionId) -> Option<&FunctionRecord> {
        self.records.get(id.index())
    }

    /// First id registered under a raw or qualified name
    #[must_use]
    pub fn id_by_name(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn id_by_runtime_address(&self, address: u64) -> Option<FunctionId> {
        self.by_runtime_address.get(&address).copied()
    }

    #[must_use]
    pub fn managed_count(&self) -> usize {
        self.managed_count
    }

    #[must_use]
    pub fn native_count(&self) -> usize {
        self.records.len() - self.managed_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.records.iter()
    }

    /// Native functions to intercept, in id order
    #[must_use]
    pub fn attach_plan(&self) -> Vec<AttachPoint> {
        self.records
            .iter()
            .filter_map(|record| {
                record.runtime_address().map(|runtime_address| AttachPoint { id: record.id, runtime_address })
            })
            .collect()
    }

    /// Fill in display names for native records that lack one
    ///
    /// Ids and addresses are untouched. Returns how many records changed.
    pub fn annotate_demangled<F>(&mut self, demangle: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut annotated = 0;
        for record in &mut self.records {
            if record.demangled_name.is_some() || !matches!(record.kind, FunctionKind::Native { .. }) {
                continue;
            }
            if let Some(name) = demangle(&record.name) {
                record.demangled_name = Some(name);
                annotated += 1;
            }
        }
        annotated
    }
}

/// Catalogs of every traced process in a session
#[derive(Debug, Clone, Default)]
pub struct SessionCatalogs {
    by_pid: BTreeMap<Pid, FunctionCatalog>,
}

impl SessionCatalogs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: Pid, catalog: FunctionCatalog) {
        self.by_pid.insert(pid, catalog);
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&FunctionCatalog> {
        self.by_pid.get(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pid, &FunctionCatalog)> {
        self.by_pid.iter().map(|(pid, catalog)| (*pid, catalog))
    }

    /// Look up the function behind a wire id
    ///
    /// # Errors
    /// [`SerializationError::UnknownFunction`] when the pid has no catalog or
    /// the id was never allocated.
    pub fn function(
        &self,
        pid: Pid,
        function_id: FunctionId,
    ) -> Result<&FunctionRecord, SerializationError> {
        self.by_pid
            .get(&pid)
            .and_then(|catalog| catalog.get(function_id))
            .ok_or(SerializationError::UnknownFunction { pid, function_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(name: &str, runtime_address: u64) -> NativeFunction {
        NativeFunction {
            candidate: NativeCandidate {
                module: "libgui.so".to_string(),
                name: name.to_string(),
                demangled_name: None,
                static_address: runtime_address - 0x7000_0000,
                size: 64,
                source: None,
            },
            runtime_address,
        }
    }

    fn managed(class: &str, method: &str) -> ManagedMethod {
        ManagedMethod { class: class.to_string(), method: method.to_string(), overload: None }
    }

    #[test]
    fn test_managed_ids_come_first() {
        let mut builder = CatalogBuilder::new();
        builder.add_native([native("render", 0x7000_1000), native("flush", 0x7000_2000)]);
        builder.add_managed([managed("com.example.View", "draw")]);

        let catalog = builder.build().unwrap();
        assert_eq!(catalog.managed_count(), 1);
        assert_eq!(catalog.native_count(), 2);
        assert_eq!(catalog.id_by_name("com.example.View.draw"), Some(FunctionId(0)));
        assert_eq!(catalog.id_by_name("render"), Some(FunctionId(1)));
        assert_eq!(catalog.id_by_runtime_address(0x7000_2000), Some(FunctionId(2)));
        assert_eq!(catalog.get(FunctionId(0)).unwrap().category, "com.example.View");
        assert_eq!(catalog.get(FunctionId(1)).unwrap().category, "libgui.so");
    }

    #[test]
    fn test_ids_are_dense_and_unique() {
        let mut builder = CatalogBuilder::new();
        builder.add_managed((0..10).map(|i| managed("C", &format!("m{i}"))));
        builder.add_native((0..20).map(|i| native(&format!("f{i}"), 0x7000_0000 + i * 0x100)));

        let catalog = builder.build().unwrap();
        let ids: Vec<u16> = catalog.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, (0..30).collect::<Vec<u16>>());
    }

    #[test]
    fn test_native_aliases_are_collapsed() {
        let mut builder = CatalogBuilder::new();
        let added = builder.add_native([native("render", 0x7000_1000), native("render_alias", 0x7000_1000)]);
        assert_eq!(added, 1);
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_id_space_exhausted() {
        let mut builder = CatalogBuilder::new();
        builder.add_managed((0..6).map(|i| managed("C", &format!("m{i}"))));
        builder.add_native((0..65_530u64).map(|i| native("f", 0x7000_0000 + i * 0x10)));

        let err = builder.build().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::IdSpaceExhausted { managed: 6, native: 65_530 }
        ));
    }

    #[test]
    fn test_largest_catalog_fits() {
        let mut builder = CatalogBuilder::new();
        builder.add_native((0..65_535u64).map(|i| native("f", 0x7000_0000 + i * 0x10)));
        let catalog = builder.build().unwrap();
        assert_eq!(catalog.len(), 65_535);
        assert_eq!(catalog.iter().last().unwrap().id, FunctionId(65_534));
    }

    #[test]
    fn test_attach_plan_skips_managed() {
        let mut builder = CatalogBuilder::new();
        builder.add_managed([managed("com.example.View", "draw")]);
        builder.add_native([native("render", 0x7000_1000)]);

        let plan = builder.build().unwrap().attach_plan();
        assert_eq!(plan, vec![AttachPoint { id: FunctionId(1), runtime_address: 0x7000_1000 }]);
    }

    #[test]
    fn test_annotate_demangled_keeps_ids() {
        let mut builder = CatalogBuilder::new();
        builder.add_native([native("_ZN7android7Surface5queueEv", 0x7000_1000), native("eglSwapBuffers", 0x7000_2000)]);
        let mut catalog = builder.build().unwrap();

        let changed = catalog.annotate_demangled(crate::symbolization::demangle);
        assert_eq!(changed, 1);

        let record = catalog.get(FunctionId(0)).unwrap();
        assert_eq!(record.display_name(), "android::Surface::queue()");
        assert_eq!(catalog.get(FunctionId(1)).unwrap().display_name(), "eglSwapBuffers");
        assert_eq!(catalog.id_by_runtime_address(0x7000_1000), Some(FunctionId(0)));
    }

    #[test]
    fn test_session_lookup_unknown_id() {
        let mut catalogs = SessionCatalogs::new();
        catalogs.insert(Pid(10), CatalogBuilder::new().build().unwrap());

        let err = catalogs.function(Pid(10), FunctionId(3)).unwrap_err();
        assert!(matches!(err, SerializationError::UnknownFunction { .. }));
        assert!(catalogs.function(Pid(11), FunctionId(0)).is_err());
    }
}
