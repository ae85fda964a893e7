//! Catalog construction for one configured process
//!
//! Managed overloads are selected first so they take the low ids; every
//! module rule is then validated against the live process and its functions
//! appended. Ids are only handed out once both lists are complete, so an
//! oversized selection fails before anything is hooked.

use log::info;

use crate::catalog::managed::MethodTable;
use crate::catalog::{select_methods, CatalogBuilder, FilterPolicy, FunctionCatalog};
use crate::config::ProcessConfig;
use crate::domain::TraceError;
use crate::engine::{ManagedRuntime, RemoteProcess};
use crate::symbolization::BinaryReader;
use crate::validation::SymbolValidator;

/// Build the frozen catalog of one process
///
/// The managed side is answered by the method table declared in the config.
///
/// # Errors
/// Propagates validation, reader and configuration errors; the first module
/// that fails validation aborts the whole catalog
pub fn build_catalog<P, R>(
    config: &ProcessConfig,
    process: &P,
    reader: &R,
    policy: &FilterPolicy,
) -> Result<FunctionCatalog, TraceError>
where
    P: RemoteProcess + ?Sized,
    R: BinaryReader,
{
    let runtime = MethodTable::new(config.managed_classes.clone());
    build_catalog_with_runtime(config, process, reader, &runtime, policy)
}

/// [`build_catalog`] against an arbitrary managed runtime
///
/// # Errors
/// See [`build_catalog`]
pub fn build_catalog_with_runtime<P, R, M>(
    config: &ProcessConfig,
    process: &P,
    reader: &R,
    runtime: &M,
    policy: &FilterPolicy,
) -> Result<FunctionCatalog, TraceError>
where
    P: RemoteProcess + ?Sized,
    R: BinaryReader,
    M: ManagedRuntime + ?Sized,
{
    let mut builder = CatalogBuilder::new();

    if !config.managed.is_empty() {
        builder.add_managed(select_methods(runtime, &config.managed)?);
    }

    let validator = SymbolValidator::new(process, reader, policy);
    for rule in &config.modules {
        let functions = validator.functions_to_trace(rule)?;
        let total = functions.len();
        let added = builder.add_native(functions);
        if added < total {
            info!("{}: {} functions share an address with earlier ones", rule.name, total - added);
        }
    }

    let mut catalog = builder.build()?;
    catalog.annotate_demangled(|name| reader.demangle(name));
    info!(
        "{} catalog: {} managed, {} native",
        process.pid(),
        catalog.managed_count(),
        catalog.native_count()
    );
    Ok(catalog)
}
