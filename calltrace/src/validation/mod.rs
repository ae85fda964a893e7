//! # Cross-Process Symbol Validation
//!
//! Function addresses come from a local copy of each binary, but hooks are
//! installed in the live process. Hooking a wrong address corrupts the target,
//! so nothing from the local side is trusted until the live side agrees:
//!
//! ```text
//!   live process                    local binary
//!   ────────────                    ────────────
//!   base_address, build_id          load_bias, build_id, symbols
//!          │                               │
//!          └──────────► build-id gate ◄────┘   mismatch → abort, nothing translated
//!                            │
//!                   filter candidates
//!                            │
//!          runtime = static - load_bias + base
//!                            │
//!   live function list ─► cross-check            any disagreement → abort
//!                            │
//!                   validated NativeFunctions
//! ```

pub mod procfs;

use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};

use crate::catalog::{FilterPolicy, NativeCandidate, NativeFunction};
use crate::config::ModuleRule;
use crate::domain::{TraceError, ValidationError};
use crate::engine::{RemoteFunction, RemoteModule, RemoteProcess};
use crate::symbolization::{BinaryImage, BinaryReader, LocalModuleInfo};

pub use procfs::ProcfsProcess;

/// Both views of one module, reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub load_bias: u64,
    pub base_address: u64,
    pub build_id: Option<String>,
}

impl ModuleInfo {
    /// Reconcile the local and live views of a module
    ///
    /// This is the build-id gate. A module that carries no build id on
    /// either side cannot be checked and is accepted with a warning.
    ///
    /// # Errors
    /// [`ValidationError::BuildIdMismatch`] when the ids differ, or
    /// [`ValidationError::MissingBuildId`] when only one side has one.
    pub fn reconcile(
        name: &str,
        local: &LocalModuleInfo,
        remote: &RemoteModule,
    ) -> Result<Self, ValidationError> {
        check_build_id(name, local.build_id.as_deref(), remote.build_id.as_deref())?;
        Ok(Self {
            name: name.to_string(),
            load_bias: local.load_bias,
            base_address: remote.base_address,
            build_id: remote.build_id.clone(),
        })
    }

    /// Live address of a static address in this module
    #[must_use]
    pub fn translate(&self, static_address: u64) -> u64 {
        static_address.wrapping_sub(self.load_bias).wrapping_add(self.base_address)
    }
}

/// Compare the local and live build ids of a module
///
/// # Errors
/// See [`ModuleInfo::reconcile`].
pub fn check_build_id(
    module: &str,
    local: Option<&str>,
    remote: Option<&str>,
) -> Result<(), ValidationError> {
    match (local, remote) {
        (Some(local), Some(remote)) if local.eq_ignore_ascii_case(remote) => Ok(()),
        (Some(local), Some(remote)) => Err(ValidationError::BuildIdMismatch {
            module: module.to_string(),
            local: local.to_string(),
            remote: remote.to_string(),
        }),
        (None, Some(_)) => {
            Err(ValidationError::MissingBuildId { module: module.to_string(), side: "local" })
        }
        (Some(_), None) => {
            Err(ValidationError::MissingBuildId { module: module.to_string(), side: "remote" })
        }
        (None, None) => {
            warn!("{module} has no build id on either side, addresses cannot be verified");
            Ok(())
        }
    }
}

/// Confirm every candidate against what the live process reports
///
/// # Errors
/// The first disagreement found, or [`ValidationError::NoRemoteFunctions`]
/// when the live list is empty.
pub fn cross_check(
    module: &str,
    functions: &[NativeFunction],
    remote: &[RemoteFunction],
) -> Result<(), ValidationError> {
    if remote.is_empty() {
        return Err(ValidationError::NoRemoteFunctions { module: module.to_string() });
    }

    // Local symbols may repeat a name across compilation units.
    let mut by_name: HashMap<&str, Vec<&RemoteFunction>> = HashMap::new();
    for function in remote {
        by_name.entry(function.name.as_str()).or_default().push(function);
    }

    for function in functions {
        let name = &function.candidate.name;
        let Some(same_name) = by_name.get(name.as_str()) else {
            return Err(ValidationError::MissingRemoteFunction {
                module: module.to_string(),
                name: name.clone(),
            });
        };
        let Some(live) = same_name.iter().find(|live| live.address == function.runtime_address) else {
            return Err(ValidationError::AddressMismatch {
                module: module.to_string(),
                name: name.clone(),
                expected: function.runtime_address,
                actual: same_name[0].address,
            });
        };
        if let Some(size) = live.size {
            if size != function.candidate.size {
                return Err(ValidationError::SizeMismatch {
                    module: module.to_string(),
                    name: name.clone(),
                    expected: function.candidate.size,
                    actual: size,
                });
            }
        }
    }
    Ok(())
}

/// Produces the validated native functions of one process
pub struct SymbolValidator<'a, P: ?Sized, R> {
    process: &'a P,
    reader: &'a R,
    policy: &'a FilterPolicy,
}

impl<'a, P, R> SymbolValidator<'a, P, R>
where
    P: RemoteProcess + ?Sized,
    R: BinaryReader,
{
    #[must_use]
    pub fn new(process: &'a P, reader: &'a R, policy: &'a FilterPolicy) -> Self {
        Self { process, reader, policy }
    }

    /// Validated, translated functions of the module a rule names, plus
    /// the functions it imports from the rule's `imported` providers
    ///
    /// # Errors
    /// [`TraceError::Validation`] for any disagreement between the local and
    /// live views; [`TraceError::Reader`] when either side cannot be read.
    pub fn functions_to_trace(&self, rule: &ModuleRule) -> Result<Vec<NativeFunction>, TraceError> {
        let (image, module) = self.open_validated(&rule.name)?;

        let candidates: Vec<NativeCandidate> = image
            .functions()?
            .into_iter()
            .map(|symbol| NativeCandidate {
                module: rule.name.clone(),
                demangled_name: self.reader.demangle(&symbol.name),
                source: image.source_location(symbol.address),
                name: symbol.name,
                static_address: symbol.address,
                size: symbol.size,
            })
            .collect();

        let (kept, stats) = self.policy.apply(candidates, rule);
        info!("{}: {stats}", rule.name);

        let mut functions = Vec::new();
        if kept.is_empty() {
            warn!("No functions to trace in {}", rule.name);
        } else {
            functions.extend(self.checked(&module, kept)?);
            info!("Collected {} functions from {}", functions.len(), rule.name);
        }

        if !rule.imported.is_empty() {
            let imports: BTreeSet<String> = image.imported_functions()?.into_iter().collect();
            debug!("{} imports {} functions", rule.name, imports.len());
            for provider in &rule.imported {
                let imported = self.imported_from(provider, &imports)?;
                info!("Collected {} functions {} imports from {provider}", imported.len(), rule.name);
                functions.extend(imported);
            }
        }
        Ok(functions)
    }

    /// The provider's exports that appear in `imports`
    ///
    /// Imported functions are not subject to the rule's prefixes; the
    /// provider's build id and live function list are checked like any
    /// traced module's.
    fn imported_from(
        &self,
        provider: &str,
        imports: &BTreeSet<String>,
    ) -> Result<Vec<NativeFunction>, TraceError> {
        let (image, module) = self.open_validated(provider)?;

        let candidates: Vec<NativeCandidate> = image
            .exported_functions()?
            .into_iter()
            .filter(|symbol| symbol.size > 0 && imports.contains(&symbol.name))
            .map(|symbol| NativeCandidate {
                module: provider.to_string(),
                demangled_name: self.reader.demangle(&symbol.name),
                source: image.source_location(symbol.address),
                name: symbol.name,
                static_address: symbol.address,
                size: symbol.size,
            })
            .collect();

        if candidates.is_empty() {
            warn!("Nothing imported from {provider}");
            return Ok(Vec::new());
        }
        self.checked(&module, candidates)
    }

    /// Find a module in the process, open its local image and pass the
    /// build-id gate
    fn open_validated(&self, name: &str) -> Result<(R::Image, ModuleInfo), TraceError> {
        let remote = self.process.module_by_name(name).map_err(remote_error)?;
        info!(
            "{name} in {}: {} at 0x{:x}",
            self.process.pid(),
            remote.path.display(),
            remote.base_address
        );

        let image = self.reader.open_image(&remote.path)?;
        let module = ModuleInfo::reconcile(name, &image.module_info(), &remote)?;
        Ok((image, module))
    }

    /// Translate candidates and confirm them against the live function list
    fn checked(
        &self,
        module: &ModuleInfo,
        candidates: Vec<NativeCandidate>,
    ) -> Result<Vec<NativeFunction>, TraceError> {
        let functions: Vec<NativeFunction> = candidates
            .into_iter()
            .map(|candidate| NativeFunction {
                runtime_address: module.translate(candidate.static_address),
                candidate,
            })
            .collect();

        let live = self.process.functions_of_module(&module.name).map_err(remote_error)?;
        debug!("{}: {} live functions to check against", module.name, live.len());
        cross_check(&module.name, &functions, &live)?;
        Ok(functions)
    }
}

// Keep validation failures reported by the remote side matchable.
fn remote_error(err: anyhow::Error) -> TraceError {
    match err.downcast::<ValidationError>() {
        Ok(validation) => validation.into(),
        Err(other) => TraceError::Reader(other),
    }
}
