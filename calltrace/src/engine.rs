//! Interfaces to the live side of a session
//!
//! The host never patches code itself. It talks to an instrumentation engine
//! that can find or start the target, hook functions in it, and stop those
//! hooks again; to the target's loader view of its modules; and to the
//! managed runtime, when there is one. These traits are the seams where a
//! concrete engine plugs in.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::catalog::{CatalogManifest, ClassMethods};
use crate::domain::Pid;

/// Which process a session should trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Existing(Pid),
    /// Look the process up by name; launch `spawn` when nothing matches
    Named { name: String, spawn: Option<Vec<String>> },
}

/// Controls interception inside the traced processes
pub trait InstrumentationEngine {
    /// Find the target, or start it when it is not running
    ///
    /// # Errors
    /// Returns an error if the process can be neither found nor started
    fn attach_or_spawn(&mut self, target: &Target) -> Result<Pid>;

    /// Make sure `library` is loaded into `pid`
    ///
    /// # Errors
    /// Returns an error if the library cannot be loaded
    fn load_library(&mut self, pid: Pid, library: &Path) -> Result<()>;

    /// Runtime address of an exported symbol of a loaded module
    ///
    /// # Errors
    /// Returns an error if the module is not loaded or does not export `symbol`
    fn resolve_export(&self, pid: Pid, module: &str, symbol: &str) -> Result<u64>;

    /// Hook every function of a frozen catalog
    ///
    /// Managed overloads are hooked in catalog order starting at id 0; native
    /// functions at their runtime addresses with the ids in the attach plan.
    ///
    /// # Errors
    /// Returns an error if the hooks cannot be installed
    fn intercept(&mut self, manifest: &CatalogManifest<'_>) -> Result<()>;

    /// Let a process run once its hooks are installed
    ///
    /// # Errors
    /// Returns an error if the process cannot be resumed
    fn resume(&mut self, pid: Pid) -> Result<()>;

    /// Remove every hook in every process
    ///
    /// Records already buffered by the agents stay buffered.
    ///
    /// # Errors
    /// Returns an error if an agent could not be told
    fn detach_all(&mut self) -> Result<()>;

    /// Have every thread of every process deliver its buffered records
    ///
    /// # Errors
    /// Returns an error if an agent could not be told
    fn flush_all(&mut self) -> Result<()>;

    /// Session-wide timestamp origin, in microseconds since the Unix epoch
    ///
    /// The first call fixes it (to `proposed`, or to now); later calls return
    /// the fixed value.
    fn base_timestamp(&mut self, proposed: Option<u64>) -> u64;
}

/// A module as the live process has it mapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteModule {
    pub name: String,
    pub path: PathBuf,
    pub base_address: u64,
    pub build_id: Option<String>,
}

/// A function the live process reports for a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFunction {
    pub name: String,
    /// Runtime address
    pub address: u64,
    pub size: Option<u64>,
}

/// What the validator may ask the live process
pub trait RemoteProcess {
    fn pid(&self) -> Pid;

    /// # Errors
    /// Returns an error if the module is not loaded
    fn module_by_name(&self, name: &str) -> Result<RemoteModule>;

    /// # Errors
    /// Returns an error if the module's functions cannot be enumerated
    fn functions_of_module(&self, name: &str) -> Result<Vec<RemoteFunction>>;
}

/// Method enumeration for a managed runtime (JVM, ART, ...)
pub trait ManagedRuntime {
    /// Classes and methods matching a `class_glob!method_glob` query
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be enumerated
    fn enumerate_methods(&self, pattern: &str) -> Result<Vec<ClassMethods>>;

    /// Argument type lists of every overload of one method
    ///
    /// # Errors
    /// Returns an error if the method does not exist
    fn overloads(&self, loader: &str, class: &str, method: &str) -> Result<Vec<Vec<String>>>;
}
