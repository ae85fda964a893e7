//! Session configuration file
//!
//! A session traces one or more processes. For each process the config names
//! the native modules to scan (with optional source and function prefixes)
//! and the managed methods to hook:
//!
//! ```json
//! {
//!   "sysroot": "/out/target/product/generic/symbols",
//!   "filter": { "skip_destructors": true },
//!   "processes": [
//!     {
//!       "name": "surfaceflinger",
//!       "modules": [
//!         { "name": "libgui.so", "src": "frameworks/native/libs/gui/" },
//!         { "name": "libsurfaceflinger.so", "imported": ["libEGL", "libGLESv2"] }
//!       ],
//!       "managed": ["+com.android.server.wm.*!perform*"],
//!       "managed_classes": [
//!         { "class": "com.android.server.wm.WindowSurfacePlacer",
//!           "methods": [{ "name": "performSurfacePlacement" }] }
//!       ]
//!     }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::managed::{DeclaredClass, MethodPattern};
use crate::catalog::FilterPolicy;
use crate::domain::{ConfigurationError, Pid};
use crate::engine::Target;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    /// Prefix under which local copies of the target's binaries live
    #[serde(default)]
    pub sysroot: Option<PathBuf>,
    #[serde(default)]
    pub filter: FilterPolicy,
    pub processes: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Process name, matched against `/proc/<pid>/stat` and the exe basename
    pub name: String,
    /// Explicit pid, skips the name lookup
    #[serde(default)]
    pub pid: Option<u32>,
    /// Command line to launch when no process with `name` is running
    #[serde(default)]
    pub spawn: Option<Vec<String>>,
    #[serde(default)]
    pub modules: Vec<ModuleRule>,
    /// `[+|-]class!method` selectors, applied in order
    #[serde(default)]
    pub managed: Vec<String>,
    #[serde(default)]
    pub managed_classes: Vec<DeclaredClass>,
}

/// Which functions of one native module to trace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleRule {
    /// Module file name (`libgui.so`) or full path as mapped in the target
    pub name: String,
    /// Only functions whose source file starts with this
    #[serde(default)]
    pub src: Option<String>,
    /// Only functions whose raw or demangled name starts with this
    #[serde(default)]
    pub function: Option<String>,
    /// Provider modules whose functions this module calls through its
    /// imports; each provider's functions are traced too
    #[serde(default)]
    pub imported: Vec<String>,
}

impl TraceConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or does not
    /// pass [`TraceConfig::validate`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error if the JSON does not describe a valid session
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// [`ConfigurationError::InvalidConfig`] naming the first problem found
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: String| Err(ConfigurationError::InvalidConfig(msg));

        if self.processes.is_empty() {
            return invalid("no processes to trace".to_string());
        }
        for process in &self.processes {
            if process.name.is_empty() && process.pid.is_none() {
                return invalid("process needs a name or a pid".to_string());
            }
            if process.modules.is_empty() && process.managed.is_empty() {
                return invalid(format!("{}: no modules or managed methods to trace", process.name));
            }
            if let Some(rule) = process.modules.iter().find(|rule| rule.name.is_empty()) {
                return invalid(format!("{}: module rule without a name ({rule:?})", process.name));
            }
            if let Some(rule) =
                process.modules.iter().find(|rule| rule.imported.iter().any(String::is_empty))
            {
                return invalid(format!("{}: {} imports from an unnamed module", process.name, rule.name));
            }
            if let Some(argv) = &process.spawn {
                if argv.is_empty() {
                    return invalid(format!("{}: empty spawn command", process.name));
                }
            }
            for pattern in &process.managed {
                if let Err(e) = MethodPattern::parse(pattern) {
                    return invalid(format!("{}: {e}", process.name));
                }
            }
        }
        Ok(())
    }
}

impl ProcessConfig {
    /// How the engine should find this process
    #[must_use]
    pub fn target(&self) -> Target {
        match self.pid {
            Some(pid) => Target::Existing(Pid(pid)),
            None => Target::Named { name: self.name.clone(), spawn: self.spawn.clone() },
        }
    }
}
