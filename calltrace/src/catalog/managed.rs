//! Managed (VM) method selection
//!
//! Managed methods are picked with include/exclude patterns of the form
//! `[+|-]class_glob!method_glob`, applied in order against whatever the
//! runtime reports. Every overload of a selected method gets its own id.
//!
//! Globs follow `globset` syntax: `*` and `?` never stop at `.` or `/`, and
//! `[...]` and `{a,b}` are available for finer selection.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobBuilder, GlobMatcher};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::engine::ManagedRuntime;

/// Methods of one class as enumerated by a managed runtime
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassMethods {
    /// Class loader the class was found through
    #[serde(default)]
    pub loader: String,
    pub class: String,
    pub methods: Vec<String>,
}

/// One include or exclude selector
#[derive(Debug, Clone)]
pub struct MethodPattern {
    pub include: bool,
    pub class_glob: String,
    pub method_glob: String,
    class_matcher: GlobMatcher,
    method_matcher: GlobMatcher,
}

impl MethodPattern {
    /// Parse `+com.example.*!on*`, `-*!toString` or `com.example.Foo!*`
    ///
    /// # Errors
    /// Returns an error when the `!` separator is missing or either side is
    /// not a valid glob
    pub fn parse(spec: &str) -> Result<Self> {
        let (include, rest) = match spec.as_bytes().first() {
            Some(b'+') => (true, &spec[1..]),
            Some(b'-') => (false, &spec[1..]),
            _ => (true, spec),
        };
        let Some((class_glob, method_glob)) = rest.split_once('!') else {
            bail!("Managed method pattern '{spec}' must look like 'class!method'");
        };
        Ok(Self {
            include,
            class_matcher: compile(class_glob).with_context(|| format!("Bad class glob in '{spec}'"))?,
            method_matcher: compile(method_glob).with_context(|| format!("Bad method glob in '{spec}'"))?,
            class_glob: class_glob.to_string(),
            method_glob: method_glob.to_string(),
        })
    }

    /// The query the runtime is asked, without the include/exclude sign
    #[must_use]
    pub fn query(&self) -> String {
        format!("{}!{}", self.class_glob, self.method_glob)
    }

    #[must_use]
    pub fn matches(&self, class: &str, method: &str) -> bool {
        self.class_matcher.is_match(class) && self.method_matcher.is_match(method)
    }
}

// Class names are dotted, not paths; nothing is a separator.
fn compile(glob: &str) -> Result<GlobMatcher, globset::Error> {
    let glob: Glob = GlobBuilder::new(glob).literal_separator(false).backslash_escape(false).build()?;
    Ok(glob.compile_matcher())
}

/// One traced managed method overload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedMethod {
    pub class: String,
    pub method: String,
    /// Argument types, only kept when the method is overloaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overload: Option<Vec<String>>,
}

impl ManagedMethod {
    /// `Class.method`, or `Class.method(arg,arg)` for overloaded methods
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.overload {
            Some(args) => format!("{}.{}({})", self.class, self.method, args.join(",")),
            None => format!("{}.{}", self.class, self.method),
        }
    }
}

impl fmt::Display for ManagedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// A class and its methods, declared up front instead of discovered
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeclaredClass {
    #[serde(default)]
    pub loader: String,
    pub class: String,
    pub methods: Vec<DeclaredMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeclaredMethod {
    pub name: String,
    /// Argument type lists, one per overload
    #[serde(default = "single_overload")]
    pub overloads: Vec<Vec<String>>,
}

fn single_overload() -> Vec<Vec<String>> {
    vec![Vec::new()]
}

/// [`ManagedRuntime`] backed by a fixed method table from the session config
///
/// Used when the managed runtime cannot be asked directly; the agent hooks
/// exactly these overloads in this order.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    classes: Vec<DeclaredClass>,
}

impl MethodTable {
    #[must_use]
    pub fn new(classes: Vec<DeclaredClass>) -> Self {
        Self { classes }
    }
}

impl ManagedRuntime for MethodTable {
    fn enumerate_methods(&self, pattern: &str) -> Result<Vec<ClassMethods>> {
        let pattern = MethodPattern::parse(pattern)?;
        Ok(self
            .classes
            .iter()
            .filter_map(|declared| {
                let methods: Vec<String> = declared
                    .methods
                    .iter()
                    .filter(|m| pattern.matches(&declared.class, &m.name))
                    .map(|m| m.name.clone())
                    .collect();
                (!methods.is_empty()).then(|| ClassMethods {
                    loader: declared.loader.clone(),
                    class: declared.class.clone(),
                    methods,
                })
            })
            .collect())
    }

    fn overloads(&self, loader: &str, class: &str, method: &str) -> Result<Vec<Vec<String>>> {
        self.classes
            .iter()
            .filter(|declared| declared.loader == loader && declared.class == class)
            .flat_map(|declared| &declared.methods)
            .find(|declared| declared.name == method)
            .map(|declared| declared.overloads.clone())
            .with_context(|| format!("{class} has no method {method}"))
    }
}

/// Resolve patterns to the ordered list of overloads to trace
///
/// Selection is `loader → class → method`, sorted, so the same runtime state
/// always yields the same id order. A method whose overloads cannot be read
/// is skipped with a warning rather than failing the session.
///
/// # Errors
/// Returns an error if a pattern is malformed or the runtime cannot be
/// enumerated at all
pub fn select_methods<R: ManagedRuntime + ?Sized>(
    runtime: &R,
    patterns: &[String],
) -> Result<Vec<ManagedMethod>> {
    let mut selected: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();

    for spec in patterns {
        let pattern = MethodPattern::parse(spec)?;
        for group in runtime.enumerate_methods(&pattern.query())? {
            let key = (group.loader.clone(), group.class.clone());
            let methods = group.methods.iter().filter(|m| pattern.matches(&group.class, m));
            if pattern.include {
                selected.entry(key).or_default().extend(methods.cloned());
            } else if let Some(existing) = selected.get_mut(&key) {
                for method in methods {
                    existing.remove(method);
                }
            }
        }
    }

    let mut traced = Vec::new();
    for ((loader, class), methods) in selected {
        for method in methods {
            let overloads = match runtime.overloads(&loader, &class, &method) {
                Ok(overloads) => overloads,
                Err(e) => {
                    warn!("Skipping {class}.{method}: {e:#}");
                    continue;
                }
            };
            let include_args = overloads.len() > 1;
            for args in overloads {
                traced.push(ManagedMethod {
                    class: class.clone(),
                    method: method.clone(),
                    overload: include_args.then_some(args),
                });
            }
        }
    }

    info!("Selected {} managed method overloads", traced.len());
    Ok(traced)
}
