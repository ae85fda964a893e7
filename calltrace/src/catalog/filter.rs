//! Candidate filtering for native functions
//!
//! Tracing every symbol of a large library is both slow and noisy: tiny
//! thunks dominate the event rate, and inlined STL helpers bury the code the
//! user cares about. [`FilterPolicy`] drops those before ids are allocated.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

use super::NativeCandidate;
use crate::config::ModuleRule;

/// Functions must be strictly larger than this to be traced
///
/// Anything at or below it is too small to hold a useful body once the
/// interception trampoline is accounted for.
pub const DEFAULT_MIN_SIZE: u64 = 14;

/// Which native candidates make it into the catalog
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterPolicy {
    /// Minimum size is exclusive: `size > min_size` survives
    pub min_size: u64,
    /// Source path prefixes whose functions are never traced
    pub excluded_source_prefixes: Vec<String>,
    pub skip_destructors: bool,
    /// Drop functions that have no source line information
    pub require_source: bool,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            excluded_source_prefixes: vec![
                "/usr/include/".to_string(),
                "/usr/lib/gcc/".to_string(),
                "/rustc/".to_string(),
            ],
            skip_destructors: false,
            require_source: true,
        }
    }
}

/// Why a candidate was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rejection {
    ZeroSize,
    NoSource,
    ExcludedSource,
    TooSmall,
    Destructor,
    SourcePrefix,
    FunctionPrefix,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::ZeroSize => "zero size",
            Self::NoSource => "no debug info",
            Self::ExcludedSource => "excluded source",
            Self::TooSmall => "too small",
            Self::Destructor => "destructor",
            Self::SourcePrefix => "outside source prefix",
            Self::FunctionPrefix => "outside function prefix",
        };
        f.write_str(reason)
    }
}

/// Per-reason drop counts, for the setup log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub kept: usize,
    pub rejected: BTreeMap<Rejection, usize>,
}

impl FilterStats {
    #[must_use]
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

impl fmt::Display for FilterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kept {}", self.kept)?;
        for (reason, count) in &self.rejected {
            write!(f, ", {reason}: {count}")?;
        }
        Ok(())
    }
}

impl FilterPolicy {
    /// Decide one candidate against the policy and a module rule
    ///
    /// # Errors
    /// Returns the first [`Rejection`] that applies.
    pub fn check(&self, candidate: &NativeCandidate, rule: &ModuleRule) -> Result<(), Rejection> {
        if candidate.size == 0 || candidate.static_address == 0 {
            return Err(Rejection::ZeroSize);
        }

        let source = match &candidate.source {
            Some(source) => Some(source.file.as_str()),
            None if self.require_source => return Err(Rejection::NoSource),
            None => None,
        };

        if let Some(file) = source {
            if self.excluded_source_prefixes.iter().any(|prefix| file.starts_with(prefix.as_str())) {
                return Err(Rejection::ExcludedSource);
            }
        }

        if let Some(prefix) = &rule.src {
            if !source.is_some_and(|file| file.starts_with(prefix.as_str())) {
                return Err(Rejection::SourcePrefix);
            }
        }

        if let Some(prefix) = &rule.function {
            let demangled = candidate.demangled_name.as_deref().unwrap_or("");
            if !candidate.name.starts_with(prefix.as_str()) && !demangled.starts_with(prefix.as_str())
            {
                return Err(Rejection::FunctionPrefix);
            }
        }

        if candidate.size <= self.min_size {
            return Err(Rejection::TooSmall);
        }

        if self.skip_destructors && is_destructor(candidate) {
            return Err(Rejection::Destructor);
        }

        Ok(())
    }

    /// Keep the candidates that pass, counting the ones that don't
    #[must_use]
    pub fn apply(
        &self,
        candidates: Vec<NativeCandidate>,
        rule: &ModuleRule,
    ) -> (Vec<NativeCandidate>, FilterStats) {
        let mut stats = FilterStats::default();
        let kept: Vec<_> = candidates
            .into_iter()
            .filter(|candidate| match self.check(candidate, rule) {
                Ok(()) => true,
                Err(reason) => {
                    *stats.rejected.entry(reason).or_default() += 1;
                    false
                }
            })
            .collect();
        stats.kept = kept.len();
        (kept, stats)
    }
}

/// C++ destructors (D0/D1/D2 variants) and Rust drop glue
fn is_destructor(candidate: &NativeCandidate) -> bool {
    let mangled = &candidate.name;
    if mangled.starts_with("_Z") && ["D0Ev", "D1Ev", "D2Ev"].iter().any(|s| mangled.ends_with(s)) {
        return true;
    }
    candidate
        .demangled_name
        .as_deref()
        .is_some_and(|name| name.contains("::~") || name.contains("drop_in_place"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolization::SourceLocation;

    fn candidate(name: &str, size: u64, file: Option<&str>) -> NativeCandidate {
        NativeCandidate {
            module: "libgui.so".to_string(),
            name: name.to_string(),
            demangled_name: crate::symbolization::demangle(name),
            static_address: 0x4000,
            size,
            source: file.map(|f| SourceLocation { file: f.to_string(), line: Some(10), column: None }),
        }
    }

    fn rule() -> ModuleRule {
        ModuleRule { name: "libgui.so".to_string(), src: None, function: None, imported: Vec::new() }
    }

    #[test]
    fn test_size_threshold_is_exclusive() {
        let policy = FilterPolicy::default();
        let at_limit = candidate("small", 14, Some("/src/gui/a.cpp"));
        let above = candidate("big", 15, Some("/src/gui/a.cpp"));

        assert_eq!(policy.check(&at_limit, &rule()), Err(Rejection::TooSmall));
        assert_eq!(policy.check(&above, &rule()), Ok(()));
    }

    #[test]
    fn test_zero_size_dropped() {
        let policy = FilterPolicy::default();
        assert_eq!(policy.check(&candidate("f", 0, Some("/a.cpp")), &rule()), Err(Rejection::ZeroSize));
    }

    #[test]
    fn test_missing_source_dropped_by_default() {
        let policy = FilterPolicy::default();
        assert_eq!(policy.check(&candidate("f", 64, None), &rule()), Err(Rejection::NoSource));

        let lenient = FilterPolicy { require_source: false, ..FilterPolicy::default() };
        assert_eq!(lenient.check(&candidate("f", 64, None), &rule()), Ok(()));
    }

    #[test]
    fn test_excluded_source_prefix() {
        let policy = FilterPolicy::default();
        let stl = candidate("_ZNSt6vectorIiE9push_backEv", 64, Some("/usr/include/c++/v1/vector"));
        assert_eq!(policy.check(&stl, &rule()), Err(Rejection::ExcludedSource));
    }

    #[test]
    fn test_rule_prefixes() {
        let policy = FilterPolicy::default();
        let rule = ModuleRule {
            name: "libgui.so".to_string(),
            src: Some("/src/gui/".to_string()),
            function: Some("android::Surface".to_string()),
            imported: Vec::new(),
        };

        let queue = candidate("_ZN7android7Surface5queueEv", 64, Some("/src/gui/Surface.cpp"));
        let other_file = candidate("_ZN7android7Surface5queueEv", 64, Some("/src/ui/Surface.cpp"));
        let other_fn = candidate("_ZN7android6Parcel4readEv", 64, Some("/src/gui/Parcel.cpp"));

        assert_eq!(policy.check(&queue, &rule), Ok(()));
        assert_eq!(policy.check(&other_file, &rule), Err(Rejection::SourcePrefix));
        assert_eq!(policy.check(&other_fn, &rule), Err(Rejection::FunctionPrefix));
    }

    #[test]
    fn test_destructors_only_skipped_when_asked() {
        let dtor = candidate("_ZN7android7SurfaceD2Ev", 64, Some("/src/gui/Surface.cpp"));

        assert_eq!(FilterPolicy::default().check(&dtor, &rule()), Ok(()));

        let policy = FilterPolicy { skip_destructors: true, ..FilterPolicy::default() };
        assert_eq!(policy.check(&dtor, &rule()), Err(Rejection::Destructor));
    }

    #[test]
    fn test_apply_counts_rejections() {
        let policy = FilterPolicy::default();
        let (kept, stats) = policy.apply(
            vec![
                candidate("a", 64, Some("/src/a.cpp")),
                candidate("b", 4, Some("/src/b.cpp")),
                candidate("c", 64, None),
            ],
            &rule(),
        );

        assert_eq!(kept.len(), 1);
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.rejected_total(), 2);
        assert_eq!(stats.to_string(), "kept 1, no debug info: 1, too small: 1");
    }
}
