//! Pre-flight checks for calltrace
//!
//! Validates what a session needs before any process is touched.
//! Provides clear, actionable error messages when requirements aren't met.

use anyhow::{bail, Context, Result};
use log::warn;
use object::{Object, ObjectSection};
use std::path::Path;

use crate::domain::Pid;

/// Run all checks that do not depend on a traced process
///
/// # Errors
/// Returns an error if the agent library is missing or is not a file
pub fn run_preflight_checks(agent_library: Option<&Path>) -> Result<()> {
    if let Some(library) = agent_library {
        check_binary_exists(library)?;
    }
    Ok(())
}

/// Check if a binary exists and is a regular file
fn check_binary_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            path.display()
        );
    }
    if !path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --agent must point to a shared library, not a directory.",
            path.display()
        );
    }
    Ok(())
}

/// Warn when a module cannot give the catalog names or source locations
///
/// Stripped modules still validate but every function is rejected by the
/// filter's source requirement, which otherwise looks like an empty config.
///
/// # Errors
/// Returns an error if the file cannot be read
pub fn check_debug_symbols(path: &Path, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let file_data =
        std::fs::read(path).with_context(|| format!("Failed to read binary: {}", path.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        // Not a valid object file, let later stages handle it
        return Ok(());
    };

    // Check for .debug_info section (DWARF debug info)
    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);

    // Check for .symtab (symbol table - present in non-stripped binaries)
    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);

    if !has_debug_info && !has_symtab {
        warn!("{} is stripped, only exported functions can be traced", path.display());
    } else if !has_debug_info {
        warn!("{} has no DWARF debug info, source filters will reject everything", path.display());
    }

    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is missing
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` is not readable
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {})\n\
             - Permission denied (trace your own processes, or run with sudo)\n\
             - /proc is not mounted",
            pid.0
        )
    })?;
    Ok(())
}
