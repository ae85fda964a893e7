//! Resolve a configured process name to a running pid
//!
//! A name matches a process when it equals the kernel command name, `argv[0]`
//! or its basename, or the executable's full path or basename. The kernel cuts
//! command names to 15 bytes: a cut name matches when it opens the configured
//! name, or closes it, as Android app processes keep the package tail.
//!
//! Several matches are never guessed between; the session config has to pin
//! the process with `"pid"` instead.

use anyhow::{Context, Result};
use log::debug;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{ConfigurationError, Pid};

/// Longest command name the kernel keeps
const COMM_LEN: usize = 15;

/// What `/proc` says about one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub comm: String,
    pub argv0: Option<String>,
    pub exe: Option<PathBuf>,
}

impl ProcessEntry {
    /// `None` once the process is gone
    #[must_use]
    pub fn read(pid: Pid) -> Option<Self> {
        let comm = fs::read_to_string(format!("/proc/{}/comm", pid.0)).ok()?;
        let argv0 = fs::read(format!("/proc/{}/cmdline", pid.0)).ok().and_then(|cmdline| {
            cmdline
                .split(|&byte| byte == 0)
                .next()
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
        });
        Some(Self {
            pid,
            comm: comm.trim_end_matches('\n').to_string(),
            argv0,
            exe: fs::read_link(format!("/proc/{}/exe", pid.0)).ok(),
        })
    }

    /// Kernel threads have neither a command line nor an executable
    #[must_use]
    pub fn is_kernel_thread(&self) -> bool {
        self.argv0.is_none() && self.exe.is_none()
    }

    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        if self.comm == name || comm_was_cut_from(&self.comm, name) {
            return true;
        }
        if let Some(argv0) = &self.argv0 {
            if argv0 == name || base_name(Path::new(argv0)) == Some(name) {
                return true;
            }
        }
        self.exe
            .as_deref()
            .is_some_and(|exe| exe == Path::new(name) || base_name(exe) == Some(name))
    }

    fn describe(&self) -> String {
        format!("  {} {}", self.pid.0, self.argv0.as_deref().unwrap_or(&self.comm))
    }
}

fn comm_was_cut_from(comm: &str, name: &str) -> bool {
    comm.len() == COMM_LEN && name.len() > COMM_LEN && (name.starts_with(comm) || name.ends_with(comm))
}

fn base_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(OsStr::to_str)
}

/// Pick the one entry `name` refers to
///
/// # Errors
/// [`ConfigurationError::InvalidConfig`] listing the candidates when more
/// than one entry matches
pub fn select(entries: Vec<ProcessEntry>, name: &str) -> Result<Option<ProcessEntry>, ConfigurationError> {
    let mut matching: Vec<ProcessEntry> = entries.into_iter().filter(|entry| entry.matches(name)).collect();
    if matching.len() > 1 {
        let candidates: Vec<String> = matching.iter().map(ProcessEntry::describe).collect();
        return Err(ConfigurationError::InvalidConfig(format!(
            "{} processes match '{name}':\n{}\nSet \"pid\" for this process in the session config",
            matching.len(),
            candidates.join("\n")
        )));
    }
    Ok(matching.pop())
}

/// Find the running process `name` refers to, never our own
///
/// # Errors
/// Returns an error if `/proc` cannot be listed or the name is ambiguous
pub fn find_process(name: &str) -> Result<Option<ProcessEntry>> {
    let own = std::process::id();
    let entries: Vec<ProcessEntry> = fs::read_dir("/proc")
        .context("Failed to read /proc")?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| pid != own)
        .filter_map(|pid| ProcessEntry::read(Pid(pid)))
        .filter(|entry| !entry.is_kernel_thread())
        .collect();
    debug!("{} processes to match '{name}' against", entries.len());

    Ok(select(entries, name)?)
}

/// The executable a process runs
///
/// # Errors
/// Returns an error if the process is gone or its `exe` link is unreadable
pub fn resolve_exe_path(pid: Pid) -> Result<PathBuf> {
    let link = format!("/proc/{}/exe", pid.0);
    fs::read_link(&link).with_context(|| format!("Cannot read {link}"))
}
