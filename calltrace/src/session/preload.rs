//! Instrumentation through a preloaded agent library
//!
//! The agent is a shared library that the target loads at startup through
//! `LD_PRELOAD`. It connects back to the [`AgentServer`] socket named in
//! `CALLTRACE_SOCKET` and waits for `calltrace-<pid>.json` to appear in
//! `CALLTRACE_PLAN_DIR`. That file is the [`CatalogManifest`]; once it is
//! there the agent hooks the listed functions and lets the process run.
//!
//! A process that is already running can only be traced if it was started
//! with the agent preloaded.

use anyhow::{bail, Context, Result};
use calltrace_common::{CONTROL_DETACH, CONTROL_FLUSH};
use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::AgentServer;
use crate::catalog::CatalogManifest;
use crate::domain::Pid;
use crate::engine::{InstrumentationEngine, Target};
use crate::preflight::check_process_exists;
use crate::process_lookup::find_process;
use crate::symbolization::read_module_mapping;
use crate::validation::ProcfsProcess;

pub const SOCKET_ENV: &str = "CALLTRACE_SOCKET";
pub const PLAN_DIR_ENV: &str = "CALLTRACE_PLAN_DIR";

/// How long a freshly spawned process gets to map the agent library
const LIBRARY_WAIT: Duration = Duration::from_secs(2);
const LIBRARY_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct PreloadEngine {
    server: AgentServer,
    agent_library: Option<PathBuf>,
    plan_dir: PathBuf,
    pending: HashMap<Pid, Vec<u8>>,
    published: Vec<PathBuf>,
    children: Vec<Child>,
    base_timestamp: Option<u64>,
}

impl PreloadEngine {
    #[must_use]
    pub fn new(server: AgentServer, agent_library: Option<PathBuf>, plan_dir: PathBuf) -> Self {
        Self {
            server,
            agent_library,
            plan_dir,
            pending: HashMap::new(),
            published: Vec::new(),
            children: Vec::new(),
            base_timestamp: None,
        }
    }

    /// Where the manifest for `pid` is published
    #[must_use]
    pub fn plan_path(&self, pid: Pid) -> PathBuf {
        self.plan_dir.join(format!("calltrace-{}.json", pid.0))
    }

    #[must_use]
    pub fn server(&self) -> &AgentServer {
        &self.server
    }

    fn spawn(&mut self, argv: &[String]) -> Result<Pid> {
        let Some((program, args)) = argv.split_first() else {
            bail!("Empty spawn command");
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env(SOCKET_ENV, self.server.path())
            .env(PLAN_DIR_ENV, &self.plan_dir);
        if let Some(library) = &self.agent_library {
            command.env("LD_PRELOAD", library);
        }

        let child = command.spawn().with_context(|| format!("Failed to start {program}"))?;
        let pid = Pid(child.id());
        info!("Started {program} as {pid}");
        self.children.push(child);
        Ok(pid)
    }
}

impl InstrumentationEngine for PreloadEngine {
    fn attach_or_spawn(&mut self, target: &Target) -> Result<Pid> {
        match target {
            Target::Existing(pid) => {
                check_process_exists(*pid)?;
                Ok(*pid)
            }
            Target::Named { name, spawn } => match (find_process(name)?, spawn) {
                (Some(process), _) => {
                    info!("Found {name} as {}", process.pid);
                    Ok(process.pid)
                }
                (None, Some(argv)) => {
                    debug!("{name} is not running");
                    self.spawn(argv)
                }
                (None, None) => bail!(
                    "No process named '{name}' is running.\n\n\
                     Start it first, or give it \"spawn\" or \"pid\" in the session config."
                ),
            },
        }
    }

    fn load_library(&mut self, pid: Pid, library: &Path) -> Result<()> {
        // The target may have been given a relative or symlinked path.
        let name = library.file_name().unwrap_or(library.as_os_str()).to_string_lossy();
        let deadline = Instant::now() + LIBRARY_WAIT;
        loop {
            if read_module_mapping(pid, &name).is_ok() {
                debug!("{} is mapped in {pid}", library.display());
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "{} is not loaded in {pid}.\n\n\
                     Start the target with LD_PRELOAD={} or let calltrace spawn it.",
                    library.display(),
                    library.display()
                );
            }
            thread::sleep(LIBRARY_POLL_INTERVAL);
        }
    }

    fn resolve_export(&self, pid: Pid, module: &str, symbol: &str) -> Result<u64> {
        ProcfsProcess::new(pid).export_address(module, symbol)
    }

    fn intercept(&mut self, manifest: &CatalogManifest<'_>) -> Result<()> {
        let mut plan = Vec::new();
        manifest.write_to(&mut plan).context("Failed to serialize attach plan")?;
        self.pending.insert(manifest.pid, plan);
        Ok(())
    }

    fn resume(&mut self, pid: Pid) -> Result<()> {
        let Some(plan) = self.pending.remove(&pid) else {
            bail!("No attach plan prepared for {pid}");
        };

        // The agent polls for the final name; rename makes it appear whole.
        let path = self.plan_path(pid);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, plan).with_context(|| format!("Failed to write {}", staging.display()))?;
        fs::rename(&staging, &path).with_context(|| format!("Failed to publish {}", path.display()))?;
        info!("Released {pid} with {}", path.display());
        self.published.push(path);
        Ok(())
    }

    fn detach_all(&mut self) -> Result<()> {
        self.server.stop_accepting();
        let reached = self.server.broadcast(CONTROL_DETACH)?;
        debug!("Detach sent to {reached} agent(s)");
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        let reached = self.server.broadcast(CONTROL_FLUSH)?;
        debug!("Flush sent to {reached} agent(s)");
        Ok(())
    }

    fn base_timestamp(&mut self, proposed: Option<u64>) -> u64 {
        *self.base_timestamp.get_or_insert_with(|| proposed.unwrap_or_else(now_micros))
    }
}

impl Drop for PreloadEngine {
    fn drop(&mut self) {
        for path in &self.published {
            let _ = fs::remove_file(path);
        }
        // Spawned targets keep running; only reap the ones already gone.
        for child in &mut self.children {
            let _ = child.try_wait();
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogBuilder, ManagedMethod};
    use crossbeam_channel::unbounded;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> PreloadEngine {
        let (tx, _rx) = unbounded();
        let server = AgentServer::bind(dir.path().join("agent.sock"), tx).unwrap();
        PreloadEngine::new(server, None, dir.path().to_path_buf())
    }

    #[test]
    fn test_base_timestamp_is_fixed_by_first_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);

        assert_eq!(engine.base_timestamp(Some(1_000)), 1_000);
        assert_eq!(engine.base_timestamp(Some(2_000)), 1_000);
        assert_eq!(engine.base_timestamp(None), 1_000);
    }

    #[test]
    fn test_plan_is_published_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);

        let mut builder = CatalogBuilder::new();
        builder.add_managed([ManagedMethod {
            class: "com.example.View".to_string(),
            method: "draw".to_string(),
            overload: None,
        }]);
        let catalog = builder.build().unwrap();
        let pid = Pid(4242);
        let manifest = CatalogManifest::new(pid, 77, &catalog);

        engine.intercept(&manifest).unwrap();
        assert!(!engine.plan_path(pid).exists());

        engine.resume(pid).unwrap();
        let plan: serde_json::Value =
            serde_json::from_slice(&fs::read(engine.plan_path(pid)).unwrap()).unwrap();
        assert_eq!(plan["pid"], 4242);
        assert_eq!(plan["base_timestamp"], 77);
        assert_eq!(plan["functions"][0]["name"], "com.example.View.draw");

        assert!(engine.resume(pid).is_err());
    }

    #[test]
    fn test_existing_target_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);

        let own = Pid(std::process::id());
        assert_eq!(engine.attach_or_spawn(&Target::Existing(own)).unwrap(), own);
        assert!(engine.attach_or_spawn(&Target::Existing(Pid(999_999_999))).is_err());
    }

    #[test]
    fn test_missing_library_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);

        let err = engine
            .load_library(Pid(std::process::id()), Path::new("/nonexistent/libcalltrace_agent.so"))
            .unwrap_err();
        assert!(err.to_string().contains("is not loaded"));
    }

    #[test]
    fn test_named_target_without_spawn_must_be_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);

        let target = Target::Named { name: "calltrace-no-such-process".to_string(), spawn: None };
        let err = engine.attach_or_spawn(&target).unwrap_err();
        assert!(err.to_string().contains("is running"));
    }

    #[test]
    fn test_resolve_export_in_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let own = Pid(std::process::id());

        assert!(engine.resolve_export(own, "libcalltrace-missing.so", "init").is_err());
        // Only glibc targets map libc.so.6
        if let Ok(address) = engine.resolve_export(own, "libc.so.6", "getpid") {
            assert_ne!(address, 0);
        }
    }

    #[test]
    fn test_detach_and_flush_without_agents() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);

        engine.detach_all().unwrap();
        engine.flush_all().unwrap();
        assert_eq!(engine.server().connected(), 0);
    }
}
