//! # calltrace - Main Entry Point
//!
//! Two subcommands:
//! - **catalog**: validate every configured module against its live process
//!   and print the attach plans, without hooking anything
//! - **record**: hook, trace until stopped, and write a Chrome trace

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use log::{info, warn};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;

use calltrace_common::AGENT_ENTRY_SYMBOL;

use calltrace::catalog::{CatalogManifest, FunctionCatalog, SessionCatalogs};
use calltrace::cli::{Args, Command};
use calltrace::config::{ProcessConfig, TraceConfig};
use calltrace::domain::{ConfigurationError, Pid, TraceError, ValidationError};
use calltrace::engine::{InstrumentationEngine, Target};
use calltrace::preflight::{check_debug_symbols, check_proc_access, run_preflight_checks};
use calltrace::process_lookup::{find_process, resolve_exe_path};
use calltrace::session::{AgentServer, Inbound, PreloadEngine, Session, SessionHandle, SessionSummary};
use calltrace::setup::build_catalog;
use calltrace::symbolization::{read_module_mapping, ElfReader};
use calltrace::validation::ProcfsProcess;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_VALIDATION: i32 = 3;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<ConfigurationError>()) {
        return EXIT_USAGE;
    }
    if let Some(trace) = err.downcast_ref::<TraceError>() {
        match trace {
            TraceError::Configuration(_) => return EXIT_USAGE,
            TraceError::Validation(_) => return EXIT_VALIDATION,
            _ => {}
        }
    }
    if err.chain().any(|cause| cause.is::<ValidationError>()) {
        return EXIT_VALIDATION;
    }

    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Catalog { config, output } => run_catalog(&config, output.as_deref(), args.quiet),
        Command::Record { config, output, socket, plan_dir, agent, duration, drain_timeout } => {
            let options = RecordOptions {
                output,
                socket,
                plan_dir,
                agent,
                duration: (duration > 0).then(|| Duration::from_secs(duration)),
                drain_timeout: Duration::from_secs(drain_timeout),
                quiet: args.quiet,
            };
            run_record(&config, options).await
        }
    }
}

/// Resolve a process without starting anything
fn find_target(process: &ProcessConfig) -> Result<Pid> {
    match process.target() {
        Target::Existing(pid) => Ok(pid),
        Target::Named { name, .. } => find_process(&name)?
            .map(|process| process.pid)
            .with_context(|| format!("No process named '{name}' is running")),
    }
}

/// Validate modules and build the catalog of one resolved process
fn prepare_process(
    config: &TraceConfig,
    process: &ProcessConfig,
    pid: Pid,
    reader: &ElfReader,
    quiet: bool,
) -> Result<FunctionCatalog> {
    check_proc_access(pid)?;
    if let Ok(exe) = resolve_exe_path(pid) {
        info!("{} runs {}", process.name, exe.display());
    }
    for rule in &process.modules {
        let Ok(mapping) = read_module_mapping(pid, &rule.name) else { continue };
        // Unreadable images are reported by validation with more context.
        let _ = check_debug_symbols(&reader.local_path(Path::new(&mapping.path)), quiet);
    }

    let remote = ProcfsProcess::new(pid);
    let catalog = build_catalog(process, &remote, reader, &config.filter)?;
    if catalog.is_empty() {
        warn!("Nothing to trace in {} ({pid})", process.name);
    }
    Ok(catalog)
}

fn run_catalog(config_path: &Path, output: Option<&Path>, quiet: bool) -> Result<()> {
    let config = TraceConfig::from_file(config_path)?;
    let reader = ElfReader::new(config.sysroot.clone());

    let mut catalogs = SessionCatalogs::new();
    for process in &config.processes {
        let pid = find_target(process)?;
        catalogs.insert(pid, prepare_process(&config, process, pid, &reader, quiet)?);
    }

    let manifests: Vec<CatalogManifest<'_>> =
        catalogs.iter().map(|(pid, catalog)| CatalogManifest::new(pid, 0, catalog)).collect();

    match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), &manifests)?;
            if !quiet {
                println!("saved: {}", path.display());
            }
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, &manifests)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

struct RecordOptions {
    output: PathBuf,
    socket: PathBuf,
    plan_dir: PathBuf,
    agent: Option<PathBuf>,
    duration: Option<Duration>,
    drain_timeout: Duration,
    quiet: bool,
}

async fn run_record(config_path: &Path, options: RecordOptions) -> Result<()> {
    let config = TraceConfig::from_file(config_path)?;
    run_preflight_checks(options.agent.as_deref())?;
    let quiet = options.quiet;

    if !quiet {
        println!("calltrace v{}", env!("CARGO_PKG_VERSION"));
        println!("config: {}", config_path.display());
    }

    let (tx, rx) = unbounded::<Inbound>();
    let server = AgentServer::bind(&options.socket, tx.clone())?;
    let mut engine = PreloadEngine::new(server, options.agent.clone(), options.plan_dir.clone());
    let base_timestamp = engine.base_timestamp(None);
    let reader = ElfReader::new(config.sysroot.clone());

    // ── Catalogs: resolve, validate, allocate ids ───────────────────────
    let mut catalogs = SessionCatalogs::new();
    for process in &config.processes {
        let pid = engine.attach_or_spawn(&process.target())?;
        if let Some(agent) = &options.agent {
            engine.load_library(pid, agent)?;
            let module = agent.file_name().unwrap_or(agent.as_os_str()).to_string_lossy();
            let entry = engine
                .resolve_export(pid, &module, AGENT_ENTRY_SYMBOL)
                .with_context(|| format!("{} is loaded but is not a calltrace agent", agent.display()))?;
            info!("{module} entry at 0x{entry:x} in {pid}");
        }
        let catalog = prepare_process(&config, process, pid, &reader, quiet)?;
        engine.intercept(&CatalogManifest::new(pid, base_timestamp, &catalog))?;
        if !quiet {
            println!(
                "{}: pid {}, {} managed + {} native functions",
                process.name,
                pid.0,
                catalog.managed_count(),
                catalog.native_count()
            );
        }
        catalogs.insert(pid, catalog);
    }

    // ── Session thread owns reconstruction and the writer ───────────────
    let file = File::create(&options.output)
        .with_context(|| format!("Failed to create trace output {}", options.output.display()))?;
    let pids: Vec<Pid> = catalogs.iter().map(|(pid, _)| pid).collect();
    let mut session = Session::new(catalogs, BufWriter::new(file))?
        .with_drain_timeout(options.drain_timeout)
        .spawn(rx)
        .context("Failed to spawn session thread")?;

    for pid in pids {
        engine.resume(pid)?;
    }

    if !quiet {
        println!("tracing, press Enter or Ctrl+C to stop");
    }
    let started = Instant::now();
    let exit_reason = wait_for_stop(options.duration, &mut session).await;

    // ── Shutdown: unhook, flush, drain ──────────────────────────────────
    info!("Stopping: {exit_reason}");
    let unhooked = engine.detach_all().and_then(|()| engine.flush_all());
    // The session's own failure explains more than a failed broadcast.
    let (summary, writer) = session.stop(&tx)?;
    drop(tx);
    unhooked?;
    drop(writer);
    drop(engine);

    if !quiet {
        print_summary(exit_reason, started.elapsed(), &summary);
        println!("saved: {}", options.output.display());
    }
    Ok(())
}

async fn wait_for_stop<W>(duration: Option<Duration>, session: &mut SessionHandle<W>) -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // A closed stdin must not end the session.
    let enter = async {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await {
            Ok(Some(_)) => {}
            _ => std::future::pending().await,
        }
    };
    let limit = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = &mut ctrl_c => "interrupted",
        () = enter => "stopped",
        () = limit => "duration limit reached",
        () = session.finished() => "session ended",
    }
}

fn print_summary(exit_reason: &str, elapsed: Duration, summary: &SessionSummary) {
    eprintln!(
        "\n{}: {:.1}s, {} agents, {} frames, {summary}",
        exit_reason,
        elapsed.as_secs_f64(),
        summary.agents,
        summary.frames,
    );
}
