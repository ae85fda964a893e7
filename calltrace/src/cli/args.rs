//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "calltrace",
    version,
    about = "Trace function calls of running processes into a Chrome trace",
    after_help = "\
EXAMPLES:
    calltrace catalog session.json                 Validate modules, print the attach plans
    calltrace record session.json                  Trace until Ctrl+C or Enter
    calltrace record session.json --duration 10    Trace for ten seconds
    calltrace record session.json --agent ./libcalltrace_agent.so -o render.json"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build and validate the function catalog of every configured process
    Catalog {
        /// Session config (JSON)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Write the attach plans here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Attach to every configured process and record a trace
    Record {
        /// Session config (JSON)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Trace output file (Chrome trace JSON)
        #[arg(short, long, value_name = "FILE", default_value = "trace.json")]
        output: PathBuf,

        /// Socket the agents connect back to
        #[arg(long, value_name = "PATH", default_value = "/tmp/calltrace.sock")]
        socket: PathBuf,

        /// Directory the agents read their attach plans from
        #[arg(long, value_name = "DIR", default_value = "/tmp")]
        plan_dir: PathBuf,

        /// Agent library to preload into spawned targets
        #[arg(long, value_name = "LIB")]
        agent: Option<PathBuf>,

        /// Stop after N seconds (0 = until Ctrl+C or Enter)
        #[arg(long, default_value = "0")]
        duration: u64,

        /// Seconds to wait for agents to deliver their buffers after stopping
        #[arg(long, default_value = "10")]
        drain_timeout: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_record_defaults() {
        let args = Args::try_parse_from(["calltrace", "record", "session.json"]).unwrap();
        let Command::Record { output, socket, duration, agent, .. } = args.command else {
            panic!("expected record");
        };
        assert_eq!(output, PathBuf::from("trace.json"));
        assert_eq!(socket, PathBuf::from("/tmp/calltrace.sock"));
        assert_eq!(duration, 0);
        assert!(agent.is_none());
    }

    #[test]
    fn test_catalog_requires_config() {
        assert!(Args::try_parse_from(["calltrace", "catalog"]).is_err());
    }
}
