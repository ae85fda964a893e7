//! Structured error types for calltrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Everything here is fatal. Runtime protocol anomalies are not errors; they
//! live in [`crate::reconstruct::Anomaly`] and never stop the pipeline.

use super::types::{FunctionId, Pid, Tid};
use calltrace_common::DecodeError;
use thiserror::Error;

/// Setup-time problems with what was asked for
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error(
        "Too many functions for a 16-bit id space: {} (managed {managed}, native {native})",
        .managed + .native
    )]
    IdSpaceExhausted { managed: usize, native: usize },

    #[error("Invalid session config: {0}")]
    InvalidConfig(String),
}

/// Offline analysis does not match the live process
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{module} buildId mismatch: local {local}, remote {remote}")]
    BuildIdMismatch { module: String, local: String, remote: String },

    #[error("{module} has no build id on the {side} side")]
    MissingBuildId { module: String, side: &'static str },

    #[error("Module {module} not loaded in process {pid}")]
    ModuleNotFound { module: String, pid: Pid },

    #[error("No remote functions to validate {module} against")]
    NoRemoteFunctions { module: String },

    #[error("No matching function found in {module}: {name}")]
    MissingRemoteFunction { module: String, name: String },

    #[error("{module}::{name} expected at 0x{expected:x}, live process has 0x{actual:x}")]
    AddressMismatch { module: String, name: String, expected: u64, actual: u64 },

    #[error("{module}::{name} expected {expected} bytes, live process has {actual}")]
    SizeMismatch { module: String, name: String, expected: u64, actual: u64 },
}

/// The trace being written would lie about what ran
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Can't find function info for {function_id} in process {pid}")]
    UnknownFunction { pid: Pid, function_id: FunctionId },

    #[error("Trace writer already closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Malformed wire buffer from {pid} {tid}: {source}")]
    MalformedWire {
        pid: Pid,
        tid: Tid,
        #[source]
        source: DecodeError,
    },

    #[error("Agent transport failed: {0}")]
    Transport(String),

    #[error("Session thread panicked")]
    SessionPanicked,

    #[error(transparent)]
    Reader(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
