//! # calltrace - Function-Level Call Tracer
//!
//! calltrace records every entry and exit of a chosen set of functions in one
//! or more running processes and writes them as a Chrome trace. Native
//! functions come from ELF modules and are checked against what the live
//! process actually mapped; managed methods come from the target's runtime.
//! Each traced function gets a 16-bit id, and only that id and a timestamp
//! delta travel from the target back to the host.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Traced Process(es)                          │
//! │        agent library: hooks, per-thread record buffers          │
//! └───────────────────────┬─────────────────────────────────────────┘
//!            ▲            │ frames: [pid tid len] + 6-byte records
//!  attach    │            ▼
//!  plans     │  ┌─────────────────────────────────────────────────┐
//!            │  │ session::transport (Unix socket, reader threads) │
//!            │  └───────────────────────┬─────────────────────────┘
//!            │                          │ Inbound (one channel)
//! ┌──────────┴──────────────────────────▼───────────────────────────┐
//! │                    calltrace (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Validation  │──▶│   Catalog    │   │     Wire     │         │
//! │  │ (local/live) │   │ (id → name)  │   │   (decode)   │         │
//! │  └──────────────┘   └──────┬───────┘   └──────┬───────┘         │
//! │         ▲                  │                  ▼                 │
//! │  ┌──────┴───────┐          │           ┌──────────────┐         │
//! │  │Symbolization │          │           │ Reconstruct  │         │
//! │  │ (ELF, DWARF) │          │           │ (per thread) │         │
//! │  └──────────────┘          │           └──────┬───────┘         │
//! │                            ▼                  ▼                 │
//! │                     ┌──────────────────────────────┐            │
//! │                     │   Export (trace.json)        │            │
//! │                     └──────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Setup
//!
//! - [`config`]: session config file (processes, module rules, filter policy)
//! - [`symbolization`]: local ELF images, `/proc/<pid>/maps`, demangling and
//!   DWARF source lines
//! - [`validation`]: build-id gate, address translation and the cross-check
//!   of every candidate against the live process
//! - [`catalog`]: function filtering, managed method selection and id
//!   allocation; [`setup`] ties them together per process
//! - [`engine`]: the seams to the instrumentation engine, the live process
//!   and the managed runtime
//!
//! ### Recording
//!
//! - [`session`]: agent transport, the preload engine, and the control loop
//! - [`wire`]: host view of agent frames
//! - [`reconstruct`]: per-thread stacks that pair enters with leaves
//! - [`export`]: streaming Chrome Trace Event Format writer
//!
//! ### Support
//!
//! - [`cli`], [`preflight`], [`process_lookup`]
//! - [`domain`]: core domain types (Pid, Tid, FunctionId, Timestamp) and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Check what would be traced
//! calltrace catalog session.json
//!
//! # Record until Enter or Ctrl+C
//! calltrace record session.json --agent ./libcalltrace_agent.so -o trace.json
//! ```
//!
//! ## Key Concepts
//!
//! - **Load bias**: lowest `PT_LOAD` vaddr of a module, page aligned; runtime
//!   address = static address - load bias + mapping base
//! - **Build id**: `NT_GNU_BUILD_ID` note; local and live copies must agree
//! - **Unterminated span**: a call still open when the session ended

pub mod catalog;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod export;
pub mod preflight;
pub mod process_lookup;
pub mod reconstruct;
pub mod session;
pub mod setup;
pub mod symbolization;
pub mod validation;
pub mod wire;
