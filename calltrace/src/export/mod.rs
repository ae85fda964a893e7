//! Trace export functionality
//!
//! Writes reconstructed spans in Chrome Trace Event Format, for viewing in
//! Perfetto or chrome://tracing.

pub mod chrome_trace;

pub use chrome_trace::{sort_for_viewer, TraceWriter};
