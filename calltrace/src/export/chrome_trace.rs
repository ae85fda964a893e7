use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::cmp::Reverse;
use std::io::Write;

use crate::catalog::{FunctionKind, SessionCatalogs};
use crate::domain::{SerializationError, TraceError};
use crate::reconstruct::{Span, SpanPhase, ThreadNameRegistry};

/// Chrome Trace Event format
/// Spec: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
#[derive(Debug, Serialize)]
struct ChromeTraceEvent<'a> {
    /// Event name (function name, or `thread_name` for metadata)
    name: &'a str,
    /// Category for filtering/coloring
    #[serde(skip_serializing_if = "Option::is_none")]
    cat: Option<&'a str>,
    /// Phase: "X" = complete, "B" = begin, "M" = metadata
    ph: &'static str,
    /// Timestamp in microseconds
    ts: u64,
    /// Duration in microseconds, "X" events only
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<i64>,
    pid: u32,
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<JsonValue>,
}

/// Streaming writer for a Chrome trace JSON array
///
/// Records are written as they arrive, so a session never has to hold the
/// serialized trace in memory:
///
/// ```text
/// [
/// {"name":"render","cat":"librender.so","ph":"X","ts":0,"dur":20,...},
/// {"name":"thread_name","ph":"M",...,"args":{"name":"RenderThread/7"}},
/// {}]
/// ```
///
/// Every record is followed by `,\n`; the trailing `{}` placeholder keeps the
/// array valid JSON without tracking which record is last.
pub struct TraceWriter<W: Write> {
    writer: Option<W>,
    records: usize,
}

impl<W: Write> TraceWriter<W> {
    /// Start a trace, writing the opening bracket
    ///
    /// # Errors
    /// Returns an error if the write fails
    pub fn create(mut writer: W) -> Result<Self, TraceError> {
        writer.write_all(b"[\n")?;
        Ok(Self { writer: Some(writer), records: 0 })
    }

    /// Records written so far, placeholder excluded
    #[must_use]
    pub fn records_written(&self) -> usize {
        self.records
    }

    /// Append one span
    ///
    /// # Errors
    /// [`SerializationError::UnknownFunction`] when the span's id has no
    /// catalog entry for its process. Nothing is written in that case.
    pub fn write_span(&mut self, span: &Span, catalogs: &SessionCatalogs) -> Result<(), TraceError> {
        let function = catalogs.function(span.pid, span.function_id)?;

        let mut args = Map::new();
        if let (FunctionKind::Native { .. }, Some(source)) = (&function.kind, &function.source) {
            args.insert("file".to_string(), json!(source.file));
            if let Some(line) = source.line {
                args.insert("line".to_string(), json!(line));
            }
        }
        let (ph, dur) = match span.phase {
            SpanPhase::Complete { duration } => ("X", Some(duration)),
            SpanPhase::Unterminated => {
                args.insert("synthetic".to_string(), json!(true));
                ("B", None)
            }
        };

        self.write_record(&ChromeTraceEvent {
            name: function.display_name(),
            cat: Some(function.category.as_str()),
            ph,
            ts: span.start.0,
            dur,
            pid: span.pid.0,
            tid: span.tid.0,
            args: (!args.is_empty()).then_some(JsonValue::Object(args)),
        })
    }

    /// Append one `thread_name` metadata record per named thread
    ///
    /// The viewer label is `<name>/<tid>` so threads sharing a name stay
    /// distinguishable.
    ///
    /// # Errors
    /// Returns an error if a write fails
    pub fn write_thread_names(&mut self, names: &ThreadNameRegistry) -> Result<(), TraceError> {
        for (pid, tid, name) in names.iter() {
            self.write_record(&ChromeTraceEvent {
                name: "thread_name",
                cat: None,
                ph: "M",
                ts: 0,
                dur: None,
                pid: pid.0,
                tid: tid.0,
                args: Some(json!({ "name": format!("{name}/{}", tid.0) })),
            })?;
        }
        Ok(())
    }

    /// Terminate the array and hand back the underlying writer
    ///
    /// # Errors
    /// Returns an error if the final write or flush fails
    pub fn close(mut self) -> Result<W, TraceError> {
        let mut writer = self.writer.take().ok_or(SerializationError::Closed)?;
        writer.write_all(b"{}]\n")?;
        writer.flush()?;
        Ok(writer)
    }

    fn write_record(&mut self, event: &ChromeTraceEvent<'_>) -> Result<(), TraceError> {
        let writer = self.writer.as_mut().ok_or(SerializationError::Closed)?;
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b",\n")?;
        self.records += 1;
        Ok(())
    }
}

/// Order spans the way trace viewers nest them best
///
/// Earlier start first; on equal starts the longer span first so it encloses
/// the shorter one. Unterminated spans count as longest.
pub fn sort_for_viewer(spans: &mut [Span]) {
    spans.sort_by_key(|span| (span.start, Reverse(span.duration().unwrap_or(i64::MAX))));
}
