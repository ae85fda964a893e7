//! # Trace Session
//!
//! One control loop owns all mutable session state. Agent reader threads and
//! the host's stop request talk to it only through a single channel, so the
//! reconstructor and the writer never need locking:
//!
//! ```text
//! agent ──frames──▶ reader thread ─┐
//! agent ──frames──▶ reader thread ─┼─▶ Receiver<Inbound> ─▶ Session::run
//! main  ──StopRequested────────────┘        decode → reconstruct → buffer
//! ```
//!
//! The loop ends once a stop was requested and every agent has hung up (or
//! the drain timeout runs out). Spans are then ordered for the viewer and
//! written in one pass.
//!
//! [`Session::spawn`] runs the loop on its own thread. The returned
//! [`SessionHandle`] can be awaited for an early end, and
//! [`SessionHandle::stop`] always yields the loop's own result.

pub mod preload;
pub mod transport;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use calltrace_common::FrameHeader;

use crate::catalog::SessionCatalogs;
use crate::domain::TraceError;
use crate::export::{sort_for_viewer, TraceWriter};
use crate::reconstruct::{Span, StackReconstructor};
use crate::wire::WireMessage;

pub use preload::PreloadEngine;
pub use transport::AgentServer;

/// Connection handle assigned by the transport
pub type AgentId = u64;

/// How long to wait for agents to hang up after a stop request
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum Inbound {
    Connected { agent: AgentId },
    Frame { agent: AgentId, header: FrameHeader, payload: Vec<u8> },
    Disconnected { agent: AgentId },
    TransportError { agent: AgentId, message: String },
    /// Detach and flush were sent; finish once agents are gone
    StopRequested,
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub agents: usize,
    pub frames: usize,
    pub events: usize,
    pub spans: usize,
    pub unterminated: usize,
    pub anomalies: usize,
    pub threads: usize,
    pub records_written: usize,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} spans ({} unterminated) from {} events on {} threads, {} anomalies",
            self.spans, self.unterminated, self.events, self.threads, self.anomalies
        )
    }
}

pub struct Session<W: Write> {
    catalogs: SessionCatalogs,
    reconstructor: StackReconstructor,
    writer: TraceWriter<W>,
    spans: Vec<Span>,
    agents: HashSet<AgentId>,
    stop_requested: bool,
    drain_timeout: Duration,
    summary: SessionSummary,
}

impl<W: Write> Session<W> {
    /// Start a session, opening the trace array on `writer`
    ///
    /// # Errors
    /// Returns an error if the opening write fails
    pub fn new(catalogs: SessionCatalogs, writer: W) -> Result<Self, TraceError> {
        Ok(Self {
            catalogs,
            reconstructor: StackReconstructor::new(),
            writer: TraceWriter::create(writer)?,
            spans: Vec::new(),
            agents: HashSet::new(),
            stop_requested: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            summary: SessionSummary::default(),
        })
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Stop requested and no agent left
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.stop_requested && self.agents.is_empty()
    }

    /// Agents currently connected
    #[must_use]
    pub fn connected_agents(&self) -> usize {
        self.agents.len()
    }

    /// Process one inbound message
    ///
    /// # Errors
    /// Malformed frames and transport failures are fatal
    pub fn handle(&mut self, message: Inbound) -> Result<(), TraceError> {
        match message {
            Inbound::Connected { agent } => {
                self.agents.insert(agent);
                self.summary.agents += 1;
            }
            Inbound::Frame { agent, header, payload } => {
                let message = WireMessage::decode(&header, &payload)?;
                if let WireMessage::Events { events, .. } = &message {
                    self.summary.events += events.len();
                }
                self.summary.frames += 1;
                debug!("agent {agent}: frame for {} {}", message.pid(), message.tid());
                self.reconstructor.apply(&message, &mut self.spans);
            }
            Inbound::Disconnected { agent } => {
                self.agents.remove(&agent);
                info!("agent {agent} disconnected, {} remaining", self.agents.len());
            }
            Inbound::TransportError { agent, message } => {
                return Err(TraceError::Transport(format!("agent {agent}: {message}")));
            }
            Inbound::StopRequested => {
                info!("Stop requested, waiting for {} agent(s) to finish", self.agents.len());
                self.stop_requested = true;
            }
        }
        Ok(())
    }

    /// Run the control loop to completion and write the trace
    ///
    /// Returns the summary and the underlying writer.
    ///
    /// # Errors
    /// Returns the first fatal error; the trace is left unterminated then
    pub fn run(mut self, rx: &Receiver<Inbound>) -> Result<(SessionSummary, W), TraceError> {
        let mut deadline: Option<Instant> = None;

        while !self.is_done() {
            let received = match deadline {
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(deadline) => rx.recv_deadline(deadline),
            };
            match received {
                Ok(message) => self.handle(message)?,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "{} agent(s) still connected after {:?}, finishing without them",
                        self.agents.len(),
                        self.drain_timeout
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("All senders gone");
                    break;
                }
            }
            if self.stop_requested && deadline.is_none() {
                deadline = Some(Instant::now() + self.drain_timeout);
            }
        }

        self.finish()
    }

    /// Run the control loop on a thread of its own
    ///
    /// # Errors
    /// Returns an error if the thread cannot be started
    pub fn spawn(self, rx: Receiver<Inbound>) -> io::Result<SessionHandle<W>>
    where
        W: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let thread = thread::Builder::new().name("calltrace-session".to_string()).spawn(move || {
            let result = self.run(&rx);
            let _ = done_tx.send(());
            result
        })?;
        Ok(SessionHandle { thread, done: Some(done_rx) })
    }

    /// Close open frames, order spans and write everything out
    ///
    /// # Errors
    /// Returns an error if a span has no catalog entry or a write fails
    pub fn finish(mut self) -> Result<(SessionSummary, W), TraceError> {
        self.reconstructor.finish(&mut self.spans);
        sort_for_viewer(&mut self.spans);

        for span in &self.spans {
            self.writer.write_span(span, &self.catalogs)?;
        }
        self.writer.write_thread_names(self.reconstructor.thread_names())?;

        let mut summary = self.summary;
        summary.spans = self.spans.len();
        summary.unterminated = self.spans.iter().filter(|s| s.is_unterminated()).count();
        summary.anomalies = self.reconstructor.anomalies().len();
        summary.threads = self.reconstructor.thread_count();
        summary.records_written = self.writer.records_written();

        let writer = self.writer.close()?;
        Ok((summary, writer))
    }
}

/// A session running on its own thread
pub struct SessionHandle<W> {
    thread: JoinHandle<Result<(SessionSummary, W), TraceError>>,
    done: Option<oneshot::Receiver<()>>,
}

impl<W> SessionHandle<W> {
    /// Resolves once the control loop has returned, successfully or not
    pub async fn finished(&mut self) {
        if let Some(done) = self.done.as_mut() {
            // A dropped sender means the thread panicked; it is over either way.
            let _ = done.await;
            self.done = None;
        }
    }

    /// Ask the loop to wind down and wait for its result
    ///
    /// # Errors
    /// Whatever ended the loop, or [`TraceError::SessionPanicked`]
    pub fn stop(self, tx: &Sender<Inbound>) -> Result<(SessionSummary, W), TraceError> {
        if tx.send(Inbound::StopRequested).is_err() {
            debug!("Session loop already returned");
        }
        self.thread.join().map_err(|_| TraceError::SessionPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogBuilder, ManagedMethod};
    use crate::domain::Pid;
    use calltrace_common::FunctionEvent;
    use crossbeam_channel::unbounded;
    use serde_json::Value;

    fn catalogs() -> SessionCatalogs {
        let mut builder = CatalogBuilder::new();
        builder.add_managed(["render", "layout"].map(|method| ManagedMethod {
            class: "com.example.View".to_string(),
            method: method.to_string(),
            overload: None,
        }));
        let mut catalogs = SessionCatalogs::new();
        catalogs.insert(Pid(100), builder.build().unwrap());
        catalogs
    }

    fn frame(agent: AgentId, events: &[FunctionEvent]) -> Inbound {
        let payload: Vec<u8> = events.iter().flat_map(|e| e.encode().unwrap()).collect();
        let header = FrameHeader::events(100, 7, u32::try_from(payload.len()).unwrap());
        Inbound::Frame { agent, header, payload }
    }

    #[test]
    fn test_run_until_stop_and_disconnect() {
        let (tx, rx) = unbounded();
        tx.send(Inbound::Connected { agent: 1 }).unwrap();
        tx.send(frame(1, &[FunctionEvent::enter(0, 5), FunctionEvent::enter(1, 10)])).unwrap();
        tx.send(frame(1, &[FunctionEvent::leave(1, 15), FunctionEvent::leave(0, 25)])).unwrap();
        tx.send(Inbound::StopRequested).unwrap();
        tx.send(Inbound::Disconnected { agent: 1 }).unwrap();

        let session = Session::new(catalogs(), Vec::new()).unwrap();
        let (summary, out) = session.run(&rx).unwrap();

        assert_eq!(summary.frames, 2);
        assert_eq!(summary.events, 4);
        assert_eq!(summary.spans, 2);
        assert_eq!(summary.anomalies, 0);
        assert_eq!(summary.records_written, 2);

        let records: Vec<Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(records[0]["name"], "com.example.View.render");
        assert_eq!(records[0]["dur"], 20);
        assert_eq!(records[1]["name"], "com.example.View.layout");
        assert_eq!(records[1]["ts"], 10);
    }

    #[test]
    fn test_stop_without_agents_finishes_immediately() {
        let (tx, rx) = unbounded();
        tx.send(Inbound::StopRequested).unwrap();

        let (summary, out) = Session::new(catalogs(), Vec::new()).unwrap().run(&rx).unwrap();
        assert_eq!(summary, SessionSummary::default());
        assert_eq!(String::from_utf8(out).unwrap(), "[\n{}]\n");
    }

    #[test]
    fn test_drain_timeout_with_lingering_agent() {
        let (tx, rx) = unbounded();
        tx.send(Inbound::Connected { agent: 1 }).unwrap();
        tx.send(frame(1, &[FunctionEvent::enter(0, 5)])).unwrap();
        tx.send(Inbound::StopRequested).unwrap();

        let session = Session::new(catalogs(), Vec::new())
            .unwrap()
            .with_drain_timeout(Duration::from_millis(20));
        let (summary, out) = session.run(&rx).unwrap();
        drop(tx);

        assert_eq!(summary.unterminated, 1);
        let records: Vec<Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(records[0]["ph"], "B");
        assert_eq!(records[0]["args"]["synthetic"], true);
    }

    #[test]
    fn test_malformed_frame_is_fatal() {
        let mut session = Session::new(catalogs(), Vec::new()).unwrap();
        let header = FrameHeader::events(100, 7, 5);
        let err = session.handle(Inbound::Frame { agent: 1, header, payload: vec![0; 5] }).unwrap_err();
        assert!(matches!(err, TraceError::MalformedWire { .. }));
    }

    #[test]
    fn test_zero_delta_record_is_counted_not_fatal() {
        let (tx, rx) = unbounded();
        let mut payload: Vec<u8> = FunctionEvent::enter(0, 5).encode().unwrap().to_vec();
        payload.extend_from_slice(&[1, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&FunctionEvent::leave(0, 9).encode().unwrap());
        let header = FrameHeader::events(100, 7, 18);
        tx.send(Inbound::Frame { agent: 1, header, payload }).unwrap();
        tx.send(Inbound::StopRequested).unwrap();

        let (summary, out) = Session::new(catalogs(), Vec::new()).unwrap().run(&rx).unwrap();

        assert_eq!(summary.events, 2);
        assert_eq!(summary.spans, 1);
        assert_eq!(summary.anomalies, 1);
        let records: Vec<Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(records[0]["dur"], 4);
    }

    #[tokio::test]
    async fn test_spawned_session_stops_on_request() {
        let (tx, rx) = unbounded();
        let handle = Session::new(catalogs(), Vec::new()).unwrap().spawn(rx).unwrap();
        tx.send(frame(1, &[FunctionEvent::enter(0, 5), FunctionEvent::leave(0, 8)])).unwrap();

        let (summary, _) = handle.stop(&tx).unwrap();
        assert_eq!(summary.spans, 1);
    }

    #[tokio::test]
    async fn test_early_failure_is_reported_by_stop() {
        let (tx, rx) = unbounded();
        let mut handle = Session::new(catalogs(), Vec::new()).unwrap().spawn(rx).unwrap();
        let header = FrameHeader::events(100, 7, 5);
        tx.send(Inbound::Frame { agent: 1, header, payload: vec![0; 5] }).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.finished()).await.unwrap();
        handle.finished().await;

        let err = handle.stop(&tx).unwrap_err();
        assert!(matches!(err, TraceError::MalformedWire { .. }));
    }

    #[test]
    fn test_transport_error_is_fatal() {
        let mut session = Session::new(catalogs(), Vec::new()).unwrap();
        let err = session
            .handle(Inbound::TransportError { agent: 3, message: "connection reset".to_string() })
            .unwrap_err();
        assert!(err.to_string().contains("agent 3"));
    }

    #[test]
    fn test_unknown_function_fails_at_finish() {
        let (tx, rx) = unbounded();
        tx.send(frame(1, &[FunctionEvent::enter(9, 1), FunctionEvent::leave(9, 2)])).unwrap();
        drop(tx);

        let err = Session::new(catalogs(), Vec::new()).unwrap().run(&rx).unwrap_err();
        assert!(matches!(err, TraceError::Serialization(_)));
    }
}
