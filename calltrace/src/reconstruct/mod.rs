//! # Per-Thread Stack Reconstruction
//!
//! Agents only report enters and leaves. Pairing them back into calls needs
//! one stack per thread, keyed by `(pid, tid)` and created on first use:
//!
//! ```text
//! enter A@0    [A@0]
//! enter B@10   [A@0, B@10]
//! leave  @15   [A@0]          → B  ts=10 dur=5
//! leave  @20   []             → A  ts=0  dur=20
//! ```
//!
//! A leave always closes the innermost open frame; the function id it carries
//! is not used for matching. Inconsistencies never stop the session. They are
//! logged and kept as [`Anomaly`] records:
//!
//! - record with a zero delta: dropped by the decoder, listed here
//! - leave on an empty stack: dropped
//! - leave earlier than its enter: the span is still emitted, with the
//!   negative duration
//! - frames still open at [`StackReconstructor::finish`]: emitted as
//!   [`SpanPhase::Unterminated`] spans

mod anomaly;
mod span;
mod thread_names;
mod thread_stack;

use log::{debug, warn};
use std::collections::HashMap;

use crate::domain::{Pid, Tid, Timestamp};
use crate::wire::{WireEvent, WireMessage};

pub use anomaly::{Anomaly, AnomalyKind};
pub use span::{Span, SpanPhase};
pub use thread_names::ThreadNameRegistry;
pub use thread_stack::{Frame, ThreadStack};

#[derive(Debug, Default)]
pub struct StackReconstructor {
    stacks: HashMap<(Pid, Tid), ThreadStack>,
    thread_names: ThreadNameRegistry,
    anomalies: Vec<Anomaly>,
}

impl StackReconstructor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded message, appending completed spans to `spans`
    pub fn apply(&mut self, message: &WireMessage, spans: &mut Vec<Span>) {
        match message {
            WireMessage::Events { pid, tid, events, corrupt } => {
                for &function_id in corrupt {
                    self.record(Anomaly {
                        pid: *pid,
                        tid: *tid,
                        function_id,
                        timestamp: Timestamp(0),
                        kind: AnomalyKind::ZeroDelta,
                    });
                }
                for event in events {
                    self.push_event(*pid, *tid, *event, spans);
                }
            }
            WireMessage::ThreadName { pid, tid, name } => {
                debug!("{pid} {tid} is named {name}");
                self.thread_names.set(*pid, *tid, name.clone());
            }
        }
    }

    pub fn push_event(&mut self, pid: Pid, tid: Tid, event: WireEvent, spans: &mut Vec<Span>) {
        let stack = self.stacks.entry((pid, tid)).or_default();

        if event.is_enter {
            stack.push(event.function_id, event.timestamp);
            return;
        }

        let Some(frame) = stack.pop() else {
            self.record(Anomaly {
                pid,
                tid,
                function_id: event.function_id,
                timestamp: event.timestamp,
                kind: AnomalyKind::UnmatchedLeave,
            });
            return;
        };

        let duration = event.timestamp.micros_since(frame.enter);
        if duration < 0 {
            self.record(Anomaly {
                pid,
                tid,
                function_id: frame.function_id,
                timestamp: event.timestamp,
                kind: AnomalyKind::NegativeDuration { duration },
            });
        }

        spans.push(Span {
            pid,
            tid,
            function_id: frame.function_id,
            start: frame.enter,
            phase: SpanPhase::Complete { duration },
        });
    }

    /// Close the session: every open frame becomes an unterminated span
    ///
    /// Threads are visited in `(pid, tid)` order, frames outermost first.
    pub fn finish(&mut self, spans: &mut Vec<Span>) {
        let mut keys: Vec<(Pid, Tid)> = self.stacks.keys().copied().collect();
        keys.sort_unstable();

        let mut open = Vec::new();
        for (pid, tid) in keys {
            let Some(stack) = self.stacks.get_mut(&(pid, tid)) else { continue };
            for frame in stack.drain() {
                open.push(Anomaly {
                    pid,
                    tid,
                    function_id: frame.function_id,
                    timestamp: frame.enter,
                    kind: AnomalyKind::BeginOnly,
                });
                spans.push(Span {
                    pid,
                    tid,
                    function_id: frame.function_id,
                    start: frame.enter,
                    phase: SpanPhase::Unterminated,
                });
            }
        }

        for anomaly in open {
            self.record(anomaly);
        }
    }

    fn record(&mut self, anomaly: Anomaly) {
        warn!("{anomaly}");
        self.anomalies.push(anomaly);
    }

    #[must_use]
    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    #[must_use]
    pub fn thread_names(&self) -> &ThreadNameRegistry {
        &self.thread_names
    }

    #[must_use]
    pub fn stack_depth(&self, pid: Pid, tid: Tid) -> usize {
        self.stacks.get(&(pid, tid)).map_or(0, ThreadStack::depth)
    }

    /// Threads that have sent at least one event
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.stacks.len()
    }
}
