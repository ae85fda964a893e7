use std::fmt;

use crate::domain::{FunctionId, Pid, Tid, Timestamp};

/// Non-fatal inconsistency in one thread's event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anomaly {
    pub pid: Pid,
    pub tid: Tid,
    pub function_id: FunctionId,
    pub timestamp: Timestamp,
    pub kind: AnomalyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// A leave arrived on an empty stack; the event was dropped
    UnmatchedLeave,
    /// An enter never saw its leave before the session ended
    BeginOnly,
    /// A leave carried an earlier timestamp than its enter
    NegativeDuration { duration: i64 },
    /// A record arrived with a zero delta and was dropped
    ZeroDelta,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            AnomalyKind::UnmatchedLeave => "end-only event".to_string(),
            AnomalyKind::BeginOnly => "begin-only event".to_string(),
            AnomalyKind::NegativeDuration { duration } => format!("negative duration {duration}us"),
            AnomalyKind::ZeroDelta => "record without a phase".to_string(),
        };
        write!(f, "{what}: {} {} {} at {}", self.pid, self.tid, self.function_id, self.timestamp)
    }
}
