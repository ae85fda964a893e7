use crate::domain::{FunctionId, Pid, Tid, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanPhase {
    /// Matched enter and leave; `duration` is negative if the clock stepped back
    Complete { duration: i64 },
    /// Still open when the session ended
    Unterminated,
}

/// One function invocation on one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub pid: Pid,
    pub tid: Tid,
    pub function_id: FunctionId,
    pub start: Timestamp,
    pub phase: SpanPhase,
}

impl Span {
    #[must_use]
    pub fn duration(&self) -> Option<i64> {
        match self.phase {
            SpanPhase::Complete { duration } => Some(duration),
            SpanPhase::Unterminated => None,
        }
    }

    #[must_use]
    pub fn is_unterminated(&self) -> bool {
        self.phase == SpanPhase::Unterminated
    }
}
