use crate::domain::{FunctionId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub function_id: FunctionId,
    pub enter: Timestamp,
}

/// Open calls of one thread, innermost last
#[derive(Debug, Clone, Default)]
pub struct ThreadStack {
    frames: Vec<Frame>,
}

impl ThreadStack {
    pub fn push(&mut self, function_id: FunctionId, enter: Timestamp) {
        self.frames.push(Frame { function_id, enter });
    }

    /// Innermost open frame
    ///
    /// A leave always closes this frame, whatever function id it carries.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Remaining frames, outermost first
    pub fn drain(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.frames.drain(..)
    }
}
