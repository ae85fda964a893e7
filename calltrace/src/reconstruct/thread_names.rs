use std::collections::BTreeMap;

use crate::domain::{Pid, Tid};

/// Latest name reported for each thread
#[derive(Debug, Clone, Default)]
pub struct ThreadNameRegistry {
    names: BTreeMap<(Pid, Tid), String>,
}

impl ThreadNameRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a name; a later name for the same thread replaces the earlier one
    pub fn set(&mut self, pid: Pid, tid: Tid, name: String) {
        self.names.insert((pid, tid), name);
    }

    #[must_use]
    pub fn get(&self, pid: Pid, tid: Tid) -> Option<&str> {
        self.names.get(&(pid, tid)).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pid, Tid, &str)> {
        self.names.iter().map(|((pid, tid), name)| (*pid, *tid, name.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
