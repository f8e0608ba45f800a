//! Bounded undo/redo history.

use crate::value::Value;
use std::collections::VecDeque;

/// Direction of a history move, as seen by plugins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryOperation {
    Undo,
    Redo,
    Reset,
}

/// Full states with a cursor. The cursor always points at an entry while
/// the history is non-empty; entries past it are the redo tail.
#[derive(Debug)]
pub(crate) struct History {
    entries: VecDeque<Value>,
    cursor: usize,
    limit: usize,
}

impl History {
    /// A history keeping at most `limit` entries. 0 disables it.
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(64)),
            cursor: 0,
            limit,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    /// Clear and start over from `state`.
    pub(crate) fn seed(&mut self, state: Value) {
        self.clear();
        self.push(state);
    }

    /// Record a new commit, dropping the redo tail and the oldest entries
    /// beyond the limit.
    pub(crate) fn push(&mut self, state: Value) {
        if !self.is_enabled() {
            return;
        }
        if !self.entries.is_empty() {
            self.entries.truncate(self.cursor + 1);
        }
        self.entries.push_back(state);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len() - 1;
    }

    pub(crate) fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub(crate) fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    /// Index and state `steps` away from the cursor, without moving.
    pub(crate) fn target(&self, operation: HistoryOperation, steps: usize) -> Option<(usize, Value)> {
        if !self.is_enabled() || self.entries.is_empty() || steps == 0 {
            return None;
        }
        let index = match operation {
            HistoryOperation::Undo => self.cursor.checked_sub(steps)?,
            HistoryOperation::Redo => {
                let index = self.cursor.checked_add(steps)?;
                if index >= self.entries.len() {
                    return None;
                }
                index
            }
            HistoryOperation::Reset => return None,
        };
        self.entries.get(index).map(|state| (index, state.clone()))
    }

    pub(crate) fn move_to(&mut self, index: usize) {
        if index < self.entries.len() {
            self.cursor = index;
        }
    }
}
