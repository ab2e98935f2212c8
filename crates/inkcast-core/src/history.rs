//! Local linear undo/redo over full-canvas snapshots.
//!
//! History belongs to one participant. Moving the cursor only changes what
//! that participant sees; nothing is retracted from the shared session.

use crate::canvas::SnapshotData;

/// Maximum number of history entries to keep.
pub const MAX_HISTORY: usize = 100;

/// Snapshot list plus a cursor into it.
#[derive(Debug, Clone)]
pub struct History {
    entries: Vec<SnapshotData>,
    step: usize,
}

impl History {
    /// Start a history whose only entry is `initial`.
    pub fn new(initial: SnapshotData) -> Self {
        Self {
            entries: vec![initial],
            step: 0,
        }
    }

    /// Record the canvas after a completed action.
    ///
    /// Anything after the cursor is discarded first.
    pub fn commit(&mut self, snapshot: SnapshotData) {
        self.entries.truncate(self.step + 1);
        self.entries.push(snapshot);

        if self.entries.len() > MAX_HISTORY {
            let excess = self.entries.len() - MAX_HISTORY;
            self.entries.drain(..excess);
        }
        self.step = self.entries.len() - 1;
    }

    /// Step back. Returns the snapshot to render, or `None` at the start.
    pub fn undo(&mut self) -> Option<&SnapshotData> {
        if self.step == 0 {
            return None;
        }
        self.step -= 1;
        self.entries.get(self.step)
    }

    /// Step forward. Returns the snapshot to render, or `None` at the end.
    pub fn redo(&mut self) -> Option<&SnapshotData> {
        if self.step + 1 >= self.entries.len() {
            return None;
        }
        self.step += 1;
        self.entries.get(self.step)
    }

    /// Drop everything and start again from `initial`.
    pub fn reset(&mut self, initial: SnapshotData) {
        self.entries.clear();
        self.entries.push(initial);
        self.step = 0;
    }

    pub fn can_undo(&self) -> bool {
        self.step > 0
    }

    pub fn can_redo(&self) -> bool {
        self.step + 1 < self.entries.len()
    }

    /// Current cursor position.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot at the cursor.
    pub fn current(&self) -> &SnapshotData {
        &self.entries[self.step]
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(SnapshotData::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(tag: u8) -> SnapshotData {
        SnapshotData::new(vec![tag])
    }

    #[test]
    fn test_undo_redo_three_actions() {
        let mut history = History::default();
        history.commit(snap(1));
        history.commit(snap(2));
        history.commit(snap(3));

        assert_eq!(history.undo(), Some(&snap(2)));
        assert_eq!(history.redo(), Some(&snap(3)));
    }

    #[test]
    fn test_commit_after_undo_drops_redo() {
        let mut history = History::default();
        history.commit(snap(1));
        history.commit(snap(2));
        history.commit(snap(3));

        history.undo();
        assert!(history.can_redo());

        history.commit(snap(4));
        assert!(!history.can_redo());
        assert_eq!(history.redo(), None);
        assert_eq!(history.current(), &snap(4));
        assert_eq!(history.undo(), Some(&snap(2)));
    }

    #[test]
    fn test_bounds_are_noops() {
        let mut history = History::new(snap(0));
        assert_eq!(history.undo(), None);
        assert_eq!(history.step(), 0);

        history.commit(snap(1));
        assert_eq!(history.redo(), None);
        assert_eq!(history.step(), 1);

        assert_eq!(history.undo(), Some(&snap(0)));
        assert_eq!(history.undo(), None);
        assert_eq!(history.step(), 0);
    }

    #[test]
    fn test_history_is_capped() {
        let mut history = History::default();
        for i in 0..(MAX_HISTORY + 20) {
            history.commit(snap((i % 256) as u8));
        }
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.step(), MAX_HISTORY - 1);
    }

    #[test]
    fn test_reset() {
        let mut history = History::default();
        history.commit(snap(1));
        history.reset(snap(9));
        assert_eq!(history.len(), 1);
        assert!(!history.can_undo());
        assert_eq!(history.current(), &snap(9));
    }
}
