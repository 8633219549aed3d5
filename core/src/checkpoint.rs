//! Stack of regions the verifier has accepted.
//!
//! Element 0 is a sentinel anchored at the origin so `top()` is always
//! defined and the first real checkpoint starts at `(0,0)`. Every pushed
//! checkpoint must start where the current top ends; the stack therefore
//! tiles `[origin, top.end)` with no gaps or overlaps.

use std::collections::HashMap;

use crate::buffer::TrackerId;
use crate::error::CheckpointError;
use crate::position::Position;
use crate::position::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub const SENTINEL: CheckpointId = CheckpointId(0);
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopState {
    Live,
    /// Removed from the stack; the matching `#pop` is not yet queued.
    PoppedPending,
    /// The verifier has been told to drop it, or is gone.
    PoppedConfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub range: Range,
    pub tracker: Option<TrackerId>,
    pub state: PopState,
}

#[derive(Debug)]
pub struct CheckpointStack {
    entries: Vec<Checkpoint>,
    retired: HashMap<CheckpointId, PopState>,
    next_id: u64,
}

impl Default for CheckpointStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStack {
    pub fn new() -> Self {
        Self {
            entries: vec![Checkpoint {
                id: CheckpointId::SENTINEL,
                range: Range::point(Position::ORIGIN),
                tracker: None,
                state: PopState::Live,
            }],
            retired: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn push(
        &mut self,
        range: Range,
        tracker: Option<TrackerId>,
    ) -> Result<CheckpointId, CheckpointError> {
        let expected = self.top().range.end;
        if range.start != expected {
            return Err(CheckpointError::NonAdjacent {
                expected,
                found: range.start,
            });
        }
        if range.end <= range.start {
            return Err(CheckpointError::EmptyRange { at: range.start });
        }
        let id = CheckpointId(self.next_id);
        self.next_id += 1;
        self.entries.push(Checkpoint {
            id,
            range,
            tracker,
            state: PopState::Live,
        });
        Ok(id)
    }

    /// Pops down to and including `id`, top first. Returns nothing when `id`
    /// is not live on the stack, so repeated rollbacks are harmless.
    pub fn rollback_to(&mut self, id: CheckpointId) -> Vec<Checkpoint> {
        if id == CheckpointId::SENTINEL {
            return Vec::new();
        }
        let Some(index) = self.entries.iter().position(|c| c.id == id) else {
            return Vec::new();
        };
        self.retire_from(index, PopState::PoppedPending)
    }

    pub fn confirm_popped(&mut self, id: CheckpointId) {
        if let Some(state) = self.retired.get_mut(&id)
            && *state == PopState::PoppedPending
        {
            *state = PopState::PoppedConfirmed;
        }
    }

    /// Drops everything above the sentinel. The verifier that held these
    /// contexts is gone, so they are confirmed immediately.
    pub fn clear(&mut self) -> Vec<Checkpoint> {
        self.retire_from(1, PopState::PoppedConfirmed)
    }

    pub fn top(&self) -> &Checkpoint {
        // The sentinel is never removed.
        &self.entries[self.entries.len() - 1]
    }

    pub fn get(&self, id: CheckpointId) -> Option<&Checkpoint> {
        self.entries.iter().find(|c| c.id == id)
    }

    /// `None` for ids this stack never issued.
    pub fn pop_state(&self, id: CheckpointId) -> Option<PopState> {
        if let Some(checkpoint) = self.get(id) {
            return Some(checkpoint.state);
        }
        self.retired.get(&id).copied()
    }

    pub fn find_by_tracker(&self, tracker: TrackerId) -> Option<&Checkpoint> {
        self.entries.iter().find(|c| c.tracker == Some(tracker))
    }

    /// Accepted checkpoints, sentinel excluded.
    pub fn depth(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Top to bottom, sentinel excluded.
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.entries[1..].iter().rev()
    }

    pub fn verified_range(&self) -> Range {
        Range {
            start: Position::ORIGIN,
            end: self.top().range.end,
        }
    }

    fn retire_from(&mut self, index: usize, state: PopState) -> Vec<Checkpoint> {
        let index = index.max(1);
        if index >= self.entries.len() {
            return Vec::new();
        }
        let mut popped: Vec<Checkpoint> = self.entries.drain(index..).rev().collect();
        for checkpoint in &mut popped {
            checkpoint.state = state;
            self.retired.insert(checkpoint.id, state);
        }
        popped
    }
}
