//! Bit-range bookkeeping for cracked elements.

use crate::model::ElementId;
use indexmap::IndexMap;

/// Absolute bit range of one element, measured from the root stream origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// First bit of the element
    pub begin: u64,
    /// One past the last bit, set when the element finishes
    pub end: Option<u64>,
    /// Size from an explicit length, the scanner or a resolved size relation
    pub size: Option<u64>,
}

impl Position {
    /// Opens a position at `begin`
    pub fn new(begin: u64, size: Option<u64>) -> Self {
        Self {
            begin,
            end: None,
            size,
        }
    }

    /// Returns true once the element has finished cracking
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }
}

/// Positions of every element entered during a crack, in entry order
#[derive(Debug, Clone, Default)]
pub struct PositionTable {
    entries: IndexMap<ElementId, Position>,
}

impl PositionTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of an element, if it has been entered
    pub fn get(&self, id: ElementId) -> Option<&Position> {
        self.entries.get(&id)
    }

    /// Known size of an element in bits
    pub fn size_of(&self, id: ElementId) -> Option<u64> {
        self.get(id).and_then(|pos| pos.size)
    }

    /// Returns true if the element has finished cracking
    pub fn is_finished(&self, id: ElementId) -> bool {
        self.get(id).is_some_and(Position::is_finished)
    }

    /// Number of recorded positions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Positions in entry order
    pub fn iter(&self) -> impl Iterator<Item = (ElementId, &Position)> {
        self.entries.iter().map(|(id, pos)| (*id, pos))
    }

    pub(crate) fn get_mut(&mut self, id: ElementId) -> Option<&mut Position> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, id: ElementId, position: Position) {
        self.entries.insert(id, position);
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(ElementId) -> bool) {
        self.entries.retain(|id, _| keep(*id));
    }
}
