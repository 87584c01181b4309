//! Observer hooks fired while cracking.
//!
//! All methods have empty default bodies, so an observer only overrides the
//! notifications it cares about.

use super::position::{Position, PositionTable};
use crate::error::Error;
use crate::model::ElementId;

/// Receives notifications from the cracker
pub trait CrackObserver {
    /// An element's position was opened; its size may still be unknown
    fn element_entered(
        &mut self,
        _element: ElementId,
        _position: &Position,
        _table: &PositionTable,
    ) {
    }

    /// An element finished cracking
    fn element_exited(
        &mut self,
        _element: ElementId,
        _position: &Position,
        _table: &PositionTable,
    ) {
    }

    /// An element failed and was rolled back
    fn element_failed(&mut self, _element: ElementId, _bit_position: u64, _error: &Error) {}

    /// An element was relocated by its placement directive.
    ///
    /// The handle is unchanged; `old_name` and `new_name` are the
    /// fully-qualified names before and after the move.
    fn element_placed(
        &mut self,
        _element: ElementId,
        _old_name: &str,
        _new_name: &str,
        _old_container: Option<ElementId>,
    ) {
    }
}

/// Observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl CrackObserver for NullObserver {}

/// One recorded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrackEvent {
    /// See [`CrackObserver::element_entered`]
    Entered {
        /// Element handle
        element: ElementId,
        /// Position at entry
        position: Position,
    },
    /// See [`CrackObserver::element_exited`]
    Exited {
        /// Element handle
        element: ElementId,
        /// Position at exit
        position: Position,
    },
    /// See [`CrackObserver::element_failed`]
    Failed {
        /// Element handle
        element: ElementId,
        /// Absolute bit position where the attempt began
        bit_position: u64,
        /// Rendered error
        error: String,
    },
    /// See [`CrackObserver::element_placed`]
    Placed {
        /// Element handle
        element: ElementId,
        /// Fully-qualified name before the move
        old_name: String,
        /// Fully-qualified name after the move
        new_name: String,
        /// Container the element was moved out of
        old_container: Option<ElementId>,
    },
}

/// Observer that records every notification in order
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Vec<CrackEvent>,
}

impl EventLog {
    /// Creates an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events in order
    pub fn events(&self) -> &[CrackEvent] {
        &self.events
    }

    /// Number of failed notifications
    pub fn failures(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, CrackEvent::Failed { .. }))
            .count()
    }
}

impl CrackObserver for EventLog {
    fn element_entered(&mut self, element: ElementId, position: &Position, _table: &PositionTable) {
        self.events.push(CrackEvent::Entered {
            element,
            position: *position,
        });
    }

    fn element_exited(&mut self, element: ElementId, position: &Position, _table: &PositionTable) {
        self.events.push(CrackEvent::Exited {
            element,
            position: *position,
        });
    }

    fn element_failed(&mut self, element: ElementId, bit_position: u64, error: &Error) {
        self.events.push(CrackEvent::Failed {
            element,
            bit_position,
            error: error.to_string(),
        });
    }

    fn element_placed(
        &mut self,
        element: ElementId,
        old_name: &str,
        new_name: &str,
        old_container: Option<ElementId>,
    ) {
        self.events.push(CrackEvent::Placed {
            element,
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            old_container,
        });
    }
}
