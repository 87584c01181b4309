//! The cracking driver.
//!
//! ## Node protocol
//!
//! Every element goes through the same steps:
//!
//! 1. Seek to a resolved offset relation, growing the stream if needed
//! 2. Determine the size with the [`scan`] module
//! 3. Open a [`Position`] and queue an unresolved size relation
//! 4. Consume content, through the transform when one is attached
//! 5. Check the constraint and queue the analyzer
//! 6. Backfill pending size relations fed by this element
//! 7. Close the position
//!
//! A failure anywhere rolls the element back: its positions and pending
//! relations are dropped, the stream is rewound to where the attempt began,
//! and the error propagates to the parent.
//!
//! ## Streams
//!
//! Sized containers and transformed elements are cracked against nested
//! streams. Each nested stream records the absolute bit offset it starts
//! at, so positions always refer to the root stream's origin.

mod consume;
mod events;
mod placement;
mod position;
mod relations;
pub mod scan;

pub use events::{CrackEvent, CrackObserver, EventLog, NullObserver};
pub use position::{Position, PositionTable};
pub use scan::SizeOutcome;

use crate::constraint::{ConstraintEvaluator, SimpleEvaluator};
use crate::error::{Error, Result};
use crate::model::{ElementId, Model, RelationId};
use crate::stream::BitStream;
use indexmap::IndexSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Limits applied while cracking
#[derive(Debug, Clone)]
pub struct CrackerConfig {
    /// Deepest element nesting before cracking fails
    pub max_depth: usize,
    /// Most instances a single array may hold
    pub max_array_items: u64,
}

impl Default for CrackerConfig {
    fn default() -> Self {
        Self {
            max_depth: 256,
            max_array_items: 65_536,
        }
    }
}

impl CrackerConfig {
    /// Creates a config with default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum nesting depth
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the maximum number of array instances
    pub fn max_array_items(mut self, items: u64) -> Self {
        self.max_array_items = items;
        self
    }
}

/// Cracks bit streams into models.
///
/// Positions from the last top-level crack stay readable through
/// [`Cracker::position`] and [`Cracker::size_of`] until the next one starts.
#[derive(Debug, Clone)]
pub struct Cracker {
    config: CrackerConfig,
    evaluator: Arc<dyn ConstraintEvaluator>,
    positions: PositionTable,
}

impl Default for Cracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Cracker {
    /// Creates a cracker with default limits and the comparison evaluator
    pub fn new() -> Self {
        Self::with_config(CrackerConfig::default())
    }

    /// Creates a cracker with custom limits
    pub fn with_config(config: CrackerConfig) -> Self {
        Self {
            config,
            evaluator: Arc::new(SimpleEvaluator),
            positions: PositionTable::new(),
        }
    }

    /// Replaces the constraint evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConstraintEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Active limits
    pub fn config(&self) -> &CrackerConfig {
        &self.config
    }

    /// Cracks `stream` into the subtree at `element`
    pub fn crack(
        &mut self,
        model: &mut Model,
        element: ElementId,
        stream: &mut BitStream,
    ) -> Result<()> {
        self.crack_with(model, element, stream, &mut NullObserver)
    }

    /// Cracks `stream` into the subtree at `element`, reporting to `observer`.
    ///
    /// Placement and analyzers run after the subtree has been cracked.
    pub fn crack_with<O: CrackObserver>(
        &mut self,
        model: &mut Model,
        element: ElementId,
        stream: &mut BitStream,
        observer: &mut O,
    ) -> Result<()> {
        debug!("Cracking '{}' from {} bits", model.full_name(element), stream.len_bits());

        let mut session = Session {
            model,
            observer,
            config: &self.config,
            evaluator: self.evaluator.as_ref(),
            positions: PositionTable::new(),
            pending: Vec::new(),
            analyzers: IndexSet::new(),
            bases: Vec::new(),
            depth: 0,
            scan_depth: 0,
        };

        let result = session.crack_root(element, stream);
        self.positions = session.positions;
        result
    }

    /// Size of an element from the last crack, `None` if unknown or not entered
    pub fn size_of(&self, element: ElementId) -> Option<u64> {
        self.positions.size_of(element)
    }

    /// Position of an element from the last crack
    pub fn position(&self, element: ElementId) -> Option<&Position> {
        self.positions.get(element)
    }

    /// All positions from the last crack
    pub fn positions(&self) -> &PositionTable {
        &self.positions
    }
}

/// State of one top-level crack
pub(crate) struct Session<'a> {
    pub(crate) model: &'a mut Model,
    pub(crate) observer: &'a mut dyn CrackObserver,
    pub(crate) config: &'a CrackerConfig,
    pub(crate) evaluator: &'a dyn ConstraintEvaluator,
    pub(crate) positions: PositionTable,
    /// Size relations waiting for their `from` element, oldest first
    pub(crate) pending: Vec<RelationId>,
    pub(crate) analyzers: IndexSet<ElementId>,
    /// Absolute start offsets of the nested streams being cracked
    pub(crate) bases: Vec<u64>,
    pub(crate) depth: usize,
    /// Nesting of the size scanner, bounded like `depth`
    pub(crate) scan_depth: usize,
}

impl Session<'_> {
    fn crack_root(&mut self, root: ElementId, stream: &mut BitStream) -> Result<()> {
        self.crack_element(root, stream)?;
        self.handle_placement(root)?;
        self.run_analyzers()
    }

    /// Absolute offset of the current stream's origin
    pub(crate) fn base(&self) -> u64 {
        self.bases.last().copied().unwrap_or(0)
    }

    /// Absolute bit position of `stream`'s read head
    pub(crate) fn absolute(&self, stream: &BitStream) -> u64 {
        self.base() + stream.tell_bits()
    }

    pub(crate) fn failure(
        &self,
        id: ElementId,
        position: u64,
        message: impl Into<String>,
    ) -> Error {
        Error::cracking_failure(self.model.full_name(id), position, message)
    }

    /// Cracks `nested` as a stream starting at absolute offset `base`
    pub(crate) fn with_stream<T>(
        &mut self,
        base: u64,
        nested: &mut BitStream,
        f: impl FnOnce(&mut Self, &mut BitStream) -> Result<T>,
    ) -> Result<T> {
        self.bases.push(base);
        let result = f(self, nested);
        self.bases.pop();
        result
    }

    /// Runs the node protocol on one element, rolling back on failure
    pub(crate) fn crack_element(&mut self, id: ElementId, stream: &mut BitStream) -> Result<()> {
        let start = stream.tell_bits();
        let begin = self.absolute(stream);

        self.depth += 1;
        let result = if self.depth > self.config.max_depth {
            Err(self.failure(
                id,
                begin,
                format!("nesting exceeds {} levels", self.config.max_depth),
            ))
        } else {
            self.handle_node(id, stream)
        };
        self.depth -= 1;

        let Err(mut err) = result else {
            return Ok(());
        };

        self.rollback(id);
        if stream.seek_bits(start).is_err() {
            trace!("Unable to rewind stream to bit {}", start);
        }

        if !err.mark_logged() {
            debug!("{} failed to crack: {}", self.model.full_name(id), err);
        } else {
            trace!("{} failed to crack", self.model.full_name(id));
        }
        self.observer.element_failed(id, begin, &err);
        Err(err)
    }

    fn handle_node(&mut self, id: ElementId, stream: &mut BitStream) -> Result<()> {
        trace!("------------------------------------");
        trace!("{} at bit {}", self.model.full_name(id), self.absolute(stream));

        self.handle_offset_relation(id, stream)?;

        let size = match self.get_size(id, stream)? {
            SizeOutcome::Known(bits) => Some(bits),
            SizeOutcome::Deterministic => None,
            SizeOutcome::Unknowable => {
                return Err(self.failure(
                    id,
                    self.absolute(stream),
                    "unable to determine size",
                ));
            }
        };

        let position = Position::new(self.absolute(stream), size);
        self.positions.insert(id, position);

        if size.is_none() {
            self.queue_size_relation(id);
        }

        self.observer.element_entered(id, &position, &self.positions);
        debug!(
            "Crack: {} Size: {}, {}/{}",
            self.model.full_name(id),
            size.map_or_else(|| "<null>".to_string(), |s| s.to_string()),
            stream.tell_bits(),
            stream.len_bits()
        );

        match self.model[id].transform().cloned() {
            Some(transform) => self.crack_transformed(id, size, transform.as_ref(), stream)?,
            None => self.consume(id, size, stream)?,
        }

        if let Some(expression) = self.model[id].constraint() {
            trace!("Running constraint [{}]", expression);
            if !self.evaluator.evaluate(expression, &self.model[id])? {
                return Err(self.failure(
                    id,
                    self.absolute(stream),
                    format!("constraint '{}' failed", expression),
                ));
            }
        }

        if self.model[id].analyzer().is_some() {
            self.analyzers.insert(id);
        }

        self.resolve_pending(id, stream)?;

        let end = self.absolute(stream);
        let position = match self.positions.get_mut(id) {
            Some(position) => {
                position.end = Some(end);
                *position
            }
            None => return Err(Error::internal("position vanished while cracking")),
        };
        self.observer.element_exited(id, &position, &self.positions);
        Ok(())
    }

    /// Drops everything recorded for `id` and its descendants
    fn rollback(&mut self, id: ElementId) {
        let model = &*self.model;
        self.positions.retain(|el| !model.contains(id, el));
        self.pending
            .retain(|rel| !model.contains(id, model.relation(*rel).of));
        self.analyzers.retain(|el| !model.contains(id, *el));
    }

    fn run_analyzers(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.analyzers) {
            let Some(analyzer) = self.model[id].analyzer().cloned() else {
                continue;
            };
            debug!("Running analyzer '{}' on {}", analyzer.name(), self.model.full_name(id));
            analyzer.analyze(self.model, id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
