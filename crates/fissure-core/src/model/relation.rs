//! Relations between elements.
//!
//! A relation is a directed edge `of <- from`: a numeric property of `of`
//! (its size, repeat count or offset) is computed from the realized content
//! of `from`. Both endpoints are arena handles.

use super::element::LengthUnit;
use super::ElementId;

/// Where an offset is measured from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetBase {
    /// From the origin of the root stream
    Absolute,
    /// From the end of the `from` element
    FromEnd,
    /// From the beginning of the named element, resolved from `from`
    RelativeTo(String),
}

/// Relation kind and kind-specific parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// `from` holds the size of `of`
    Size {
        /// Unit `from`'s value is counted in
        unit: LengthUnit,
    },
    /// `from` holds the instance count of the array `of`
    Count,
    /// `from` holds the byte offset where `of` starts
    Offset {
        /// Reference point of the offset
        base: OffsetBase,
    },
}

impl RelationKind {
    /// Short lowercase kind name for logs
    pub fn label(&self) -> &'static str {
        match self {
            RelationKind::Size { .. } => "size",
            RelationKind::Count => "count",
            RelationKind::Offset { .. } => "offset",
        }
    }
}

/// A directed dependency between two elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Kind and parameters
    pub kind: RelationKind,
    /// Element whose property is computed
    pub of: ElementId,
    /// Element whose content provides the value
    pub from: ElementId,
}

impl Relation {
    /// Returns true if `element` is either endpoint
    pub fn touches(&self, element: ElementId) -> bool {
        self.of == element || self.from == element
    }

    /// Returns true for size relations
    pub fn is_size(&self) -> bool {
        matches!(self.kind, RelationKind::Size { .. })
    }

    /// Returns true for count relations
    pub fn is_count(&self) -> bool {
        matches!(self.kind, RelationKind::Count)
    }

    /// Returns true for offset relations
    pub fn is_offset(&self) -> bool {
        matches!(self.kind, RelationKind::Offset { .. })
    }

    /// Converts `from`'s raw value into this relation's quantity.
    ///
    /// Sizes and offsets come out in bits, counts unchanged.
    pub fn scale(&self, raw: u64) -> u64 {
        match &self.kind {
            RelationKind::Size { unit } => unit.to_bits(raw),
            RelationKind::Count => raw,
            RelationKind::Offset { .. } => raw.saturating_mul(8),
        }
    }
}
