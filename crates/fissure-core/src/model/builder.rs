//! Declarative element descriptions.
//!
//! An [`ElementSpec`] tree describes a model by name. Relations,
//! placements and fixups refer to other elements by name; relations are
//! resolved to handles when the spec is inserted into a [`Model`](super::Model).
//!
//! ```
//! use fissure_core::model::{ElementSpec, Model};
//!
//! let spec = ElementSpec::block("Packet")
//!     .child(ElementSpec::number("len", 8).size_of("payload"))
//!     .child(ElementSpec::blob("payload"));
//!
//! let model = Model::build(spec)?;
//! assert_eq!(model.len(), 3);
//! # Ok::<(), fissure_core::Error>(())
//! ```

use super::element::{Endian, Fixup, Length, LengthUnit, Placement};
use super::relation::{OffsetBase, RelationKind};
use crate::analyzer::Analyzer;
use crate::transform::Transform;
use bytes::Bytes;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) enum SpecKind {
    Number {
        bits: u32,
        signed: bool,
        endian: Endian,
    },
    String {
        null_terminated: bool,
    },
    Blob,
    Block(Vec<ElementSpec>),
    Choice(Vec<ElementSpec>),
    Array {
        template: Box<ElementSpec>,
        min_occurs: u64,
        max_occurs: Option<u64>,
    },
}

/// A relation declared on its `from` element, naming its `of` element
#[derive(Debug, Clone)]
pub(crate) struct RelationSpec {
    pub(crate) kind: RelationKind,
    pub(crate) of: String,
}

/// Builder-style description of one element and its subtree
#[derive(Debug, Clone)]
pub struct ElementSpec {
    pub(crate) name: String,
    pub(crate) kind: SpecKind,
    pub(crate) length: Option<Length>,
    pub(crate) token: bool,
    pub(crate) value: Option<Bytes>,
    pub(crate) transform: Option<Arc<dyn Transform>>,
    pub(crate) constraint: Option<String>,
    pub(crate) analyzer: Option<Arc<dyn Analyzer>>,
    pub(crate) placement: Option<Placement>,
    pub(crate) fixup: Option<Fixup>,
    pub(crate) relations: Vec<RelationSpec>,
}

impl ElementSpec {
    fn new(name: impl Into<String>, kind: SpecKind) -> Self {
        Self {
            name: name.into(),
            kind,
            length: None,
            token: false,
            value: None,
            transform: None,
            constraint: None,
            analyzer: None,
            placement: None,
            fixup: None,
            relations: Vec::new(),
        }
    }

    /// Unsigned big-endian integer of `bits` bits
    pub fn number(name: impl Into<String>, bits: u32) -> Self {
        Self::new(
            name,
            SpecKind::Number {
                bits,
                signed: false,
                endian: Endian::Big,
            },
        )
    }

    /// String without a terminator
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(
            name,
            SpecKind::String {
                null_terminated: false,
            },
        )
    }

    /// Opaque bytes
    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, SpecKind::Blob)
    }

    /// Ordered container
    pub fn block(name: impl Into<String>) -> Self {
        Self::new(name, SpecKind::Block(Vec::new()))
    }

    /// Selector over alternatives added with [`ElementSpec::child`]
    pub fn choice(name: impl Into<String>) -> Self {
        Self::new(name, SpecKind::Choice(Vec::new()))
    }

    /// Array of `template`, zero or more instances by default
    pub fn array(name: impl Into<String>, template: ElementSpec) -> Self {
        Self::new(
            name,
            SpecKind::Array {
                template: Box::new(template),
                min_occurs: 0,
                max_occurs: None,
            },
        )
    }

    /// Element name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes a number signed
    pub fn signed(mut self) -> Self {
        if let SpecKind::Number { signed, .. } = &mut self.kind {
            *signed = true;
        }
        self
    }

    /// Makes a number little-endian
    pub fn little_endian(mut self) -> Self {
        if let SpecKind::Number { endian, .. } = &mut self.kind {
            *endian = Endian::Little;
        }
        self
    }

    /// Makes a string null-terminated
    pub fn null_terminated(mut self) -> Self {
        if let SpecKind::String { null_terminated } = &mut self.kind {
            *null_terminated = true;
        }
        self
    }

    /// Sets an explicit length
    pub fn length(mut self, value: u64, unit: LengthUnit) -> Self {
        self.length = Some(Length { value, unit });
        self
    }

    /// Sets an explicit length in bytes
    pub fn length_bytes(self, value: u64) -> Self {
        self.length(value, LengthUnit::Bytes)
    }

    /// Sets an explicit length in bits
    pub fn length_bits(self, value: u64) -> Self {
        self.length(value, LengthUnit::Bits)
    }

    /// Sets the default value
    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Marks the element as a literal-token anchor with the given bytes
    pub fn token(mut self, value: impl Into<Bytes>) -> Self {
        self.token = true;
        self.value = Some(value.into());
        self
    }

    /// Attaches a content transform
    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Attaches a constraint expression
    pub fn constraint(mut self, expression: impl Into<String>) -> Self {
        self.constraint = Some(expression.into());
        self
    }

    /// Attaches an analyzer
    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Relocates the element after the named element once cracked
    pub fn place_after(mut self, target: impl Into<String>) -> Self {
        self.placement = Some(Placement::After(target.into()));
        self
    }

    /// Relocates the element before the named element once cracked
    pub fn place_before(mut self, target: impl Into<String>) -> Self {
        self.placement = Some(Placement::Before(target.into()));
        self
    }

    /// Attaches a fixup
    pub fn fixup(mut self, fixup: Fixup) -> Self {
        self.fixup = Some(fixup);
        self
    }

    /// This element holds the byte size of `of`
    pub fn size_of(self, of: impl Into<String>) -> Self {
        self.size_of_in(of, LengthUnit::Bytes)
    }

    /// This element holds the size of `of` counted in `unit`
    pub fn size_of_in(mut self, of: impl Into<String>, unit: LengthUnit) -> Self {
        self.relations.push(RelationSpec {
            kind: RelationKind::Size { unit },
            of: of.into(),
        });
        self
    }

    /// This element holds the instance count of the array `of`
    pub fn count_of(mut self, of: impl Into<String>) -> Self {
        self.relations.push(RelationSpec {
            kind: RelationKind::Count,
            of: of.into(),
        });
        self
    }

    /// This element holds the byte offset of `of`
    pub fn offset_of(mut self, of: impl Into<String>, base: OffsetBase) -> Self {
        self.relations.push(RelationSpec {
            kind: RelationKind::Offset { base },
            of: of.into(),
        });
        self
    }

    /// Appends a child to a block or an alternative to a choice
    pub fn child(mut self, child: ElementSpec) -> Self {
        if let SpecKind::Block(children) | SpecKind::Choice(children) = &mut self.kind {
            children.push(child);
        }
        self
    }

    /// Appends several children
    pub fn children(self, children: impl IntoIterator<Item = ElementSpec>) -> Self {
        children.into_iter().fold(self, ElementSpec::child)
    }

    /// Sets array bounds; `max == Some(min)` fixes the repeat count
    pub fn occurs(mut self, min: u64, max: Option<u64>) -> Self {
        if let SpecKind::Array {
            min_occurs,
            max_occurs,
            ..
        } = &mut self.kind
        {
            *min_occurs = min;
            *max_occurs = max;
        }
        self
    }
}
