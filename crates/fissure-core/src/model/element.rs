//! Element nodes and their attached descriptors.

use super::{ElementId, RelationId};
use crate::analyzer::Analyzer;
use crate::transform::Transform;
use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::Arc;

/// Unit of an explicit length or size relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthUnit {
    /// Lengths count bits
    Bits,
    /// Lengths count bytes
    #[default]
    Bytes,
}

impl LengthUnit {
    /// Converts a count in this unit to bits
    pub fn to_bits(self, value: u64) -> u64 {
        match self {
            LengthUnit::Bits => value,
            LengthUnit::Bytes => value.saturating_mul(8),
        }
    }
}

/// An explicit element length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Length {
    /// Length in `unit`s
    pub value: u64,
    /// Unit of `value`
    pub unit: LengthUnit,
}

impl Length {
    /// Length in bits
    pub fn bits(&self) -> u64 {
        self.unit.to_bits(self.value)
    }
}

/// Byte order of a number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// Most significant byte first
    #[default]
    Big,
    /// Least significant byte first
    Little,
}

/// Post-crack relocation directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Move the element right after the named element
    After(String),
    /// Move the element right before the named element
    Before(String),
}

impl Placement {
    /// Name of the anchor element
    pub fn target(&self) -> &str {
        match self {
            Placement::After(name) | Placement::Before(name) => name,
        }
    }
}

/// A fixup holds name references to the elements it is computed from.
///
/// Only the references matter to the cracker: placement rewrites them when
/// a referenced element moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixup {
    kind: String,
    references: IndexMap<String, String>,
}

impl Fixup {
    /// Creates a fixup of the given kind with no references
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            references: IndexMap::new(),
        }
    }

    /// Adds a reference parameter
    pub fn reference(mut self, param: impl Into<String>, target: impl Into<String>) -> Self {
        self.references.insert(param.into(), target.into());
        self
    }

    /// Fixup kind, e.g. `crc32`
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Parameter name to referenced element name
    pub fn references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.references.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Points a reference parameter at a new element name
    pub fn update_ref(&mut self, param: &str, target: impl Into<String>) -> bool {
        match self.references.get_mut(param) {
            Some(slot) => {
                *slot = target.into();
                true
            }
            None => false,
        }
    }
}

/// Raw content realized by cracking, left aligned, most-significant bit first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realized {
    /// Packed bits
    pub data: Bytes,
    /// Number of meaningful bits in `data`
    pub bits: u64,
}

impl Realized {
    /// Wraps whole bytes
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let bits = data.len() as u64 * 8;
        Self { data, bits }
    }
}

/// Kind-specific shape of an element
#[derive(Debug, Clone)]
pub enum ElementKind {
    /// Fixed-width integer
    Number {
        /// Width in bits (1..=64)
        bits: u32,
        /// Two's complement when true
        signed: bool,
        /// Byte order; only meaningful for whole-byte widths
        endian: Endian,
    },
    /// Text
    String {
        /// Content runs up to and including a `0x00` byte
        null_terminated: bool,
    },
    /// Opaque bytes
    Blob,
    /// Ordered container
    Block {
        /// Owned children
        children: Vec<ElementId>,
    },
    /// Selector: exactly one alternative is cracked
    Choice {
        /// Alternatives in trial order
        children: Vec<ElementId>,
        /// Alternative picked by the last crack
        chosen: Option<ElementId>,
    },
    /// Repeated template
    Array {
        /// Element cloned for each instance; parented to the array but not a child
        template: ElementId,
        /// Minimum instance count
        min_occurs: u64,
        /// Maximum instance count, unbounded when `None`
        max_occurs: Option<u64>,
        /// Cracked instances
        children: Vec<ElementId>,
    },
}

impl ElementKind {
    /// Returns true for Block, Choice and Array
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ElementKind::Block { .. } | ElementKind::Choice { .. } | ElementKind::Array { .. }
        )
    }

    /// Owned children, empty for leaves
    pub fn children(&self) -> &[ElementId] {
        match self {
            ElementKind::Block { children }
            | ElementKind::Choice { children, .. }
            | ElementKind::Array { children, .. } => children,
            _ => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<ElementId>> {
        match self {
            ElementKind::Block { children }
            | ElementKind::Choice { children, .. }
            | ElementKind::Array { children, .. } => Some(children),
            _ => None,
        }
    }

    /// Short lowercase kind name for logs
    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::Number { .. } => "number",
            ElementKind::String { .. } => "string",
            ElementKind::Blob => "blob",
            ElementKind::Block { .. } => "block",
            ElementKind::Choice { .. } => "choice",
            ElementKind::Array { .. } => "array",
        }
    }
}

/// A node of the data model
#[derive(Debug, Clone)]
pub struct Element {
    pub(crate) name: String,
    pub(crate) kind: ElementKind,
    pub(crate) parent: Option<ElementId>,
    pub(crate) length: Option<Length>,
    pub(crate) token: bool,
    pub(crate) default_value: Option<Bytes>,
    pub(crate) transform: Option<Arc<dyn Transform>>,
    pub(crate) constraint: Option<String>,
    pub(crate) analyzer: Option<Arc<dyn Analyzer>>,
    pub(crate) placement: Option<Placement>,
    pub(crate) fixup: Option<Fixup>,
    pub(crate) relations: Vec<RelationId>,
    pub(crate) value: Option<Realized>,
}

impl Element {
    pub(crate) fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: None,
            length: None,
            token: false,
            default_value: None,
            transform: None,
            constraint: None,
            analyzer: None,
            placement: None,
            fixup: None,
            relations: Vec::new(),
            value: None,
        }
    }

    /// Element name, unique among its siblings
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind and kind-specific state
    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    /// Owning container, `None` for the root
    pub fn parent(&self) -> Option<ElementId> {
        self.parent
    }

    /// Owned children, empty for leaves
    pub fn children(&self) -> &[ElementId] {
        self.kind.children()
    }

    /// Returns true for container kinds
    pub fn is_container(&self) -> bool {
        self.kind.is_container()
    }

    /// Explicit length in bits.
    ///
    /// Numbers always have one. A token without an explicit length is as
    /// long as its literal value.
    pub fn length_bits(&self) -> Option<u64> {
        if let Some(length) = self.length {
            return Some(length.bits());
        }
        match &self.kind {
            ElementKind::Number { bits, .. } => Some(u64::from(*bits)),
            _ if self.token => self.default_value.as_ref().map(|v| v.len() as u64 * 8),
            _ => None,
        }
    }

    /// Returns true if cracking content alone reveals the element's size
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::String {
                null_terminated: true
            }
        )
    }

    /// Returns true for literal-token anchors
    pub fn is_token(&self) -> bool {
        self.token
    }

    /// Literal default value (the token bytes for anchors)
    pub fn default_value(&self) -> Option<&Bytes> {
        self.default_value.as_ref()
    }

    /// Attached content transform
    pub fn transform(&self) -> Option<&Arc<dyn Transform>> {
        self.transform.as_ref()
    }

    /// Attached constraint expression
    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// Attached analyzer
    pub fn analyzer(&self) -> Option<&Arc<dyn Analyzer>> {
        self.analyzer.as_ref()
    }

    /// Attached placement directive
    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    /// Attached fixup
    pub fn fixup(&self) -> Option<&Fixup> {
        self.fixup.as_ref()
    }

    /// Relations this element takes part in, as either endpoint
    pub fn relations(&self) -> &[RelationId] {
        &self.relations
    }

    /// Content realized by the last crack, for leaves
    pub fn value(&self) -> Option<&Realized> {
        self.value.as_ref()
    }

    /// Interprets the realized content as an integer.
    ///
    /// Numbers decode according to width, sign and byte order; strings parse
    /// as trimmed ASCII decimal. Everything else yields `None`.
    pub fn integer(&self) -> Option<i64> {
        let value = self.value.as_ref()?;
        match self.kind {
            ElementKind::Number {
                bits,
                signed,
                endian,
            } => {
                let raw = raw_number(value, bits, endian);
                if signed && bits < 64 && raw & (1 << (bits - 1)) != 0 {
                    Some((raw | (u64::MAX << bits)) as i64)
                } else {
                    Some(raw as i64)
                }
            }
            ElementKind::String { .. } => self.text()?.parse().ok(),
            _ => None,
        }
    }

    /// Interprets the realized content as a non-negative integer.
    ///
    /// Unlike [`Element::integer`], unsigned 64-bit numbers keep their full
    /// range. Negative values yield `None`.
    pub fn unsigned(&self) -> Option<u64> {
        let value = self.value.as_ref()?;
        match self.kind {
            ElementKind::Number {
                bits,
                signed: false,
                endian,
            } => Some(raw_number(value, bits, endian)),
            ElementKind::Number { .. } => u64::try_from(self.integer()?).ok(),
            ElementKind::String { .. } => self.text()?.parse().ok(),
            _ => None,
        }
    }

    fn text(&self) -> Option<&str> {
        let value = self.value.as_ref()?;
        let mut text = &value.data[..];
        if let ElementKind::String {
            null_terminated: true,
        } = self.kind
        {
            text = text.strip_suffix(&[0u8]).unwrap_or(text);
        }
        Some(std::str::from_utf8(text).ok()?.trim())
    }
}

/// Unsigned value of a number's bits
fn raw_number(value: &Realized, bits: u32, endian: Endian) -> u64 {
    let mut bytes = value.data.to_vec();
    if endian == Endian::Little && bits % 8 == 0 {
        bytes.reverse();
    }

    let mut raw: u64 = 0;
    for byte in &bytes {
        raw = (raw << 8) | u64::from(*byte);
    }
    // Left aligned: drop the padding bits of the final byte
    let padding = bytes.len() as u32 * 8 - bits;
    raw >> padding
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(bits: u32, signed: bool, endian: Endian, data: &[u8]) -> Element {
        let mut element = Element::new(
            "n",
            ElementKind::Number {
                bits,
                signed,
                endian,
            },
        );
        element.value = Some(Realized {
            data: Bytes::copy_from_slice(data),
            bits: u64::from(bits),
        });
        element
    }

    #[test]
    fn test_number_decoding() {
        assert_eq!(number(16, false, Endian::Big, &[0x01, 0x02]).integer(), Some(0x0102));
        assert_eq!(number(16, false, Endian::Little, &[0x01, 0x02]).integer(), Some(0x0201));
        assert_eq!(number(8, true, Endian::Big, &[0xFF]).integer(), Some(-1));
        assert_eq!(number(4, false, Endian::Big, &[0b1010_0000]).integer(), Some(10));
        assert_eq!(number(4, true, Endian::Big, &[0b1110_0000]).integer(), Some(-2));
    }

    #[test]
    fn test_unsigned_keeps_full_range() {
        let max = number(64, false, Endian::Big, &[0xFF; 8]);
        assert_eq!(max.unsigned(), Some(u64::MAX));
        assert_eq!(max.integer(), Some(-1));

        let high = number(64, false, Endian::Little, &[0, 0, 0, 0, 0, 0, 0, 0x80]);
        assert_eq!(high.unsigned(), Some(1 << 63));

        assert_eq!(number(8, true, Endian::Big, &[0xFF]).unsigned(), None);
        assert_eq!(number(8, true, Endian::Big, &[0x7F]).unsigned(), Some(127));
    }

    #[test]
    fn test_string_integer() {
        let mut element = Element::new(
            "s",
            ElementKind::String {
                null_terminated: true,
            },
        );
        element.value = Some(Realized::from_bytes(&b" 42\0"[..]));
        assert_eq!(element.integer(), Some(42));
    }

    #[test]
    fn test_token_length_from_value() {
        let mut element = Element::new("crlf", ElementKind::Blob);
        element.token = true;
        element.default_value = Some(Bytes::from_static(b"\r\n"));
        assert_eq!(element.length_bits(), Some(16));
        assert!(!element.is_deterministic());
    }

    #[test]
    fn test_fixup_update_ref() {
        let mut fixup = Fixup::new("crc32").reference("ref", "Body");
        assert!(fixup.update_ref("ref", "Model.Trailer.Body"));
        assert!(!fixup.update_ref("missing", "x"));
        assert_eq!(
            fixup.references().collect::<Vec<_>>(),
            vec![("ref", "Model.Trailer.Body")]
        );
    }
}
