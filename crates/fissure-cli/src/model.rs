//! TOML model descriptions.
//!
//! The top-level table describes the root element. Containers list their
//! children as `[[children]]` tables and arrays give their `template`:
//!
//! ```toml
//! name = "Packet"
//! kind = "block"
//!
//! [[children]]
//! name = "len"
//! kind = "number"
//! bits = 8
//! relations = [{ kind = "size", of = "payload" }]
//!
//! [[children]]
//! name = "payload"
//! kind = "blob"
//! ```

use anyhow::{bail, Context, Result};
use fissure_core::model::{ElementSpec, Fixup, LengthUnit, Model, OffsetBase};
use fissure_core::{DelimitedAnalyzer, Hex, Xor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KindDef {
    Number,
    String,
    Blob,
    Block,
    Choice,
    Array,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitDef {
    Bits,
    #[default]
    Bytes,
}

impl From<UnitDef> for LengthUnit {
    fn from(unit: UnitDef) -> Self {
        match unit {
            UnitDef::Bits => LengthUnit::Bits,
            UnitDef::Bytes => LengthUnit::Bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndianDef {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum RelationDef {
    Size {
        of: String,
        #[serde(default)]
        unit: UnitDef,
    },
    Count {
        of: String,
    },
    Offset {
        of: String,
        /// Measure from the end of the element holding the offset
        #[serde(default)]
        relative: bool,
        /// Measure from the start of this element instead
        relative_to: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum TransformDef {
    Hex,
    Xor { key: u8 },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum AnalyzerDef {
    Delimited { delimiter: String },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PlacementDef {
    pub after: Option<String>,
    pub before: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FixupDef {
    pub kind: String,
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

/// One element of a model description
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ElementDef {
    pub name: String,
    pub kind: KindDef,
    pub length: Option<u64>,
    #[serde(default)]
    pub unit: UnitDef,
    pub bits: Option<u32>,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub endian: EndianDef,
    #[serde(default)]
    pub null_terminated: bool,
    #[serde(default)]
    pub token: bool,
    pub value: Option<String>,
    pub constraint: Option<String>,
    pub transform: Option<TransformDef>,
    pub analyzer: Option<AnalyzerDef>,
    pub placement: Option<PlacementDef>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    pub min_occurs: Option<u64>,
    pub max_occurs: Option<u64>,
    pub template: Option<Box<ElementDef>>,
    pub fixup: Option<FixupDef>,
    #[serde(default)]
    pub children: Vec<ElementDef>,
}

impl ElementDef {
    /// Parses a description from TOML text
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse model description")
    }

    /// Reads and parses a description file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file: {}", path.display()))?;
        let def = Self::parse(&text)
            .with_context(|| format!("Invalid model file: {}", path.display()))?;
        // Catch structural mistakes once instead of on every input
        def.build()?;
        Ok(def)
    }

    /// Builds a fresh model
    pub fn build(&self) -> Result<Model> {
        let spec = self.to_spec()?;
        Model::build(spec).with_context(|| format!("Failed to build model '{}'", self.name))
    }

    fn to_spec(&self) -> Result<ElementSpec> {
        let mut spec = match self.kind {
            KindDef::Number => {
                let Some(bits) = self.bits else {
                    bail!("number '{}' needs 'bits'", self.name);
                };
                let mut spec = ElementSpec::number(&self.name, bits);
                if self.signed {
                    spec = spec.signed();
                }
                if self.endian == EndianDef::Little {
                    spec = spec.little_endian();
                }
                spec
            }
            KindDef::String if self.null_terminated => {
                ElementSpec::string(&self.name).null_terminated()
            }
            KindDef::String => ElementSpec::string(&self.name),
            KindDef::Blob => ElementSpec::blob(&self.name),
            KindDef::Block => ElementSpec::block(&self.name),
            KindDef::Choice => ElementSpec::choice(&self.name),
            KindDef::Array => {
                let Some(template) = &self.template else {
                    bail!("array '{}' needs a 'template'", self.name);
                };
                ElementSpec::array(&self.name, template.to_spec()?)
                    .occurs(self.min_occurs.unwrap_or(0), self.max_occurs)
            }
        };

        match self.kind {
            KindDef::Block | KindDef::Choice => {
                for child in &self.children {
                    spec = spec.child(child.to_spec()?);
                }
            }
            _ if !self.children.is_empty() => {
                bail!("'{}' cannot have children", self.name);
            }
            _ => {}
        }

        if let Some(length) = self.length {
            spec = spec.length(length, self.unit.into());
        }

        if let Some(value) = &self.value {
            let bytes = value.as_bytes().to_vec();
            spec = if self.token {
                spec.token(bytes)
            } else {
                spec.value(bytes)
            };
        } else if self.token {
            bail!("token '{}' needs a 'value'", self.name);
        }

        if let Some(constraint) = &self.constraint {
            spec = spec.constraint(constraint);
        }

        spec = match &self.transform {
            Some(TransformDef::Hex) => spec.transform(Arc::new(Hex)),
            Some(TransformDef::Xor { key }) => spec.transform(Arc::new(Xor(*key))),
            None => spec,
        };

        if let Some(AnalyzerDef::Delimited { delimiter }) = &self.analyzer {
            let &[byte] = delimiter.as_bytes() else {
                bail!("delimiter of '{}' must be a single byte", self.name);
            };
            spec = spec.analyzer(Arc::new(DelimitedAnalyzer::new(byte)));
        }

        if let Some(placement) = &self.placement {
            spec = match (&placement.after, &placement.before) {
                (Some(after), None) => spec.place_after(after),
                (None, Some(before)) => spec.place_before(before),
                _ => bail!(
                    "placement of '{}' needs exactly one of 'after' or 'before'",
                    self.name
                ),
            };
        }

        for relation in &self.relations {
            spec = match relation {
                RelationDef::Size { of, unit } => spec.size_of_in(of, (*unit).into()),
                RelationDef::Count { of } => spec.count_of(of),
                RelationDef::Offset {
                    of,
                    relative,
                    relative_to,
                } => {
                    let base = match (relative_to, relative) {
                        (Some(anchor), _) => OffsetBase::RelativeTo(anchor.clone()),
                        (None, true) => OffsetBase::FromEnd,
                        (None, false) => OffsetBase::Absolute,
                    };
                    spec.offset_of(of, base)
                }
            };
        }

        if let Some(fixup) = &self.fixup {
            let fixup = fixup
                .references
                .iter()
                .fold(Fixup::new(&fixup.kind), |f, (param, target)| {
                    f.reference(param, target)
                });
            spec = spec.fixup(fixup);
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fissure_core::{BitStream, Cracker, ElementKind};
    use pretty_assertions::assert_eq;

    const LINE: &str = r#"
name = "Line"
kind = "block"

[[children]]
name = "len"
kind = "number"
bits = 8
relations = [{ kind = "size", of = "text" }]

[[children]]
name = "text"
kind = "string"

[[children]]
name = "eol"
kind = "blob"
token = true
value = "\r\n"
"#;

    #[test]
    fn test_parse_and_crack() {
        let def = ElementDef::parse(LINE).unwrap();
        assert_eq!(def.children.len(), 3);
        assert_eq!(
            def.children[0].relations,
            vec![RelationDef::Size {
                of: "text".to_string(),
                unit: UnitDef::Bytes
            }]
        );

        let mut model = def.build().unwrap();
        let root = model.root();
        let mut stream = BitStream::new(b"\x02hi\r\n");
        Cracker::new().crack(&mut model, root, &mut stream).unwrap();

        let text = model.find(root, "text").unwrap();
        assert_eq!(&model[text].value().unwrap().data[..], b"hi");
    }

    #[test]
    fn test_array_template() {
        let def = ElementDef::parse(
            r#"
name = "items"
kind = "array"
min_occurs = 2
max_occurs = 2

[template]
name = "item"
kind = "number"
bits = 16
endian = "little"
"#,
        )
        .unwrap();

        let model = def.build().unwrap();
        let root = model.root();
        assert!(matches!(
            model[root].kind(),
            ElementKind::Array {
                min_occurs: 2,
                max_occurs: Some(2),
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = ElementDef::parse("name = \"x\"\nkind = \"blob\"\nsize = 3\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_number_without_bits() {
        let def = ElementDef::parse("name = \"n\"\nkind = \"number\"\n").unwrap();
        assert!(def.build().is_err());
    }

    #[test]
    fn test_placement_needs_one_side() {
        let def = ElementDef::parse(
            "name = \"x\"\nkind = \"blob\"\nplacement = { after = \"a\", before = \"b\" }\n",
        )
        .unwrap();
        assert!(def.build().is_err());
    }

    #[test]
    fn test_transform_and_analyzer() {
        let def = ElementDef::parse(
            r#"
name = "M"
kind = "block"

[[children]]
name = "query"
kind = "blob"
length = 6
transform = { kind = "hex" }
analyzer = { kind = "delimited", delimiter = "&" }
"#,
        )
        .unwrap();

        let mut model = def.build().unwrap();
        let root = model.root();
        let mut stream = BitStream::new(b"61262");
        // Five bytes cannot hold a six byte element
        assert!(Cracker::new().crack(&mut model, root, &mut stream).is_err());

        let mut model = def.build().unwrap();
        let root = model.root();
        let mut stream = BitStream::new(b"612662");
        Cracker::new().crack(&mut model, root, &mut stream).unwrap();
        let query = model.find(root, "query").unwrap();
        assert_eq!(model[query].children().len(), 2);
    }
}
