//! Post-crack restructuring of element content.
//!
//! Analyzers run once the whole tree is cracked and placed. Each one may
//! replace an element's opaque content with a finer-grained subtree.

use crate::error::{Error, Result};
use crate::model::{ElementId, ElementSpec, Model, Realized};
use bytes::Bytes;
use std::fmt::Debug;
use tracing::debug;

/// Rewrites a cracked element in place
pub trait Analyzer: Debug + Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Restructures `element`, which has been cracked and placed
    fn analyze(&self, model: &mut Model, element: ElementId) -> Result<()>;
}

/// Splits a leaf's content into blobs, each ending at a delimiter byte.
///
/// The final piece holds whatever trails the last delimiter. Generating the
/// restructured element reproduces the original bytes.
#[derive(Debug, Clone, Copy)]
pub struct DelimitedAnalyzer {
    delimiter: u8,
}

impl DelimitedAnalyzer {
    /// Creates an analyzer splitting on `delimiter`
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Analyzer for DelimitedAnalyzer {
    fn name(&self) -> &str {
        "delimited"
    }

    fn analyze(&self, model: &mut Model, element: ElementId) -> Result<()> {
        if model[element].is_container() {
            return Err(Error::analyzer(
                self.name(),
                model.full_name(element),
                "only leaf elements can be split",
            ));
        }
        let Some(value) = model[element].value().cloned() else {
            return Err(Error::analyzer(
                self.name(),
                model.full_name(element),
                "element has no cracked content",
            ));
        };
        if value.bits % 8 != 0 {
            return Err(Error::analyzer(
                self.name(),
                model.full_name(element),
                "content is not byte aligned",
            ));
        }

        let pieces: Vec<Bytes> = value
            .data
            .split_inclusive(|b| *b == self.delimiter)
            .map(|piece| value.data.slice_ref(piece))
            .collect();

        let specs = (0..pieces.len()).map(|i| ElementSpec::blob(format!("part_{}", i)));
        let children = model.restructure(element, specs.collect())?;
        for (child, piece) in children.into_iter().zip(pieces) {
            model.set_value(child, Realized::from_bytes(piece));
        }

        debug!(
            "{} split '{}' into {} parts",
            self.name(),
            model.full_name(element),
            model[element].children().len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn leaf(data: &'static [u8]) -> Model {
        let mut model = Model::build(ElementSpec::blob("body")).unwrap();
        let root = model.root();
        model.set_value(root, Realized::from_bytes(Bytes::from_static(data)));
        model
    }

    #[test]
    fn test_splits_on_delimiter() {
        let mut model = leaf(b"a=1&b=2&c");
        let root = model.root();
        DelimitedAnalyzer::new(b'&').analyze(&mut model, root).unwrap();

        let parts: Vec<_> = model[root]
            .children()
            .iter()
            .map(|c| model[*c].value().unwrap().data.clone())
            .collect();
        assert_eq!(
            parts,
            vec![
                Bytes::from_static(b"a=1&"),
                Bytes::from_static(b"b=2&"),
                Bytes::from_static(b"c"),
            ]
        );
        assert_eq!(&model.generate(root).unwrap()[..], b"a=1&b=2&c");
    }

    #[test]
    fn test_rejects_uncracked_element() {
        let mut model = Model::build(ElementSpec::blob("body")).unwrap();
        let root = model.root();
        let err = DelimitedAnalyzer::new(b'&')
            .analyze(&mut model, root)
            .unwrap_err();
        assert!(matches!(err, Error::Analyzer { .. }));
    }
}
