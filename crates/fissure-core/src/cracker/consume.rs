//! Per-kind content consumption.

use super::Session;
use crate::error::{Error, Result};
use crate::model::{ElementId, ElementKind, Realized};
use crate::stream::BitStream;
use crate::transform::Transform;
use bytes::Bytes;
use tracing::{debug, trace};

/// Bytes requested per round while looking for a terminator
const TERMINATOR_CHUNK: u64 = 256;

impl Session<'_> {
    /// Consumes `id`'s content from `stream`
    pub(crate) fn consume(
        &mut self,
        id: ElementId,
        size: Option<u64>,
        stream: &mut BitStream,
    ) -> Result<()> {
        match *self.model[id].kind() {
            ElementKind::Number { bits, .. } => self.read_leaf(id, u64::from(bits), stream),
            ElementKind::String { null_terminated } => match size {
                Some(bits) => self.read_leaf(id, bits, stream),
                None if null_terminated => self.read_terminated(id, stream),
                None => Err(self.failure(id, self.absolute(stream), "unsized string")),
            },
            ElementKind::Blob => match size {
                Some(bits) => self.read_leaf(id, bits, stream),
                None => Err(self.failure(id, self.absolute(stream), "unsized blob")),
            },
            ElementKind::Block { .. } => self.in_bounds(id, size, stream, Self::crack_children),
            ElementKind::Choice { .. } => self.in_bounds(id, size, stream, Self::crack_choice),
            ElementKind::Array { .. } => self.in_bounds(id, size, stream, Self::crack_array),
        }
    }

    /// Runs `f` against the next `size` bits as a nested stream, or against
    /// `stream` directly when the size is unknown
    fn in_bounds(
        &mut self,
        id: ElementId,
        size: Option<u64>,
        stream: &mut BitStream,
        f: fn(&mut Self, ElementId, &mut BitStream) -> Result<()>,
    ) -> Result<()> {
        let Some(bits) = size else {
            return f(self, id, stream);
        };

        let base = self.absolute(stream);
        let data = self.read_sized(id, bits, stream)?;
        let mut nested = BitStream::from_bits(data, bits);
        self.with_stream(base, &mut nested, |session, nested| f(session, id, nested))
    }

    /// Reads exactly `bits` bits, growing the stream if needed
    pub(crate) fn read_sized(
        &mut self,
        id: ElementId,
        bits: u64,
        stream: &mut BitStream,
    ) -> Result<Bytes> {
        let Some(needed) = stream.tell_bits().checked_add(bits) else {
            return Err(Error::insufficient_data(
                self.model.full_name(id),
                self.absolute(stream),
                u64::MAX,
                stream.len_bits(),
            ));
        };
        stream.ensure_bits(needed);
        stream.read_bits(bits).ok_or_else(|| {
            Error::insufficient_data(
                self.model.full_name(id),
                self.absolute(stream),
                needed,
                stream.len_bits(),
            )
        })
    }

    fn read_leaf(&mut self, id: ElementId, bits: u64, stream: &mut BitStream) -> Result<()> {
        let data = self.read_sized(id, bits, stream)?;
        self.realize(id, Realized { data, bits }, stream)
    }

    fn read_terminated(&mut self, id: ElementId, stream: &mut BitStream) -> Result<()> {
        let start = stream.tell_bits();
        loop {
            if let Some(at) = stream.index_of(&[0], start) {
                return self.read_leaf(id, at + 8 - start, stream);
            }
            if stream.want_bytes(TERMINATOR_CHUNK) == 0 {
                return Err(Error::insufficient_data(
                    self.model.full_name(id),
                    self.absolute(stream),
                    stream.len_bits() + 8,
                    stream.len_bits(),
                ));
            }
        }
    }

    /// Stores a leaf's content, checking token literals
    fn realize(&mut self, id: ElementId, value: Realized, stream: &BitStream) -> Result<()> {
        let element = &self.model[id];
        if element.is_token() {
            let expected = element.default_value().map(|v| &v[..]).unwrap_or_default();
            if value.data[..] != *expected {
                return Err(self.failure(
                    id,
                    self.absolute(stream),
                    format!("token mismatch: expected {:02x?}", expected),
                ));
            }
        }

        trace!("{} = {:02x?}", self.model.full_name(id), &value.data[..]);
        self.model.set_value(id, value);
        Ok(())
    }

    /// Reads the encoded region, decodes it and cracks the content
    pub(crate) fn crack_transformed(
        &mut self,
        id: ElementId,
        size: Option<u64>,
        transform: &dyn Transform,
        stream: &mut BitStream,
    ) -> Result<()> {
        let Some(bits) = size else {
            return Err(self.failure(
                id,
                self.absolute(stream),
                format!("transform '{}' needs a known size", transform.name()),
            ));
        };

        let base = self.absolute(stream);
        let encoded = self.read_sized(id, bits, stream)?;
        let decoded = transform.decode(&encoded)?;
        let decoded_bits = decoded.len() as u64 * 8;
        debug!(
            "{} decoded {} bits into {} with '{}'",
            self.model.full_name(id),
            bits,
            decoded_bits,
            transform.name()
        );

        let mut nested = BitStream::from_bits(decoded, decoded_bits);
        self.with_stream(base, &mut nested, |session, nested| {
            session.consume(id, Some(decoded_bits), nested)
        })
    }

    fn crack_children(&mut self, id: ElementId, stream: &mut BitStream) -> Result<()> {
        for child in self.model[id].children().to_vec() {
            self.crack_element(child, stream)?;
        }
        Ok(())
    }

    fn crack_choice(&mut self, id: ElementId, stream: &mut BitStream) -> Result<()> {
        self.model.set_chosen(id, None);

        for alternative in self.model[id].children().to_vec() {
            match self.crack_element(alternative, stream) {
                Ok(()) => {
                    debug!(
                        "{} chose {}",
                        self.model.full_name(id),
                        self.model[alternative].name()
                    );
                    self.model.set_chosen(id, Some(alternative));
                    return Ok(());
                }
                Err(err) if err.is_recoverable() => {
                    trace!(
                        "{} rejected {}",
                        self.model.full_name(id),
                        self.model[alternative].name()
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(self.failure(id, self.absolute(stream), "no alternative matched"))
    }

    fn crack_array(&mut self, id: ElementId, stream: &mut BitStream) -> Result<()> {
        let ElementKind::Array {
            template,
            min_occurs,
            max_occurs,
            ..
        } = *self.model[id].kind()
        else {
            return Err(Error::internal("array consumption on a non-array"));
        };
        self.model.clear_children(id);

        let count = match self.model.count_relation(id) {
            Some(relation) if self.positions.is_finished(relation.from) => {
                Some(self.model.relation_value(relation).ok_or_else(|| {
                    self.failure(id, self.absolute(stream), "count relation has no usable value")
                })?)
            }
            _ if max_occurs == Some(min_occurs) => Some(min_occurs),
            _ => None,
        };

        if let Some(count) = count {
            if count > self.config.max_array_items {
                return Err(self.failure(
                    id,
                    self.absolute(stream),
                    format!(
                        "count {} exceeds the limit of {} items",
                        count, self.config.max_array_items
                    ),
                ));
            }
            for index in 0..count {
                let instance = self.new_instance(id, template, index)?;
                if let Err(err) = self.crack_element(instance, stream) {
                    self.model.detach(instance);
                    return Err(err);
                }
            }
            trace!("{} cracked {} instances", self.model.full_name(id), count);
            return Ok(());
        }

        let limit = max_occurs
            .unwrap_or(u64::MAX)
            .min(self.config.max_array_items);
        let mut cracked = 0;

        while cracked < limit {
            if stream.remaining_bits() == 0 && stream.want_bytes(1) == 0 {
                break;
            }

            let before = stream.tell_bits();
            let instance = self.new_instance(id, template, cracked)?;
            match self.crack_element(instance, stream) {
                Ok(()) if stream.tell_bits() == before => {
                    trace!("{} instance consumed nothing", self.model.full_name(instance));
                    self.rollback(instance);
                    self.model.detach(instance);
                    break;
                }
                Ok(()) => cracked += 1,
                Err(err) if err.is_recoverable() => {
                    self.model.detach(instance);
                    break;
                }
                Err(err) => {
                    self.model.detach(instance);
                    return Err(err);
                }
            }
        }

        if cracked < min_occurs {
            return Err(self.failure(
                id,
                self.absolute(stream),
                format!("expected at least {} instances, found {}", min_occurs, cracked),
            ));
        }

        trace!("{} cracked {} instances", self.model.full_name(id), cracked);
        Ok(())
    }

    fn new_instance(
        &mut self,
        array: ElementId,
        template: ElementId,
        index: u64,
    ) -> Result<ElementId> {
        let name = format!("{}_{}", self.model[template].name(), index);
        let instance = self.model.clone_subtree(template, Some(array), name);
        self.model.attach(array, usize::MAX, instance)?;
        Ok(instance)
    }
}
