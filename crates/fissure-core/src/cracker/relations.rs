//! Offset seeking and deferred size relations.

use super::Session;
use crate::error::{Error, Result};
use crate::model::{ElementId, OffsetBase, RelationKind};
use crate::stream::BitStream;
use tracing::{debug, trace};

impl Session<'_> {
    /// Bits from the read position to where `id`'s offset relation points.
    ///
    /// `None` while the relation's `from` (or its `relative_to` anchor) has
    /// not been cracked. Targets behind the read position, or closer than
    /// `min` bits, fail.
    pub(crate) fn relative_offset(
        &self,
        id: ElementId,
        stream: &BitStream,
        min: u64,
    ) -> Result<Option<u64>> {
        let Some(relation) = self.model.offset_relation(id) else {
            return Ok(None);
        };
        if !self.positions.is_finished(relation.from) {
            return Ok(None);
        }

        let here = self.absolute(stream);
        let mut target = self
            .model
            .relation_value(relation)
            .ok_or_else(|| self.failure(id, here, "offset relation has no usable value"))?;

        if let RelationKind::Offset { base } = &relation.kind {
            let origin = match base {
                OffsetBase::Absolute => 0,
                OffsetBase::FromEnd => {
                    let Some(end) = self.positions.get(relation.from).and_then(|p| p.end) else {
                        return Ok(None);
                    };
                    end
                }
                OffsetBase::RelativeTo(name) => {
                    let anchor = self.model.find(relation.from, name).ok_or_else(|| {
                        self.failure(
                            id,
                            here,
                            format!("unable to locate relative_to element '{}'", name),
                        )
                    })?;
                    let Some(position) = self.positions.get(anchor) else {
                        return Ok(None);
                    };
                    position.begin
                }
            };
            // No stream can reach past u64::MAX bits
            target = target.checked_add(origin).ok_or_else(|| {
                Error::insufficient_data(
                    self.model.full_name(id),
                    here,
                    u64::MAX,
                    stream.len_bits(),
                )
            })?;
        }

        // Into the current stream's coordinates
        let read = stream.tell_bits();
        let target = target
            .checked_sub(self.base())
            .filter(|target| *target >= read)
            .ok_or_else(|| {
                self.failure(
                    id,
                    here,
                    format!("has offset of {} bits but already read {} bits", target, here),
                )
            })?;

        let offset = target - read;
        if offset < min {
            return Err(self.failure(
                id,
                here,
                format!("has offset of {} bits but must be at least {} bits", offset, min),
            ));
        }
        Ok(Some(offset))
    }

    /// Seeks to the target of `id`'s offset relation, if resolvable
    pub(crate) fn handle_offset_relation(
        &mut self,
        id: ElementId,
        stream: &mut BitStream,
    ) -> Result<()> {
        let Some(offset) = self.relative_offset(id, stream, 0)? else {
            return Ok(());
        };

        let target = stream.tell_bits() + offset;
        if target > stream.len_bits() && !stream.ensure_bits(target) {
            return Err(Error::insufficient_data(
                self.model.full_name(id),
                self.absolute(stream),
                target,
                stream.len_bits(),
            ));
        }

        trace!("Offset relation of {} seeks {} bits ahead", self.model.full_name(id), offset);
        stream.seek_bits(target)?;
        Ok(())
    }

    /// Queues `id`'s size relation if its `from` has not been cracked yet
    pub(crate) fn queue_size_relation(&mut self, id: ElementId) {
        let Some(&rel) = self.model[id]
            .relations()
            .iter()
            .find(|rel| {
                let relation = self.model.relation(**rel);
                relation.of == id && relation.is_size()
            })
        else {
            return;
        };

        if !self.positions.is_finished(self.model.relation(rel).from) {
            trace!("Size relation of {} pending", self.model.full_name(id));
            self.pending.push(rel);
        }
    }

    /// Backfills sizes whose `from` is `finished` or lies inside it.
    ///
    /// Most recently queued relations are resolved first.
    pub(crate) fn resolve_pending(
        &mut self,
        finished: ElementId,
        stream: &BitStream,
    ) -> Result<()> {
        for i in (0..self.pending.len()).rev() {
            let relation = self.model.relation(self.pending[i]);
            if !self.model.contains(finished, relation.from) {
                continue;
            }

            let of = relation.of;
            let size = self.model.relation_value(relation).ok_or_else(|| {
                self.failure(of, self.absolute(stream), "size relation has no usable value")
            })?;

            if let Some(position) = self.positions.get_mut(of) {
                position.size = Some(size);
            }
            self.pending.remove(i);

            debug!(
                "Size relation of {} cracked. Updating size: {}",
                self.model.full_name(of),
                size
            );
            trace!("{}: dependents notified", self.model.full_name(of));
        }
        Ok(())
    }
}
