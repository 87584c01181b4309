//! Post-crack relocation and fixup reference repair.

use super::Session;
use crate::error::Result;
use crate::model::{ElementId, Placement};
use tracing::debug;

impl Session<'_> {
    /// Moves every element with a placement directive beside its target.
    ///
    /// Elements are handled in pre-order. Fixups that referenced a moved
    /// element by name are pointed at its new fully-qualified name.
    pub(crate) fn handle_placement(&mut self, root: ElementId) -> Result<()> {
        let placed: Vec<ElementId> = self
            .model
            .preorder(root)
            .into_iter()
            .filter(|id| self.model[*id].placement().is_some())
            .collect();

        for id in placed {
            let Some(placement) = self.model[id].placement().cloned() else {
                continue;
            };
            let at = self.positions.get(id).map_or(0, |p| p.begin);
            let old_name = self.model.full_name(id);
            let old_container = self.model[id].parent();

            for rel in self.model[id].relations() {
                if !self.model.relation(*rel).touches(id) {
                    return Err(self.failure(
                        id,
                        at,
                        "unable to resolve relations of/from to match current element",
                    ));
                }
            }

            let fixups = self.fixups_referencing(root, id, at)?;

            let target = self.model.find(id, placement.target()).ok_or_else(|| {
                self.failure(
                    id,
                    at,
                    format!("unable to resolve placement target '{}'", placement.target()),
                )
            })?;

            let moved = match &placement {
                Placement::After(_) => self.model.move_after(id, target),
                Placement::Before(_) => self.model.move_before(id, target),
            };
            if let Err(err) = moved {
                return Err(self.failure(id, at, err.to_string()));
            }

            for rel in self.model[id].relations() {
                let relation = self.model.relation(*rel);
                if !self.model.is_attached(relation.of) || !self.model.is_attached(relation.from) {
                    return Err(self.failure(
                        id,
                        at,
                        format!(
                            "{} relation no longer resolves after placement",
                            relation.kind.label()
                        ),
                    ));
                }
            }

            let new_name = self.model.full_name(id);
            for (owner, param) in fixups {
                if let Some(fixup) = self.model.fixup_mut(owner) {
                    fixup.update_ref(&param, new_name.clone());
                }
            }

            debug!("Placed {} as {}", old_name, new_name);
            self.observer
                .element_placed(id, &old_name, &new_name, old_container);
        }

        Ok(())
    }

    /// Fixup parameters anywhere under `root` that name `element`
    fn fixups_referencing(
        &self,
        root: ElementId,
        element: ElementId,
        at: u64,
    ) -> Result<Vec<(ElementId, String)>> {
        let name = self.model[element].name();
        let mut out = Vec::new();

        for owner in self.model.preorder(root) {
            let Some(fixup) = self.model[owner].fixup() else {
                continue;
            };
            for (param, target) in fixup.references() {
                if target.rsplit('.').next() != Some(name) {
                    continue;
                }
                let resolved = self.model.find(owner, target).ok_or_else(|| {
                    self.failure(
                        element,
                        at,
                        format!("unable to resolve fixup reference '{}'", target),
                    )
                })?;
                if resolved == element {
                    out.push((owner, param.to_string()));
                }
            }
        }

        Ok(out)
    }
}
