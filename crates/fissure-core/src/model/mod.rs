//! The element tree the cracker fills in.
//!
//! ## Arena layout
//!
//! Elements live in a single arena owned by [`Model`] and are addressed by
//! stable [`ElementId`] handles. Parent links, children lists and relation
//! endpoints all store handles, so the relation graph may point in either
//! direction of tree order without ownership cycles. Handles stay valid
//! when an element is moved or detached; detached elements simply become
//! unreachable from the root.
//!
//! ## Name resolution
//!
//! [`Model::find`] follows the search order a human would use: the element
//! itself, then its subtree, then each ancestor and that ancestor's
//! remaining subtree, walking towards the root. Dotted names are matched as
//! paths starting at any container found in that order.

mod builder;
mod element;
mod relation;

pub use builder::ElementSpec;
pub use element::{Element, ElementKind, Endian, Fixup, Length, LengthUnit, Placement, Realized};
pub use relation::{OffsetBase, Relation, RelationKind};

use crate::error::{Error, Result};
use crate::stream::BitWriter;
use builder::{RelationSpec, SpecKind};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Index, IndexMut};
use tracing::trace;

/// Stable handle to an element in a [`Model`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u32);

impl ElementId {
    /// Arena index of this handle
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable handle to a relation in a [`Model`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationId(u32);

/// Arena of elements and relations rooted at a single element
#[derive(Debug, Clone)]
pub struct Model {
    elements: Vec<Element>,
    relations: Vec<Relation>,
    root: ElementId,
}

impl Index<ElementId> for Model {
    type Output = Element;

    fn index(&self, id: ElementId) -> &Element {
        &self.elements[id.index()]
    }
}

impl IndexMut<ElementId> for Model {
    fn index_mut(&mut self, id: ElementId) -> &mut Element {
        &mut self.elements[id.index()]
    }
}

impl Model {
    /// Builds a model from a spec tree and resolves its relations
    pub fn build(spec: ElementSpec) -> Result<Self> {
        let mut model = Self {
            elements: Vec::new(),
            relations: Vec::new(),
            root: ElementId(0),
        };

        let mut pending = Vec::new();
        model.root = model.insert_spec(spec, None, &mut pending)?;
        model.resolve_relations(pending)?;
        Ok(model)
    }

    /// Root element
    pub fn root(&self) -> ElementId {
        self.root
    }

    /// Number of elements in the arena, reachable or not
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if the arena holds no elements
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns the element behind a handle, if it belongs to this model
    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(id.index())
    }

    /// Returns a relation
    pub fn relation(&self, id: RelationId) -> &Relation {
        &self.relations[id.0 as usize]
    }

    /// Size relation whose `of` is `id`
    pub fn size_relation(&self, id: ElementId) -> Option<&Relation> {
        self.relation_of(id, Relation::is_size)
    }

    /// Count relation whose `of` is `id`
    pub fn count_relation(&self, id: ElementId) -> Option<&Relation> {
        self.relation_of(id, Relation::is_count)
    }

    /// Offset relation whose `of` is `id`
    pub fn offset_relation(&self, id: ElementId) -> Option<&Relation> {
        self.relation_of(id, Relation::is_offset)
    }

    fn relation_of(&self, id: ElementId, matches: fn(&Relation) -> bool) -> Option<&Relation> {
        self[id]
            .relations
            .iter()
            .map(|rel| self.relation(*rel))
            .find(|rel| rel.of == id && matches(rel))
    }

    /// Value of a relation computed from its `from` element's realized content.
    ///
    /// Sizes and offsets are returned in bits, saturating at `u64::MAX`.
    /// `None` if `from` has no integer value or the value is negative.
    pub fn relation_value(&self, relation: &Relation) -> Option<u64> {
        let raw = self[relation.from].unsigned()?;
        Some(relation.scale(raw))
    }

    /// Dotted path from the root, e.g. `Packet.Header.len`
    pub fn full_name(&self, id: ElementId) -> String {
        let mut names = vec![self[id].name.as_str()];
        let mut current = self[id].parent;
        while let Some(parent) = current {
            names.push(&self[parent].name);
            current = self[parent].parent;
        }
        names.reverse();
        names.join(".")
    }

    /// Position of `id` among its parent's children
    pub fn index_in_parent(&self, id: ElementId) -> Option<usize> {
        let parent = self[id].parent?;
        self[parent].children().iter().position(|child| *child == id)
    }

    /// Next sibling in the parent's children
    pub fn next_sibling(&self, id: ElementId) -> Option<ElementId> {
        let parent = self[id].parent?;
        let index = self.index_in_parent(id)?;
        self[parent].children().get(index + 1).copied()
    }

    /// Returns true if `id` is `ancestor` or lies in its subtree
    pub fn contains(&self, ancestor: ElementId, id: ElementId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self[node].parent;
        }
        false
    }

    /// Returns true if `id` hangs off the root through children links
    pub fn is_attached(&self, id: ElementId) -> bool {
        let mut node = id;
        while let Some(parent) = self[node].parent {
            if !self[parent].children().contains(&node) {
                return false;
            }
            node = parent;
        }
        node == self.root
    }

    /// Direct child of `parent` with the given name
    pub fn child_named(&self, parent: ElementId, name: &str) -> Option<ElementId> {
        self[parent]
            .children()
            .iter()
            .copied()
            .find(|child| self[*child].name == name)
    }

    /// Pre-order walk of `from`'s subtree through children links.
    ///
    /// Array templates are not visited; only cracked instances are.
    pub fn preorder(&self, from: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self[id].children().iter().rev());
        }
        out
    }

    /// Pre-order walk that also descends into array templates
    fn preorder_with_templates(&self, from: ElementId, skip: Option<ElementId>) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if Some(id) == skip {
                continue;
            }
            out.push(id);
            if let ElementKind::Array { template, .. } = self[id].kind {
                stack.push(template);
            }
            stack.extend(self[id].children().iter().rev());
        }
        out
    }

    fn search_order(&self, from: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut skip = None;
        let mut current = Some(from);
        while let Some(id) = current {
            out.extend(self.preorder_with_templates(id, skip));
            skip = Some(id);
            current = self[id].parent;
        }
        out
    }

    /// Resolves a plain or dotted name starting the search at `from`
    pub fn find(&self, from: ElementId, name: &str) -> Option<ElementId> {
        let parts: Vec<&str> = name.split('.').collect();
        let order = self.search_order(from);

        if parts.len() == 1 {
            return order.into_iter().find(|id| self[*id].name == name);
        }

        order
            .into_iter()
            .filter(|id| self[*id].is_container())
            .find_map(|id| self.resolve_path(id, &parts))
    }

    fn resolve_path(&self, start: ElementId, parts: &[&str]) -> Option<ElementId> {
        if self[start].name != parts[0] {
            return None;
        }
        parts[1..].iter().try_fold(start, |current, part| {
            self.child_named(current, part).or_else(|| match self[current].kind {
                ElementKind::Array { template, .. } if self[template].name == *part => {
                    Some(template)
                }
                _ => None,
            })
        })
    }

    /// Stores realized content on an element
    pub fn set_value(&mut self, id: ElementId, value: Realized) {
        self[id].value = Some(value);
    }

    /// Mutable access to an element's fixup
    pub fn fixup_mut(&mut self, id: ElementId) -> Option<&mut Fixup> {
        self[id].fixup.as_mut()
    }

    pub(crate) fn set_chosen(&mut self, choice: ElementId, alternative: Option<ElementId>) {
        if let ElementKind::Choice { chosen, .. } = &mut self[choice].kind {
            *chosen = alternative;
        }
    }

    pub(crate) fn clear_children(&mut self, id: ElementId) {
        if let Some(children) = self[id].kind.children_mut() {
            children.clear();
        }
    }

    /// Removes `id` from its parent's children, keeping the parent link
    pub(crate) fn detach(&mut self, id: ElementId) {
        if let Some(parent) = self[id].parent {
            if let Some(children) = self[parent].kind.children_mut() {
                children.retain(|child| *child != id);
            }
        }
    }

    /// Inserts `id` into `parent`'s children at `index`, renaming on a clash
    pub(crate) fn attach(&mut self, parent: ElementId, index: usize, id: ElementId) -> Result<()> {
        if !self[parent].is_container() {
            return Err(Error::invalid_model(format!(
                "'{}' is not a container",
                self.full_name(parent)
            )));
        }

        let base = self[id].name.clone();
        let mut name = base.clone();
        let mut suffix = 1;
        while self
            .child_named(parent, &name)
            .is_some_and(|existing| existing != id)
        {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        if name != base {
            trace!("Renaming '{}' to '{}' in '{}'", base, name, self[parent].name);
        }

        self[id].name = name;
        self[id].parent = Some(parent);
        if let Some(children) = self[parent].kind.children_mut() {
            let index = index.min(children.len());
            children.insert(index, id);
        }
        Ok(())
    }

    /// Moves `id` to directly after `target` in `target`'s container
    pub fn move_after(&mut self, id: ElementId, target: ElementId) -> Result<()> {
        self.relocate(id, target, true)
    }

    /// Moves `id` to directly before `target` in `target`'s container
    pub fn move_before(&mut self, id: ElementId, target: ElementId) -> Result<()> {
        self.relocate(id, target, false)
    }

    fn relocate(&mut self, id: ElementId, target: ElementId, after: bool) -> Result<()> {
        if self.contains(id, target) {
            return Err(Error::invalid_model(format!(
                "cannot place '{}' relative to its own descendant '{}'",
                self.full_name(id),
                self.full_name(target)
            )));
        }
        let destination = self[target].parent.ok_or_else(|| {
            Error::invalid_model(format!(
                "cannot place '{}' beside the root",
                self.full_name(id)
            ))
        })?;

        self.detach(id);
        let index = self
            .index_in_parent(target)
            .ok_or_else(|| Error::internal("placement target is not a child of its parent"))?;
        self.attach(destination, index + usize::from(after), id)
    }

    /// Copies the subtree at `source` into new, unattached arena slots.
    ///
    /// The copy's root is named `name` and points at `parent`, but is not
    /// added to any children list. Realized values are not copied. Relations
    /// whose `of` lies inside the subtree are duplicated with endpoints
    /// inside the subtree remapped to the copies.
    pub(crate) fn clone_subtree(
        &mut self,
        source: ElementId,
        parent: Option<ElementId>,
        name: impl Into<String>,
    ) -> ElementId {
        let order = self.preorder_with_templates(source, None);
        let mut map = HashMap::with_capacity(order.len());

        for old in &order {
            let mut copy = self[*old].clone();
            copy.value = None;
            copy.relations.clear();
            let new = ElementId(self.elements.len() as u32);
            self.elements.push(copy);
            map.insert(*old, new);
        }

        for old in &order {
            let new = map[old];
            let element = &mut self.elements[new.index()];
            element.parent = if *old == source {
                parent
            } else {
                element.parent.map(|p| map.get(&p).copied().unwrap_or(p))
            };
            match &mut element.kind {
                ElementKind::Block { children } => {
                    children.iter_mut().for_each(|c| *c = map[&*c]);
                }
                ElementKind::Choice { children, chosen } => {
                    children.iter_mut().for_each(|c| *c = map[&*c]);
                    *chosen = None;
                }
                ElementKind::Array {
                    template, children, ..
                } => {
                    *template = map[&*template];
                    children.clear();
                }
                _ => {}
            }
        }

        let mut seen = Vec::new();
        for old in &order {
            for rel in self[*old].relations.clone() {
                if seen.contains(&rel) {
                    continue;
                }
                seen.push(rel);
                let relation = self.relation(rel).clone();
                let Some(&of) = map.get(&relation.of) else {
                    continue;
                };
                let from = map.get(&relation.from).copied().unwrap_or(relation.from);
                self.push_relation(Relation {
                    kind: relation.kind,
                    of,
                    from,
                });
            }
        }

        let root = map[&source];
        self[root].name = name.into();
        root
    }

    fn push_relation(&mut self, relation: Relation) -> RelationId {
        let id = RelationId(self.relations.len() as u32);
        let (of, from) = (relation.of, relation.from);
        self.relations.push(relation);
        self[of].relations.push(id);
        if from != of {
            self[from].relations.push(id);
        }
        id
    }

    fn insert_spec(
        &mut self,
        spec: ElementSpec,
        parent: Option<ElementId>,
        pending: &mut Vec<(ElementId, RelationSpec)>,
    ) -> Result<ElementId> {
        let id = ElementId(self.elements.len() as u32);
        let kind = match &spec.kind {
            SpecKind::Number {
                bits,
                signed,
                endian,
            } => {
                if !(1..=64).contains(bits) {
                    return Err(Error::invalid_model(format!(
                        "number '{}' must be 1 to 64 bits wide, got {}",
                        spec.name, bits
                    )));
                }
                ElementKind::Number {
                    bits: *bits,
                    signed: *signed,
                    endian: *endian,
                }
            }
            SpecKind::String { null_terminated } => ElementKind::String {
                null_terminated: *null_terminated,
            },
            SpecKind::Blob => ElementKind::Blob,
            SpecKind::Block(_) => ElementKind::Block {
                children: Vec::new(),
            },
            SpecKind::Choice(_) => ElementKind::Choice {
                children: Vec::new(),
                chosen: None,
            },
            SpecKind::Array {
                min_occurs,
                max_occurs,
                ..
            } => {
                if max_occurs.is_some_and(|max| max < *min_occurs) {
                    return Err(Error::invalid_model(format!(
                        "array '{}' has max_occurs below min_occurs",
                        spec.name
                    )));
                }
                ElementKind::Array {
                    template: id,
                    min_occurs: *min_occurs,
                    max_occurs: *max_occurs,
                    children: Vec::new(),
                }
            }
        };

        if spec.token && spec.value.is_none() {
            return Err(Error::invalid_model(format!(
                "token '{}' has no value",
                spec.name
            )));
        }

        let mut element = Element::new(spec.name, kind);
        element.parent = parent;
        element.length = spec.length;
        element.token = spec.token;
        element.default_value = spec.value;
        element.transform = spec.transform;
        element.constraint = spec.constraint;
        element.analyzer = spec.analyzer;
        element.placement = spec.placement;
        element.fixup = spec.fixup;
        self.elements.push(element);

        pending.extend(spec.relations.into_iter().map(|rel| (id, rel)));

        match spec.kind {
            SpecKind::Block(children) | SpecKind::Choice(children) => {
                for child in children {
                    let name = child.name.clone();
                    if self.child_named(id, &name).is_some() {
                        return Err(Error::DuplicateName {
                            parent: self.full_name(id),
                            name,
                        });
                    }
                    let child = self.insert_spec(child, Some(id), pending)?;
                    if let Some(children) = self[id].kind.children_mut() {
                        children.push(child);
                    }
                }
            }
            SpecKind::Array { template, .. } => {
                let template = self.insert_spec(*template, Some(id), pending)?;
                if let ElementKind::Array { template: slot, .. } = &mut self[id].kind {
                    *slot = template;
                }
            }
            _ => {}
        }

        Ok(id)
    }

    fn resolve_relations(&mut self, pending: Vec<(ElementId, RelationSpec)>) -> Result<()> {
        for (from, spec) in pending {
            let of = self
                .find(from, &spec.of)
                .ok_or_else(|| Error::unresolved_reference(self.full_name(from), &spec.of))?;
            trace!(
                "Relation {} of {} from {}",
                spec.kind.label(),
                self.full_name(of),
                self.full_name(from)
            );
            self.push_relation(Relation {
                kind: spec.kind,
                of,
                from,
            });
        }
        Ok(())
    }

    /// Replaces an element's content with children built from specs.
    ///
    /// The element becomes a block; used by analyzers to restructure
    /// cracked content. Returns the new children in order.
    pub fn restructure(
        &mut self,
        id: ElementId,
        children: Vec<ElementSpec>,
    ) -> Result<Vec<ElementId>> {
        self[id].kind = ElementKind::Block {
            children: Vec::new(),
        };
        self[id].value = None;
        self[id].length = None;

        let mut pending = Vec::new();
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            if self.child_named(id, &child.name).is_some() {
                return Err(Error::DuplicateName {
                    parent: self.full_name(id),
                    name: child.name,
                });
            }
            let child = self.insert_spec(child, Some(id), &mut pending)?;
            if let Some(list) = self[id].kind.children_mut() {
                list.push(child);
            }
            out.push(child);
        }
        self.resolve_relations(pending)?;
        Ok(out)
    }

    /// Serializes the realized tree at `id` back into bytes.
    ///
    /// Leaves emit their realized content, falling back to their default
    /// value; choices emit the chosen alternative; transformed elements are
    /// re-encoded.
    pub fn generate(&self, id: ElementId) -> Result<Bytes> {
        let mut writer = BitWriter::new();
        self.write_element(id, &mut writer)?;
        Ok(writer.finish())
    }

    fn write_element(&self, id: ElementId, writer: &mut BitWriter) -> Result<()> {
        let element = &self[id];
        let Some(transform) = &element.transform else {
            return self.write_content(id, writer);
        };

        let mut inner = BitWriter::new();
        self.write_content(id, &mut inner)?;
        let encoded = transform.encode(&inner.finish())?;
        writer.write_bits(&encoded, encoded.len() as u64 * 8);
        Ok(())
    }

    fn write_content(&self, id: ElementId, writer: &mut BitWriter) -> Result<()> {
        let element = &self[id];
        match &element.kind {
            ElementKind::Block { children } | ElementKind::Array { children, .. } => {
                for child in children {
                    self.write_element(*child, writer)?;
                }
            }
            ElementKind::Choice { children, chosen } => {
                if let Some(alternative) = chosen.or_else(|| children.first().copied()) {
                    self.write_element(alternative, writer)?;
                }
            }
            _ => {
                if let Some(value) = &element.value {
                    writer.write_bits(&value.data, value.bits);
                } else if let Some(default) = &element.default_value {
                    writer.write_bits(default, default.len() as u64 * 8);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Model {
        let spec = ElementSpec::block("Packet")
            .child(
                ElementSpec::block("Header")
                    .child(ElementSpec::number("len", 8).size_of("Body.data"))
                    .child(ElementSpec::number("kind", 8)),
            )
            .child(
                ElementSpec::block("Body")
                    .child(ElementSpec::blob("data"))
                    .child(ElementSpec::blob("kind")),
            );
        Model::build(spec).unwrap()
    }

    fn named(model: &Model, path: &str) -> ElementId {
        model.find(model.root(), path).unwrap()
    }

    #[test]
    fn test_full_name_and_navigation() {
        let model = sample();
        let len = named(&model, "Packet.Header.len");
        assert_eq!(model.full_name(len), "Packet.Header.len");
        assert_eq!(model.index_in_parent(len), Some(0));
        let kind = model.next_sibling(len).unwrap();
        assert_eq!(model[kind].name(), "kind");
        assert_eq!(model.next_sibling(kind), None);
    }

    #[test]
    fn test_find_prefers_nearest() {
        let model = sample();
        let len = named(&model, "Packet.Header.len");
        let near = model.find(len, "kind").unwrap();
        assert_eq!(model.full_name(near), "Packet.Header.kind");

        let data = named(&model, "Packet.Body.data");
        let near = model.find(data, "kind").unwrap();
        assert_eq!(model.full_name(near), "Packet.Body.kind");
        assert_eq!(model.find(data, "missing"), None);
    }

    #[test]
    fn test_relations_resolve_to_handles() {
        let model = sample();
        let data = named(&model, "Packet.Body.data");
        let len = named(&model, "Packet.Header.len");
        let rel = model.size_relation(data).unwrap();
        assert_eq!(rel.from, len);
        assert!(model.size_relation(len).is_none());
        assert_eq!(model[len].relations().len(), 1);
    }

    #[test]
    fn test_unresolved_relation_fails() {
        let spec = ElementSpec::block("M").child(ElementSpec::number("n", 8).count_of("nothing"));
        assert!(matches!(
            Model::build(spec),
            Err(Error::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_duplicate_sibling_names_rejected() {
        let spec = ElementSpec::block("M")
            .child(ElementSpec::blob("a"))
            .child(ElementSpec::blob("a"));
        assert!(matches!(Model::build(spec), Err(Error::DuplicateName { .. })));
    }

    #[test]
    fn test_move_after_renames_on_clash() {
        let mut model = sample();
        let header_kind = named(&model, "Packet.Header.kind");
        let data = named(&model, "Packet.Body.data");
        model.move_after(header_kind, data).unwrap();

        assert_eq!(model.full_name(header_kind), "Packet.Body.kind_1");
        let body = named(&model, "Packet.Body");
        let names: Vec<_> = model[body]
            .children()
            .iter()
            .map(|c| model[*c].name().to_string())
            .collect();
        assert_eq!(names, vec!["data", "kind_1", "kind"]);
        assert!(model.is_attached(header_kind));
    }

    #[test]
    fn test_move_into_own_subtree_rejected() {
        let mut model = sample();
        let header = named(&model, "Packet.Header");
        let len = named(&model, "Packet.Header.len");
        assert!(model.move_before(header, len).is_err());
    }

    #[test]
    fn test_clone_subtree_remaps_internal_relations() {
        let spec = ElementSpec::array(
            "items",
            ElementSpec::block("item")
                .child(ElementSpec::number("n", 8).size_of("body"))
                .child(ElementSpec::blob("body")),
        );
        let mut model = Model::build(spec).unwrap();
        let ElementKind::Array { template, .. } = model[model.root()].kind().clone() else {
            panic!("expected array");
        };

        let copy = model.clone_subtree(template, Some(model.root()), "item_0");
        let body = model.child_named(copy, "body").unwrap();
        let n = model.child_named(copy, "n").unwrap();
        assert_eq!(model.size_relation(body).unwrap().from, n);
        assert_ne!(body, model.child_named(template, "body").unwrap());
    }

    #[test]
    fn test_generate_concatenates_leaves() {
        let mut model = sample();
        for (path, bytes) in [
            ("Packet.Header.len", &b"\x02"[..]),
            ("Packet.Header.kind", &b"\x01"[..]),
            ("Packet.Body.data", &b"hi"[..]),
            ("Packet.Body.kind", &b"!"[..]),
        ] {
            let id = named(&model, path);
            model.set_value(id, Realized::from_bytes(Bytes::copy_from_slice(bytes)));
        }
        assert_eq!(&model.generate(model.root()).unwrap()[..], b"\x02\x01hi!");
    }
}
