//! Static size inference.
//!
//! Before an element consumes anything the driver asks how many bits it
//! spans. The answer comes from, in order:
//!
//! 1. its explicit length
//! 2. a size relation whose `from` element has already been cracked
//! 3. the element being self-delimiting (deterministic)
//! 4. the sum of its children, for containers
//! 5. the template size times the instance count, for arrays
//! 6. a lookahead over the elements that follow it
//!
//! The lookahead walks following siblings, then ascends through the
//! ancestors, adding up every sized element it passes. It stops at the
//! first unsized element, at a resolvable offset relation, or at an ancestor
//! with a known size. Literal tokens seen on the way become search anchors:
//! the gap between the current read position and the first anchor found in
//! the stream is the size.

use super::Session;
use crate::error::Result;
use crate::model::{ElementId, ElementKind};
use crate::stream::BitStream;
use tracing::{debug, trace};

/// Bytes requested per round when a size depends on the rest of the input
const FILL_CHUNK: u64 = 4096;

/// Outcome of size determination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOutcome {
    /// Size in bits
    Known(u64),
    /// Unknown in advance, discovered by cracking the content
    Deterministic,
    /// No strategy can determine the size
    Unknowable,
}

impl SizeOutcome {
    /// Size in bits if known
    pub fn bits(self) -> Option<u64> {
        match self {
            SizeOutcome::Known(bits) => Some(bits),
            _ => None,
        }
    }
}

/// Result of scanning one element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scan {
    Sized,
    Deterministic,
    Unsized,
}

/// A literal token met while scanning
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mark {
    pub(crate) element: ElementId,
    /// Bits between the scan origin and the token
    pub(crate) position: u64,
    pub(crate) optional: bool,
}

impl Session<'_> {
    /// Determines the size of `id` at the current read position
    pub(crate) fn get_size(
        &mut self,
        id: ElementId,
        stream: &mut BitStream,
    ) -> Result<SizeOutcome> {
        trace!("getSize: -----> {}", self.model.full_name(id));

        let mut pos = 0;
        let mut tokens = Vec::new();
        match self.scan(id, &mut pos, &mut tokens, None, stream)? {
            Scan::Sized => {
                trace!("getSize: <----- Size: {}", pos);
                return Ok(SizeOutcome::Known(pos));
            }
            Scan::Deterministic => {
                trace!("getSize: <----- Deterministic: ???");
                return Ok(SizeOutcome::Deterministic);
            }
            Scan::Unsized => {}
        }

        // Children sized before the unsized one are part of this element,
        // so following elements are measured from its end
        let mut pos = 0;
        let mut tokens = Vec::new();
        let mut end = None;
        let ret = self.lookahead(id, &mut pos, &mut tokens, &mut end, stream)?;

        // An offset relation pins where the following content starts
        if let Some(end) = end {
            let size = end.position.saturating_sub(pos);
            debug!("getSize: <----- Placement: {}", size);
            return Ok(SizeOutcome::Known(size));
        }

        for token in &tokens {
            match self.find_token(token, stream) {
                Some(gap) => {
                    debug!(
                        "getSize: <----- {} Token: {}",
                        if token.optional { "Optional" } else { "Required" },
                        gap
                    );
                    return Ok(SizeOutcome::Known(gap));
                }
                None if !token.optional => {
                    debug!("getSize: <----- Missing Required Token: ???");
                    return Ok(SizeOutcome::Unknowable);
                }
                None => {}
            }
        }

        let is_container = self.model[id].is_container();

        if !tokens.is_empty() {
            let outcome = remaining_minus(stream, pos);
            debug!("getSize: <----- Missing Optional Token: {:?}", outcome);
            return Ok(outcome);
        }

        if ret == Scan::Sized && (pos != 0 || !is_container) {
            let outcome = remaining_minus(stream, pos);
            debug!("getSize: <----- Last Unsized: {:?}", outcome);
            return Ok(outcome);
        }

        if is_container {
            debug!("getSize: <----- Container, children decide");
            Ok(SizeOutcome::Deterministic)
        } else {
            debug!("getSize: <----- Not Last Unsized: ???");
            Ok(SizeOutcome::Unknowable)
        }
    }

    /// Scans `id` and its subtree, adding sized bits to `pos`.
    ///
    /// When `end` is given, an element with a resolvable offset relation
    /// records where it lands there and ends the scan. Nesting deeper than
    /// the configured depth fails.
    pub(crate) fn scan(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<Mark>,
        end: Option<&mut Option<Mark>>,
        stream: &mut BitStream,
    ) -> Result<Scan> {
        self.scan_depth += 1;
        let result = if self.scan_depth > self.config.max_depth {
            Err(self.failure(
                id,
                self.absolute(stream),
                format!("nesting exceeds {} levels", self.config.max_depth),
            ))
        } else {
            self.scan_node(id, pos, tokens, end, stream)
        };
        self.scan_depth -= 1;
        result
    }

    fn scan_node(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<Mark>,
        mut end: Option<&mut Option<Mark>>,
        stream: &mut BitStream,
    ) -> Result<Scan> {
        let element = &self.model[id];
        let name = self.model.full_name(id);

        if element.is_token() {
            tokens.push(Mark {
                element: id,
                position: *pos,
                optional: false,
            });
            trace!("scan: {} -> Pos: {}, Saving Token", name, pos);
        }

        if let Some(end) = end.as_deref_mut() {
            if let Some(offset) = self.relative_offset(id, stream, *pos)? {
                *end = Some(Mark {
                    element: id,
                    position: offset,
                    optional: false,
                });
                trace!("scan: {} -> Pos: {}, Offset relation: {}", name, pos, offset);
                return Ok(Scan::Sized);
            }
        }

        let element = &self.model[id];
        if let Some(length) = element.length_bits() {
            *pos = pos.saturating_add(length);
            trace!("scan: {} -> Pos: {}, Length: {}", name, pos, length);
            return Ok(Scan::Sized);
        }

        if let Some(relation) = self.model.size_relation(id) {
            if !self.positions.is_finished(relation.from) {
                trace!("scan: {} -> Pos: {}, Size relation: ???", name, pos);
                return Ok(Scan::Deterministic);
            }
            let size = self.model.relation_value(relation).ok_or_else(|| {
                self.failure(id, self.absolute(stream), "size relation has no usable value")
            })?;
            *pos = pos.saturating_add(size);
            trace!("scan: {} -> Pos: {}, Size relation: {}", name, pos, size);
            return Ok(Scan::Sized);
        }

        if element.is_deterministic() {
            trace!("scan: {} -> Pos: {}, Deterministic", name, pos);
            return Ok(Scan::Deterministic);
        }

        if !element.is_container() {
            trace!("scan: {} -> Offset: {}, Unsized element", name, pos);
            return Ok(Scan::Unsized);
        }

        if element.transform().is_some() {
            trace!("scan: {} -> Offset: {}, Unsized transformer", name, pos);
            return Ok(Scan::Unsized);
        }

        match element.kind() {
            ElementKind::Choice { .. } => {
                trace!("scan: {} -> Offset: {}, Unsized choice", name, pos);
                Ok(Scan::Unsized)
            }
            ElementKind::Array { .. } => self.scan_array(id, pos, tokens, stream),
            _ => {
                trace!("scan: {}", name);
                for child in self.model[id].children().to_vec() {
                    // Content after an offset jump is not contiguous with its siblings
                    if end.is_none() && self.model.offset_relation(child).is_some() {
                        trace!("scan: {} -> Offset relation inside container", name);
                        return Ok(Scan::Deterministic);
                    }
                    let ret = self.scan(child, pos, tokens, end.as_deref_mut(), stream)?;
                    if ret != Scan::Sized {
                        return Ok(ret);
                    }
                    if end.as_ref().is_some_and(|end| end.is_some()) {
                        return Ok(Scan::Sized);
                    }
                }
                Ok(Scan::Sized)
            }
        }
    }

    /// Sizes an array from its template.
    ///
    /// Tokens inside the template are optional when the array may be empty.
    pub(crate) fn scan_array(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<Mark>,
        stream: &mut BitStream,
    ) -> Result<Scan> {
        let name = self.model.full_name(id);
        trace!("scanArray: {}", name);

        let ElementKind::Array {
            template,
            min_occurs,
            max_occurs,
            ..
        } = *self.model[id].kind()
        else {
            return Ok(Scan::Unsized);
        };

        let first_token = tokens.len();
        let mut array_pos = 0;
        let ret = self.scan(template, &mut array_pos, tokens, None, stream)?;

        for token in &mut tokens[first_token..] {
            token.optional = min_occurs == 0;
            token.position = token.position.saturating_add(*pos);
        }

        if ret != Scan::Sized {
            trace!("scanArray: {} -> {:?}", name, ret);
            return Ok(ret);
        }

        if let Some(relation) = self.model.count_relation(id) {
            if self.positions.is_finished(relation.from) {
                let count = self.model.relation_value(relation).ok_or_else(|| {
                    self.failure(id, self.absolute(stream), "count relation has no usable value")
                })?;
                let size = array_pos.saturating_mul(count);
                *pos = pos.saturating_add(size);
                trace!("scanArray: {} -> Count Relation: {}, Size: {}", name, count, size);
                return Ok(Scan::Sized);
            }
        }

        if max_occurs == Some(min_occurs) {
            let size = array_pos.saturating_mul(min_occurs);
            *pos = pos.saturating_add(size);
            trace!("scanArray: {} -> Occurs: {}, Size: {}", name, min_occurs, size);
            return Ok(Scan::Sized);
        }

        for token in tokens[first_token..].to_vec() {
            if token.optional && self.find_token(&token, stream).is_none() {
                trace!("scanArray: {} -> Missing Token, min_occurs==0", name);
                return Ok(Scan::Sized);
            }
        }

        trace!("scanArray: {} -> Count Unknown", name);
        Ok(Scan::Unsized)
    }

    /// Scans the elements after `id` in document order
    pub(crate) fn lookahead(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<Mark>,
        end: &mut Option<Mark>,
        stream: &mut BitStream,
    ) -> Result<Scan> {
        trace!("lookahead: {}", self.model.full_name(id));

        let is_container = self.model[id].is_container();
        let mut prev = id;

        loop {
            if let Some(next) = self.model.next_sibling(prev) {
                let ret = self.scan(next, pos, tokens, Some(&mut *end), stream)?;
                if ret != Scan::Sized || end.is_some() {
                    return Ok(ret);
                }
                prev = next;
                continue;
            }

            let Some(parent) = self.model[prev].parent() else {
                break;
            };

            if self.positions.size_of(parent).is_some() {
                trace!("lookahead: parent {} bound by size", self.model.full_name(parent));
                break;
            }

            // The next array instance could start right after this one
            if !is_container && matches!(self.model[parent].kind(), ElementKind::Array { .. }) {
                let mut array_pos = *pos;
                let ret = self.scan_array(parent, &mut array_pos, tokens, stream)?;
                if ret != Scan::Sized {
                    return Ok(ret);
                }
            }

            prev = parent;
        }

        Ok(Scan::Sized)
    }

    /// Searches for a token, growing the stream until it shows up.
    ///
    /// Returns the bits between the token's expected earliest position and
    /// where it was found.
    pub(crate) fn find_token(&self, mark: &Mark, stream: &mut BitStream) -> Option<u64> {
        let needle = self.model[mark.element].default_value()?.clone();
        let step = (needle.len() as u64).max(1);

        loop {
            let start = stream.tell_bits();
            let from = start.saturating_add(mark.position);
            if let Some(at) = stream.index_of(&needle, from) {
                return Some(at - from);
            }
            if stream.want_bytes(step) == 0 {
                return None;
            }
        }
    }
}

/// Everything after the read position except `following` bits
fn remaining_minus(stream: &mut BitStream, following: u64) -> SizeOutcome {
    while stream.want_bytes(FILL_CHUNK) > 0 {}
    match stream.remaining_bits().checked_sub(following) {
        Some(bits) => SizeOutcome::Known(bits),
        None => SizeOutcome::Unknowable,
    }
}
