//! Candidate enumeration: the recursive `find` over the compositor graph.
//!
//! Starting from the current path node, the search descends into admissible
//! children, re-enters fulfilled positions sideways, and ascends out of
//! fulfilled groups, collecting every segment whose final node matches the
//! incoming element name (or is a wildcard admitting it). Probe nodes made
//! along the way are scratch: segments own clones, and the scratch is
//! recycled before `find` returns.

use std::cmp::Ordering;

use xsdpath_model::{ElementValidator, QName, StateId, StateKind, StateMachine};

use crate::fulfilment::assess;
use crate::path::{Direction, DocId, PathId, PathNode, Paths};
use crate::{Invariant, PathFinder};

/// Depth guard for the recursive search; hitting it means "no candidate
/// from this branch", never an error.
pub(crate) const MAX_DEPTH: usize = 256;

/// A candidate suffix: a chain of path nodes from the (shared) branch
/// point to the node that matched the incoming element.
///
/// The start's outgoing edge is kept aside in `start_edge` and only
/// materialised when the segment is chosen; everything from `after_start`
/// on is linked and uniquely owned by this segment.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Segment {
    pub start: PathId,
    pub start_edge: Option<usize>,
    pub after_start: Option<PathId>,
    pub end: PathId,
}

impl Segment {
    fn leaf(pn: PathId) -> Segment {
        Segment {
            start: pn,
            start_edge: None,
            after_start: None,
            end: pn,
        }
    }
}

impl<'s, V: ElementValidator> PathFinder<'s, V> {
    /// Enumerate candidate segments for `qname` starting at `origin`,
    /// sorted into preference order. Empty when no traversal admits the
    /// element.
    pub(crate) fn find_candidates(
        &mut self,
        origin: PathId,
        qname: &QName,
    ) -> Result<Vec<Segment>, Invariant> {
        let machine = self.machine;
        let target_ns = self
            .element_stack
            .last()
            .and_then(|e| e.qname.namespace.clone());
        let open_doc = self
            .element_stack
            .iter()
            .rev()
            .find_map(|e| e.pn)
            .and_then(|p| self.paths.node(p).doc);
        let (origin_state, origin_doc) = {
            let node = self.paths.node(origin);
            (node.state, node.doc)
        };
        // Entry shim: sitting at (or in the character content of) the
        // element just opened, descend into its content model.
        let at_open_element = matches!(machine.node(origin_state).kind(), StateKind::Element(_))
            && origin_doc.is_some()
            && origin_doc == open_doc;

        let mut scratch = Vec::new();
        let mut segments = if at_open_element {
            match machine.node(origin_state).next().first().copied() {
                // Simple or empty content: no child can open here.
                None => Vec::new(),
                Some(content) => {
                    let child = self.probe_child(origin, 0, content, &mut scratch);
                    let subs =
                        self.search(child, qname, target_ns.as_deref(), 1, None, &mut scratch)?;
                    let mut segs = Vec::with_capacity(subs.len());
                    for sub in subs {
                        let seg = self.prepend(origin, Some(0), sub);
                        segs.push(seg);
                    }
                    segs
                }
            }
        } else {
            self.search(origin, qname, target_ns.as_deref(), 0, None, &mut scratch)?
        };
        for id in scratch {
            self.paths.recycle(id);
        }
        segments.sort_by(|a, b| compare(machine, &self.paths, a, b));
        Ok(segments)
    }

    /// Recursive exploration. `do_not_follow` is the child index the search
    /// just ascended out of, to prevent immediate re-descent.
    fn search(
        &mut self,
        pn: PathId,
        qname: &QName,
        target_ns: Option<&str>,
        depth: usize,
        do_not_follow: Option<usize>,
        scratch: &mut Vec<PathId>,
    ) -> Result<Vec<Segment>, Invariant> {
        if depth > MAX_DEPTH {
            return Ok(Vec::new());
        }
        let machine = self.machine;
        let (state_id, iteration, doc, max_occurs) = {
            let node = self.paths.node(pn);
            (node.state, node.iteration, node.doc, node.max_occurs)
        };
        let committed = doc.map_or(false, |d| self.paths.doc(d).iteration == iteration);
        let is_group = machine.node(state_id).kind().is_group();
        let mut out = Vec::new();

        // Leaf rules apply to prospective (not yet committed) matches only.
        if !committed && iteration <= max_occurs {
            match machine.node(state_id).kind() {
                StateKind::Element(decl) if decl.name == *qname => {
                    out.push(Segment::leaf(pn));
                }
                StateKind::Any(rule) if rule.accepts(qname.namespace.as_deref(), target_ns) => {
                    out.push(Segment::leaf(pn));
                }
                _ => {}
            }
        }

        let assessment = if is_group || committed {
            Some(assess(machine, &self.paths, pn, do_not_follow)?)
        } else {
            None
        };

        // Downward.
        if is_group {
            let admissible = assessment
                .as_ref()
                .expect("groups are always assessed")
                .admissible
                .clone();
            for index in admissible {
                let child_state = machine.node(state_id).next()[index];
                let child = self.probe_child(pn, index, child_state, scratch);
                let subs = self.search(child, qname, target_ns, depth + 1, None, scratch)?;
                for sub in subs {
                    let seg = self.prepend(pn, Some(index), sub);
                    out.push(seg);
                }
            }
        }

        if committed {
            let status = assessment
                .as_ref()
                .expect("committed nodes are always assessed")
                .status;
            if status.fulfilled() {
                // Sideways: a further repetition of this position.
                if iteration < max_occurs {
                    let sibling =
                        self.probe(Direction::Sibling, state_id, iteration + 1, doc, scratch);
                    let subs = self.search(sibling, qname, target_ns, depth + 1, None, scratch)?;
                    for sub in subs {
                        let seg = self.prepend(pn, None, sub);
                        out.push(seg);
                    }
                }
                // Upward, but never out of the element currently open.
                let dn = doc.expect("committed node is bound");
                if let Some(parent) = self.paths.doc(dn).parent {
                    let parent_state = self.paths.doc(parent).state;
                    if machine.node(parent_state).kind().is_group() {
                        let from_index = self.paths.doc(dn).parent_index;
                        let parent_iteration = self.paths.doc(parent).iteration;
                        let up = self.probe(
                            Direction::Parent,
                            parent_state,
                            parent_iteration,
                            Some(parent),
                            scratch,
                        );
                        let subs = self.search(
                            up,
                            qname,
                            target_ns,
                            depth + 1,
                            Some(from_index),
                            scratch,
                        )?;
                        for sub in subs {
                            let seg = self.prepend(pn, None, sub);
                            out.push(seg);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn probe(
        &mut self,
        direction: Direction,
        state: StateId,
        iteration: usize,
        doc: Option<DocId>,
        scratch: &mut Vec<PathId>,
    ) -> PathId {
        let max_occurs = self.machine.node(state).max_occurs();
        let id = self.paths.alloc(PathNode {
            state,
            direction,
            iteration,
            doc,
            saved_sequence_position: 0,
            prev: None,
            next: None,
            next_state_index: None,
            max_occurs,
        });
        scratch.push(id);
        id
    }

    fn probe_child(
        &mut self,
        parent: PathId,
        index: usize,
        state: StateId,
        scratch: &mut Vec<PathId>,
    ) -> PathId {
        let (view_iteration, parent_doc) = {
            let node = self.paths.node(parent);
            (node.iteration, node.doc)
        };
        let existing = parent_doc.and_then(|d| self.paths.child_doc(d, view_iteration, index));
        let count = existing.map(|d| self.paths.doc(d).iteration).unwrap_or(0);
        self.probe(Direction::Child, state, count + 1, existing, scratch)
    }

    /// Extend a sub-segment with a new start. The old start is cloned to
    /// become `after_start` (sibling candidates may still share it) and its
    /// dangling edge is materialised on the clone.
    fn prepend(&mut self, start: PathId, edge: Option<usize>, seg: Segment) -> Segment {
        let after = self.paths.clone_node(seg.start);
        self.paths.node_mut(after).next_state_index = seg.start_edge;
        let end = match seg.after_start {
            Some(first) => {
                self.paths.node_mut(after).next = Some(first);
                self.paths.node_mut(first).prev = Some(after);
                seg.end
            }
            None => after,
        };
        Segment {
            start,
            start_edge: edge,
            after_start: Some(after),
            end,
        }
    }
}

/// Lock-step walk of a segment chain yielding, per node, its direction and
/// the edge index selected by its predecessor.
struct Steps<'a> {
    paths: &'a Paths,
    cursor: Option<PathId>,
    edge: Option<usize>,
}

impl<'a> Steps<'a> {
    fn new(paths: &'a Paths, seg: &Segment) -> Steps<'a> {
        Steps {
            paths,
            cursor: seg.after_start,
            edge: seg.start_edge,
        }
    }
}

impl<'a> Iterator for Steps<'a> {
    type Item = (Direction, Option<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = self.paths.node(id);
        let item = (node.direction, self.edge);
        self.edge = node.next_state_index;
        self.cursor = node.next;
        Some(item)
    }
}

/// Candidate preference order: concrete elements before wildcards, then
/// lock-step comparison of direction rank and selected edge index, then
/// shorter chains first. Used with a stable sort so fully tied candidates
/// keep their discovery order.
pub(crate) fn compare(
    machine: &StateMachine,
    paths: &Paths,
    a: &Segment,
    b: &Segment,
) -> Ordering {
    let a_wild = matches!(
        machine.node(paths.node(a.end).state).kind(),
        StateKind::Any(_)
    );
    let b_wild = matches!(
        machine.node(paths.node(b.end).state).kind(),
        StateKind::Any(_)
    );
    match a_wild.cmp(&b_wild) {
        Ordering::Equal => {}
        other => return other,
    }
    let mut left = Steps::new(paths, a);
    let mut right = Steps::new(paths, b);
    loop {
        match (left.next(), right.next()) {
            (Some((da, ea)), Some((db, eb))) => {
                match da.rank().cmp(&db.rank()) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match ea.cmp(&eb) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}
