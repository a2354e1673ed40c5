//! Path-node pool and document tree.
//!
//! Path nodes (the speculative traversal) and document nodes (the committed
//! instantiation counts) live in index-addressed arenas. Path nodes are
//! created liberally during candidate search and recycled through a free
//! list when their branch is refuted; document nodes are created only when
//! a candidate segment is committed and released again when a rollback
//! returns their occurrence count to zero.

use std::fmt;
use std::io;

use fnv::FnvHashMap;
use xsdpath_model::{StateId, StateKind, StateMachine};

use crate::search::Segment;
use crate::Invariant;

/// Relation of a path node to its predecessor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Direction {
    /// Descend into a child state of the predecessor.
    Child,
    /// Re-enter the same state for a further repetition.
    Sibling,
    /// Ascend to the predecessor's parent state.
    Parent,
    /// Character content inside the same state.
    Content,
}

impl Direction {
    /// Preference rank used by candidate ordering; lower is preferred.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Direction::Child => 0,
            Direction::Sibling => 1,
            Direction::Parent => 2,
            Direction::Content => 3,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Child => "child",
            Direction::Sibling => "sibling",
            Direction::Parent => "parent",
            Direction::Content => "content",
        })
    }
}

/// Handle of a path node within the pool.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PathId(u32);

/// Handle of a document node within the tree.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct DocId(u32);

/// One step of the (possibly speculative) traversal.
#[derive(Clone, Debug)]
pub(crate) struct PathNode {
    pub state: StateId,
    pub direction: Direction,
    /// Prospective occurrence index of `state` this step stands for.
    pub iteration: usize,
    /// Bound on commit; probes keep the candidate binding for count views.
    pub doc: Option<DocId>,
    /// Parent's sequence position before this step advanced it; restored on
    /// rollback.
    pub saved_sequence_position: usize,
    pub prev: Option<PathId>,
    pub next: Option<PathId>,
    /// Child index selected by the outgoing edge; `None` for
    /// sibling/parent/content edges.
    pub next_state_index: Option<usize>,
    pub max_occurs: usize,
}

/// One committed occurrence of a schema state in the document.
#[derive(Debug)]
pub(crate) struct DocNode {
    pub state: StateId,
    /// How many times this position has been entered at this level.
    pub iteration: usize,
    /// For SEQUENCE states: child index reached within the current
    /// iteration.
    pub sequence_position: usize,
    pub parent: Option<DocId>,
    /// Child index within the parent, and the parent iteration the entry
    /// was created under; both are needed to unhook on rollback.
    pub parent_index: usize,
    pub parent_iteration: usize,
    /// Children keyed by `(iteration, child index)`; a fresh repetition
    /// therefore starts from an empty view.
    pub children: FnvHashMap<(usize, usize), DocId>,
    pub received_content: bool,
    pub max_occurs: usize,
}

/// Owner of both arenas plus the free lists.
#[derive(Default)]
pub(crate) struct Paths {
    nodes: Vec<Option<PathNode>>,
    free: Vec<PathId>,
    docs: Vec<Option<DocNode>>,
    doc_free: Vec<DocId>,
}

impl Paths {
    pub fn new() -> Paths {
        Paths::default()
    }

    pub fn alloc(&mut self, node: PathNode) -> PathId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0 as usize] = Some(node);
                id
            }
            None => {
                let id = PathId(self.nodes.len() as u32);
                self.nodes.push(Some(node));
                id
            }
        }
    }

    pub fn node(&self, id: PathId) -> &PathNode {
        self.nodes[id.0 as usize]
            .as_ref()
            .expect("path node recycled while referenced")
    }

    pub fn node_mut(&mut self, id: PathId) -> &mut PathNode {
        self.nodes[id.0 as usize]
            .as_mut()
            .expect("path node recycled while referenced")
    }

    /// Copy of the scalar fields with the link and binding fields cleared;
    /// used when a shared segment start is promoted into a longer segment.
    pub fn clone_node(&mut self, id: PathId) -> PathId {
        let mut copy = self.node(id).clone();
        copy.prev = None;
        copy.next = None;
        copy.doc = None;
        self.alloc(copy)
    }

    pub fn recycle(&mut self, id: PathId) {
        self.nodes[id.0 as usize] = None;
        self.free.push(id);
    }

    /// Recycle every node of a segment beyond its (shared) start.
    pub fn recycle_segment(&mut self, seg: &Segment) {
        let mut cur = seg.after_start;
        while let Some(id) = cur {
            cur = self.node(id).next;
            self.recycle(id);
        }
    }

    fn alloc_doc(&mut self, node: DocNode) -> DocId {
        match self.doc_free.pop() {
            Some(id) => {
                self.docs[id.0 as usize] = Some(node);
                id
            }
            None => {
                let id = DocId(self.docs.len() as u32);
                self.docs.push(Some(node));
                id
            }
        }
    }

    pub fn doc(&self, id: DocId) -> &DocNode {
        self.docs[id.0 as usize]
            .as_ref()
            .expect("document node freed while referenced")
    }

    pub fn doc_mut(&mut self, id: DocId) -> &mut DocNode {
        self.docs[id.0 as usize]
            .as_mut()
            .expect("document node freed while referenced")
    }

    fn free_doc(&mut self, id: DocId) {
        self.docs[id.0 as usize] = None;
        self.doc_free.push(id);
    }

    /// Child document node of `dn` at `(iteration, index)`, if instantiated.
    pub fn child_doc(&self, dn: DocId, iteration: usize, index: usize) -> Option<DocId> {
        self.doc(dn).children.get(&(iteration, index)).copied()
    }

    /// Splice a chosen candidate into the committed chain and bind every
    /// new step to the document tree.
    pub fn follow(&mut self, machine: &StateMachine, seg: &Segment) -> Result<(), Invariant> {
        let start = seg.start;
        if self.node(start).doc.is_none() {
            // Root bootstrap: the pre-created root path node commits itself.
            let state = self.node(start).state;
            let max = machine.node(state).max_occurs();
            let dn = self.alloc_doc(DocNode {
                state,
                iteration: 1,
                sequence_position: 0,
                parent: None,
                parent_index: 0,
                parent_iteration: 0,
                children: FnvHashMap::default(),
                received_content: false,
                max_occurs: max,
            });
            let node = self.node_mut(start);
            node.doc = Some(dn);
            node.iteration = 1;
        }
        self.node_mut(start).next_state_index = seg.start_edge;
        self.node_mut(start).next = seg.after_start;
        let mut prev = start;
        let mut walk = seg.after_start;
        while let Some(cur) = walk {
            self.node_mut(cur).prev = Some(prev);
            self.commit_step(machine, prev, cur)?;
            prev = cur;
            walk = self.node(cur).next;
        }
        Ok(())
    }

    fn commit_step(
        &mut self,
        machine: &StateMachine,
        prev: PathId,
        cur: PathId,
    ) -> Result<(), Invariant> {
        let direction = self.node(cur).direction;
        match direction {
            Direction::Child => {
                let parent_dn = self
                    .node(prev)
                    .doc
                    .ok_or_else(|| Invariant::new("child step from an unbound path node"))?;
                let index = self
                    .node(prev)
                    .next_state_index
                    .ok_or_else(|| Invariant::new("child step without a selected edge"))?;
                let parent_iter = self.doc(parent_dn).iteration;
                let state = self.node(cur).state;
                let dn = match self.child_doc(parent_dn, parent_iter, index) {
                    Some(dn) => {
                        if self.doc(dn).state != state {
                            return Err(Invariant::new("child document node state mismatch"));
                        }
                        let doc = self.doc_mut(dn);
                        doc.iteration += 1;
                        if doc.iteration > doc.max_occurs {
                            return Err(Invariant::new("iteration above maxOccurs"));
                        }
                        dn
                    }
                    None => {
                        let max = machine.node(state).max_occurs();
                        let dn = self.alloc_doc(DocNode {
                            state,
                            iteration: 1,
                            sequence_position: 0,
                            parent: Some(parent_dn),
                            parent_index: index,
                            parent_iteration: parent_iter,
                            children: FnvHashMap::default(),
                            received_content: false,
                            max_occurs: max,
                        });
                        self.doc_mut(parent_dn)
                            .children
                            .insert((parent_iter, index), dn);
                        dn
                    }
                };
                if matches!(
                    machine.node(self.doc(parent_dn).state).kind(),
                    StateKind::Sequence
                ) {
                    let old = self.doc(parent_dn).sequence_position;
                    self.node_mut(cur).saved_sequence_position = old;
                    self.doc_mut(parent_dn).sequence_position = index;
                }
                let iteration = self.doc(dn).iteration;
                let node = self.node_mut(cur);
                node.doc = Some(dn);
                node.iteration = iteration;
            }
            Direction::Sibling => {
                let dn = self
                    .node(prev)
                    .doc
                    .ok_or_else(|| Invariant::new("sibling step from an unbound path node"))?;
                if matches!(machine.node(self.doc(dn).state).kind(), StateKind::Sequence) {
                    let old = self.doc(dn).sequence_position;
                    self.node_mut(cur).saved_sequence_position = old;
                    self.doc_mut(dn).sequence_position = 0;
                }
                let doc = self.doc_mut(dn);
                doc.iteration += 1;
                if doc.iteration > doc.max_occurs {
                    return Err(Invariant::new("iteration above maxOccurs"));
                }
                let iteration = doc.iteration;
                let node = self.node_mut(cur);
                node.doc = Some(dn);
                node.iteration = iteration;
            }
            Direction::Parent => {
                let dn = self
                    .node(prev)
                    .doc
                    .ok_or_else(|| Invariant::new("parent step from an unbound path node"))?;
                let parent = self
                    .doc(dn)
                    .parent
                    .ok_or_else(|| Invariant::new("parent step above the document root"))?;
                let iteration = self.doc(parent).iteration;
                let node = self.node_mut(cur);
                node.doc = Some(parent);
                node.iteration = iteration;
            }
            Direction::Content => {
                let prev_node = self.node(prev);
                let (doc, iteration) = (prev_node.doc, prev_node.iteration);
                let node = self.node_mut(cur);
                node.doc = doc;
                node.iteration = iteration;
            }
        }
        Ok(())
    }

    /// Reverse every transition after `branch`, truncate the chain there,
    /// and recycle the removed path nodes.
    pub fn unfollow(&mut self, machine: &StateMachine, branch: PathId) -> Result<(), Invariant> {
        let mut chain = Vec::new();
        let mut walk = self.node(branch).next;
        while let Some(id) = walk {
            chain.push(id);
            walk = self.node(id).next;
        }
        for &id in chain.iter().rev() {
            self.revert_step(machine, id)?;
        }
        for id in chain {
            self.recycle(id);
        }
        self.node_mut(branch).next = None;
        self.node_mut(branch).next_state_index = None;
        Ok(())
    }

    fn revert_step(&mut self, machine: &StateMachine, id: PathId) -> Result<(), Invariant> {
        let node = self.node(id);
        let (direction, doc, saved) = (node.direction, node.doc, node.saved_sequence_position);
        match direction {
            Direction::Child => {
                let dn = doc.ok_or_else(|| Invariant::new("rolling back an unbound child step"))?;
                let parent = self.doc(dn).parent;
                if let Some(parent) = parent {
                    if matches!(
                        machine.node(self.doc(parent).state).kind(),
                        StateKind::Sequence
                    ) {
                        self.doc_mut(parent).sequence_position = saved;
                    }
                }
                let remaining = {
                    let doc = self.doc_mut(dn);
                    doc.iteration -= 1;
                    doc.iteration
                };
                if remaining == 0 {
                    let (parent, key) = {
                        let doc = self.doc(dn);
                        (doc.parent, (doc.parent_iteration, doc.parent_index))
                    };
                    if let Some(parent) = parent {
                        self.doc_mut(parent).children.remove(&key);
                    }
                    self.free_doc(dn);
                }
            }
            Direction::Sibling => {
                let dn =
                    doc.ok_or_else(|| Invariant::new("rolling back an unbound sibling step"))?;
                {
                    let doc = self.doc_mut(dn);
                    doc.iteration -= 1;
                }
                if matches!(machine.node(self.doc(dn).state).kind(), StateKind::Sequence) {
                    self.doc_mut(dn).sequence_position = saved;
                }
            }
            Direction::Parent | Direction::Content => {}
        }
        Ok(())
    }

    /// Append a committed PARENT step after `cur` (walk-up machinery).
    pub fn append_parent(
        &mut self,
        machine: &StateMachine,
        cur: PathId,
    ) -> Result<PathId, Invariant> {
        let dn = self
            .node(cur)
            .doc
            .ok_or_else(|| Invariant::new("walk-up from an unbound path node"))?;
        let parent = self
            .doc(dn)
            .parent
            .ok_or_else(|| Invariant::new("walk-up above the document root"))?;
        let (state, iteration) = {
            let doc = self.doc(parent);
            (doc.state, doc.iteration)
        };
        let id = self.alloc(PathNode {
            state,
            direction: Direction::Parent,
            iteration,
            doc: Some(parent),
            saved_sequence_position: 0,
            prev: Some(cur),
            next: None,
            next_state_index: None,
            max_occurs: machine.node(state).max_occurs(),
        });
        let node = self.node_mut(cur);
        node.next = Some(id);
        node.next_state_index = None;
        Ok(id)
    }

    /// Append a committed CONTENT step after `cur` (character data).
    pub fn append_content(&mut self, cur: PathId) -> PathId {
        let template = self.node(cur);
        let node = PathNode {
            state: template.state,
            direction: Direction::Content,
            iteration: template.iteration,
            doc: template.doc,
            saved_sequence_position: 0,
            prev: Some(cur),
            next: None,
            next_state_index: None,
            max_occurs: template.max_occurs,
        };
        let id = self.alloc(node);
        let cur_node = self.node_mut(cur);
        cur_node.next = Some(id);
        cur_node.next_state_index = None;
        id
    }
}

/// One step of the committed canonical path.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PathStep {
    pub state: StateId,
    pub direction: Direction,
    pub iteration: usize,
}

/// Iterator over the committed chain, root first.
pub struct PathSteps<'a> {
    paths: &'a Paths,
    cursor: Option<PathId>,
}

impl<'a> PathSteps<'a> {
    pub(crate) fn new(paths: &'a Paths, start: Option<PathId>) -> PathSteps<'a> {
        PathSteps {
            paths,
            cursor: start,
        }
    }
}

impl<'a> Iterator for PathSteps<'a> {
    type Item = PathStep;

    fn next(&mut self) -> Option<PathStep> {
        let id = self.cursor?;
        let node = self.paths.node(id);
        self.cursor = node.next;
        Some(PathStep {
            state: node.state,
            direction: node.direction,
            iteration: node.iteration,
        })
    }
}

/// Write the committed chain one step per line, for debugging and the tool.
pub(crate) fn dump<W: io::Write>(
    machine: &StateMachine,
    paths: &Paths,
    start: Option<PathId>,
    w: &mut W,
) -> io::Result<()> {
    for step in PathSteps::new(paths, start) {
        writeln!(
            w,
            "{:<8} {} #{}",
            step.direction.to_string(),
            machine.describe(step.state),
            step.iteration
        )?;
    }
    Ok(())
}
