//! Backtracking path finder over a precompiled XML Schema content model.
//!
//! [`PathFinder`] consumes SAX-like events and maintains the single
//! traversal of the schema state machine that is consistent with the
//! document so far. Where several traversals could absorb an element, the
//! alternatives are stacked as decision points; a later event that refutes
//! the chosen branch rolls the path back, re-commits the next alternative
//! and replays the intervening history. After `end_document` the committed
//! chain of path nodes is the canonical alignment of the document against
//! the schema.
//!
//! The schema state machine itself, and the lexical validation of
//! attributes and character content, are external collaborators (see
//! `xsdpath_model`). [`driver::XmlMatcher`] bridges an XML tokenizer onto
//! the event interface.

use std::fmt;
use std::io;

use xsdpath_model::{
    AcceptingValidator, Attr, ContentKind, ElementValidator, NamespaceContext, QName, StateKind,
    StateMachine, ValidationError,
};

pub mod driver;
mod fulfilment;
mod path;
mod search;

use fulfilment::Fulfilment;
use path::{DocId, PathId, PathNode, Paths};
use search::Segment;

pub use path::{Direction, PathStep, PathSteps};

/// Internal invariant violation; surfaced as [`FinderError::SchemaInvariant`]
/// with the event trail attached.
#[derive(Debug)]
pub(crate) struct Invariant(String);

impl Invariant {
    pub(crate) fn new(detail: &str) -> Invariant {
        Invariant(detail.to_string())
    }
}

/// Kind of a logged document event.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EventKind {
    Start,
    Content,
    End,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Start => "start",
            EventKind::Content => "content",
            EventKind::End => "end",
        })
    }
}

/// One entry of the append-only event log. The log is never truncated:
/// backtracking re-interprets history, it does not rewrite it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TraversedElement {
    pub qname: QName,
    pub kind: EventKind,
}

/// The event log rendered for diagnostics: `[qname:kind | qname:kind | …]`.
#[derive(Clone, Default, Debug)]
pub struct Trail(Vec<TraversedElement>);

impl Trail {
    pub fn events(&self) -> &[TraversedElement] {
        &self.0
    }
}

impl fmt::Display for Trail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, ev) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{}:{}", ev.qname, ev.kind)?;
        }
        f.write_str("]")
    }
}

/// Failure modes of the matcher. Every variant carries the rendered event
/// trail up to the failure.
#[derive(Debug)]
pub enum FinderError {
    /// Every decision point is exhausted; no schema traversal admits the
    /// document prefix.
    PathNotFound { qname: QName, trail: Trail },
    /// `endElement` for something other than the innermost open element.
    MismatchedEnd {
        expected: Option<QName>,
        found: QName,
        trail: Trail,
    },
    /// `endDocument` with elements still open.
    UnclosedElements { open: Vec<QName>, trail: Trail },
    /// Non-whitespace character data where the content model allows none.
    UnexpectedCharacterData {
        element: Option<QName>,
        trail: Trail,
    },
    /// A simple-typed, non-defaultable element closed without content.
    MissingContent { element: QName, trail: Trail },
    /// The external validator rejected attributes or character content.
    ContentInvalid {
        source: ValidationError,
        trail: Trail,
    },
    /// Internal inconsistency: a malformed machine or a matcher bug.
    SchemaInvariant { detail: String, trail: Trail },
}

impl fmt::Display for FinderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinderError::PathNotFound { qname, trail } => {
                write!(f, "no schema path admits element {qname} {trail}")
            }
            FinderError::MismatchedEnd {
                expected,
                found,
                trail,
            } => match expected {
                Some(expected) => write!(
                    f,
                    "unexpected end of {found}, expected end of {expected} {trail}"
                ),
                None => write!(f, "unexpected end of {found}: no element is open {trail}"),
            },
            FinderError::UnclosedElements { open, trail } => {
                write!(f, "document ended with unclosed elements")?;
                for (i, name) in open.iter().enumerate() {
                    write!(f, "{} {name}", if i == 0 { ":" } else { "," })?;
                }
                write!(f, " {trail}")
            }
            FinderError::UnexpectedCharacterData { element, trail } => match element {
                Some(element) => {
                    write!(f, "character data not allowed in {element} {trail}")
                }
                None => write!(
                    f,
                    "character data not allowed outside the document element {trail}"
                ),
            },
            FinderError::MissingContent { element, trail } => {
                write!(f, "element {element} requires character content {trail}")
            }
            FinderError::ContentInvalid { source, trail } => {
                write!(f, "content rejected by validator: {source} {trail}")
            }
            FinderError::SchemaInvariant { detail, trail } => {
                write!(f, "schema invariant violated: {detail} {trail}")
            }
        }
    }
}

impl std::error::Error for FinderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FinderError::ContentInvalid { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// An element currently open. Wildcard-opaque elements carry no path node.
#[derive(Clone, Debug)]
struct OpenElement {
    qname: QName,
    pn: Option<PathId>,
}

/// Snapshot taken at an ambiguous start: the branch point, the untried
/// alternatives in preference order, the log index of the diverging event,
/// and the stacks as they were before it.
struct DecisionPoint {
    branch: PathId,
    candidates: Vec<Segment>,
    next: usize,
    event_index: usize,
    element_stack: Vec<OpenElement>,
    wildcard_stack: Vec<QName>,
}

impl DecisionPoint {
    fn take_next(&mut self) -> Option<Segment> {
        let seg = self.candidates.get(self.next).copied()?;
        self.next += 1;
        Some(seg)
    }
}

/// The SAX-event-driven matcher. One instance processes one document; the
/// state machine itself is shared and immutable.
pub struct PathFinder<'s, V = AcceptingValidator> {
    machine: &'s StateMachine,
    validator: V,
    namespaces: NamespaceContext,
    paths: Paths,
    root: PathId,
    current: Option<PathId>,
    element_stack: Vec<OpenElement>,
    wildcard_stack: Vec<QName>,
    decisions: Vec<DecisionPoint>,
    log: Vec<TraversedElement>,
    finished: bool,
}

impl<'s> PathFinder<'s, AcceptingValidator> {
    pub fn new(machine: &'s StateMachine) -> PathFinder<'s, AcceptingValidator> {
        PathFinder::with_validator(machine, AcceptingValidator)
    }
}

impl<'s, V: ElementValidator> PathFinder<'s, V> {
    pub fn with_validator(machine: &'s StateMachine, validator: V) -> PathFinder<'s, V> {
        let mut paths = Paths::new();
        let start = machine.start();
        let root = paths.alloc(PathNode {
            state: start,
            direction: Direction::Child,
            iteration: 1,
            doc: None,
            saved_sequence_position: 0,
            prev: None,
            next: None,
            next_state_index: None,
            max_occurs: machine.node(start).max_occurs(),
        });
        PathFinder {
            machine,
            validator,
            namespaces: NamespaceContext::new(),
            paths,
            root,
            current: None,
            element_stack: Vec::new(),
            wildcard_stack: Vec::new(),
            decisions: Vec::new(),
            log: Vec::new(),
            finished: false,
        }
    }

    /// No per-document setup is needed; provided for interface symmetry
    /// with the event source.
    pub fn start_document(&mut self) {}

    pub fn start_prefix_mapping(&mut self, prefix: &str, uri: &str) {
        self.namespaces.declare(prefix, uri);
    }

    /// The prefix registry is append-only; nothing to undo.
    pub fn end_prefix_mapping(&mut self, _prefix: &str) {}

    pub fn start_element(&mut self, qname: QName, attrs: &[Attr]) -> Result<(), FinderError> {
        if self.in_wildcard() {
            // Content inside a matched wildcard is opaque: logged for
            // replay, but produces no path.
            self.log.push(TraversedElement {
                qname: qname.clone(),
                kind: EventKind::Start,
            });
            self.wildcard_stack.push(qname.clone());
            self.element_stack.push(OpenElement { qname, pn: None });
            return Ok(());
        }
        if self.current.is_none() {
            self.current = Some(self.root);
        }
        let origin = self.current.expect("current was just bootstrapped");
        let candidates = self
            .find_candidates(origin, &qname)
            .map_err(|e| self.invariant(e))?;
        if candidates.is_empty() {
            return self.backtrack_start(&qname, attrs);
        }
        let event_index = self.log.len();
        self.commit_candidates(candidates, &qname, Some(attrs), event_index, true)
    }

    pub fn characters(&mut self, text: &str) -> Result<(), FinderError> {
        if self.in_wildcard() {
            return Ok(());
        }
        let trimmed = text.trim_matches(is_xml_whitespace);
        let owner = match (self.current, self.open_element_doc()) {
            (Some(_), Some(owner)) => owner,
            _ => {
                // Character data outside the document element.
                if trimmed.is_empty() {
                    return Ok(());
                }
                return Err(FinderError::UnexpectedCharacterData {
                    element: None,
                    trail: self.trail(),
                });
            }
        };
        let machine = self.machine;
        let decl = machine
            .node(self.paths.doc(owner).state)
            .element()
            .expect("open elements are element states");
        if !decl.content.expects_content() {
            if trimmed.is_empty() {
                return Ok(()); // ignorable whitespace
            }
            return Err(FinderError::UnexpectedCharacterData {
                element: Some(decl.name.clone()),
                trail: self.trail(),
            });
        }
        if trimmed.is_empty()
            && decl.content == ContentKind::Simple
            && !decl.content_defaultable()
        {
            return Err(FinderError::MissingContent {
                element: decl.name.clone(),
                trail: self.trail(),
            });
        }
        if let Err(source) = self.validator.validate_content(decl, text, &self.namespaces) {
            return Err(FinderError::ContentInvalid {
                source,
                trail: self.trail(),
            });
        }
        self.paths.doc_mut(owner).received_content = true;
        let cur = self.current.expect("document element is open");
        let content = self.paths.append_content(cur);
        self.current = Some(content);
        self.log.push(TraversedElement {
            qname: decl.name.clone(),
            kind: EventKind::Content,
        });
        Ok(())
    }

    pub fn end_element(&mut self, qname: &QName) -> Result<(), FinderError> {
        if self.in_wildcard() {
            self.log.push(TraversedElement {
                qname: qname.clone(),
                kind: EventKind::End,
            });
            self.element_stack.pop();
            self.wildcard_stack.pop();
            if self.wildcard_stack.is_empty() {
                // The wildcard-matched element itself closed.
                self.walk_up_tree().map_err(|e| self.invariant(e))?;
            }
            return Ok(());
        }
        match self.element_stack.last() {
            Some(top) if top.qname == *qname => {}
            other => {
                return Err(FinderError::MismatchedEnd {
                    expected: other.map(|o| o.qname.clone()),
                    found: qname.clone(),
                    trail: self.trail(),
                });
            }
        }
        if self.try_close(qname, true)? {
            return Ok(());
        }
        // An unfulfilled compositor on the way up refutes the current
        // interpretation just like a failing start would.
        loop {
            self.rewind(qname)?;
            if self.try_close(qname, true)? {
                return Ok(());
            }
        }
    }

    pub fn end_document(&mut self) -> Result<(), FinderError> {
        if !self.element_stack.is_empty() {
            return Err(FinderError::UnclosedElements {
                open: self.element_stack.iter().map(|e| e.qname.clone()).collect(),
                trail: self.trail(),
            });
        }
        for dp in std::mem::take(&mut self.decisions) {
            for seg in &dp.candidates[dp.next..] {
                self.paths.recycle_segment(seg);
            }
        }
        self.finished = true;
        Ok(())
    }

    /// The committed canonical path, root first. Meaningful once
    /// `end_document` succeeded; earlier it reflects the committed prefix.
    pub fn path(&self) -> PathSteps<'_> {
        let start = self.current.map(|_| self.root);
        PathSteps::new(&self.paths, start)
    }

    /// Write the committed path one step per line.
    pub fn dump_path<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        path::dump(
            self.machine,
            &self.paths,
            self.current.map(|_| self.root),
            w,
        )
    }

    /// The append-only event log.
    pub fn events(&self) -> &[TraversedElement] {
        &self.log
    }

    pub fn trail(&self) -> Trail {
        Trail(self.log.clone())
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn machine(&self) -> &'s StateMachine {
        self.machine
    }

    pub fn namespaces(&self) -> &NamespaceContext {
        &self.namespaces
    }

    fn in_wildcard(&self) -> bool {
        !self.wildcard_stack.is_empty()
    }

    fn invariant(&self, inv: Invariant) -> FinderError {
        FinderError::SchemaInvariant {
            detail: inv.0,
            trail: self.trail(),
        }
    }

    /// Document node of the innermost open element.
    fn open_element_doc(&self) -> Option<DocId> {
        self.element_stack
            .iter()
            .rev()
            .find_map(|e| e.pn)
            .and_then(|p| self.paths.node(p).doc)
    }

    /// Commit the preferred candidate; stack the rest as a decision point.
    fn commit_candidates(
        &mut self,
        mut candidates: Vec<Segment>,
        qname: &QName,
        attrs: Option<&[Attr]>,
        event_index: usize,
        record: bool,
    ) -> Result<(), FinderError> {
        let first = candidates.remove(0);
        if !candidates.is_empty() {
            let branch = self.current.expect("a branch point exists");
            self.decisions.push(DecisionPoint {
                branch,
                candidates,
                next: 0,
                event_index,
                element_stack: self.element_stack.clone(),
                wildcard_stack: self.wildcard_stack.clone(),
            });
        }
        self.commit_start(first, qname, attrs, record)
    }

    fn commit_start(
        &mut self,
        seg: Segment,
        qname: &QName,
        attrs: Option<&[Attr]>,
        record: bool,
    ) -> Result<(), FinderError> {
        let machine = self.machine;
        self.paths
            .follow(machine, &seg)
            .map_err(|e| self.invariant(e))?;
        self.current = Some(seg.end);
        let end_state = self.paths.node(seg.end).state;
        let is_wildcard = matches!(machine.node(end_state).kind(), StateKind::Any(_));
        if !is_wildcard {
            if let Some(attrs) = attrs {
                let decl = machine
                    .node(end_state)
                    .element()
                    .expect("a match ends at an element or wildcard");
                if let Err(source) =
                    self.validator
                        .validate_attributes(decl, attrs, &self.namespaces)
                {
                    return Err(FinderError::ContentInvalid {
                        source,
                        trail: self.trail(),
                    });
                }
            }
        }
        if record {
            self.log.push(TraversedElement {
                qname: qname.clone(),
                kind: EventKind::Start,
            });
        }
        self.element_stack.push(OpenElement {
            qname: qname.clone(),
            pn: Some(seg.end),
        });
        if is_wildcard {
            self.wildcard_stack.push(qname.clone());
        }
        Ok(())
    }

    /// Backtrack until the failing start can be committed.
    fn backtrack_start(&mut self, qname: &QName, attrs: &[Attr]) -> Result<(), FinderError> {
        loop {
            self.rewind(qname)?;
            let origin = self.current.expect("rewind leaves a current node");
            let candidates = self
                .find_candidates(origin, qname)
                .map_err(|e| self.invariant(e))?;
            if candidates.is_empty() {
                continue;
            }
            let event_index = self.log.len();
            return self.commit_candidates(candidates, qname, Some(attrs), event_index, true);
        }
    }

    /// One successful retraction: take the next untried candidate from the
    /// top decision point (popping exhausted points), undo the committed
    /// path back to its branch, restore the stacks, re-commit, and replay
    /// history. Returns once a replay reaches the end of the log; fails
    /// with PATH-NOT-FOUND when every alternative is exhausted. Decision
    /// points freshly created by a failed replay stay stacked and are
    /// tried next.
    fn rewind(&mut self, failing: &QName) -> Result<(), FinderError> {
        loop {
            if self.decisions.is_empty() {
                return Err(FinderError::PathNotFound {
                    qname: failing.clone(),
                    trail: self.trail(),
                });
            }
            let taken = {
                let dp = self.decisions.last_mut().expect("checked non-empty");
                dp.take_next().map(|seg| {
                    (
                        seg,
                        dp.branch,
                        dp.event_index,
                        dp.element_stack.clone(),
                        dp.wildcard_stack.clone(),
                    )
                })
            };
            let Some((seg, branch, event_index, element_stack, wildcard_stack)) = taken else {
                self.decisions.pop();
                continue;
            };
            let machine = self.machine;
            self.paths
                .unfollow(machine, branch)
                .map_err(|e| self.invariant(e))?;
            self.element_stack = element_stack;
            self.wildcard_stack = wildcard_stack;
            self.current = Some(branch);
            let diverged = self.log[event_index].qname.clone();
            self.commit_start(seg, &diverged, None, false)?;
            if self.replay(event_index + 1)? {
                return Ok(());
            }
        }
    }

    /// Re-drive logged events against the freshly chosen branch. Returns
    /// false when a replayed event refutes this branch as well. Replay is
    /// structural: it does not re-invoke the external validator.
    fn replay(&mut self, from: usize) -> Result<bool, FinderError> {
        for index in from..self.log.len() {
            let event = self.log[index].clone();
            match event.kind {
                EventKind::Start => {
                    if self.in_wildcard() {
                        self.wildcard_stack.push(event.qname.clone());
                        self.element_stack.push(OpenElement {
                            qname: event.qname,
                            pn: None,
                        });
                        continue;
                    }
                    let origin = self.current.expect("replay starts after the root");
                    let candidates = self
                        .find_candidates(origin, &event.qname)
                        .map_err(|e| self.invariant(e))?;
                    if candidates.is_empty() {
                        return Ok(false);
                    }
                    self.commit_candidates(candidates, &event.qname, None, index, false)?;
                }
                EventKind::Content => {
                    if let Some(owner) = self.open_element_doc() {
                        self.paths.doc_mut(owner).received_content = true;
                    }
                    let cur = self.current.expect("content is replayed inside the root");
                    let content = self.paths.append_content(cur);
                    self.current = Some(content);
                }
                EventKind::End => {
                    if self.in_wildcard() {
                        self.element_stack.pop();
                        self.wildcard_stack.pop();
                        if self.wildcard_stack.is_empty() {
                            self.walk_up_tree().map_err(|e| self.invariant(e))?;
                        }
                        continue;
                    }
                    if !self.try_close(&event.qname, false)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Close the innermost open element: climb to its path node checking
    /// fulfilment on the way, verify its content expectation, then ascend
    /// out of saturated positions. Returns false when the close refutes
    /// the current interpretation. With `record` set, the event is logged
    /// and content violations are fatal rather than refuting.
    fn try_close(&mut self, qname: &QName, record: bool) -> Result<bool, FinderError> {
        let machine = self.machine;
        let top_pn = self.element_stack.last().and_then(|e| e.pn);
        let top_pn = match top_pn {
            Some(p) => p,
            None => {
                return Err(self.invariant(Invariant::new(
                    "closing an element that was never matched",
                )))
            }
        };
        let open_dn = match self.paths.node(top_pn).doc {
            Some(d) => d,
            None => {
                return Err(self.invariant(Invariant::new("open element is not committed")));
            }
        };
        loop {
            let cur = self.current.expect("an element is open");
            let node = self.paths.node(cur);
            let here = matches!(machine.node(node.state).kind(), StateKind::Element(_))
                && node.doc == Some(open_dn);
            if here {
                break;
            }
            let assessment = fulfilment::assess(machine, &self.paths, cur, None)
                .map_err(|e| self.invariant(e))?;
            if !assessment.status.fulfilled() {
                return Ok(false);
            }
            let up = self
                .paths
                .append_parent(machine, cur)
                .map_err(|e| self.invariant(e))?;
            self.current = Some(up);
        }
        let state_id = self.paths.doc(open_dn).state;
        let decl = machine
            .node(state_id)
            .element()
            .expect("open elements are element states");
        if decl.content == ContentKind::Simple
            && !self.paths.doc(open_dn).received_content
            && !decl.content_defaultable()
        {
            if record {
                return Err(FinderError::MissingContent {
                    element: decl.name.clone(),
                    trail: self.trail(),
                });
            }
            return Ok(false);
        }
        if matches!(decl.content, ContentKind::ElementOnly | ContentKind::Mixed) {
            if let Some(&content) = machine.node(state_id).next().first() {
                let iteration = self.paths.doc(open_dn).iteration;
                let entered = self.paths.child_doc(open_dn, iteration, 0).is_some();
                if !entered && !fulfilment::emptiable(machine, content) {
                    return Ok(false);
                }
            }
        }
        if record {
            self.log.push(TraversedElement {
                qname: qname.clone(),
                kind: EventKind::End,
            });
        }
        self.element_stack.pop();
        self.walk_up_tree().map_err(|e| self.invariant(e))?;
        Ok(true)
    }

    /// Ascend out of every position that can absorb nothing further,
    /// stopping below the enclosing element (or at the root).
    fn walk_up_tree(&mut self) -> Result<(), Invariant> {
        let machine = self.machine;
        loop {
            let cur = match self.current {
                Some(c) => c,
                None => return Ok(()),
            };
            let dn = match self.paths.node(cur).doc {
                Some(d) => d,
                None => return Ok(()),
            };
            let parent = match self.paths.doc(dn).parent {
                Some(p) => p,
                None => return Ok(()), // document root
            };
            let assessment = fulfilment::assess(machine, &self.paths, cur, None)?;
            if assessment.status != Fulfilment::Complete {
                return Ok(());
            }
            if matches!(
                machine.node(self.paths.doc(parent).state).kind(),
                StateKind::Element(_)
            ) {
                return Ok(());
            }
            let up = self.paths.append_parent(machine, cur)?;
            self.current = Some(up);
        }
    }
}

pub(crate) fn is_xml_whitespace(c: char) -> bool {
    matches!(c, '\x20' | '\x09' | '\x0d' | '\x0a')
}
