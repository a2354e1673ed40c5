//! Occurrence fulfilment of a path node against its schema state.
//!
//! `assess` is a pure function over the path node, its schema state and the
//! committed child counts: it reports whether the position could be left as
//! is (PARTIAL), cannot absorb anything further (COMPLETE), or is still
//! short of its minima (NOT), together with the ordered child indices that
//! may legitimately be entered next. A path node whose iteration lies above
//! its bound document iteration sees an empty child view, which is exactly
//! the fresh-repetition semantics the search needs.

use xsdpath_model::{StateId, StateKind, StateMachine};

use crate::path::{PathId, Paths};
use crate::Invariant;

/// Recursion bound for emptiability over (degenerate) cyclic models.
const MAX_EMPTIABLE_DEPTH: usize = 64;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Fulfilment {
    /// Minimum occurrence requirements not yet met.
    Not,
    /// Minima met; the position may be left or extended.
    Partial,
    /// Maxima reached; nothing further may be absorbed here.
    Complete,
}

impl Fulfilment {
    pub fn fulfilled(self) -> bool {
        !matches!(self, Fulfilment::Not)
    }
}

/// Result of assessing one path node.
#[derive(Debug)]
pub(crate) struct Assessment {
    pub status: Fulfilment,
    /// Child indices admissible for the next entry, in preference order.
    pub admissible: Vec<usize>,
}

/// Whether a particle can legally occur zero times.
pub(crate) fn emptiable(machine: &StateMachine, state: StateId) -> bool {
    emptiable_at(machine, state, 0)
}

fn emptiable_at(machine: &StateMachine, state: StateId, depth: usize) -> bool {
    if depth > MAX_EMPTIABLE_DEPTH {
        return false;
    }
    let node = machine.node(state);
    if node.min_occurs() == 0 {
        return true;
    }
    match node.kind() {
        StateKind::Element(_) | StateKind::Any(_) => false,
        StateKind::Choice | StateKind::SubstitutionGroup => node
            .next()
            .iter()
            .any(|&c| emptiable_at(machine, c, depth + 1)),
        StateKind::Sequence | StateKind::All => node
            .next()
            .iter()
            .all(|&c| emptiable_at(machine, c, depth + 1)),
    }
}

/// Assess `pn`. `skip` is the do-not-follow child index used when the
/// search ascends out of a child; it is excluded from the admissible set
/// but still participates in the occurrence accounting.
pub(crate) fn assess(
    machine: &StateMachine,
    paths: &Paths,
    pn: PathId,
    skip: Option<usize>,
) -> Result<Assessment, Invariant> {
    let node = paths.node(pn);
    let state = machine.node(node.state);
    match state.kind() {
        StateKind::Element(_) | StateKind::Any(_) => {
            let count = node.doc.map(|d| paths.doc(d).iteration).unwrap_or(0);
            if count > state.max_occurs() {
                return Err(Invariant::new("iteration above maxOccurs"));
            }
            let status = if count == state.max_occurs() {
                Fulfilment::Complete
            } else if count >= state.min_occurs() {
                Fulfilment::Partial
            } else {
                Fulfilment::Not
            };
            Ok(Assessment {
                status,
                admissible: Vec::new(),
            })
        }
        StateKind::Choice | StateKind::SubstitutionGroup => {
            let contents = assess_choice(machine, paths, pn, skip)?;
            Ok(combine(contents, node.iteration, node.max_occurs))
        }
        StateKind::All => {
            let contents = assess_all(machine, paths, pn, skip)?;
            Ok(combine(contents, node.iteration, node.max_occurs))
        }
        StateKind::Sequence => {
            let contents = assess_sequence(machine, paths, pn, skip)?;
            Ok(combine(contents, node.iteration, node.max_occurs))
        }
    }
}

/// Fold the group-content result with the node's own occurrence bound:
/// overall COMPLETE needs the contents saturated *and* the final repetition.
fn combine(contents: Assessment, iteration: usize, max_occurs: usize) -> Assessment {
    let status = match contents.status {
        Fulfilment::Complete if iteration >= max_occurs => Fulfilment::Complete,
        Fulfilment::Complete => Fulfilment::Partial,
        other => other,
    };
    Assessment {
        status,
        admissible: contents.admissible,
    }
}

/// Count view of a group path node: entries under the node's prospective
/// iteration, so fresh repetitions read as zero.
fn child_count(paths: &Paths, pn: PathId, index: usize) -> usize {
    let node = paths.node(pn);
    node.doc
        .and_then(|d| paths.child_doc(d, node.iteration, index))
        .map(|d| paths.doc(d).iteration)
        .unwrap_or(0)
}

fn assess_choice(
    machine: &StateMachine,
    paths: &Paths,
    pn: PathId,
    skip: Option<usize>,
) -> Result<Assessment, Invariant> {
    let state = machine.node(paths.node(pn).state);
    let children = state.next();
    if children.is_empty() {
        return Err(Invariant::new("compositor with no children"));
    }
    let mut entered = false;
    let mut chosen: Option<(usize, usize, usize)> = None;
    for (i, &child) in children.iter().enumerate() {
        let count = child_count(paths, pn, i);
        let occurs = machine.node(child).occurs();
        if count > occurs.max {
            return Err(Invariant::new("iteration above maxOccurs"));
        }
        if count > 0 {
            entered = true;
            if count >= occurs.min && chosen.is_none() {
                chosen = Some((i, count, occurs.max));
            }
        }
    }
    Ok(match chosen {
        // A branch has satisfied its minimum: the group is committed to it.
        Some((i, count, max)) => {
            let status = if count == max {
                Fulfilment::Complete
            } else {
                Fulfilment::Partial
            };
            let admissible = if count < max && skip != Some(i) {
                vec![i]
            } else {
                Vec::new()
            };
            Assessment { status, admissible }
        }
        None => {
            let status = if entered {
                Fulfilment::Not
            } else if children.iter().any(|&c| emptiable(machine, c)) {
                Fulfilment::Partial
            } else {
                Fulfilment::Not
            };
            let admissible = (0..children.len())
                .filter(|&i| {
                    skip != Some(i)
                        && child_count(paths, pn, i) < machine.node(children[i]).max_occurs()
                })
                .collect();
            Assessment { status, admissible }
        }
    })
}

fn assess_all(
    machine: &StateMachine,
    paths: &Paths,
    pn: PathId,
    skip: Option<usize>,
) -> Result<Assessment, Invariant> {
    let state = machine.node(paths.node(pn).state);
    let children = state.next();
    if children.is_empty() {
        return Err(Invariant::new("compositor with no children"));
    }
    let mut satisfied = true;
    let mut saturated = true;
    let mut admissible = Vec::new();
    for (i, &child) in children.iter().enumerate() {
        let count = child_count(paths, pn, i);
        let occurs = machine.node(child).occurs();
        if count > occurs.max {
            return Err(Invariant::new("iteration above maxOccurs"));
        }
        if count < occurs.max {
            saturated = false;
            if skip != Some(i) {
                admissible.push(i);
            }
        }
        if !(count >= occurs.min || (count == 0 && emptiable(machine, child))) {
            satisfied = false;
        }
    }
    let status = if !satisfied {
        Fulfilment::Not
    } else if saturated {
        Fulfilment::Complete
    } else {
        Fulfilment::Partial
    };
    Ok(Assessment { status, admissible })
}

fn assess_sequence(
    machine: &StateMachine,
    paths: &Paths,
    pn: PathId,
    skip: Option<usize>,
) -> Result<Assessment, Invariant> {
    let node = paths.node(pn);
    let state = machine.node(node.state);
    let children = state.next();
    if children.is_empty() {
        return Err(Invariant::new("compositor with no children"));
    }
    let start = match node.doc {
        Some(d) if paths.doc(d).iteration == node.iteration => paths.doc(d).sequence_position,
        _ => 0,
    };
    let mut satisfied = true;
    let mut saturated = true;
    let mut admissible = Vec::new();
    for i in start..children.len() {
        let child = children[i];
        let count = child_count(paths, pn, i);
        let occurs = machine.node(child).occurs();
        if count > occurs.max {
            return Err(Invariant::new("iteration above maxOccurs"));
        }
        if count < occurs.max {
            saturated = false;
            if skip != Some(i) {
                admissible.push(i);
            }
        }
        if !(count >= occurs.min || (count == 0 && emptiable(machine, child))) {
            // An unmet required position blocks both fulfilment and any
            // later position.
            satisfied = false;
            break;
        }
    }
    let status = if !satisfied {
        Fulfilment::Not
    } else if saturated {
        Fulfilment::Complete
    } else {
        Fulfilment::Partial
    };
    Ok(Assessment { status, admissible })
}
