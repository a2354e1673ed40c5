//! Consistency checks run over a freshly built state machine.
//!
//! The schema walker that produces the machine is outside this workspace,
//! so the builder re-verifies the structural assumptions the matcher relies
//! on. A machine that passes here can still describe an unsatisfiable
//! content model; these checks only reject shapes the matcher would have to
//! treat as internal invariant violations at run time.

use fnv::FnvHashSet;
use std::fmt;

use crate::{ContentKind, StateId, StateKind, StateMachine};

/// A structural defect detected in a built state machine.
#[derive(Debug)]
pub enum ModelError {
    /// `min > max`, or `max == 0` (a particle that can never occur).
    BadOccurs {
        state: StateId,
        min: usize,
        max: usize,
    },
    /// A compositor with no children.
    EmptyGroup { state: StateId },
    /// An ELEMENT state carrying more than one content edge.
    ExtraContentEdges { state: StateId, edges: usize },
    /// An ELEMENT with simple or empty content but a content edge attached.
    UnexpectedContentEdge { state: StateId },
    /// An ELEMENT declared element-only or mixed with no content edge.
    MissingContentEdge { state: StateId },
    /// A substitution-group member that is not an ELEMENT state.
    NonElementSubstitute { group: StateId, member: StateId },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::BadOccurs { state, min, max } => {
                write!(f, "{state}: invalid occurrence bounds {min}..{max}")
            }
            ModelError::EmptyGroup { state } => {
                write!(f, "{state}: compositor has no children")
            }
            ModelError::ExtraContentEdges { state, edges } => {
                write!(f, "{state}: element has {edges} content edges")
            }
            ModelError::UnexpectedContentEdge { state } => {
                write!(
                    f,
                    "{state}: element with simple or empty content has a content edge"
                )
            }
            ModelError::MissingContentEdge { state } => {
                write!(
                    f,
                    "{state}: element declares element content but has no content edge"
                )
            }
            ModelError::NonElementSubstitute { group, member } => {
                write!(f, "{group}: substitution-group member {member} is not an element")
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Check every node reachable from the start state.
pub fn check_machine(machine: &StateMachine) -> Result<(), ModelError> {
    let mut seen = FnvHashSet::default();
    let mut work = vec![machine.start()];
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        check_node(machine, id)?;
        work.extend(machine.node(id).next().iter().copied());
    }
    Ok(())
}

fn check_node(machine: &StateMachine, id: StateId) -> Result<(), ModelError> {
    let node = machine.node(id);
    let occurs = node.occurs();
    if occurs.min > occurs.max || occurs.max == 0 {
        return Err(ModelError::BadOccurs {
            state: id,
            min: occurs.min,
            max: occurs.max,
        });
    }
    match node.kind() {
        StateKind::Element(decl) => {
            let edges = node.next().len();
            if edges > 1 {
                return Err(ModelError::ExtraContentEdges { state: id, edges });
            }
            match decl.content {
                ContentKind::Simple | ContentKind::Empty if edges != 0 => {
                    return Err(ModelError::UnexpectedContentEdge { state: id });
                }
                ContentKind::ElementOnly | ContentKind::Mixed if edges == 0 => {
                    return Err(ModelError::MissingContentEdge { state: id });
                }
                _ => {}
            }
        }
        StateKind::Any(_) => {
            // Wildcards carry no successors by construction.
        }
        StateKind::SubstitutionGroup => {
            if node.next().is_empty() {
                return Err(ModelError::EmptyGroup { state: id });
            }
            for &member in node.next() {
                if !matches!(machine.node(member).kind(), StateKind::Element(_)) {
                    return Err(ModelError::NonElementSubstitute {
                        group: id,
                        member,
                    });
                }
            }
        }
        StateKind::Sequence | StateKind::All | StateKind::Choice => {
            if node.next().is_empty() {
                return Err(ModelError::EmptyGroup { state: id });
            }
        }
    }
    Ok(())
}
