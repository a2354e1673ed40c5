// Stress tests for the path finder.
//
// These tests programmatically generate state machines and XML documents to
// test correctness at scale: wide choices, deep nesting, long repetitions,
// and backtracking chains. All tests are self-contained.
//
// Run with: cargo test --test stress
// Run the larger sizes: cargo test --test stress -- --ignored

use std::fmt::Write;
use std::time::Instant;

use xsdpath_finder::driver::XmlMatcher;
use xsdpath_finder::FinderError;
use xsdpath_model::{
    ContentKind, ElementDecl, Occurs, QName, StateId, StateMachine, StateMachineBuilder,
};

fn run(machine: &StateMachine, xml: &str) -> Result<(), String> {
    let mut matcher = XmlMatcher::new(machine, xml);
    matcher.run().map_err(|e| format!("{e:?}"))
}

// ══════════════════════════════════════════════════════════════════════════
//  Wide choice stress
// ══════════════════════════════════════════════════════════════════════════
//
//  A choice over `n` branches repeated `children` times. Every start event
//  scans the admissible branch set, so this stresses candidate enumeration
//  with many dead branches per event.

fn wide_choice_machine(branches: usize) -> StateMachine {
    let mut builder = StateMachineBuilder::new();
    let members: Vec<StateId> = (0..branches)
        .map(|i| {
            builder.element(
                ElementDecl::new(QName::local(&format!("branch{i}")), ContentKind::Simple),
                Occurs::once(),
            )
        })
        .collect();
    let choice = builder.choice(Occurs::at_least(1), members);
    let root = builder.element_with_content(
        ElementDecl::new(QName::local("root"), ContentKind::ElementOnly),
        Occurs::once(),
        choice,
    );
    builder.build(root).unwrap()
}

fn wide_choice_doc(branches: usize, children: usize) -> String {
    let mut xml = String::with_capacity(children * 40);
    xml.push_str("<root>");
    for i in 0..children {
        let branch = i % branches;
        write!(xml, "<branch{branch}>text</branch{branch}>").unwrap();
    }
    xml.push_str("</root>");
    xml
}

fn validate_wide_choice(branches: usize, children: usize) {
    let machine = wide_choice_machine(branches);
    let doc = wide_choice_doc(branches, children);
    let start = Instant::now();
    run(&machine, &doc).expect("valid choice doc");
    eprintln!(
        "  [stress] choice {branches} branches x {children} children — {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[test]
fn choice_50_branches_200_children() {
    validate_wide_choice(50, 200);
}

#[test]
fn choice_100_branches_500_children() {
    validate_wide_choice(100, 500);
}

#[test]
fn choice_wrong_branch_name() {
    let machine = wide_choice_machine(10);
    let mut doc = wide_choice_doc(10, 5);
    let pos = doc.rfind("</root>").unwrap();
    doc.insert_str(pos, "<nonexistent>x</nonexistent>");
    let result = run(&machine, &doc);
    assert!(result.is_err(), "element outside choice branches should fail");
}

// ══════════════════════════════════════════════════════════════════════════
//  Deep nesting stress
// ══════════════════════════════════════════════════════════════════════════
//
//  Pure depth: element e0 contains e1 contains e2 … with text at the
//  bottom. Exercises the element stack, the entry shim, and the walk-up
//  machinery at depth.

fn deep_machine(depth: usize) -> StateMachine {
    let mut builder = StateMachineBuilder::new();
    let mut inner: Option<StateId> = None;
    for i in (0..depth).rev() {
        let name = QName::local(&format!("e{i}"));
        let elem = match inner {
            None => builder.element(
                ElementDecl::new(name, ContentKind::Simple),
                Occurs::once(),
            ),
            Some(child) => {
                let seq = builder.sequence(Occurs::once(), vec![child]);
                builder.element_with_content(
                    ElementDecl::new(name, ContentKind::ElementOnly),
                    Occurs::once(),
                    seq,
                )
            }
        };
        inner = Some(elem);
    }
    builder.build(inner.unwrap()).unwrap()
}

fn deep_doc(depth: usize) -> String {
    let mut xml = String::with_capacity(depth * 12);
    for i in 0..depth {
        write!(xml, "<e{i}>").unwrap();
    }
    xml.push_str("leaf");
    for i in (0..depth).rev() {
        write!(xml, "</e{i}>").unwrap();
    }
    xml
}

#[test]
fn deep_nesting_100() {
    let machine = deep_machine(100);
    let doc = deep_doc(100);
    let start = Instant::now();
    run(&machine, &doc).expect("valid nested doc");
    eprintln!(
        "  [stress] deep nesting 100 — {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[test]
#[ignore] // Larger sizes are slow under debug profiles
fn deep_nesting_500() {
    let machine = deep_machine(500);
    let doc = deep_doc(500);
    let start = Instant::now();
    run(&machine, &doc).expect("valid nested doc");
    eprintln!(
        "  [stress] deep nesting 500 — {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[test]
fn deep_nesting_wrong_leaf() {
    let machine = deep_machine(50);
    let mut doc = String::new();
    for i in 0..49 {
        write!(doc, "<e{i}>").unwrap();
    }
    doc.push_str("<wrong>leaf</wrong>");
    for i in (0..49).rev() {
        write!(doc, "</e{i}>").unwrap();
    }
    let result = run(&machine, &doc);
    assert!(result.is_err(), "wrong element name at depth should fail");
}

// ══════════════════════════════════════════════════════════════════════════
//  Long repetition stress
// ══════════════════════════════════════════════════════════════════════════

#[test]
fn repetition_5000_items() {
    let mut builder = StateMachineBuilder::new();
    let item = builder.element(
        ElementDecl::new(QName::local("item"), ContentKind::Simple),
        Occurs::at_least(0),
    );
    let seq = builder.sequence(Occurs::once(), vec![item]);
    let root = builder.element_with_content(
        ElementDecl::new(QName::local("root"), ContentKind::ElementOnly),
        Occurs::once(),
        seq,
    );
    let machine = builder.build(root).unwrap();
    let mut doc = String::with_capacity(5000 * 20);
    doc.push_str("<root>");
    for i in 0..5000 {
        write!(doc, "<item>{i}</item>").unwrap();
    }
    doc.push_str("</root>");
    let start = Instant::now();
    run(&machine, &doc).expect("valid repetition doc");
    eprintln!(
        "  [stress] repetition 5000 — {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

// ══════════════════════════════════════════════════════════════════════════
//  Backtracking stress
// ══════════════════════════════════════════════════════════════════════════
//
//  `sequence { X?, X?, …, X }`: every position accepts the same element
//  name, and only the interpretation binding the final required position
//  survives the close. With a single X in the document the matcher has to
//  retract and replay once per optional position.

fn optional_chain_machine(optionals: usize) -> StateMachine {
    let mut builder = StateMachineBuilder::new();
    let mut positions: Vec<StateId> = (0..optionals)
        .map(|_| {
            builder.element(
                ElementDecl::new(QName::local("X"), ContentKind::Empty),
                Occurs::optional(),
            )
        })
        .collect();
    positions.push(builder.element(
        ElementDecl::new(QName::local("X"), ContentKind::Empty),
        Occurs::once(),
    ));
    let seq = builder.sequence(Occurs::once(), positions);
    let root = builder.element_with_content(
        ElementDecl::new(QName::local("root"), ContentKind::ElementOnly),
        Occurs::once(),
        seq,
    );
    builder.build(root).unwrap()
}

fn backtrack_chain(optionals: usize, xs: usize) {
    let machine = optional_chain_machine(optionals);
    let mut doc = String::from("<root>");
    for _ in 0..xs {
        doc.push_str("<X/>");
    }
    doc.push_str("</root>");
    let start = Instant::now();
    run(&machine, &doc).expect("valid optional-chain doc");
    eprintln!(
        "  [stress] backtrack {optionals} optionals, {xs} present — {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[test]
fn backtrack_20_optionals_one_present() {
    backtrack_chain(20, 1);
}

#[test]
fn backtrack_20_optionals_three_present() {
    backtrack_chain(20, 3);
}

#[test]
#[ignore] // Quadratic replay cost; fine under release profiles
fn backtrack_60_optionals_one_present() {
    backtrack_chain(60, 1);
}

#[test]
fn backtrack_overfull_chain_fails() {
    // More X elements than positions.
    let machine = optional_chain_machine(3);
    let doc = "<root><X/><X/><X/><X/><X/></root>";
    let result = run(&machine, doc);
    assert!(result.is_err(), "five X against four positions should fail");
}

#[test]
fn backtrack_reports_path_not_found() {
    let machine = optional_chain_machine(4);
    let mut matcher = XmlMatcher::new(&machine, "<root/>");
    match matcher.run() {
        Err(xsdpath_finder::driver::MatchError::Path {
            error: FinderError::PathNotFound { .. },
            ..
        }) => {}
        other => panic!("expected PathNotFound, got {other:?}"),
    }
}
