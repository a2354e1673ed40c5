use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::exit;

use structopt::StructOpt;
use xsdpath_finder::driver::XmlMatcher;
use xsdpath_model::{
    ContentKind, ElementDecl, NamespaceRule, Occurs, QName, StateMachine, StateMachineBuilder,
};

/// Schema compilation lives outside this workspace, so the tool ships a
/// built-in demonstration content model:
///
///   library { sequence { book+, any{##other}? } }
///   book    { sequence { title, author+, year? } }
#[derive(Debug, StructOpt)]
enum Cli {
    /// Match XML documents against the built-in demo model and dump the
    /// canonical path for each.
    Dump { xml: Vec<PathBuf> },
}

fn demo_machine() -> StateMachine {
    let mut b = StateMachineBuilder::new();
    let title = b.element(
        ElementDecl::new(QName::local("title"), ContentKind::Simple),
        Occurs::once(),
    );
    let author = b.element(
        ElementDecl::new(QName::local("author"), ContentKind::Simple),
        Occurs::at_least(1),
    );
    let year = b.element(
        ElementDecl::new(QName::local("year"), ContentKind::Simple),
        Occurs::optional(),
    );
    let book_seq = b.sequence(Occurs::once(), vec![title, author, year]);
    let book = b.element_with_content(
        ElementDecl::new(QName::local("book"), ContentKind::ElementOnly),
        Occurs::at_least(1),
        book_seq,
    );
    let extension = b.any(NamespaceRule::Other, Occurs::optional());
    let library_seq = b.sequence(Occurs::once(), vec![book, extension]);
    let library = b.element_with_content(
        ElementDecl::new(QName::local("library"), ContentKind::ElementOnly),
        Occurs::once(),
        library_seq,
    );
    match b.build(library) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("demo model failed its checks: {err}");
            exit(1);
        }
    }
}

fn main() {
    match Cli::from_args() {
        Cli::Dump { xml } => dump(xml),
    }
}

fn dump(xmls: Vec<PathBuf>) {
    let machine = demo_machine();
    for xml in xmls {
        let mut f = match File::open(&xml) {
            Ok(f) => f,
            Err(err) => {
                eprintln!("cannot open {xml:?}: {err}");
                exit(1);
            }
        };
        let mut doc = String::new();
        if let Err(err) = f.read_to_string(&mut doc) {
            eprintln!("cannot read {xml:?}: {err}");
            exit(1);
        }
        eprintln!("Matching {xml:?}");
        let mut matcher = XmlMatcher::new(&machine, &doc);
        match matcher.run() {
            Ok(()) => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                if let Err(err) = matcher.finder().dump_path(&mut out) {
                    eprintln!("cannot write path: {err}");
                    exit(1);
                }
            }
            Err(err) => {
                let (map, diagnostics) =
                    matcher.diagnostic(xml.to_string_lossy().to_string(), doc.clone(), &err);
                let mut emitter = codemap_diagnostic::Emitter::stderr(
                    codemap_diagnostic::ColorConfig::Auto,
                    Some(&map),
                );
                emitter.emit(&diagnostics[..]);
                exit(2);
            }
        }
    }
}
