//! XML front-end: pumps an `xmlparser` token stream into a [`PathFinder`].
//!
//! The finder itself consumes abstract, namespace-resolved events; this
//! module owns the prefix scoping, attribute collection, text buffering
//! (content may arrive split across CDATA sections and processing
//! instructions) and entity decoding needed to produce them from raw XML.

use std::collections::HashMap;
use std::ops::Range;

use xmlparser::{ElementEnd, EntityDefinition, StrSpan, Token, Tokenizer};
use xsdpath_model::{AcceptingValidator, Attr, ElementValidator, QName, StateMachine};

use crate::{FinderError, PathFinder};

static XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Failure while driving a document through the matcher.
#[derive(Debug)]
pub enum MatchError<'a> {
    /// The tokenizer rejected the input.
    Xml(xmlparser::Error),
    /// The matcher refused the document; `span` points at the triggering
    /// token when one exists.
    Path {
        error: FinderError,
        span: Option<StrSpan<'a>>,
    },
    UndefinedNamespacePrefix {
        prefix: StrSpan<'a>,
    },
    UndefinedEntity {
        name: &'a str,
        span: Range<usize>,
    },
    InvalidOrUnclosedEntity {
        span: Range<usize>,
    },
    /// External entity declarations are not resolved.
    UnresolvedExternalEntity {
        span: StrSpan<'a>,
    },
}

struct Ns<'a> {
    prefix: StrSpan<'a>,
    uri: StrSpan<'a>,
}

struct RawAttr<'a> {
    prefix: StrSpan<'a>,
    local: StrSpan<'a>,
    value: StrSpan<'a>,
}

struct OpenTag<'a> {
    prefix: StrSpan<'a>,
    local: StrSpan<'a>,
    namespaces: Vec<Ns<'a>>,
    attributes: Vec<RawAttr<'a>>,
}

/// Prefix scoping across the open elements, feeding the finder's
/// namespace-resolved event interface.
#[derive(Default)]
struct ElementStack<'a> {
    elements: Vec<OpenTag<'a>>,
}

impl<'a> ElementStack<'a> {
    fn push(&mut self, prefix: StrSpan<'a>, local: StrSpan<'a>) {
        self.elements.push(OpenTag {
            prefix,
            local,
            namespaces: Vec::new(),
            attributes: Vec::new(),
        });
    }

    fn pop(&mut self) {
        self.elements.pop();
    }

    fn add_attr(&mut self, prefix: StrSpan<'a>, local: StrSpan<'a>, value: StrSpan<'a>) {
        let top = self.elements.last_mut().expect("attribute outside a tag");
        if prefix.as_str() == "xmlns" {
            top.namespaces.push(Ns {
                prefix: local,
                uri: value,
            });
        } else if prefix.as_str().is_empty() && local.as_str() == "xmlns" {
            // Default namespace declaration.
            top.namespaces.push(Ns {
                prefix,
                uri: value,
            });
        } else {
            top.attributes.push(RawAttr {
                prefix,
                local,
                value,
            });
        }
    }

    fn lookup(&self, prefix: &str) -> Option<&'a str> {
        self.elements.iter().rev().find_map(|tag| {
            tag.namespaces
                .iter()
                .find(|ns| ns.prefix.as_str() == prefix)
                .map(|ns| ns.uri.as_str())
        })
    }

    fn resolve_prefix(&self, prefix: StrSpan<'a>) -> Result<Option<&'a str>, MatchError<'a>> {
        if prefix.as_str().is_empty() {
            // An empty default namespace means "no namespace".
            match self.lookup("") {
                Some(uri) if !uri.is_empty() => Ok(Some(uri)),
                _ => Ok(None),
            }
        } else if prefix.as_str() == "xml" {
            Ok(Some(XML_NAMESPACE))
        } else {
            self.lookup(prefix.as_str())
                .map(Some)
                .ok_or(MatchError::UndefinedNamespacePrefix { prefix })
        }
    }

    fn qname(&self, prefix: StrSpan<'a>, local: StrSpan<'a>) -> Result<QName, MatchError<'a>> {
        let namespace = self.resolve_prefix(prefix)?;
        Ok(QName {
            namespace: namespace.map(str::to_string),
            local: local.as_str().to_string(),
        })
    }

    fn current_qname(&self) -> Result<QName, MatchError<'a>> {
        let top = self.elements.last().expect("no element is open");
        self.qname(top.prefix, top.local)
    }

    fn current_namespaces(&self) -> Vec<(String, String)> {
        let top = self.elements.last().expect("no element is open");
        top.namespaces
            .iter()
            .map(|ns| (ns.prefix.as_str().to_string(), ns.uri.as_str().to_string()))
            .collect()
    }

    fn current_attributes(&self) -> Result<Vec<Attr>, MatchError<'a>> {
        let top = self.elements.last().expect("no element is open");
        top.attributes
            .iter()
            .map(|attr| {
                // Unprefixed attributes carry no namespace; the default
                // namespace does not apply to them.
                let namespace = if attr.prefix.as_str().is_empty() {
                    None
                } else {
                    self.resolve_prefix(attr.prefix)?
                };
                Ok(Attr {
                    name: QName {
                        namespace: namespace.map(str::to_string),
                        local: attr.local.as_str().to_string(),
                    },
                    value: attr.value.as_str().to_string(),
                })
            })
            .collect()
    }
}

/// Decode character data, resolving predefined, declared and numeric
/// entity references, and append it to `out`.
fn decode_text<'a>(
    out: &mut String,
    entities: &HashMap<String, String>,
    text: StrSpan<'a>,
) -> Result<(), MatchError<'a>> {
    let s = text.as_str();
    let base = text.start();
    let mut rest = s;
    let mut consumed = 0usize;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let Some(semi) = after.find(';') else {
            let at = base + consumed + amp;
            return Err(MatchError::InvalidOrUnclosedEntity { span: at..at + 1 });
        };
        let name = &after[..semi];
        if let Some(number) = name.strip_prefix('#') {
            let code = if let Some(hex) = number.strip_prefix('x') {
                u32::from_str_radix(hex, 16).ok()
            } else {
                number.parse().ok()
            };
            match code.and_then(char::from_u32) {
                Some(c) => out.push(c),
                None => {
                    let at = base + consumed + amp;
                    return Err(MatchError::InvalidOrUnclosedEntity {
                        span: at..at + name.len() + 2,
                    });
                }
            }
        } else if let Some(value) = entities.get(name) {
            out.push_str(value);
        } else {
            let at = base + consumed + amp + 1;
            return Err(MatchError::UndefinedEntity {
                name,
                span: at..at + name.len(),
            });
        }
        consumed += amp + 1 + semi + 1;
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(())
}

/// Drives a whole document from an `xmlparser` tokenizer through a
/// [`PathFinder`].
pub struct XmlMatcher<'a, 's, V = AcceptingValidator> {
    finder: PathFinder<'s, V>,
    tokenizer: Tokenizer<'a>,
    stack: ElementStack<'a>,
    entities: HashMap<String, String>,
    text_buffer: String,
    done: bool,
}

impl<'a, 's> XmlMatcher<'a, 's, AcceptingValidator> {
    pub fn new(machine: &'s StateMachine, xml: &'a str) -> XmlMatcher<'a, 's, AcceptingValidator> {
        XmlMatcher::with_validator(machine, xml, AcceptingValidator)
    }
}

impl<'a, 's, V: ElementValidator> XmlMatcher<'a, 's, V> {
    pub fn with_validator(
        machine: &'s StateMachine,
        xml: &'a str,
        validator: V,
    ) -> XmlMatcher<'a, 's, V> {
        let mut entities = HashMap::new();
        entities.insert("lt".to_string(), "<".to_string());
        entities.insert("gt".to_string(), ">".to_string());
        entities.insert("amp".to_string(), "&".to_string());
        entities.insert("apos".to_string(), "'".to_string());
        entities.insert("quot".to_string(), "\"".to_string());
        XmlMatcher {
            finder: PathFinder::with_validator(machine, validator),
            tokenizer: Tokenizer::from(xml),
            stack: ElementStack::default(),
            entities,
            text_buffer: String::new(),
            done: false,
        }
    }

    pub fn finder(&self) -> &PathFinder<'s, V> {
        &self.finder
    }

    pub fn into_finder(self) -> PathFinder<'s, V> {
        self.finder
    }

    /// Process the next token. `None` once the document is complete or a
    /// failure was reported.
    pub fn match_next(&mut self) -> Option<Result<(), MatchError<'a>>> {
        if self.done {
            return None;
        }
        match self.tokenizer.next() {
            Some(Ok(token)) => {
                let result = self.consume(token);
                if result.is_err() {
                    self.done = true;
                }
                Some(result)
            }
            Some(Err(err)) => {
                self.done = true;
                Some(Err(MatchError::Xml(err)))
            }
            None => {
                self.done = true;
                Some(
                    self.finder
                        .end_document()
                        .map_err(|error| MatchError::Path { error, span: None }),
                )
            }
        }
    }

    /// Run the document to completion.
    pub fn run(&mut self) -> Result<(), MatchError<'a>> {
        while let Some(step) = self.match_next() {
            step?;
        }
        Ok(())
    }

    fn consume(&mut self, token: Token<'a>) -> Result<(), MatchError<'a>> {
        match token {
            Token::Declaration { .. }
            | Token::DtdStart { .. }
            | Token::DtdEnd { .. }
            | Token::EmptyDtd { .. }
            | Token::Comment { .. } => Ok(()),
            // PIs may appear inside text content ("x<?pi?>y" is the text
            // "xy"); the buffer carries across them.
            Token::ProcessingInstruction { .. } => Ok(()),
            Token::EntityDeclaration {
                name, definition, ..
            } => match definition {
                EntityDefinition::EntityValue(value) => {
                    self.entities
                        .insert(name.as_str().to_string(), value.as_str().to_string());
                    Ok(())
                }
                EntityDefinition::ExternalId(_) => {
                    Err(MatchError::UnresolvedExternalEntity { span: name })
                }
            },
            Token::ElementStart { prefix, local, span } => {
                self.flush_text(Some(span))?;
                self.stack.push(prefix, local);
                Ok(())
            }
            Token::Attribute {
                prefix,
                local,
                value,
                ..
            } => {
                self.stack.add_attr(prefix, local, value);
                Ok(())
            }
            Token::ElementEnd { end, span } => match end {
                ElementEnd::Open => self.open_element(span),
                ElementEnd::Empty => {
                    self.open_element(span)?;
                    self.close_current(span)
                }
                ElementEnd::Close(prefix, local) => {
                    self.flush_text(Some(span))?;
                    let qname = self.stack.qname(prefix, local)?;
                    self.finder
                        .end_element(&qname)
                        .map_err(|error| MatchError::Path {
                            error,
                            span: Some(span),
                        })?;
                    self.stack.pop();
                    Ok(())
                }
            },
            Token::Text { text } => decode_text(&mut self.text_buffer, &self.entities, text),
            Token::Cdata { text, .. } => {
                self.text_buffer.push_str(text.as_str());
                Ok(())
            }
        }
    }

    fn open_element(&mut self, span: StrSpan<'a>) -> Result<(), MatchError<'a>> {
        for (prefix, uri) in self.stack.current_namespaces() {
            self.finder.start_prefix_mapping(&prefix, &uri);
        }
        let qname = self.stack.current_qname()?;
        let attrs = self.stack.current_attributes()?;
        self.finder
            .start_element(qname, &attrs)
            .map_err(|error| MatchError::Path {
                error,
                span: Some(span),
            })
    }

    fn close_current(&mut self, span: StrSpan<'a>) -> Result<(), MatchError<'a>> {
        let qname = self.stack.current_qname()?;
        self.finder
            .end_element(&qname)
            .map_err(|error| MatchError::Path {
                error,
                span: Some(span),
            })?;
        self.stack.pop();
        Ok(())
    }

    fn flush_text(&mut self, span: Option<StrSpan<'a>>) -> Result<(), MatchError<'a>> {
        if self.text_buffer.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.text_buffer);
        self.finder
            .characters(&text)
            .map_err(|error| MatchError::Path { error, span })
    }

    /// Render the failure as a span-labelled diagnostic over the source.
    pub fn diagnostic(
        &self,
        name: String,
        source: String,
        err: &MatchError,
    ) -> (codemap::CodeMap, Vec<codemap_diagnostic::Diagnostic>) {
        use codemap_diagnostic::{Diagnostic, Level, SpanLabel, SpanStyle};

        let mut map = codemap::CodeMap::new();
        let file = map.add_file(name, source);
        let mut diagnostics = Vec::new();
        match err {
            MatchError::Xml(e) => {
                diagnostics.push(Diagnostic {
                    level: Level::Error,
                    message: format!("{e}"),
                    code: None,
                    spans: vec![],
                });
            }
            MatchError::Path { error, span } => {
                let spans = match span {
                    Some(s) => vec![SpanLabel {
                        span: file.span.subspan(s.start() as u64, s.end() as u64),
                        label: Some("does not align with the schema".to_string()),
                        style: SpanStyle::Primary,
                    }],
                    None => vec![],
                };
                diagnostics.push(Diagnostic {
                    level: Level::Error,
                    message: format!("{error}"),
                    code: None,
                    spans,
                });
            }
            MatchError::UndefinedNamespacePrefix { prefix } => {
                diagnostics.push(Diagnostic {
                    level: Level::Error,
                    message: format!("the prefix {:?} is not defined", prefix.as_str()),
                    code: None,
                    spans: vec![SpanLabel {
                        span: file
                            .span
                            .subspan(prefix.start() as u64, prefix.end() as u64),
                        label: Some(format!(
                            "add an xmlns:{}=\"..\" attribute to define this prefix",
                            prefix.as_str()
                        )),
                        style: SpanStyle::Primary,
                    }],
                });
            }
            MatchError::UndefinedEntity { name, span } => {
                diagnostics.push(Diagnostic {
                    level: Level::Error,
                    message: format!("the entity &{name}; is not defined"),
                    code: None,
                    spans: vec![SpanLabel {
                        span: file.span.subspan(span.start as u64, span.end as u64),
                        label: Some("undefined".to_string()),
                        style: SpanStyle::Primary,
                    }],
                });
            }
            MatchError::InvalidOrUnclosedEntity { span } => {
                diagnostics.push(Diagnostic {
                    level: Level::Error,
                    message: "invalid or unclosed entity reference".to_string(),
                    code: None,
                    spans: vec![SpanLabel {
                        span: file.span.subspan(span.start as u64, span.end as u64),
                        label: None,
                        style: SpanStyle::Primary,
                    }],
                });
            }
            MatchError::UnresolvedExternalEntity { span } => {
                diagnostics.push(Diagnostic {
                    level: Level::Error,
                    message: "external entities are not resolved".to_string(),
                    code: None,
                    spans: vec![SpanLabel {
                        span: file.span.subspan(span.start() as u64, span.end() as u64),
                        label: None,
                        style: SpanStyle::Primary,
                    }],
                });
            }
        }
        (map, diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use xsdpath_model::{
        ContentKind, ElementDecl, Namespaces, Occurs, StateMachineBuilder, ValidationError,
    };

    fn namespaced_machine() -> StateMachine {
        let mut builder = StateMachineBuilder::new();
        let child = builder.element(
            ElementDecl::new(QName::new("urn:b", "child"), ContentKind::Simple),
            Occurs::once(),
        );
        let seq = builder.sequence(Occurs::once(), vec![child]);
        let root = builder.element_with_content(
            ElementDecl::new(QName::new("urn:a", "root"), ContentKind::ElementOnly),
            Occurs::once(),
            seq,
        );
        builder.build(root).unwrap()
    }

    #[test]
    fn prefixes_resolve_through_scopes() {
        let machine = namespaced_machine();
        let xml = "<a:root xmlns:a=\"urn:a\" xmlns:b=\"urn:b\"><b:child>x</b:child></a:root>";
        let mut matcher = XmlMatcher::new(&machine, xml);
        matcher.run().expect("namespaced document matches");
    }

    #[test]
    fn default_namespace_applies_to_elements() {
        let machine = namespaced_machine();
        let xml = "<root xmlns=\"urn:a\"><b:child xmlns:b=\"urn:b\">x</b:child></root>";
        let mut matcher = XmlMatcher::new(&machine, xml);
        matcher.run().expect("default namespace resolves");
    }

    #[test]
    fn wrong_namespace_is_path_not_found() {
        let machine = namespaced_machine();
        let xml = "<root xmlns=\"urn:wrong\"><child>x</child></root>";
        let mut matcher = XmlMatcher::new(&machine, xml);
        assert_matches!(
            matcher.run(),
            Err(MatchError::Path {
                error: FinderError::PathNotFound { .. },
                ..
            })
        );
    }

    #[test]
    fn undefined_prefix_is_reported() {
        let machine = namespaced_machine();
        let xml = "<a:root xmlns:a=\"urn:a\"><b:child>x</b:child></a:root>";
        let mut matcher = XmlMatcher::new(&machine, xml);
        assert_matches!(
            matcher.run(),
            Err(MatchError::UndefinedNamespacePrefix { .. })
        );
    }

    #[test]
    fn entities_decode_into_content() {
        let mut out = String::new();
        let mut entities = HashMap::new();
        entities.insert("amp".to_string(), "&".to_string());
        decode_text(&mut out, &entities, StrSpan::from("a&amp;b&#33;&#x21;"))
            .expect("entities decode");
        assert_eq!(out, "a&b!!");
    }

    #[test]
    fn undefined_entity_is_reported() {
        let mut out = String::new();
        let entities = HashMap::new();
        let err = decode_text(&mut out, &entities, StrSpan::from("x&nope;y"))
            .expect_err("undefined entity");
        assert_matches!(err, MatchError::UndefinedEntity { name: "nope", .. });
    }

    #[test]
    fn unclosed_entity_is_reported() {
        let mut out = String::new();
        let entities = HashMap::new();
        let err =
            decode_text(&mut out, &entities, StrSpan::from("x&brok")).expect_err("unclosed");
        assert_matches!(err, MatchError::InvalidOrUnclosedEntity { .. });
    }

    #[test]
    fn attributes_reach_the_validator_resolved() {
        struct ExpectAttr;
        impl ElementValidator for ExpectAttr {
            fn validate_attributes(
                &self,
                element: &ElementDecl,
                attrs: &[Attr],
                ns: &dyn Namespaces,
            ) -> Result<(), ValidationError> {
                if element.name.local != "root" {
                    return Ok(());
                }
                if attrs.len() != 1 {
                    return Err(ValidationError::new("expected exactly one attribute"));
                }
                let attr = &attrs[0];
                if attr.name != (QName { namespace: Some("urn:m".to_string()), local: "id".to_string() }) {
                    return Err(ValidationError::new("unexpected attribute name"));
                }
                if attr.value != "7" {
                    return Err(ValidationError::new("unexpected attribute value"));
                }
                if ns.resolve("m") != Some("urn:m") {
                    return Err(ValidationError::new("prefix registry incomplete"));
                }
                Ok(())
            }
            fn validate_content(
                &self,
                _element: &ElementDecl,
                _text: &str,
                _ns: &dyn Namespaces,
            ) -> Result<(), ValidationError> {
                Ok(())
            }
        }
        let machine = namespaced_machine();
        let xml = "<a:root xmlns:a=\"urn:a\" xmlns:b=\"urn:b\" xmlns:m=\"urn:m\" m:id=\"7\">\
                   <b:child>x</b:child></a:root>";
        let mut matcher = XmlMatcher::with_validator(&machine, xml, ExpectAttr);
        matcher.run().expect("attribute validation sees resolved names");
    }

    #[test]
    fn cdata_and_pi_splits_are_buffered_together() {
        let machine = namespaced_machine();
        let xml = "<a:root xmlns:a=\"urn:a\" xmlns:b=\"urn:b\">\
                   <b:child>he<?pi?><![CDATA[llo]]></b:child></a:root>";
        let mut matcher = XmlMatcher::new(&machine, xml);
        matcher.run().expect("split text content matches");
        // A single characters event was delivered for the whole run.
        let content_events = matcher
            .finder()
            .events()
            .iter()
            .filter(|e| e.kind == crate::EventKind::Content)
            .count();
        assert_eq!(content_events, 1);
    }
}
