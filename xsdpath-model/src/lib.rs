//! Precompiled XML Schema content-model state machine.
//!
//! A schema walker (not part of this workspace) lowers element declarations
//! and their compositors into a graph of [`StateNode`]s held in a
//! [`StateMachine`]. The machine is immutable once built and may be shared
//! by any number of matcher instances. Construction goes through
//! [`StateMachineBuilder`], which supports recursive content models by
//! letting an element's content edge be attached after the element itself
//! was created.

use std::fmt;

pub mod checks;

pub use checks::ModelError;

/// Sentinel for an unbounded `maxOccurs`.
pub const UNBOUNDED: usize = usize::MAX;

/// A namespace-qualified name.
///
/// `namespace: None` means "no namespace" (an unqualified name), which is
/// distinct from any namespace URI including the empty string.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct QName {
    pub namespace: Option<String>,
    pub local: String,
}

impl QName {
    pub fn local(name: &str) -> QName {
        QName {
            namespace: None,
            local: name.to_string(),
        }
    }

    pub fn new(namespace: &str, local: &str) -> QName {
        QName {
            namespace: Some(namespace.to_string()),
            local: local.to_string(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{{{}}}{}", ns, self.local),
            None => f.write_str(&self.local),
        }
    }
}

/// Occurrence bounds of a particle.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Occurs {
    pub min: usize,
    pub max: usize,
}

impl Occurs {
    pub fn new(min: usize, max: usize) -> Occurs {
        Occurs { min, max }
    }

    /// `minOccurs="1" maxOccurs="1"`, the schema default.
    pub fn once() -> Occurs {
        Occurs { min: 1, max: 1 }
    }

    /// `minOccurs="0" maxOccurs="1"`.
    pub fn optional() -> Occurs {
        Occurs { min: 0, max: 1 }
    }

    /// `minOccurs=min maxOccurs="unbounded"`.
    pub fn at_least(min: usize) -> Occurs {
        Occurs {
            min,
            max: UNBOUNDED,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max == UNBOUNDED
    }
}

/// How an element's type consumes character content.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ContentKind {
    /// No character or element content permitted.
    Empty,
    /// Simple-typed: character content only.
    Simple,
    /// Child elements only; non-whitespace text is an error.
    ElementOnly,
    /// Child elements interleaved with character content.
    Mixed,
}

impl ContentKind {
    /// Whether character content belongs to the element's value space.
    pub fn expects_content(&self) -> bool {
        matches!(self, ContentKind::Simple | ContentKind::Mixed)
    }
}

/// Metadata of an element declaration carried on ELEMENT states.
#[derive(Clone, Debug)]
pub struct ElementDecl {
    pub name: QName,
    pub content: ContentKind,
    pub nillable: bool,
    pub default_value: Option<String>,
    pub fixed_value: Option<String>,
}

impl ElementDecl {
    pub fn new(name: QName, content: ContentKind) -> ElementDecl {
        ElementDecl {
            name,
            content,
            nillable: false,
            default_value: None,
            fixed_value: None,
        }
    }

    pub fn nillable(mut self) -> ElementDecl {
        self.nillable = true;
        self
    }

    pub fn with_default(mut self, value: &str) -> ElementDecl {
        self.default_value = Some(value.to_string());
        self
    }

    pub fn with_fixed(mut self, value: &str) -> ElementDecl {
        self.fixed_value = Some(value.to_string());
        self
    }

    /// True when absence of character content is tolerable: the element is
    /// nillable or a default/fixed value would fill it in.
    pub fn content_defaultable(&self) -> bool {
        self.nillable || self.default_value.is_some() || self.fixed_value.is_some()
    }
}

/// One alternative inside an explicit wildcard namespace list.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NamespaceConstraint {
    /// `##targetNamespace`
    TargetNamespace,
    /// `##local` — names with no namespace.
    Local,
    /// A literal namespace URI.
    Uri(String),
}

/// The namespace rule of a wildcard (`xs:any`).
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NamespaceRule {
    /// `##any`
    Any,
    /// `##other` — any namespace except the target namespace (and except
    /// no-namespace).
    Other,
    /// An explicit list of admitted namespaces.
    List(Vec<NamespaceConstraint>),
}

impl NamespaceRule {
    /// Whether an element in namespace `ns` is admitted. `target` is the
    /// target namespace the wildcard is evaluated against; callers without
    /// the originating schema pass the namespace of the innermost open
    /// element as a stand-in.
    pub fn accepts(&self, ns: Option<&str>, target: Option<&str>) -> bool {
        match self {
            NamespaceRule::Any => true,
            NamespaceRule::Other => match ns {
                None => false,
                Some(ns) => target != Some(ns),
            },
            NamespaceRule::List(items) => items.iter().any(|item| match item {
                NamespaceConstraint::TargetNamespace => ns.is_some() && ns == target,
                NamespaceConstraint::Local => ns.is_none(),
                NamespaceConstraint::Uri(uri) => ns == Some(uri.as_str()),
            }),
        }
    }
}

/// Discriminant payload of a state-machine node.
#[derive(Clone, Debug)]
pub enum StateKind {
    Element(ElementDecl),
    Any(NamespaceRule),
    Sequence,
    All,
    Choice,
    /// A head element and its substitutes, modelled as a compositor whose
    /// children are all ELEMENT states.
    SubstitutionGroup,
}

impl StateKind {
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            StateKind::Sequence
                | StateKind::All
                | StateKind::Choice
                | StateKind::SubstitutionGroup
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            StateKind::Element(_) => "element",
            StateKind::Any(_) => "any",
            StateKind::Sequence => "sequence",
            StateKind::All => "all",
            StateKind::Choice => "choice",
            StateKind::SubstitutionGroup => "substitution-group",
        }
    }
}

/// Index of a node within its [`StateMachine`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct StateId(pub(crate) u32);

impl StateId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A single content-model particle: an element, a wildcard, or a compositor
/// over the ordered successor states in `next`.
#[derive(Clone, Debug)]
pub struct StateNode {
    kind: StateKind,
    occurs: Occurs,
    next: Vec<StateId>,
}

impl StateNode {
    pub fn kind(&self) -> &StateKind {
        &self.kind
    }

    pub fn occurs(&self) -> Occurs {
        self.occurs
    }

    pub fn min_occurs(&self) -> usize {
        self.occurs.min
    }

    pub fn max_occurs(&self) -> usize {
        self.occurs.max
    }

    /// Successor states: the compositor children, or the single content
    /// model edge of an ELEMENT (empty for simple/empty content and for
    /// wildcards).
    pub fn next(&self) -> &[StateId] {
        &self.next
    }

    pub fn element(&self) -> Option<&ElementDecl> {
        match &self.kind {
            StateKind::Element(decl) => Some(decl),
            _ => None,
        }
    }

    pub fn wildcard(&self) -> Option<&NamespaceRule> {
        match &self.kind {
            StateKind::Any(rule) => Some(rule),
            _ => None,
        }
    }
}

/// The immutable content-model graph. Nodes live in an arena and refer to
/// each other by [`StateId`]; recursive content models are ordinary cycles
/// through element content edges.
#[derive(Clone, Debug)]
pub struct StateMachine {
    nodes: Vec<StateNode>,
    start: StateId,
}

impl StateMachine {
    pub fn node(&self, id: StateId) -> &StateNode {
        &self.nodes[id.index()]
    }

    pub fn start(&self) -> StateId {
        self.start
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Short human-readable label for diagnostics.
    pub fn describe(&self, id: StateId) -> String {
        let node = self.node(id);
        match &node.kind {
            StateKind::Element(decl) => format!("element {}", decl.name),
            StateKind::Any(_) => "any".to_string(),
            other => other.name().to_string(),
        }
    }
}

/// Builds a [`StateMachine`] bottom-up.
///
/// Compositors take their children at creation. Elements are created
/// without a content edge and may receive one later through
/// [`set_content`](StateMachineBuilder::set_content), which is what makes
/// recursive content models expressible:
///
/// ```
/// use xsdpath_model::*;
///
/// let mut b = StateMachineBuilder::new();
/// let item = b.element(
///     ElementDecl::new(QName::local("item"), ContentKind::ElementOnly),
///     Occurs::once(),
/// );
/// let nested = b.sequence(Occurs::optional(), vec![item]);
/// b.set_content(item, nested); // item contains item?
/// let machine = b.build(item).unwrap();
/// assert_eq!(machine.start(), item);
/// ```
#[derive(Default)]
pub struct StateMachineBuilder {
    nodes: Vec<StateNode>,
}

impl StateMachineBuilder {
    pub fn new() -> StateMachineBuilder {
        StateMachineBuilder::default()
    }

    fn push(&mut self, kind: StateKind, occurs: Occurs, next: Vec<StateId>) -> StateId {
        let id = StateId(self.nodes.len() as u32);
        self.nodes.push(StateNode { kind, occurs, next });
        id
    }

    /// An element state with no content edge yet (simple or empty content,
    /// or content attached later via [`set_content`](Self::set_content)).
    pub fn element(&mut self, decl: ElementDecl, occurs: Occurs) -> StateId {
        self.push(StateKind::Element(decl), occurs, Vec::new())
    }

    /// An element state with its content model attached immediately.
    pub fn element_with_content(
        &mut self,
        decl: ElementDecl,
        occurs: Occurs,
        content: StateId,
    ) -> StateId {
        self.push(StateKind::Element(decl), occurs, vec![content])
    }

    /// Attach (or replace) the content edge of an element created earlier.
    pub fn set_content(&mut self, element: StateId, content: StateId) {
        let node = &mut self.nodes[element.index()];
        node.next.clear();
        node.next.push(content);
    }

    pub fn any(&mut self, rule: NamespaceRule, occurs: Occurs) -> StateId {
        self.push(StateKind::Any(rule), occurs, Vec::new())
    }

    pub fn sequence(&mut self, occurs: Occurs, children: Vec<StateId>) -> StateId {
        self.push(StateKind::Sequence, occurs, children)
    }

    pub fn all(&mut self, occurs: Occurs, children: Vec<StateId>) -> StateId {
        self.push(StateKind::All, occurs, children)
    }

    pub fn choice(&mut self, occurs: Occurs, children: Vec<StateId>) -> StateId {
        self.push(StateKind::Choice, occurs, children)
    }

    /// The head element and its substitutes, head first.
    pub fn substitution_group(&mut self, occurs: Occurs, members: Vec<StateId>) -> StateId {
        self.push(StateKind::SubstitutionGroup, occurs, members)
    }

    /// Run the consistency checks and freeze the machine.
    pub fn build(self, start: StateId) -> Result<StateMachine, ModelError> {
        let machine = StateMachine {
            nodes: self.nodes,
            start,
        };
        checks::check_machine(&machine)?;
        Ok(machine)
    }
}

/// Prefix-to-URI resolution, as needed by validators for qname-typed
/// lexical values.
pub trait Namespaces {
    fn resolve(&self, prefix: &str) -> Option<&str>;
}

/// Append-only registry of prefix mappings fed from `startPrefixMapping`
/// events. Later mappings shadow earlier ones for the same prefix; nothing
/// is ever removed, since the matcher only consults it at the point of use.
#[derive(Default, Debug)]
pub struct NamespaceContext {
    mappings: Vec<(String, String)>,
}

impl NamespaceContext {
    pub fn new() -> NamespaceContext {
        NamespaceContext::default()
    }

    pub fn declare(&mut self, prefix: &str, uri: &str) {
        self.mappings.push((prefix.to_string(), uri.to_string()));
    }
}

impl Namespaces for NamespaceContext {
    fn resolve(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some("http://www.w3.org/XML/1998/namespace");
        }
        self.mappings
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }
}

/// A resolved attribute as delivered with a start-element event.
#[derive(Clone, Debug)]
pub struct Attr {
    pub name: QName,
    pub value: String,
}

/// Failure reported by an [`ElementValidator`].
#[derive(Debug)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> ValidationError {
        ValidationError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

/// External checker for attributes and simple-typed character content.
/// The path finder delegates lexical validation here and surfaces failures
/// as content-invalid errors.
pub trait ElementValidator {
    fn validate_attributes(
        &self,
        element: &ElementDecl,
        attrs: &[Attr],
        ns: &dyn Namespaces,
    ) -> Result<(), ValidationError>;

    fn validate_content(
        &self,
        element: &ElementDecl,
        text: &str,
        ns: &dyn Namespaces,
    ) -> Result<(), ValidationError>;
}

/// Validator that accepts everything; useful when only the structural
/// alignment is of interest.
#[derive(Default, Clone, Copy, Debug)]
pub struct AcceptingValidator;

impl ElementValidator for AcceptingValidator {
    fn validate_attributes(
        &self,
        _element: &ElementDecl,
        _attrs: &[Attr],
        _ns: &dyn Namespaces,
    ) -> Result<(), ValidationError> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_display() {
        assert_eq!(QName::local("a").to_string(), "a");
        assert_eq!(QName::new("urn:x", "a").to_string(), "{urn:x}a");
    }

    #[test]
    fn wildcard_any_accepts_everything() {
        let rule = NamespaceRule::Any;
        assert!(rule.accepts(None, None));
        assert!(rule.accepts(Some("urn:x"), Some("urn:y")));
    }

    #[test]
    fn wildcard_other_excludes_target_and_local() {
        let rule = NamespaceRule::Other;
        assert!(!rule.accepts(None, Some("urn:t")));
        assert!(!rule.accepts(Some("urn:t"), Some("urn:t")));
        assert!(rule.accepts(Some("urn:x"), Some("urn:t")));
        assert!(rule.accepts(Some("urn:x"), None));
    }

    #[test]
    fn wildcard_list() {
        let rule = NamespaceRule::List(vec![
            NamespaceConstraint::TargetNamespace,
            NamespaceConstraint::Local,
            NamespaceConstraint::Uri("urn:a".to_string()),
        ]);
        assert!(rule.accepts(Some("urn:t"), Some("urn:t")));
        assert!(rule.accepts(None, Some("urn:t")));
        assert!(rule.accepts(Some("urn:a"), Some("urn:t")));
        assert!(!rule.accepts(Some("urn:b"), Some("urn:t")));
    }

    #[test]
    fn namespace_context_shadows() {
        let mut ctx = NamespaceContext::new();
        ctx.declare("p", "urn:one");
        ctx.declare("p", "urn:two");
        assert_eq!(ctx.resolve("p"), Some("urn:two"));
        assert_eq!(ctx.resolve("q"), None);
        assert_eq!(
            ctx.resolve("xml"),
            Some("http://www.w3.org/XML/1998/namespace")
        );
    }

    #[test]
    fn recursive_content_model_builds() {
        let mut b = StateMachineBuilder::new();
        let item = b.element(
            ElementDecl::new(QName::local("item"), ContentKind::ElementOnly),
            Occurs::once(),
        );
        let inner = b.sequence(Occurs::optional(), vec![item]);
        b.set_content(item, inner);
        let machine = b.build(item).unwrap();
        assert_eq!(machine.node(item).next(), &[inner]);
        assert_eq!(machine.node(inner).next(), &[item]);
    }
}
