// End-to-end coverage over a realistic purchase-order content model:
// nested groups, repetitions, optional positions, simple content, and a
// foreign-namespace extension point.

use assert_matches::assert_matches;
use xsdpath_finder::driver::{MatchError, XmlMatcher};
use xsdpath_finder::{Direction, FinderError};
use xsdpath_model::{
    ContentKind, ElementDecl, NamespaceRule, Occurs, QName, StateMachine, StateMachineBuilder,
};

/// purchaseOrder {
///   sequence {
///     shipTo { sequence { name, street, city } }
///     billTo { sequence { name, street, city } }?
///     comment*
///     items { sequence { item* } }
///     any{##other}?
///   }
/// }
/// item { sequence { productName, quantity, price, note? } }
fn purchase_order_machine() -> StateMachine {
    let mut b = StateMachineBuilder::new();

    let simple = |b: &mut StateMachineBuilder, name: &str, occurs: Occurs| {
        b.element(
            ElementDecl::new(QName::local(name), ContentKind::Simple),
            occurs,
        )
    };

    let address = |b: &mut StateMachineBuilder, name: &str, occurs: Occurs| {
        let n = simple(b, "name", Occurs::once());
        let street = simple(b, "street", Occurs::once());
        let city = simple(b, "city", Occurs::once());
        let seq = b.sequence(Occurs::once(), vec![n, street, city]);
        b.element_with_content(
            ElementDecl::new(QName::local(name), ContentKind::ElementOnly),
            occurs,
            seq,
        )
    };

    let ship_to = address(&mut b, "shipTo", Occurs::once());
    let bill_to = address(&mut b, "billTo", Occurs::optional());
    let comment = simple(&mut b, "comment", Occurs::at_least(0));

    let product_name = simple(&mut b, "productName", Occurs::once());
    let quantity = simple(&mut b, "quantity", Occurs::once());
    let price = simple(&mut b, "price", Occurs::once());
    let note = simple(&mut b, "note", Occurs::optional());
    let item_seq = b.sequence(Occurs::once(), vec![product_name, quantity, price, note]);
    let item = b.element_with_content(
        ElementDecl::new(QName::local("item"), ContentKind::ElementOnly),
        Occurs::at_least(0),
        item_seq,
    );
    let items_seq = b.sequence(Occurs::once(), vec![item]);
    let items = b.element_with_content(
        ElementDecl::new(QName::local("items"), ContentKind::ElementOnly),
        Occurs::once(),
        items_seq,
    );

    let extension = b.any(NamespaceRule::Other, Occurs::optional());

    let po_seq = b.sequence(
        Occurs::once(),
        vec![ship_to, bill_to, comment, items, extension],
    );
    let po = b.element_with_content(
        ElementDecl::new(QName::local("purchaseOrder"), ContentKind::ElementOnly),
        Occurs::once(),
        po_seq,
    );
    b.build(po).unwrap()
}

fn valid(xml: &str) -> Vec<xsdpath_finder::PathStep> {
    let machine = purchase_order_machine();
    let mut matcher = XmlMatcher::new(&machine, xml);
    if let Err(err) = matcher.run() {
        panic!("expected valid purchase order, got {err:?}");
    }
    matcher.finder().path().collect()
}

fn invalid(xml: &str) -> FinderError {
    let machine = purchase_order_machine();
    let mut matcher = XmlMatcher::new(&machine, xml);
    match matcher.run() {
        Ok(()) => panic!("invalid purchase order was accepted"),
        Err(MatchError::Path { error, .. }) => error,
        Err(other) => panic!("expected a path error, got {other:?}"),
    }
}

const FULL_ORDER: &str = "\
<purchaseOrder>\
  <shipTo><name>Alice</name><street>1 Main</street><city>Springfield</city></shipTo>\
  <billTo><name>Bob</name><street>2 High</street><city>Shelbyville</city></billTo>\
  <comment>rush order</comment>\
  <comment>fragile</comment>\
  <items>\
    <item><productName>Widget</productName><quantity>3</quantity><price>9.99</price></item>\
    <item><productName>Gadget</productName><quantity>1</quantity><price>19.99</price><note>gift</note></item>\
  </items>\
</purchaseOrder>";

#[test]
fn full_order_matches() {
    let path = valid(FULL_ORDER);
    assert!(!path.is_empty());
    // Two items were committed: the item position re-entered sideways.
    assert!(path
        .iter()
        .any(|s| s.direction == Direction::Sibling && s.iteration == 2));
}

#[test]
fn minimal_order_matches() {
    valid("<purchaseOrder><shipTo><name>A</name><street>S</street><city>C</city></shipTo><items/></purchaseOrder>");
}

#[test]
fn extension_point_takes_foreign_elements() {
    let xml = "<purchaseOrder>\
               <shipTo><name>A</name><street>S</street><city>C</city></shipTo>\
               <items/>\
               <x:audit xmlns:x=\"urn:ext\"><x:by>ops</x:by></x:audit>\
               </purchaseOrder>";
    valid(xml);
}

#[test]
fn extension_point_rejects_unqualified_elements() {
    let xml = "<purchaseOrder>\
               <shipTo><name>A</name><street>S</street><city>C</city></shipTo>\
               <items/>\
               <audit/>\
               </purchaseOrder>";
    assert_matches!(invalid(xml), FinderError::PathNotFound { qname, .. } if qname == QName::local("audit"));
}

#[test]
fn missing_ship_to_fails() {
    let xml = "<purchaseOrder><items/></purchaseOrder>";
    assert_matches!(invalid(xml), FinderError::PathNotFound { .. });
}

#[test]
fn out_of_order_positions_fail() {
    // items before shipTo violates the sequence.
    let xml = "<purchaseOrder><items/>\
               <shipTo><name>A</name><street>S</street><city>C</city></shipTo>\
               </purchaseOrder>";
    assert_matches!(invalid(xml), FinderError::PathNotFound { .. });
}

#[test]
fn incomplete_item_fails_on_close() {
    let xml = "<purchaseOrder>\
               <shipTo><name>A</name><street>S</street><city>C</city></shipTo>\
               <items><item><productName>W</productName></item></items>\
               </purchaseOrder>";
    assert_matches!(invalid(xml), FinderError::PathNotFound { .. });
}

#[test]
fn empty_quantity_is_missing_content() {
    let xml = "<purchaseOrder>\
               <shipTo><name>A</name><street>S</street><city>C</city></shipTo>\
               <items><item><productName>W</productName><quantity/><price>1</price></item></items>\
               </purchaseOrder>";
    assert_matches!(
        invalid(xml),
        FinderError::MissingContent { element, .. } if element == QName::local("quantity")
    );
}

#[test]
fn comments_may_repeat_or_be_absent() {
    valid(
        "<purchaseOrder><shipTo><name>A</name><street>S</street><city>C</city></shipTo>\
         <comment>a</comment><comment>b</comment><comment>c</comment><items/></purchaseOrder>",
    );
}

#[test]
fn path_dump_renders_every_step() {
    let machine = purchase_order_machine();
    let mut matcher = XmlMatcher::new(&machine, FULL_ORDER);
    matcher.run().expect("valid order");
    let mut out = Vec::new();
    matcher.finder().dump_path(&mut out).expect("dump succeeds");
    let text = String::from_utf8(out).expect("utf-8 dump");
    let steps = matcher.finder().path().count();
    assert_eq!(text.lines().count(), steps);
    assert!(text.contains("element purchaseOrder"));
    assert!(text.contains("sibling"));
}

#[test]
fn deterministic_across_runs() {
    let one = valid(FULL_ORDER);
    let two = valid(FULL_ORDER);
    assert_eq!(one, two);
}
