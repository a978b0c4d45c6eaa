use weft_types::EntryId;

use super::{id, node_id, put, test_key};
use crate::entry::{LogEntry, Operation};

#[test]
fn test_new_entry_verifies() {
    let entry = put("orders", 1, "order-1", "shipped", &[]);
    assert!(entry.verify_signature());
    assert_eq!(entry.author, node_id(1));
    assert_eq!(entry.clock, 1);
    assert!(entry.predecessors.is_empty());
}

#[test]
fn test_tampered_value_fails_verification() {
    let mut entry = put("orders", 1, "order-1", "shipped", &[]);
    entry.op = Operation::Put {
        key: "order-1".into(),
        value: b"lost".to_vec(),
    };
    assert!(!entry.verify_signature());
}

#[test]
fn test_tampered_clock_fails_verification() {
    let mut entry = put("orders", 1, "order-1", "shipped", &[]);
    entry.clock = 99;
    assert!(!entry.verify_signature());
}

#[test]
fn test_wrong_author_fails_verification() {
    let mut entry = put("orders", 1, "order-1", "shipped", &[]);
    entry.author = node_id(2);
    assert!(!entry.verify_signature());
}

#[test]
fn test_same_content_same_id() {
    let a = put("orders", 1, "k", "v", &[]);
    let b = put("orders", 1, "k", "v", &[]);
    assert_eq!(a, b);
    assert_eq!(id(&a), id(&b));
}

#[test]
fn test_id_is_hash_of_encoding() {
    let entry = put("orders", 1, "k", "v", &[]);
    let bytes = entry.encode().unwrap();
    assert_eq!(id(&entry), EntryId::from_data(&bytes));
    assert_eq!(LogEntry::decode(&bytes).unwrap(), entry);
}

#[test]
fn test_different_author_different_id() {
    let a = put("orders", 1, "k", "v", &[]);
    let b = put("orders", 2, "k", "v", &[]);
    assert_ne!(id(&a), id(&b));
}

#[test]
fn test_different_db_different_id() {
    let a = put("orders", 1, "k", "v", &[]);
    let b = put("invoices", 1, "k", "v", &[]);
    assert_ne!(id(&a), id(&b));
}

#[test]
fn test_predecessors_sorted_and_deduplicated() {
    let x = EntryId::from_data(b"x");
    let y = EntryId::from_data(b"y");
    let entry = LogEntry::new_signed(
        "orders",
        Operation::Delete { key: "k".into() },
        vec![y, x, y, x],
        2,
        &test_key(1),
    )
    .unwrap();

    let mut expected = vec![x, y];
    expected.sort();
    assert_eq!(entry.predecessors, expected);
    assert!(entry.verify_signature());
}

#[test]
fn test_garbage_does_not_decode() {
    assert!(LogEntry::decode(&[0xff; 3]).is_err());
}

#[test]
fn test_operation_accessors() {
    let put = Operation::Put {
        key: "k".into(),
        value: b"v".to_vec(),
    };
    let del = Operation::Delete { key: "k".into() };
    assert_eq!(put.key(), "k");
    assert_eq!(put.value(), Some(&b"v"[..]));
    assert_eq!(del.key(), "k");
    assert_eq!(del.value(), None);
}
