//! Shared fixtures for the strata end-to-end suites.

use strata_index::{IndexDef, IndexKey};
use strata_mvcc::TxManager;
use strata_types::{SpaceId, Tuple, Value};

/// A tuple of integer fields.
pub fn row(vals: &[i64]) -> Tuple {
    Tuple::new(vals.iter().map(|&v| Value::Int(v)).collect::<Vec<_>>())
}

/// A tuple with an integer key and a string payload.
pub fn labeled(pk: i64, label: &str) -> Tuple {
    Tuple::new(vec![Value::Int(pk), Value::Str(label.to_string())])
}

/// An integer search key.
pub fn key(vals: &[i64]) -> IndexKey {
    vals.iter().map(|&v| Value::Int(v)).collect()
}

/// A space with a single ordered primary index on field 0.
pub fn single_pk_space(m: &mut TxManager, id: u32) -> SpaceId {
    let sid = SpaceId::new(id);
    m.create_space(sid, format!("test_{id}"), vec![IndexDef::tree("pk", [0], true)])
        .expect("space definition is valid");
    sid
}

/// A space with an ordered primary index on field 0 and a secondary
/// ordered index on field 1.
pub fn pk_sk_space(m: &mut TxManager, id: u32, sk_unique: bool) -> SpaceId {
    let sid = SpaceId::new(id);
    m.create_space(
        sid,
        format!("test_{id}"),
        vec![
            IndexDef::tree("pk", [0], true),
            IndexDef::tree("sk", [1], sk_unique),
        ],
    )
    .expect("space definition is valid");
    sid
}

/// A space with an unordered (hash) primary index on field 0.
pub fn hash_pk_space(m: &mut TxManager, id: u32) -> SpaceId {
    let sid = SpaceId::new(id);
    m.create_space(sid, format!("test_{id}"), vec![IndexDef::hash("pk", [0])])
        .expect("space definition is valid");
    sid
}

/// Insert every row in one committed transaction.
pub fn seed(m: &mut TxManager, space: SpaceId, rows: &[&[i64]]) {
    let tx = m.begin();
    for vals in rows {
        m.insert(tx, space, row(vals)).expect("seed row inserts");
    }
    m.commit(tx).expect("seed commits");
}

/// Extract field 0 of every tuple as an integer, for compact asserts.
pub fn field0(tuples: &[Tuple]) -> Vec<i64> {
    tuples
        .iter()
        .map(|t| match t.field(0) {
            Some(Value::Int(v)) => *v,
            other => panic!("field 0 is not an integer: {other:?}"),
        })
        .collect()
}
