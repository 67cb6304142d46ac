//! Property suites: the engine against a non-versioned reference model,
//! plus the idempotence guarantees.

use std::collections::BTreeMap;

use proptest::prelude::*;
use strata_harness::{field0, key, row, single_pk_space};
use strata_index::IteratorType;
use strata_mvcc::{TxManager, TxnStatus};
use strata_types::{Psn, Value};

#[derive(Debug, Clone)]
enum Op {
    Replace(i64, i64),
    Delete(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..8, 0i64..100).prop_map(|(k, v)| Op::Replace(k, v)),
        (0i64..8).prop_map(Op::Delete),
    ]
}

fn engine_state(m: &mut TxManager, space: strata_types::SpaceId) -> BTreeMap<i64, i64> {
    let reader = m.begin();
    let tuples = m
        .select(Some(reader), space, 0, IteratorType::Ge, None)
        .unwrap();
    let out = tuples
        .iter()
        .map(|t| {
            let k = match t.field(0) {
                Some(Value::Int(v)) => *v,
                _ => unreachable!(),
            };
            let v = match t.field(1) {
                Some(Value::Int(v)) => *v,
                _ => unreachable!(),
            };
            (k, v)
        })
        .collect();
    m.rollback(reader).unwrap();
    out
}

proptest! {
    /// Any sequence of individually committed writes leaves every index
    /// in the state a plain map would be in — with and without the
    /// collector having caught up.
    #[test]
    fn prop_committed_history_matches_reference(ops in prop::collection::vec(op_strategy(), 0..48)) {
        let mut m = TxManager::new();
        let space = single_pk_space(&mut m, 1);
        let mut model: BTreeMap<i64, i64> = BTreeMap::new();

        for op in &ops {
            let tx = m.begin();
            match *op {
                Op::Replace(k, v) => {
                    m.replace(tx, space, row(&[k, v])).unwrap();
                    model.insert(k, v);
                }
                Op::Delete(k) => {
                    let deleted = m.delete(tx, space, &key(&[k])).unwrap();
                    prop_assert_eq!(deleted.is_some(), model.remove(&k).is_some());
                }
            }
            m.commit(tx).unwrap();
        }

        prop_assert_eq!(engine_state(&mut m, space), model.clone());

        // Collection changes nothing observable.
        for _ in 0..512 {
            m.story_gc_step();
        }
        prop_assert_eq!(engine_state(&mut m, space), model);
    }

    /// Uncommitted writes are invisible to other transactions and
    /// vanish without trace on rollback.
    #[test]
    fn prop_uncommitted_writes_are_invisible(
        committed in prop::collection::vec(op_strategy(), 0..16),
        pending in prop::collection::vec(op_strategy(), 1..16),
    ) {
        let mut m = TxManager::new();
        let space = single_pk_space(&mut m, 1);
        let mut model: BTreeMap<i64, i64> = BTreeMap::new();

        for op in &committed {
            let tx = m.begin();
            match *op {
                Op::Replace(k, v) => {
                    m.replace(tx, space, row(&[k, v])).unwrap();
                    model.insert(k, v);
                }
                Op::Delete(k) => {
                    m.delete(tx, space, &key(&[k])).unwrap();
                    model.remove(&k);
                }
            }
            m.commit(tx).unwrap();
        }

        let writer = m.begin();
        for op in &pending {
            match *op {
                Op::Replace(k, v) => {
                    m.replace(writer, space, row(&[k, v])).unwrap();
                }
                Op::Delete(k) => {
                    m.delete(writer, space, &key(&[k])).unwrap();
                }
            }
        }

        prop_assert_eq!(engine_state(&mut m, space), model.clone());
        m.rollback(writer).unwrap();
        for _ in 0..512 {
            m.story_gc_step();
        }
        prop_assert_eq!(engine_state(&mut m, space), model);
    }
}

#[test]
fn test_send_to_read_view_is_idempotent_at_same_or_higher_psn() {
    let mut m = TxManager::new();
    let tx = m.begin();
    m.send_to_read_view(tx, Psn::new(10));
    let before = m.read_view_psn(tx);
    m.send_to_read_view(tx, Psn::new(10));
    m.send_to_read_view(tx, Psn::new(11));
    assert_eq!(m.read_view_psn(tx), before);
    m.rollback(tx).unwrap();
}

#[test]
fn test_abort_with_conflict_applied_twice_equals_once() {
    let mut m = TxManager::new();
    let tx = m.begin();
    m.abort_with_conflict(tx);
    m.abort_with_conflict(tx);
    assert_eq!(m.transaction_status(tx), Some(TxnStatus::Aborted));
    m.rollback(tx).unwrap();
    assert_eq!(m.transaction_status(tx), None);
}

#[test]
fn test_select_after_mixed_history_sees_iterator_order() {
    let mut m = TxManager::new();
    let space = single_pk_space(&mut m, 1);
    for k in [5, 1, 3, 4, 2] {
        let tx = m.begin();
        m.insert(tx, space, row(&[k])).unwrap();
        m.commit(tx).unwrap();
    }
    let tx = m.begin();
    m.delete(tx, space, &key(&[3])).unwrap();
    m.commit(tx).unwrap();

    let reader = m.begin();
    let asc = m
        .select(Some(reader), space, 0, IteratorType::Ge, None)
        .unwrap();
    assert_eq!(field0(&asc), vec![1, 2, 4, 5]);
    let desc = m
        .select(Some(reader), space, 0, IteratorType::Le, None)
        .unwrap();
    assert_eq!(field0(&desc), vec![5, 4, 2, 1]);
    m.rollback(reader).unwrap();
}
