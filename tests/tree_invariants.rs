//! Merge invariants from the engine contract, exercised directly on
//! the tree with synthetic traces.

use std::sync::Arc;

use fuzzx_dsa::{BranchTree, Coverage};
use fuzzx_io::{InputType, LocationId, Predicate, StdinRecord, Termination, TraceRecord};

fn rec(id: u32, direction: bool, value: f64) -> TraceRecord {
    TraceRecord {
        loc: LocationId::flat(id),
        direction,
        value,
        num_stdin_bytes: 1,
        xor_like: false,
        predicate: Predicate::Less,
    }
}

fn stdin(bytes: &[u8]) -> Arc<StdinRecord> {
    Arc::new(StdinRecord::from_bytes(
        bytes,
        vec![InputType::U8; bytes.len()],
    ))
}

#[test]
fn best_summary_value_is_monotone_under_merge() {
    let mut tree = BranchTree::new();
    let mut coverage = Coverage::new();

    let values = [9.0, 5.0, 7.0, 2.0, 4.0, 2.5];
    let mut previous = f64::INFINITY;
    for (i, &v) in values.iter().enumerate() {
        let trace = Arc::new(vec![rec(1, false, v), rec(2, true, 1.0)]);
        tree.merge(&trace, &stdin(&[i as u8]), Termination::Normal, i as u32, &mut coverage)
            .unwrap();
        let root = tree.root().unwrap();
        let summary = tree.node(root).best_summary_value;
        assert!(summary <= previous);
        previous = summary;
    }
    // The witness matched the best |value| seen.
    let root = tree.root().unwrap();
    assert_eq!(tree.node(root).best_coverage_value, 2.0);
}

#[test]
fn covered_and_uncovered_stay_disjoint() {
    let mut tree = BranchTree::new();
    let mut coverage = Coverage::new();

    let traces = [
        vec![rec(1, false, 1.0), rec(2, false, 1.0)],
        vec![rec(1, false, 1.0), rec(2, true, -1.0), rec(3, true, 2.0)],
        vec![rec(1, true, -1.0)],
        vec![rec(1, false, 1.0), rec(2, true, -1.0), rec(3, false, -2.0)],
    ];
    for (i, t) in traces.iter().enumerate() {
        tree.merge(
            &Arc::new(t.clone()),
            &stdin(&[i as u8]),
            Termination::Normal,
            i as u32,
            &mut coverage,
        )
        .unwrap();
        for (loc, _) in &coverage.uncovered {
            assert!(!coverage.covered.contains(loc));
        }
    }
    assert!(coverage.covered.contains(&LocationId::flat(1)));
    assert!(coverage.covered.contains(&LocationId::flat(2)));
    assert!(coverage.covered.contains(&LocationId::flat(3)));
    assert!(coverage.uncovered.is_empty());
}

#[test]
fn closed_nodes_reopen_only_through_an_explicit_reset() {
    let mut tree = BranchTree::new();
    let mut coverage = Coverage::new();
    let trace = Arc::new(vec![rec(1, false, 1.0)]);
    tree.merge(&trace, &stdin(&[0]), Termination::Normal, 0, &mut coverage)
        .unwrap();
    let root = tree.root().unwrap();

    // Latching sensitivity with no findings drains the node.
    {
        let n = tree.node_mut(root);
        n.sensitivity_performed = true;
        n.minimization_performed = true;
        n.minimization_start_execution = 0;
    }
    tree.update_close_flags_from(root);
    assert!(tree.node(root).closed);

    // A later, better witness re-arms it through the explicit reset.
    tree.node_mut(root).best_value_execution = 5;
    tree.node_mut(root).reset_analyses();
    let n = tree.node(root);
    assert!(!n.closed);
    assert!(!n.sensitivity_performed);
    assert_eq!(n.num_coverage_failure_resets, 1);
}
