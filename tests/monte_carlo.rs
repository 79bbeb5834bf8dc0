//! The iid explorer in isolation: pivots harvested from a hand-built
//! tree, probability streaks, and the forward walk.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use fuzzx_dsa::{BranchTree, Coverage};
use fuzzx_io::{InputType, LocationId, Predicate, StdinRecord, Termination, TraceRecord};
use fuzzx_mc::{select_iid_coverage_target, IidPivots, ProbabilityGenerator};

fn rec(id: u32, direction: bool, value: f64, bytes: u32) -> TraceRecord {
    TraceRecord {
        loc: LocationId::flat(id),
        direction,
        value,
        num_stdin_bytes: bytes,
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
fn all_then_all_generator_emits_full_streaks() {
    let mut rng = SmallRng::seed_from_u64(1);
    let mut generator = ProbabilityGenerator::all_then_all(0.5, 4, false);
    let stream: Vec<f32> = (0..8).map(|_| generator.next(&mut rng)).collect();
    // Two false draws, two true draws, then the streaks repeat.
    assert_eq!(stream, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn forward_walk_lands_on_an_open_branching() {
    let mut tree = BranchTree::new();
    let mut coverage = Coverage::new();

    // Two traces sharing a prefix; node C keeps an unexplored side.
    let t1 = Arc::new(vec![rec(1, false, 2.0, 1), rec(2, false, 3.0, 2)]);
    tree.merge(&t1, &stdin(&[7, 7]), Termination::Normal, 0, &mut coverage)
        .unwrap();
    let t2 = Arc::new(vec![
        rec(1, false, 2.0, 1),
        rec(2, true, 1.0, 2),
        rec(3, false, 5.0, 3),
    ]);
    let delta = tree
        .merge(&t2, &stdin(&[7, 9, 1]), Termination::Normal, 1, &mut coverage)
        .unwrap();
    let node_c = delta.leaf.unwrap();

    // Latch the two upper branchings as iid.
    let root = tree.root().unwrap();
    let node_b = tree.node(root).successor(false).child().unwrap();
    for id in [root, node_b] {
        tree.node_mut(id).sensitivity_performed = true;
    }

    let mut pivots = IidPivots::new();
    let changed: HashSet<_> = [root, node_b].into_iter().collect();
    pivots.collect_from_sensitivity(&tree, &changed, |_| false, node_b);
    assert!(!pivots.is_empty());

    let mut rng_location = SmallRng::seed_from_u64(2);
    let mut rng_generators = SmallRng::seed_from_u64(3);
    let winner = select_iid_coverage_target(
        &tree,
        &mut pivots,
        3,
        &mut rng_location,
        &mut rng_generators,
    )
    .expect("an open branching is reachable");

    // The walk cannot stop inside the iid prefix; it lands on the
    // open frontier node.
    assert_eq!(winner, node_c);
    assert!(tree.node(winner).is_open_branching());
}

#[test]
fn covered_locations_lose_their_pivots() {
    let mut tree = BranchTree::new();
    let mut coverage = Coverage::new();
    let t1 = Arc::new(vec![rec(1, false, 2.0, 1)]);
    tree.merge(&t1, &stdin(&[7]), Termination::Normal, 0, &mut coverage)
        .unwrap();
    let root = tree.root().unwrap();
    tree.node_mut(root).sensitivity_performed = true;

    let mut pivots = IidPivots::new();
    let changed: HashSet<_> = [root].into_iter().collect();
    pivots.collect_from_sensitivity(&tree, &changed, |_| false, root);
    assert_eq!(pivots.len(), 1);

    pivots.drop_covered(|loc| loc == LocationId::flat(1));
    assert!(pivots.is_empty());
}
