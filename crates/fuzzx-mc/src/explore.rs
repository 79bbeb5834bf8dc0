use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::Rng;

use fuzzx_dsa::{BranchTree, NodeId};
use fuzzx_io::width::distance_to_central_class;
use fuzzx_io::LocationId;

use crate::histogram::{total_hits, HitCountFrame, HitCounts};
use crate::pivots::IidPivots;

const LIMIT_STEP: f32 = 0.75;

/// Per-location stream of direction-deciding probabilities.
///
/// Inside pure loop bodies an all-then-all generator emits one full
/// streak of each direction sized by the observed hit counts, which
/// exercises loop edges a uniform stream rarely reaches.
#[derive(Debug)]
pub enum ProbabilityGenerator {
    Uniform,
    AllThenAll {
        samples_total: [u32; 2],
        samples_consumed: [u32; 2],
        direction: bool,
    },
}

impl ProbabilityGenerator {
    pub fn all_then_all(false_probability: f32, total_samples: u32, first_direction: bool) -> Self {
        let total = total_samples.max(1);
        let false_samples = (false_probability * total as f32 + 0.5) as u32;
        ProbabilityGenerator::AllThenAll {
            samples_total: [false_samples, total - false_samples],
            samples_consumed: [0, 0],
            direction: first_direction,
        }
    }

    pub fn next(&mut self, rng: &mut SmallRng) -> f32 {
        match self {
            ProbabilityGenerator::Uniform => rng.gen_range(0.0..1.0),
            ProbabilityGenerator::AllThenAll {
                samples_total,
                samples_consumed,
                direction,
            } => loop {
                let index = *direction as usize;
                if samples_consumed[index] < samples_total[index] {
                    samples_consumed[index] += 1;
                    return if *direction { 1.0 } else { 0.0 };
                }
                samples_consumed[index] = 0;
                *direction = !*direction;
            },
        }
    }
}

/// Geometric bias over a sorted candidate list: each step keeps
/// probability `LIMIT_STEP` of stopping at the current index.
fn limit_step_index(len: usize, probability: f32, limit_step: f32) -> usize {
    let mut i = 0;
    let mut limit = limit_step;
    while i + 1 < len && probability > limit {
        limit += limit_step * (1.0 - limit);
        i += 1;
    }
    i
}

/// Picks a pivot favouring small |best value| and central input
/// width.
fn select_best_iid_pivot(
    tree: &BranchTree,
    pivots: &[NodeId],
    max_input_width: u32,
    rng: &mut SmallRng,
) -> NodeId {
    let mut order: Vec<NodeId> = pivots.to_vec();
    order.sort_by(|&a, &b| {
        let na = tree.node(a);
        let nb = tree.node(b);
        na.best_coverage_value
            .abs()
            .total_cmp(&nb.best_coverage_value.abs())
            .then_with(|| {
                distance_to_central_class(na.num_stdin_bytes, max_input_width)
                    .cmp(&distance_to_central_class(nb.num_stdin_bytes, max_input_width))
            })
            .then_with(|| na.num_stdin_bytes.cmp(&nb.num_stdin_bytes))
            .then_with(|| na.trace_index.cmp(&nb.trace_index))
    });
    let probability = rng.gen_range(0.0..1.0);
    order[limit_step_index(order.len(), probability, LIMIT_STEP)]
}

/// Estimates, per location, the probability of taking the false
/// direction at the target input width. Estimates from pivots with
/// larger |best value| are extrapolated towards the best pivot.
fn compute_false_direction_histogram(
    tree: &BranchTree,
    input_width: u32,
    pure_loop_bodies: &HashSet<LocationId>,
    pivots: &HashMap<NodeId, crate::pivots::IidPivotProps>,
) -> HashMap<u32, f32> {
    let mut hist_pack: HashMap<u32, Vec<(f64, f32)>> = HashMap::new();
    let mut processed: HashSet<*const HitCountFrame> = HashSet::new();

    for (&pivot, props) in pivots {
        if tree.node(pivot).num_stdin_bytes != input_width {
            continue;
        }
        let abs_value = tree.node(pivot).best_coverage_value.abs();
        let mut frame = props.histogram.clone();
        while let Some(f) = frame {
            if !processed.insert(Arc::as_ptr(&f)) {
                break;
            }
            for (&id, &counts) in f.local() {
                let total = total_hits(&counts);
                if total == 0 {
                    continue;
                }
                let false_probability = counts[0] as f64 / total as f64;
                hist_pack
                    .entry(id)
                    .or_default()
                    .push((abs_value, false_probability as f32));
            }
            frame = f.predecessor().cloned();
        }
    }

    let mut histogram = HashMap::new();
    for (id, mut pack) in hist_pack {
        pack.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (best_value, best_probability) = pack[0];
        let mut probabilities: Vec<f32> = Vec::new();
        for &(value, probability) in pack.iter().rev() {
            if (best_value - value).abs() >= 1e-6 {
                let t = (-value / (best_value - value)) as f32;
                let raw = probability + t * (best_probability - probability);
                probabilities.push(raw.clamp(0.0, 1.0));
            }
        }
        if probabilities.is_empty() {
            probabilities.push(best_probability);
            if pure_loop_bodies.iter().any(|loc| loc.id == id) {
                probabilities.push(0.5);
            }
        }
        let avg = probabilities.iter().sum::<f32>() / probabilities.len() as f32;
        histogram.insert(id, avg);
    }
    histogram
}

fn compute_generators(
    histogram: &HashMap<u32, f32>,
    hit_counts: &HitCounts,
    pure_loop_bodies: &HashSet<LocationId>,
    rng_selection: &mut SmallRng,
) -> HashMap<u32, ProbabilityGenerator> {
    let mut generators = HashMap::new();
    for (&id, &probability) in histogram {
        let generator = if pure_loop_bodies.iter().any(|loc| loc.id == id) {
            match rng_selection.gen_range(0..3) {
                0 => ProbabilityGenerator::Uniform,
                choice => {
                    let total = hit_counts.get(&id).map(total_hits).unwrap_or(1);
                    ProbabilityGenerator::all_then_all(probability, total, choice == 2)
                }
            }
        } else {
            ProbabilityGenerator::Uniform
        };
        generators.insert(id, generator);
    }
    generators
}

/// Start of the walk: a biased pick from the pivot's loop entries,
/// preferring the deepest ones; the root is the fallback.
fn select_start_node(
    tree: &BranchTree,
    loop_boundaries: &[NodeId],
    rng: &mut SmallRng,
    fallback: NodeId,
) -> NodeId {
    if !loop_boundaries.is_empty() {
        let probability = rng.gen_range(0.0..1.0);
        let mut i = 0;
        let mut limit = LIMIT_STEP;
        while i != loop_boundaries.len() && probability > limit {
            limit += LIMIT_STEP * (1.0 - limit);
            i += 1;
        }
        while i < loop_boundaries.len() {
            let node = loop_boundaries[loop_boundaries.len() - 1 - i];
            if !tree.node(node).closed {
                return node;
            }
            i += 1;
        }
    }
    fallback
}

fn monte_carlo_step(
    tree: &BranchTree,
    pivot: NodeId,
    histogram: &HashMap<u32, f32>,
    generators: &mut HashMap<u32, ProbabilityGenerator>,
    rng: &mut SmallRng,
) -> Option<NodeId> {
    let node = tree.node(pivot);
    debug_assert!(!node.closed);

    let left = node.successor(false).child().filter(|&id| !tree.node(id).closed);
    let right = node.successor(true).child().filter(|&id| !tree.node(id).closed);

    let false_probability = histogram.get(&node.loc.id).copied().unwrap_or(0.5);
    let probability = match generators.get_mut(&node.loc.id) {
        Some(generator) => generator.next(rng),
        None => rng.gen_range(0.0..1.0),
    };
    let desired_direction = probability > false_probability;

    let desired_child = if desired_direction { right } else { left };
    match desired_child {
        Some(child) => Some(child),
        None if !node.is_open_branching() => left.or(right),
        None => None,
    }
}

/// Forward random descent from `start`: follows the per-location
/// direction histogram until it lands on an open branching.
fn monte_carlo_search(
    tree: &BranchTree,
    start: NodeId,
    histogram: &HashMap<u32, f32>,
    generators: &mut HashMap<u32, ProbabilityGenerator>,
    rng: &mut SmallRng,
) -> NodeId {
    let mut pivot = start;
    while let Some(next) = monte_carlo_step(tree, pivot, histogram, generators, rng) {
        pivot = next;
    }
    debug_assert!(tree.node(pivot).is_open_branching());
    pivot
}

/// Full iid target selection: random location, biased pivot, walk.
///
/// Returns `None` when there are no pivots or the root is closed.
pub fn select_iid_coverage_target(
    tree: &BranchTree,
    pivots: &mut IidPivots,
    max_input_width: u32,
    rng_location: &mut SmallRng,
    rng_generator_selection: &mut SmallRng,
) -> Option<NodeId> {
    let root = tree.root()?;
    if pivots.is_empty() || tree.node(root).closed {
        return None;
    }

    let locations: Vec<LocationId> = pivots.locations().copied().collect();
    let loc = locations[rng_location.gen_range(0..locations.len())];

    let (pivot, input_width, pure_loop_bodies, loop_boundaries, histogram_frame) = {
        let props = pivots.location_props_mut(&loc)?;
        let pivot_ids: Vec<NodeId> = props.pivots.keys().copied().collect();
        let pivot = select_best_iid_pivot(
            tree,
            &pivot_ids,
            max_input_width,
            &mut props.rng_pivot_selection,
        );
        let pivot_props = props.pivots.get(&pivot)?;
        (
            pivot,
            tree.node(pivot).num_stdin_bytes,
            pivot_props.pure_loop_bodies.clone(),
            pivot_props.loop_boundaries.clone(),
            pivot_props.histogram.clone(),
        )
    };

    let histogram = {
        let props = pivots.location_props(&loc)?;
        compute_false_direction_histogram(tree, input_width, &pure_loop_bodies, &props.pivots)
    };
    let hit_counts = histogram_frame
        .as_ref()
        .map(|frame| frame.merge())
        .unwrap_or_default();
    let mut generators = compute_generators(
        &histogram,
        &hit_counts,
        &pure_loop_bodies,
        rng_generator_selection,
    );

    let props = pivots.location_props_mut(&loc)?;
    let pivot_props = props.pivots.get_mut(&pivot)?;
    let start = select_start_node(
        tree,
        &loop_boundaries,
        &mut pivot_props.rng_start_node,
        root,
    );
    if tree.node(start).closed {
        return None;
    }
    let winner = monte_carlo_search(
        tree,
        start,
        &histogram,
        &mut generators,
        &mut pivot_props.rng_monte_carlo,
    );
    tracing::debug!(loc = tree.node(winner).loc.id, "monte-carlo target selected");
    Some(winner)
}
