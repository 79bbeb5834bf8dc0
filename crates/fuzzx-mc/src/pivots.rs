use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use fuzzx_dsa::{detect_loops_along_path, loops::compute_loop_boundaries, BranchTree, NodeId};
use fuzzx_io::LocationId;

use crate::histogram::{HitCountFrame, HitCounts};

/// State attached to one iid pivot: a historic witness at an iid
/// location, usable as a Monte-Carlo starting point.
#[derive(Debug)]
pub struct IidPivotProps {
    /// Loop entries on the path up to the pivot, by trace index.
    pub loop_boundaries: Vec<NodeId>,
    /// Locations living strictly inside loops before the pivot.
    pub pure_loop_bodies: HashSet<LocationId>,
    pub histogram: Option<Arc<HitCountFrame>>,
    pub rng_monte_carlo: SmallRng,
    pub rng_start_node: SmallRng,
}

#[derive(Debug)]
pub struct IidLocationProps {
    pub pivots: HashMap<NodeId, IidPivotProps>,
    pub pivot_with_lowest_abs_value: Option<NodeId>,
    pub rng_pivot_selection: SmallRng,
}

/// All iid pivots of the search, keyed by location.
#[derive(Debug, Default)]
pub struct IidPivots {
    map: HashMap<LocationId, IidLocationProps>,
    seed_counter: u64,
}

impl IidPivots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn locations(&self) -> impl Iterator<Item = &LocationId> {
        self.map.keys()
    }

    pub fn location_props(&self, loc: &LocationId) -> Option<&IidLocationProps> {
        self.map.get(loc)
    }

    pub fn location_props_mut(&mut self, loc: &LocationId) -> Option<&mut IidLocationProps> {
        self.map.get_mut(loc)
    }

    pub fn pivot_with_lowest_abs_value(&self, loc: LocationId) -> Option<NodeId> {
        self.map.get(&loc).and_then(|props| props.pivot_with_lowest_abs_value)
    }

    fn next_seed(&mut self) -> u64 {
        self.seed_counter += 1;
        self.seed_counter
    }

    /// Harvests new pivots after a sensitivity run: every node the
    /// run reclassified that latched *iid* and is still uncovered.
    /// Loop structure and hit-count histograms are derived from the
    /// path to the sensitivity target.
    pub fn collect_from_sensitivity(
        &mut self,
        tree: &BranchTree,
        changed_nodes: &HashSet<NodeId>,
        is_covered: impl Fn(LocationId) -> bool,
        sensitivity_target: NodeId,
    ) {
        let mut new_pivots: Vec<NodeId> = Vec::new();
        for &node_id in changed_nodes {
            if !tree.contains(node_id) {
                continue;
            }
            let node = tree.node(node_id);
            if !node.is_iid_branching() || is_covered(node.loc) {
                continue;
            }
            let seed = self.next_seed();
            let loc_props = self.map.entry(node.loc).or_insert_with(|| IidLocationProps {
                pivots: HashMap::new(),
                pivot_with_lowest_abs_value: None,
                rng_pivot_selection: SmallRng::seed_from_u64(seed),
            });
            if loc_props.pivots.contains_key(&node_id) {
                continue;
            }
            let better = match loc_props.pivot_with_lowest_abs_value {
                None => true,
                Some(current) => {
                    node.best_coverage_value.abs() < tree.node(current).best_coverage_value.abs()
                }
            };
            if better {
                loc_props.pivot_with_lowest_abs_value = Some(node_id);
            }
            new_pivots.push(node_id);
        }
        if new_pivots.is_empty() {
            return;
        }
        tracing::debug!(count = new_pivots.len(), "iid pivots collected");

        let info = detect_loops_along_path(tree, sensitivity_target);
        let loop_boundaries = compute_loop_boundaries(tree, &info.loops);

        // Earliest occurrence of each loop head on the path.
        let mut first_head_occurrence: HashMap<LocationId, NodeId> = HashMap::new();
        for boundary in &info.loops {
            let loc = tree.node(boundary.exit).loc;
            first_head_occurrence
                .entry(loc)
                .and_modify(|existing| {
                    if tree.node(boundary.exit).trace_index < tree.node(*existing).trace_index {
                        *existing = boundary.exit;
                    }
                })
                .or_insert(boundary.exit);
        }
        let mut heads_by_index: Vec<(NodeId, &HashSet<LocationId>)> = first_head_occurrence
            .iter()
            .map(|(loc, &node)| (node, &info.heads_to_bodies[loc]))
            .collect();
        heads_by_index.sort_by_key(|(node, _)| tree.node(*node).trace_index);

        new_pivots.sort_by_key(|&id| tree.node(id).trace_index);

        let mut previous_frame: Option<Arc<HitCountFrame>> = None;
        let mut previous_pivot: Option<NodeId> = None;
        let mut accumulated: HitCounts = HitCounts::new();

        for &pivot in &new_pivots {
            let pivot_index = tree.node(pivot).trace_index;

            let boundaries: Vec<NodeId> = loop_boundaries
                .iter()
                .copied()
                .take_while(|&b| tree.node(b).trace_index <= pivot_index)
                .collect();

            let mut pure_bodies: HashSet<LocationId> = HashSet::new();
            let mut head_locs: HashSet<LocationId> = HashSet::new();
            for &(head, body) in &heads_by_index {
                if tree.node(head).trace_index > pivot_index {
                    break;
                }
                head_locs.insert(tree.node(head).loc);
                pure_bodies.extend(body.iter().copied());
            }
            for head in &head_locs {
                pure_bodies.remove(head);
            }

            // Extend the hit-count chain by this pivot's new path
            // segment.
            let mut frame = HitCountFrame::new(previous_frame.clone());
            {
                let local = frame.local_mut();
                let mut cursor = Some(pivot);
                while let Some(node_id) = cursor {
                    let pred = tree.node(node_id).predecessor;
                    let Some(pred_id) = pred else { break };
                    if Some(pred_id) == previous_pivot {
                        break;
                    }
                    let pred_node = tree.node(pred_id);
                    let direction = pred_node.successor_direction(node_id);
                    let entry = local.entry(pred_node.loc.id).or_insert_with(|| {
                        accumulated.get(&pred_node.loc.id).copied().unwrap_or([0, 0])
                    });
                    entry[direction as usize] += 1;
                    cursor = Some(pred_id);
                }
            }
            for (&id, &counts) in frame.local() {
                accumulated.insert(id, counts);
            }
            pure_bodies.retain(|loc| accumulated.contains_key(&loc.id));

            let frame = Arc::new(frame);
            previous_frame = Some(Arc::clone(&frame));
            previous_pivot = Some(pivot);

            let (seed_a, seed_b) = (self.next_seed(), self.next_seed());
            let loc = tree.node(pivot).loc;
            if let Some(loc_props) = self.map.get_mut(&loc) {
                loc_props.pivots.insert(
                    pivot,
                    IidPivotProps {
                        loop_boundaries: boundaries,
                        pure_loop_bodies: pure_bodies,
                        histogram: Some(frame),
                        rng_monte_carlo: SmallRng::seed_from_u64(seed_a),
                        rng_start_node: SmallRng::seed_from_u64(seed_b),
                    },
                );
            }
        }
    }

    /// Drops every pivot at covered locations.
    pub fn drop_covered(&mut self, is_covered: impl Fn(LocationId) -> bool) {
        self.map.retain(|loc, _| !is_covered(*loc));
    }

    /// Forgets nodes the tree removed; lowest-value pivots are
    /// recomputed only after the whole batch is gone, so the survey
    /// never touches a vacated arena slot.
    pub fn remove_nodes(&mut self, tree: &BranchTree, removed: &[(NodeId, LocationId)]) {
        let mut affected: HashSet<LocationId> = HashSet::new();
        for &(node, loc) in removed {
            if let Some(props) = self.map.get_mut(&loc) {
                if props.pivots.remove(&node).is_some() {
                    affected.insert(loc);
                    if props.pivot_with_lowest_abs_value == Some(node) {
                        props.pivot_with_lowest_abs_value = None;
                    }
                }
            }
        }
        for loc in affected {
            let Some(props) = self.map.get_mut(&loc) else {
                continue;
            };
            if props.pivots.is_empty() {
                self.map.remove(&loc);
                continue;
            }
            if props.pivot_with_lowest_abs_value.is_none() {
                props.pivot_with_lowest_abs_value = props.pivots.keys().copied().min_by(|&a, &b| {
                    tree.node(a)
                        .best_coverage_value
                        .abs()
                        .total_cmp(&tree.node(b).best_coverage_value.abs())
                });
            }
        }
    }
}
