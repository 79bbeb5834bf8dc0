use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use fuzzx_dsa::{detect_loops_along_path, BranchTree, Coverage, NodeId};
use fuzzx_io::width::{distance_to_central_class, input_width_class, INPUT_WIDTH_CLASSES};
use fuzzx_io::LocationId;
use fuzzx_mc::IidPivots;

use crate::stats::EngineStats;

/// The four open-branching classes the selector feeds on, in priority
/// order: loop heads diversifying input widths, sensitive nodes with
/// analyses left, untouched nodes, and the rare iid-twin tie-break.
///
/// The boolean attached to each target records whether loop heads
/// were already collected along its path.
#[derive(Debug, Default)]
pub struct PrimaryCoverageTargets {
    loop_heads: HashSet<NodeId>,
    sensitive: HashMap<NodeId, bool>,
    untouched: HashMap<NodeId, bool>,
    iid_twins: HashMap<LocationId, (NodeId, bool)>,
}

/// Total order used inside each class. Lower is better.
fn node_less_than(tree: &BranchTree, a: NodeId, b: NodeId, max_input_width: u32) -> Ordering {
    let na = tree.node(a);
    let nb = tree.node(b);
    // Nodes with sensitivity behind them are cheaper to finish.
    (nb.sensitivity_performed)
        .cmp(&na.sensitivity_performed)
        .then_with(|| na.sensitive_bits.len().cmp(&nb.sensitive_bits.len()))
        .then_with(|| {
            distance_to_central_class(na.num_stdin_bytes, max_input_width)
                .cmp(&distance_to_central_class(nb.num_stdin_bytes, max_input_width))
        })
        .then_with(|| na.num_stdin_bytes.cmp(&nb.num_stdin_bytes))
        .then_with(|| na.trace_index.cmp(&nb.trace_index))
        .then_with(|| nb.max_successors_trace_index.cmp(&na.max_successors_trace_index))
        .then_with(|| a.cmp(&b))
}

impl PrimaryCoverageTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.loop_heads.is_empty()
            && self.sensitive.is_empty()
            && self.untouched.is_empty()
            && self.iid_twins.is_empty()
    }

    pub fn clear(&mut self) {
        self.loop_heads.clear();
        self.sensitive.clear();
        self.untouched.clear();
        self.iid_twins.clear();
    }

    /// Sorts a node into its class, if it is a target at all.
    pub fn process_potential_coverage_target(
        &mut self,
        tree: &BranchTree,
        coverage: &Coverage,
        pivots: &IidPivots,
        node: NodeId,
        loop_heads_collected: bool,
    ) {
        let n = tree.node(node);
        if !n.is_open_branching() || coverage.is_covered(n.loc) {
            return;
        }
        if n.sensitivity_performed {
            if !n.sensitive_bits.is_empty() && (!n.bitshare_performed || !n.minimization_performed)
            {
                self.sensitive.insert(node, loop_heads_collected);
            }
            return;
        }
        match pivots.pivot_with_lowest_abs_value(n.loc) {
            Some(pivot) => {
                // An untested node beating the best iid pivot at its
                // location is worth a dedicated attempt.
                if n.best_coverage_value.abs() < tree.node(pivot).best_coverage_value.abs() {
                    let entry = self
                        .iid_twins
                        .entry(n.loc)
                        .or_insert((node, loop_heads_collected));
                    if entry.0 != node
                        && n.best_coverage_value.abs()
                            < tree.node(entry.0).best_coverage_value.abs()
                    {
                        *entry = (node, loop_heads_collected);
                    }
                }
            }
            None => {
                self.untouched.insert(node, loop_heads_collected);
            }
        }
    }

    pub fn erase(&mut self, node: NodeId, loc: LocationId) {
        self.loop_heads.remove(&node);
        self.sensitive.remove(&node);
        self.untouched.remove(&node);
        if let Some(&(twin, _)) = self.iid_twins.get(&loc) {
            if twin == node {
                self.iid_twins.remove(&loc);
            }
        }
    }

    /// Re-validates every stored target against the current tree.
    pub fn do_cleanup(&mut self, tree: &BranchTree, coverage: &Coverage, pivots: &IidPivots) {
        self.loop_heads
            .retain(|&node| tree.contains(node) && tree.node(node).is_open_branching());

        let mut work_set: HashMap<NodeId, bool> = HashMap::new();
        work_set.extend(self.sensitive.drain());
        work_set.extend(self.untouched.drain());
        for (_, (node, flag)) in self.iid_twins.drain() {
            work_set.insert(node, flag);
        }
        for (node, flag) in work_set {
            if tree.contains(node) {
                self.process_potential_coverage_target(tree, coverage, pivots, node, flag);
            }
        }
    }

    /// Along the path to `end_node`, picks per input-width class the
    /// shallowest open loop head of a class that has no closed loop
    /// head yet.
    fn collect_loop_heads_along_path(&mut self, tree: &BranchTree, end_node: NodeId) {
        let mut class_state: HashMap<u32, (bool, Option<NodeId>)> = INPUT_WIDTH_CLASSES
            .iter()
            .map(|&width| (width, (false, None)))
            .collect();

        let info = detect_loops_along_path(tree, end_node);

        let mut cursor = Some(end_node);
        while let Some(node) = cursor {
            let n = tree.node(node);
            if info.heads_to_bodies.contains_key(&n.loc) {
                let class = input_width_class(n.num_stdin_bytes);
                let state = class_state.get_mut(&class).expect("class table is total");
                if !state.0 {
                    if n.is_open_branching() {
                        let better = match state.1 {
                            None => true,
                            Some(current) => {
                                let c = tree.node(current);
                                (n.num_stdin_bytes, n.trace_index)
                                    < (c.num_stdin_bytes, c.trace_index)
                            }
                        };
                        if better {
                            state.1 = Some(node);
                        }
                    } else {
                        state.0 = true;
                    }
                }
            }
            cursor = n.predecessor;
        }

        for (_, (covered, best)) in class_state {
            if !covered {
                if let Some(node) = best {
                    self.loop_heads.insert(node);
                }
            }
        }
    }

    fn best_of_class(
        &mut self,
        class: &str,
        tree: &BranchTree,
        max_input_width: u32,
    ) -> Option<NodeId> {
        let targets = match class {
            "sensitive" => &self.sensitive,
            _ => &self.untouched,
        };
        let best = targets
            .keys()
            .copied()
            .min_by(|&a, &b| node_less_than(tree, a, b, max_input_width))?;
        let needs_collection = {
            let targets = match class {
                "sensitive" => &mut self.sensitive,
                _ => &mut self.untouched,
            };
            let collected = targets.get_mut(&best).expect("best came from the map");
            let needs = !*collected;
            *collected = true;
            needs
        };
        if needs_collection {
            self.collect_loop_heads_along_path(tree, best);
        }
        Some(best)
    }

    fn best_loop_head(&self, tree: &BranchTree) -> Option<NodeId> {
        self.loop_heads
            .iter()
            .copied()
            .min_by_key(|&id| (tree.node(id).trace_index, tree.node(id).loc))
    }

    /// The next coverage target, honouring the class priority and the
    /// in-class total order. Loop heads discovered while examining a
    /// lower class preempt it.
    pub fn get_best(
        &mut self,
        tree: &BranchTree,
        max_input_width: u32,
        stats: &mut EngineStats,
    ) -> Option<NodeId> {
        loop {
            if let Some(head) = self.best_loop_head(tree) {
                stats.strategy_primary_loop_head += 1;
                return Some(head);
            }
            if let Some(best) = self.best_of_class("sensitive", tree, max_input_width) {
                if self.loop_heads.is_empty() {
                    stats.strategy_primary_sensitive += 1;
                    return Some(best);
                }
                continue;
            }
            if let Some(best) = self.best_of_class("untouched", tree, max_input_width) {
                if self.loop_heads.is_empty() {
                    stats.strategy_primary_untouched += 1;
                    return Some(best);
                }
                continue;
            }
            let twin = self
                .iid_twins
                .iter()
                .next()
                .map(|(&loc, &(node, collected))| (loc, node, collected));
            if let Some((loc, node, collected)) = twin {
                if !collected {
                    self.collect_loop_heads_along_path(tree, node);
                    self.iid_twins.insert(loc, (node, true));
                    if !self.loop_heads.is_empty() {
                        continue;
                    }
                }
                stats.strategy_primary_iid_twins += 1;
                return Some(node);
            }
            return None;
        }
    }
}
