use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use fuzzx_io::{ExecutionTrace, LocationId, StdinRecord, Termination};

use crate::arena::{NodeArena, NodeId};
use crate::coverage::Coverage;
use crate::node::{BranchingNode, Successor};

/// Tree-level failures. Both mean the instrumentation reported a
/// trace the existing tree cannot absorb; the engine aborts the
/// running analysis and resets its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// The first record disagrees with the established root.
    RootMismatch { expected: LocationId, got: LocationId },
    /// A record mid-walk disagrees with the node reached so far.
    PathMismatch {
        trace_index: u32,
        expected: LocationId,
        got: LocationId,
    },
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::RootMismatch { expected, got } => write!(
                f,
                "trace root {}!{} disagrees with tree root {}!{}",
                got.id, got.context_hash, expected.id, expected.context_hash
            ),
            TreeError::PathMismatch {
                trace_index,
                expected,
                got,
            } => write!(
                f,
                "trace diverged from tree shape at index {trace_index}: got {}!{}, tree has {}!{}",
                got.id, got.context_hash, expected.id, expected.context_hash
            ),
        }
    }
}

/// What one merge changed.
#[derive(Debug, Default)]
pub struct TreeDelta {
    pub leaf: Option<NodeId>,
    /// First node created by this merge, if the trace extended the
    /// frontier anywhere.
    pub diverging_node: Option<NodeId>,
    pub any_location_discovered: bool,
    pub covered_locations: HashSet<LocationId>,
}

#[derive(Debug, Default, Clone)]
pub struct TreeStats {
    pub nodes_created: usize,
    pub nodes_destroyed: usize,
    pub leaf_nodes_created: usize,
    pub leaf_nodes_destroyed: usize,
    pub max_leaf_nodes: usize,
    pub longest_branch: usize,
}

/// The explored-path tree: one node per distinct trace prefix.
///
/// The tree owns every node for the duration of the search; analyses
/// address nodes by `NodeId` only. Witness inputs and traces are
/// shared `Arc`s, so a single stdin record backs all nodes that
/// observed it.
#[derive(Debug, Default)]
pub struct BranchTree {
    pub arena: NodeArena,
    root: Option<NodeId>,
    leaves: HashSet<NodeId>,
    stats: TreeStats,
}

impl BranchTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn leaves(&self) -> &HashSet<NodeId> {
        &self.leaves
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    pub fn node(&self, id: NodeId) -> &BranchingNode {
        &self.arena[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BranchingNode {
        &mut self.arena[id]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.arena.get(id).is_some()
    }

    /// Path from the root to `id`, root first.
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            path.push(node_id);
            cursor = self.arena[node_id].predecessor;
        }
        path.reverse();
        path
    }

    /// Direction taken at each node of `path` (root first) to stay on
    /// it; the last node contributes nothing.
    pub fn path_directions(&self, path: &[NodeId]) -> Vec<bool> {
        path.windows(2)
            .map(|pair| self.arena[pair[0]].successor_direction(pair[1]))
            .collect()
    }

    /// Walks the trace into the tree, creating nodes where the trace
    /// extends the frontier and improving best-witnesses along the
    /// whole prefix. Coverage promotion/demotion is applied on the
    /// fly. The trace must be non-empty.
    pub fn merge(
        &mut self,
        trace: &Arc<ExecutionTrace>,
        stdin: &Arc<StdinRecord>,
        termination: Termination,
        execution: u32,
        coverage: &mut Coverage,
    ) -> Result<TreeDelta, TreeError> {
        assert!(!trace.is_empty(), "merge requires a non-empty trace");

        let mut delta = TreeDelta::default();

        let root = match self.root {
            Some(root) => {
                let expected = self.arena[root].loc;
                if expected != trace[0].loc {
                    return Err(TreeError::RootMismatch {
                        expected,
                        got: trace[0].loc,
                    });
                }
                root
            }
            None => {
                let first = &trace[0];
                let id = self.arena.insert(BranchingNode::new(
                    first.loc,
                    0,
                    first.num_stdin_bytes,
                    None,
                    None,
                    None,
                    f64::INFINITY,
                    f64::INFINITY,
                    execution,
                    first.xor_like,
                    first.predicate,
                ));
                self.stats.nodes_created += 1;
                self.root = Some(id);
                delta.diverging_node = Some(id);
                id
            }
        };

        let mut leaf = root;
        let mut summary_value = 0.0f64;
        let last_index = trace.len() - 1;

        for (trace_index, info) in trace.iter().enumerate() {
            let node_loc = self.arena[leaf].loc;
            if node_loc != info.loc {
                return Err(TreeError::PathMismatch {
                    trace_index: trace_index as u32,
                    expected: node_loc,
                    got: info.loc,
                });
            }

            let (discovered, covered) = coverage.on_branching_taken(info.loc, info.direction);
            delta.any_location_discovered |= discovered;
            if covered {
                delta.covered_locations.insert(info.loc);
            }

            summary_value += info.value * info.value;
            let value_ok = summary_value.is_finite();
            {
                let node = &mut self.arena[leaf];
                if node.best_stdin.is_none() || (value_ok && node.best_summary_value > summary_value)
                {
                    node.best_stdin = Some(Arc::clone(stdin));
                    node.best_trace = Some(Arc::clone(trace));
                    node.best_coverage_value = if value_ok { info.value } else { f64::INFINITY };
                    node.best_summary_value = if value_ok { summary_value } else { f64::INFINITY };
                    node.best_value_execution = execution;
                }
                node.max_successors_trace_index =
                    node.max_successors_trace_index.max(last_index as u32);
            }

            if trace_index == last_index {
                break;
            }

            if self.arena[leaf].successor(info.direction).child().is_none() {
                // The frontier moves: re-open the prefix first.
                let mut cursor = Some(leaf);
                while let Some(id) = cursor {
                    if !self.arena[id].closed {
                        break;
                    }
                    self.arena[id].closed = false;
                    cursor = self.arena[id].predecessor;
                }

                let succ_info = &trace[trace_index + 1];
                let new_node = self.arena.insert(BranchingNode::new(
                    succ_info.loc,
                    (trace_index + 1) as u32,
                    succ_info.num_stdin_bytes,
                    Some(leaf),
                    Some(Arc::clone(stdin)),
                    Some(Arc::clone(trace)),
                    succ_info.value,
                    succ_info.value * succ_info.value,
                    execution,
                    succ_info.xor_like,
                    succ_info.predicate,
                ));
                self.stats.nodes_created += 1;
                *self.arena[leaf].successor_mut(info.direction) = Successor::Visited(new_node);
                delta.diverging_node.get_or_insert(new_node);
            }

            leaf = self.arena[leaf]
                .successor(info.direction)
                .child()
                .expect("successor was just linked");
        }

        let terminal = if termination.is_exceptional() {
            Successor::EndExceptional
        } else {
            Successor::EndNormal
        };
        let last = trace[last_index];
        self.arena[leaf]
            .successor_mut(last.direction)
            .raise_terminal(terminal);

        if delta.diverging_node.is_some() {
            let inserted = self.leaves.insert(leaf);
            debug_assert!(inserted, "a freshly extended branch ends in a new leaf");
            self.stats.leaf_nodes_created += 1;
            self.stats.max_leaf_nodes = self.stats.max_leaf_nodes.max(self.leaves.len());
            self.stats.longest_branch = self.stats.longest_branch.max(trace.len());
        } else {
            self.update_close_flags_from(leaf);
        }

        delta.leaf = Some(leaf);
        Ok(delta)
    }

    /// Bottom-up fold of the closedness invariant: a node closes when
    /// it is not open and both children are closed or terminal.
    /// Stops at the first ancestor that stays open.
    pub fn update_close_flags_from(&mut self, node: NodeId) {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            let n = &self.arena[id];
            if n.closed || n.is_open_branching() {
                return;
            }
            for direction in [false, true] {
                if let Some(child) = n.successor(direction).child() {
                    if !self.arena[child].closed {
                        return;
                    }
                }
            }
            self.arena[id].closed = true;
            tracing::debug!(loc = self.arena[id].loc.id, "branching closed");
            cursor = self.arena[id].predecessor;
        }
    }

    /// Deletes a dead leaf branch, walking upward while each ancestor
    /// became childless and is not itself a live leaf. Returns the
    /// removed ids and their locations so callers can purge their
    /// side tables.
    pub fn remove_leaf_branching_node(&mut self, node: NodeId) -> Vec<(NodeId, LocationId)> {
        let mut removed = Vec::new();
        if self.leaves.remove(&node) {
            self.stats.leaf_nodes_destroyed += 1;
        }

        let mut node = node;
        loop {
            let n = &self.arena[node];
            if n.successor(false).child().is_some() || n.successor(true).child().is_some() {
                break;
            }
            if self.leaves.contains(&node) {
                break;
            }

            let mut label = n.successor(false);
            label.raise_terminal(n.successor(true));
            let pred = n.predecessor;
            let loc = n.loc;

            self.arena.remove(node);
            removed.push((node, loc));
            self.stats.nodes_destroyed += 1;

            let Some(pred) = pred else {
                self.root = None;
                break;
            };

            let direction = self.arena[pred].successor_direction(node);
            *self.arena[pred].successor_mut(direction) = label;
            node = pred;
        }
        removed
    }

    /// Drops every node; used when the loop terminates.
    pub fn clear(&mut self) {
        let leaves: Vec<NodeId> = self.leaves.iter().copied().collect();
        for leaf in leaves {
            self.remove_leaf_branching_node(leaf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzx_io::{InputType, Predicate, TraceRecord};

    fn rec(id: u32, direction: bool, value: f64) -> TraceRecord {
        TraceRecord {
            loc: LocationId::flat(id),
            direction,
            value,
            num_stdin_bytes: 1,
            xor_like: false,
            predicate: Predicate::Equal,
        }
    }

    fn stdin(bytes: &[u8]) -> Arc<StdinRecord> {
        Arc::new(StdinRecord::from_bytes(bytes, vec![InputType::U8; bytes.len()]))
    }

    #[test]
    fn merge_grows_prefix_tree() {
        let mut tree = BranchTree::new();
        let mut cov = Coverage::new();

        let t1 = Arc::new(vec![rec(1, false, 3.0), rec(2, true, 1.0)]);
        let delta = tree
            .merge(&t1, &stdin(&[0]), Termination::Normal, 0, &mut cov)
            .unwrap();
        assert!(delta.any_location_discovered);
        assert_eq!(tree.arena.len(), 2);

        // Same path again: no new nodes, no discovery.
        let delta = tree
            .merge(&t1, &stdin(&[0]), Termination::Normal, 1, &mut cov)
            .unwrap();
        assert!(delta.diverging_node.is_none());
        assert_eq!(tree.arena.len(), 2);

        // Flipping the second branching covers location 2.
        let t2 = Arc::new(vec![rec(1, false, 3.0), rec(2, false, -1.0)]);
        let delta = tree
            .merge(&t2, &stdin(&[1]), Termination::Normal, 2, &mut cov)
            .unwrap();
        assert!(delta.covered_locations.contains(&LocationId::flat(2)));
        assert!(cov.covered.contains(&LocationId::flat(2)));
        assert!(!cov.uncovered.contains(&(LocationId::flat(2), false)));
    }

    #[test]
    fn merge_improves_witness_monotonically() {
        let mut tree = BranchTree::new();
        let mut cov = Coverage::new();

        let t1 = Arc::new(vec![rec(1, false, 4.0)]);
        tree.merge(&t1, &stdin(&[0]), Termination::Normal, 0, &mut cov)
            .unwrap();
        let root = tree.root().unwrap();
        let first_summary = tree.node(root).best_summary_value;

        let t2 = Arc::new(vec![rec(1, false, 2.0)]);
        tree.merge(&t2, &stdin(&[1]), Termination::Normal, 1, &mut cov)
            .unwrap();
        assert!(tree.node(root).best_summary_value < first_summary);

        // A worse execution must not displace the witness.
        let t3 = Arc::new(vec![rec(1, false, 9.0)]);
        tree.merge(&t3, &stdin(&[2]), Termination::Normal, 2, &mut cov)
            .unwrap();
        assert_eq!(tree.node(root).best_summary_value, 4.0);
        assert_eq!(tree.node(root).best_value_execution, 1);
    }

    #[test]
    fn non_finite_values_are_flagged_infinite() {
        let mut tree = BranchTree::new();
        let mut cov = Coverage::new();
        let t = Arc::new(vec![rec(1, true, f64::NAN)]);
        tree.merge(&t, &stdin(&[0]), Termination::Normal, 0, &mut cov)
            .unwrap();
        let root = tree.root().unwrap();
        assert!(tree.node(root).best_summary_value.is_infinite());
        assert!(tree.node(root).best_coverage_value.is_infinite());
    }

    #[test]
    fn exceptional_end_is_not_downgraded() {
        let mut tree = BranchTree::new();
        let mut cov = Coverage::new();
        let t = Arc::new(vec![rec(1, true, 1.0)]);
        tree.merge(&t, &stdin(&[0]), Termination::Crash, 0, &mut cov)
            .unwrap();
        let root = tree.root().unwrap();
        assert_eq!(tree.node(root).successor(true), Successor::EndExceptional);

        // A later normal run through the same edge upgrades it.
        tree.merge(&t, &stdin(&[0]), Termination::Normal, 1, &mut cov)
            .unwrap();
        assert_eq!(tree.node(root).successor(true), Successor::EndNormal);
    }

    #[test]
    fn root_mismatch_is_reported() {
        let mut tree = BranchTree::new();
        let mut cov = Coverage::new();
        let t1 = Arc::new(vec![rec(1, false, 1.0)]);
        tree.merge(&t1, &stdin(&[0]), Termination::Normal, 0, &mut cov)
            .unwrap();
        let t2 = Arc::new(vec![rec(9, false, 1.0)]);
        assert!(matches!(
            tree.merge(&t2, &stdin(&[0]), Termination::Normal, 1, &mut cov),
            Err(TreeError::RootMismatch { .. })
        ));
    }

    #[test]
    fn remove_leaf_propagates_upward() {
        let mut tree = BranchTree::new();
        let mut cov = Coverage::new();
        let t = Arc::new(vec![rec(1, false, 1.0), rec(2, true, 1.0), rec(3, false, 1.0)]);
        let delta = tree
            .merge(&t, &stdin(&[0]), Termination::Normal, 0, &mut cov)
            .unwrap();
        let leaf = delta.leaf.unwrap();
        assert_eq!(tree.arena.len(), 3);

        let removed = tree.remove_leaf_branching_node(leaf);
        assert_eq!(removed.len(), 3);
        assert!(tree.root().is_none());
        assert!(tree.arena.is_empty());
    }
}
