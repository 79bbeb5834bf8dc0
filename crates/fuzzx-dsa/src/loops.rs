use std::collections::{HashMap, HashSet};

use fuzzx_io::LocationId;

use crate::arena::NodeId;
use crate::tree::BranchTree;

/// One loop found along a path: the node exiting (and heading) the
/// loop and the earliest node of its body on the path.
#[derive(Debug, Clone, Copy)]
pub struct LoopBoundary {
    pub exit: NodeId,
    pub entry: NodeId,
}

#[derive(Debug, Default)]
pub struct LoopInfo {
    /// Loop head location -> locations of its body.
    pub heads_to_bodies: HashMap<LocationId, HashSet<LocationId>>,
    pub loops: Vec<LoopBoundary>,
}

/// Detects loops along the path from the root to `end_node`.
///
/// The path is explored backwards: every loop terminates with its
/// head condition but does not have to start with it (do-while
/// shapes), so the first repeated location seen from the back is the
/// head, and everything stacked above it belongs to the body.
pub fn detect_loops_along_path(tree: &BranchTree, end_node: NodeId) -> LoopInfo {
    struct StackEntry {
        exit: NodeId,
        loop_index: Option<usize>,
    }

    let mut info = LoopInfo::default();
    let mut stack: Vec<StackEntry> = Vec::new();
    let mut stack_positions: HashMap<LocationId, usize> = HashMap::new();

    let mut cursor = Some(end_node);
    while let Some(node) = cursor {
        let loc = tree.node(node).loc;
        match stack_positions.get(&loc).copied() {
            None => {
                stack_positions.insert(loc, stack.len());
                stack.push(StackEntry {
                    exit: node,
                    loop_index: None,
                });
            }
            Some(pos) => {
                let exit = stack[pos].exit;
                match stack[pos].loop_index {
                    None => {
                        stack[pos].loop_index = Some(info.loops.len());
                        info.loops.push(LoopBoundary { exit, entry: node });
                    }
                    Some(idx) => info.loops[idx].entry = node,
                }
                let body = info.heads_to_bodies.entry(tree.node(exit).loc).or_default();
                while stack.len() > pos + 1 {
                    let popped = stack.pop().expect("stack length checked");
                    let popped_loc = tree.node(popped.exit).loc;
                    body.insert(popped_loc);
                    stack_positions.remove(&popped_loc);
                }
            }
        }
        cursor = tree.node(node).predecessor;
    }

    // Pull each entry up to the outermost node still inside the loop.
    for boundary in &mut info.loops {
        let body = &info.heads_to_bodies[&tree.node(boundary.exit).loc];
        let head_loc = tree.node(boundary.exit).loc;
        while let Some(pred) = tree.node(boundary.entry).predecessor {
            let pred_loc = tree.node(pred).loc;
            if pred_loc == head_loc || body.contains(&pred_loc) {
                boundary.entry = pred;
            } else {
                break;
            }
        }
    }

    info
}

/// Deduplicated loop entries ordered by trace index; the Monte-Carlo
/// walk starts from one of these.
pub fn compute_loop_boundaries(tree: &BranchTree, loops: &[LoopBoundary]) -> Vec<NodeId> {
    let mut stored = HashSet::new();
    let mut boundaries = Vec::with_capacity(loops.len());
    for boundary in loops {
        if stored.insert(boundary.entry) {
            boundaries.push(boundary.entry);
        }
    }
    boundaries.sort_by_key(|&id| tree.node(id).trace_index);
    boundaries
}
