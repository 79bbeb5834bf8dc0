use std::sync::Arc;

use fuzzx_dsa::{BitshareCache, BranchTree, NodeId};
use fuzzx_io::{ExecutionTrace, StdinRecord};

use crate::Analysis;

#[derive(Debug, Default, Clone)]
pub struct BitshareStats {
    pub start_calls: usize,
    pub generated_inputs: usize,
    pub hits: usize,
    pub misses: usize,
    pub stop_calls_instant: usize,
    pub stop_calls_early: usize,
    pub stop_calls_regular: usize,
}

/// Replays cached discriminating bit patterns from other branchings
/// at the same location over the target's witness.
///
/// Cheap first shot before any descent: two branchings at one
/// location usually share their deciding bytes even across call
/// contexts.
pub struct BitshareAnalysis {
    busy: bool,
    node: Option<NodeId>,
    samples: Vec<Vec<bool>>,
    sample_index: usize,
    execution_id: u32,
    stats: BitshareStats,
}

impl BitshareAnalysis {
    pub fn new() -> Self {
        Self {
            busy: false,
            node: None,
            samples: Vec::new(),
            sample_index: 0,
            execution_id: 0,
            stats: BitshareStats::default(),
        }
    }

    pub fn start(
        &mut self,
        tree: &BranchTree,
        cache: &BitshareCache,
        node: NodeId,
        execution_id: u32,
    ) {
        assert!(self.is_ready(), "bitshare already running");
        let n = tree.node(node);
        debug_assert!(n.best_stdin.is_some() && !n.sensitive_bits.is_empty());

        // Replay patterns that previously drove this location down the
        // direction the target still misses.
        let wanted_direction = !n.is_direction_unexplored(false);
        self.samples = cache
            .patterns(n.loc.id, wanted_direction)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default();
        self.sample_index = 0;
        self.busy = true;
        self.node = Some(node);
        self.execution_id = execution_id;
        self.stats.start_calls += 1;
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn stats(&self) -> &BitshareStats {
        &self.stats
    }

    /// Feeds the cache after some analysis flipped a branching: the
    /// flipping stdin projected onto the branching's sensitive bits,
    /// keyed by the direction the trace actually took there.
    pub fn bits_available_for_branching(
        cache: &mut BitshareCache,
        tree: &BranchTree,
        node: NodeId,
        trace: &ExecutionTrace,
        stdin: &StdinRecord,
    ) {
        let n = tree.node(node);
        let index = n.trace_index as usize;
        if index >= trace.len() || trace[index].loc != n.loc {
            return;
        }
        let pattern: Vec<bool> = n
            .sensitive_bits
            .iter()
            .filter_map(|&bit| stdin.bits.get(bit as usize).copied())
            .collect();
        if !pattern.is_empty() {
            cache.insert(n.loc.id, trace[index].direction, pattern);
        }
    }
}

impl Default for BitshareAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl Analysis for BitshareAnalysis {
    fn is_ready(&self) -> bool {
        !self.busy
    }

    fn generate_next_input(&mut self, tree: &BranchTree) -> Option<Vec<bool>> {
        if !self.busy {
            return None;
        }
        let node = self.node?;
        if self.sample_index >= self.samples.len() {
            return None;
        }
        let n = tree.node(node);
        let witness = n.best_stdin.as_ref().expect("target carries a witness");
        let mut bits = witness.bits.clone();
        let pattern = &self.samples[self.sample_index];
        for (&bit, &value) in n.sensitive_bits.iter().zip(pattern.iter()) {
            if let Some(slot) = bits.get_mut(bit as usize) {
                *slot = value;
            }
        }
        self.sample_index += 1;
        self.stats.generated_inputs += 1;
        Some(bits)
    }

    fn process_results(
        &mut self,
        _trace: &Arc<ExecutionTrace>,
        _stdin: &Arc<StdinRecord>,
        tree: &mut BranchTree,
    ) {
        if !self.busy {
            return;
        }
        let Some(node) = self.node else { return };
        let n = tree.node(node);
        if n.is_direction_explored(false) && n.is_direction_explored(true) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
    }

    fn stop(&mut self, tree: &mut BranchTree) {
        if !self.busy {
            return;
        }
        self.busy = false;
        let Some(node) = self.node else { return };
        if self.samples.is_empty() {
            self.stats.stop_calls_instant += 1;
        } else if self.sample_index < self.samples.len() {
            self.stats.stop_calls_early += 1;
        } else {
            self.stats.stop_calls_regular += 1;
        }
        if tree.contains(node) {
            let n = tree.node_mut(node);
            n.bitshare_performed = true;
            n.bitshare_start_execution = self.execution_id;
        }
        self.samples.clear();
        self.sample_index = 0;
    }
}
