use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fuzzx_dsa::{BranchTree, NodeId};
use fuzzx_io::trace::diverging_index;
use fuzzx_io::{ExecutionTrace, StdinRecord};

use crate::Analysis;

const MAX_PROBE_TRIALS: u32 = 10;

#[derive(Debug, Default, Clone)]
pub struct SensitivityStats {
    pub start_calls: usize,
    pub stop_calls: usize,
    pub generated_inputs: usize,
    pub probe_hits: usize,
}

#[derive(Debug)]
enum Stage {
    /// Hamming-1 sweep over the baseline: flip exactly one bit per
    /// execution.
    Hamming { next_bit: u32 },
    /// Randomise the discovered sensitive bits, hunting for a second
    /// input with the same path prefix to sweep again.
    ProbeSearch { trial: u32 },
}

#[derive(Debug)]
enum Pending {
    None,
    Bit(u32),
    Probe(Vec<bool>),
}

/// Determines which stdin bits a branching's value depends on.
///
/// The witness input is the baseline; every bit read before the
/// target is flipped in isolation, and each sample's divergence
/// against the reference path attributes the flipped bit to the path
/// nodes it disturbed. A node ending the sweep with an empty set is
/// latched *iid*.
pub struct SensitivityAnalysis {
    busy: bool,
    node: Option<NodeId>,
    path: Vec<NodeId>,
    reference: Option<Arc<ExecutionTrace>>,
    baseline: Option<Arc<StdinRecord>>,
    swept_bits: u32,
    stage: Stage,
    pending: Pending,
    alt_swept: bool,
    sensitive_union: HashSet<u32>,
    changed_nodes: HashSet<NodeId>,
    execution_id: u32,
    rng: SmallRng,
    stats: SensitivityStats,
}

impl SensitivityAnalysis {
    pub fn new(seed: u64) -> Self {
        Self {
            busy: false,
            node: None,
            path: Vec::new(),
            reference: None,
            baseline: None,
            swept_bits: 0,
            stage: Stage::Hamming { next_bit: 0 },
            pending: Pending::None,
            alt_swept: false,
            sensitive_union: HashSet::new(),
            changed_nodes: HashSet::new(),
            execution_id: 0,
            rng: SmallRng::seed_from_u64(seed),
            stats: SensitivityStats::default(),
        }
    }

    pub fn start(&mut self, tree: &BranchTree, node: NodeId, execution_id: u32) {
        assert!(self.is_ready(), "sensitivity already running");
        let n = tree.node(node);
        let baseline = n.best_stdin.clone().expect("target carries a witness");
        let reference = n.best_trace.clone().expect("target carries a witness");

        // Bits read after the target cannot influence it without
        // diverging the path first.
        self.swept_bits = n.num_stdin_bits().min(baseline.num_bits());
        self.busy = true;
        self.node = Some(node);
        self.path = tree.path_to_root(node);
        self.reference = Some(reference);
        self.baseline = Some(baseline);
        self.stage = Stage::Hamming { next_bit: 0 };
        self.pending = Pending::None;
        self.alt_swept = false;
        self.sensitive_union.clear();
        self.changed_nodes.clear();
        self.execution_id = execution_id;
        self.stats.start_calls += 1;
        tracing::debug!(bits = self.swept_bits, "sensitivity sweep started");
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Nodes whose sensitivity state changed during this run; the
    /// engine harvests iid pivots from these.
    pub fn changed_nodes(&self) -> &HashSet<NodeId> {
        &self.changed_nodes
    }

    pub fn stats(&self) -> &SensitivityStats {
        &self.stats
    }

    fn target_prefix_len(&self, tree: &BranchTree) -> usize {
        self.node
            .map(|id| tree.node(id).trace_index as usize + 1)
            .unwrap_or(0)
    }

    fn attribute_bit(&mut self, tree: &mut BranchTree, bit: u32, sample: &ExecutionTrace) {
        let reference = self.reference.as_ref().expect("busy");
        let div = diverging_index(reference, sample);

        // Value drift along the agreeing prefix.
        let prefix = div.min(self.path.len()).min(sample.len());
        for j in 0..prefix {
            if sample[j].value != reference[j].value {
                let node_id = self.path[j];
                if tree.node_mut(node_id).sensitive_bits.insert(bit) {
                    self.changed_nodes.insert(node_id);
                }
            }
        }
        // The diverging branching itself took the other direction.
        if div < self.path.len() && div < sample.len() {
            let node_id = self.path[div];
            if tree.node_mut(node_id).sensitive_bits.insert(bit) {
                self.changed_nodes.insert(node_id);
            }
        }
    }
}

impl Analysis for SensitivityAnalysis {
    fn is_ready(&self) -> bool {
        !self.busy
    }

    fn generate_next_input(&mut self, tree: &BranchTree) -> Option<Vec<bool>> {
        if !self.busy {
            return None;
        }
        loop {
            match self.stage {
                Stage::Hamming { next_bit } => {
                    if next_bit < self.swept_bits {
                        let mut bits = self.baseline.as_ref().expect("busy").bits.clone();
                        let idx = next_bit as usize;
                        bits[idx] = !bits[idx];
                        self.pending = Pending::Bit(next_bit);
                        self.stage = Stage::Hamming {
                            next_bit: next_bit + 1,
                        };
                        self.stats.generated_inputs += 1;
                        return Some(bits);
                    }
                    // Collect the union once the sweep is complete.
                    self.sensitive_union = self
                        .path
                        .iter()
                        .flat_map(|&id| tree.node(id).sensitive_bits.iter().copied())
                        .collect();
                    self.stage = Stage::ProbeSearch { trial: 0 };
                }
                Stage::ProbeSearch { trial } => {
                    if self.alt_swept || self.sensitive_union.len() < 2 || trial >= MAX_PROBE_TRIALS
                    {
                        return None;
                    }
                    let mut bits = self.baseline.as_ref().expect("busy").bits.clone();
                    for &bit in &self.sensitive_union {
                        if (bit as usize) < bits.len() {
                            bits[bit as usize] = self.rng.gen();
                        }
                    }
                    self.pending = Pending::Probe(bits.clone());
                    self.stage = Stage::ProbeSearch { trial: trial + 1 };
                    self.stats.generated_inputs += 1;
                    return Some(bits);
                }
            }
        }
    }

    fn process_results(
        &mut self,
        trace: &Arc<ExecutionTrace>,
        stdin: &Arc<StdinRecord>,
        tree: &mut BranchTree,
    ) {
        let pending = std::mem::replace(&mut self.pending, Pending::None);
        match pending {
            Pending::None => {}
            Pending::Bit(bit) => self.attribute_bit(tree, bit, trace),
            Pending::Probe(_) => {
                // A usable second baseline matches the reference up to
                // and including the target branching.
                let reference = self.reference.as_ref().expect("busy");
                let prefix = self.target_prefix_len(tree);
                if diverging_index(reference, trace) >= prefix && trace.len() >= prefix {
                    self.baseline = Some(Arc::clone(stdin));
                    self.reference = Some(Arc::clone(trace));
                    self.swept_bits = self.swept_bits.min(stdin.num_bits());
                    self.alt_swept = true;
                    self.stage = Stage::Hamming { next_bit: 0 };
                    self.stats.probe_hits += 1;
                    tracing::debug!("similar trace adopted as second baseline");
                }
            }
        }
    }

    fn stop(&mut self, tree: &mut BranchTree) {
        if !self.busy {
            return;
        }
        for &id in &self.path {
            if tree.contains(id) {
                let node = tree.node_mut(id);
                if !node.sensitivity_performed {
                    node.sensitivity_performed = true;
                    node.sensitivity_start_execution = self.execution_id;
                    self.changed_nodes.insert(id);
                }
            }
        }
        self.busy = false;
        self.path.clear();
        self.reference = None;
        self.baseline = None;
        self.pending = Pending::None;
        self.stats.stop_calls += 1;
    }
}
