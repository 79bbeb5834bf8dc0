use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use fuzzx_dsa::{BranchTree, NodeId};
use fuzzx_io::{ExecutionTrace, LocationId, StdinRecord};

use crate::math;
use crate::Analysis;

#[derive(Debug, Default, Clone)]
pub struct BitflipStats {
    pub start_calls: usize,
    pub generated_inputs: usize,
    pub seeds_processed: usize,
    pub gradient_steps: usize,
    pub stop_calls_early: usize,
    pub stop_calls_regular: usize,
    pub max_bits: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    TakeNextSeed,
    ExecuteSeed,
    Partials,
    PartialsExtended,
    Step,
}

#[derive(Debug, Default)]
struct Descent {
    bits: Vec<bool>,
    value: f64,
    partials: Vec<f64>,
    partials_extended: Vec<f64>,
    bit_max_changes: Vec<f64>,
    bit_order: Vec<u16>,
}

/// Gradient descent over the raw sensitive bits, for branchings the
/// typed descent cannot touch.
///
/// Seeds are drawn from every Hamming class with counts proportional
/// to class size. Each seed descends by single-bit partials; when no
/// single flip improves, bits are reordered by the largest value
/// change ever observed and flipped in suffix bundles.
pub struct BitflipMinimization {
    busy: bool,
    node: Option<NodeId>,
    witness: Option<Arc<StdinRecord>>,
    execution_id: u32,
    path: Vec<(LocationId, bool)>,
    target_loc: Option<LocationId>,
    bit_translation: Vec<u32>,
    seeds: Vec<Vec<bool>>,
    stage: Stage,
    descent: Descent,
    stopped_early: bool,
    rng: SmallRng,
    stats: BitflipStats,
}

impl BitflipMinimization {
    pub fn new(seed: u64) -> Self {
        Self {
            busy: false,
            node: None,
            witness: None,
            execution_id: 0,
            path: Vec::new(),
            target_loc: None,
            bit_translation: Vec::new(),
            seeds: Vec::new(),
            stage: Stage::TakeNextSeed,
            descent: Descent::default(),
            stopped_early: false,
            rng: SmallRng::seed_from_u64(seed),
            stats: BitflipStats::default(),
        }
    }

    pub fn start(&mut self, tree: &BranchTree, node: NodeId, execution_id: u32) {
        assert!(self.is_ready(), "bit minimization already running");
        let n = tree.node(node);
        let witness = n.best_stdin.clone().expect("target carries a witness");

        // `(loc, direction)` for every ancestor; the target itself is
        // matched by location only.
        let path_ids = tree.path_to_root(node);
        let directions = tree.path_directions(&path_ids);
        self.path = path_ids
            .iter()
            .zip(directions.iter())
            .map(|(&id, &dir)| (tree.node(id).loc, dir))
            .collect();
        self.target_loc = Some(n.loc);

        self.bit_translation = n.sensitive_bits.iter().copied().collect();
        let num_bits = self.bit_translation.len();

        self.seeds.clear();
        let class_counts = math::sample_counts_per_hamming_class(num_bits, num_bits);
        for (hamming_class, &count) in class_counts.iter().enumerate() {
            math::generate_samples_of_hamming_class(
                &mut self.seeds,
                num_bits,
                hamming_class,
                count,
                &mut self.rng,
            );
        }
        self.seeds.reverse();

        self.busy = true;
        self.node = Some(node);
        self.witness = Some(witness);
        self.execution_id = execution_id;
        self.stage = Stage::TakeNextSeed;
        self.descent = Descent::default();
        self.stopped_early = false;
        self.stats.start_calls += 1;
        self.stats.max_bits = self.stats.max_bits.max(num_bits);
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    pub fn stats(&self) -> &BitflipStats {
        &self.stats
    }

    /// |value| of the target branching if the sample followed the
    /// reference path all the way to it.
    fn last_stdin_value(&self, trace: &ExecutionTrace) -> f64 {
        if trace.len() < self.path.len() {
            return f64::INFINITY;
        }
        for (record, &(loc, direction)) in trace.iter().zip(self.path.iter()) {
            if record.loc != loc || record.direction != direction {
                return f64::INFINITY;
            }
        }
        match (trace.get(self.path.len()), self.target_loc) {
            (Some(record), Some(target)) if record.loc == target && record.value.is_finite() => {
                record.value.abs()
            }
            _ => f64::INFINITY,
        }
    }

    fn project(&self, computed: &[bool]) -> Vec<bool> {
        let witness = self.witness.as_ref().expect("busy");
        let mut bits = witness.bits.clone();
        for (i, &bit_index) in self.bit_translation.iter().enumerate() {
            if let Some(slot) = bits.get_mut(bit_index as usize) {
                *slot = computed[i];
            }
        }
        bits
    }
}

impl Analysis for BitflipMinimization {
    fn is_ready(&self) -> bool {
        !self.busy
    }

    fn generate_next_input(&mut self, _tree: &BranchTree) -> Option<Vec<bool>> {
        if !self.busy {
            return None;
        }
        let num_bits = self.bit_translation.len();

        let computed = loop {
            match self.stage {
                Stage::TakeNextSeed => {
                    let Some(seed) = self.seeds.pop() else {
                        return None;
                    };
                    debug_assert_eq!(seed.len(), num_bits);
                    self.stage = Stage::ExecuteSeed;
                    self.descent = Descent {
                        bits: seed.clone(),
                        value: f64::INFINITY,
                        partials: Vec::new(),
                        partials_extended: Vec::new(),
                        bit_max_changes: vec![0.0; num_bits],
                        bit_order: Vec::new(),
                    };
                    self.stats.seeds_processed += 1;
                    break seed;
                }
                Stage::ExecuteSeed => {
                    self.stage = Stage::Partials;
                }
                Stage::Step => {
                    self.stage = Stage::Partials;
                    self.descent.partials.clear();
                    self.descent.partials_extended.clear();
                    self.stats.gradient_steps += 1;
                }
                Stage::Partials => {
                    if self.descent.partials.len() < num_bits {
                        let mut probe = self.descent.bits.clone();
                        let i = self.descent.partials.len();
                        probe[i] = !probe[i];
                        break probe;
                    }
                    let idx = math::arg_inf(&self.descent.partials);
                    if self.descent.partials[idx] < self.descent.value {
                        self.descent.bits[idx] = !self.descent.bits[idx];
                        self.descent.value = self.descent.partials[idx];
                        self.stage = Stage::Step;
                    } else if num_bits > 1 {
                        self.stage = Stage::PartialsExtended;
                    } else {
                        self.stage = Stage::TakeNextSeed;
                    }
                }
                Stage::PartialsExtended => {
                    if self.descent.bit_order.is_empty() {
                        let mut order: Vec<u16> = (0..num_bits as u16).collect();
                        order.sort_by(|&a, &b| {
                            self.descent.bit_max_changes[b as usize]
                                .total_cmp(&self.descent.bit_max_changes[a as usize])
                        });
                        self.descent.bit_order = order;
                    }
                    if self.descent.partials_extended.len() < num_bits - 1 {
                        let mut probe = self.descent.bits.clone();
                        for i in self.descent.partials_extended.len()..num_bits {
                            let k = self.descent.bit_order[i] as usize;
                            probe[k] = !probe[k];
                        }
                        break probe;
                    }
                    let idx = math::arg_inf(&self.descent.partials_extended);
                    if self.descent.partials_extended[idx] < self.descent.value {
                        for i in idx..num_bits {
                            let k = self.descent.bit_order[i] as usize;
                            self.descent.bits[k] = !self.descent.bits[k];
                        }
                        self.descent.value = self.descent.partials_extended[idx];
                        self.stage = Stage::Step;
                    } else {
                        self.stage = Stage::TakeNextSeed;
                    }
                }
            }
        };

        self.stats.generated_inputs += 1;
        Some(self.project(&computed))
    }

    fn process_results(
        &mut self,
        trace: &Arc<ExecutionTrace>,
        _stdin: &Arc<StdinRecord>,
        _tree: &mut BranchTree,
    ) {
        if !self.busy {
            return;
        }
        let value = self.last_stdin_value(trace);
        match self.stage {
            Stage::ExecuteSeed => {
                self.descent.value = value;
            }
            Stage::Partials => {
                let i = self.descent.partials.len();
                let abs_delta = (value - self.descent.value).abs();
                if abs_delta.is_finite() && abs_delta > self.descent.bit_max_changes[i] {
                    self.descent.bit_max_changes[i] = abs_delta;
                    self.descent.bit_order.clear();
                }
                self.descent.partials.push(value);
            }
            Stage::PartialsExtended => {
                self.descent.partials_extended.push(value);
            }
            _ => {}
        }
    }

    fn stop(&mut self, tree: &mut BranchTree) {
        if !self.busy {
            return;
        }
        self.busy = false;
        let Some(node) = self.node else { return };
        if !self.seeds.is_empty() || self.stage != Stage::TakeNextSeed {
            self.stopped_early = true;
            self.stats.stop_calls_early += 1;
        } else {
            self.stats.stop_calls_regular += 1;
        }
        if tree.contains(node) {
            let n = tree.node_mut(node);
            n.minimization_performed = true;
            n.minimization_start_execution = self.execution_id;
        }
        self.witness = None;
        self.path.clear();
        self.seeds.clear();
        self.descent = Descent::default();
    }
}
