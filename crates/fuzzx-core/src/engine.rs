use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use fuzzx_analysis::typed::types_of_sensitive_bits_available;
use fuzzx_analysis::{
    Analysis, BitflipMinimization, BitshareAnalysis, SensitivityAnalysis, TypedMinimization,
};
use fuzzx_dsa::{BitshareCache, BranchTree, Coverage, NodeId, TreeError};
use fuzzx_io::record::flags;
use fuzzx_io::{ExecutionRecord, RawExecution, StdinRecord, Termination};
use fuzzx_mc::IidPivots;

use crate::config::FuzzerConfig;
use crate::error::EngineError;
use crate::stats::{AnalysisOutcomes, EngineStats, TerminationKind};
use crate::targets::PrimaryCoverageTargets;

/// Why the search loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    AllReachableBranchingsCovered,
    FuzzingStrategyDepleted,
    TimeBudgetDepleted,
    ExecutionsBudgetDepleted,
}

/// What the host should do this round.
#[derive(Debug)]
pub enum RoundBegin {
    /// Run the client on these stdin bits.
    Execute(Vec<bool>),
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzerState {
    Startup,
    Sensitivity,
    Bitshare,
    TypedMinimization,
    Minimization,
    Finished,
}

/// The search engine: owns the branching tree, the coverage state,
/// the four analyses, and the target selector.
///
/// Single-threaded cooperative: the host calls `round_begin` to get
/// the next input and `round_end` with the resulting trace; every
/// mutation happens inside those two calls.
pub struct Fuzzer {
    config: FuzzerConfig,

    tree: BranchTree,
    coverage: Coverage,
    targets: PrimaryCoverageTargets,
    iid_pivots: IidPivots,
    coverage_failures_with_hope: HashSet<NodeId>,

    state: FuzzerState,
    sensitivity: SensitivityAnalysis,
    bitshare_cache: BitshareCache,
    bitshare: BitshareAnalysis,
    typed_minimization: TypedMinimization,
    minimization: BitflipMinimization,

    max_input_width: u32,
    num_driver_executions: u32,
    started_at: Instant,

    rng_iid_location: SmallRng,
    rng_generator_selection: SmallRng,
    rng_blind: SmallRng,

    stats: EngineStats,
}

impl Fuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        Self::with_seed(config, 0x5EED_F122)
    }

    pub fn with_seed(config: FuzzerConfig, seed: u64) -> Self {
        Self {
            config,
            tree: BranchTree::new(),
            coverage: Coverage::new(),
            targets: PrimaryCoverageTargets::new(),
            iid_pivots: IidPivots::new(),
            coverage_failures_with_hope: HashSet::new(),
            state: FuzzerState::Startup,
            sensitivity: SensitivityAnalysis::new(seed ^ 0x01),
            bitshare_cache: BitshareCache::new(),
            bitshare: BitshareAnalysis::new(),
            typed_minimization: TypedMinimization::new(),
            minimization: BitflipMinimization::new(seed ^ 0x02),
            max_input_width: 0,
            num_driver_executions: 0,
            started_at: Instant::now(),
            rng_iid_location: SmallRng::seed_from_u64(seed ^ 0x10),
            rng_generator_selection: SmallRng::seed_from_u64(seed ^ 0x11),
            rng_blind: SmallRng::seed_from_u64(seed ^ 0x12),
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &FuzzerConfig {
        &self.config
    }

    pub fn tree(&self) -> &BranchTree {
        &self.tree
    }

    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    pub fn state(&self) -> FuzzerState {
        self.state
    }

    pub fn num_executions(&self) -> u32 {
        self.num_driver_executions
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn can_make_progress(&self) -> bool {
        self.state != FuzzerState::Finished
    }

    /// Budget checks and input generation; called once per round
    /// before the client runs.
    pub fn round_begin(&mut self) -> Result<RoundBegin, EngineError> {
        if self.num_driver_executions > 0 && self.coverage.uncovered.is_empty() {
            self.terminate();
            return Ok(RoundBegin::Terminated(
                TerminationReason::AllReachableBranchingsCovered,
            ));
        }
        if self.elapsed_seconds() >= self.config.max_seconds {
            self.terminate();
            return Ok(RoundBegin::Terminated(TerminationReason::TimeBudgetDepleted));
        }
        if self.num_driver_executions >= self.config.max_executions {
            self.terminate();
            return Ok(RoundBegin::Terminated(
                TerminationReason::ExecutionsBudgetDepleted,
            ));
        }
        match self.generate_next_input()? {
            Some(bits) => Ok(RoundBegin::Execute(bits)),
            None => {
                self.terminate();
                Ok(RoundBegin::Terminated(
                    TerminationReason::FuzzingStrategyDepleted,
                ))
            }
        }
    }

    /// Consumes the client's trace for the input produced by the
    /// preceding `round_begin`. Returns the execution record when the
    /// round was worth keeping.
    pub fn round_end(&mut self, raw: &RawExecution) -> Result<Option<ExecutionRecord>, EngineError> {
        let exe_flags = self.process_execution_results(raw)?;
        self.num_driver_executions += 1;
        if exe_flags == 0 {
            return Ok(None);
        }
        let limit = self.config.max_trace_length as usize;
        Ok(Some(ExecutionRecord {
            flags: exe_flags,
            stdin_bytes: raw.stdin.bytes.to_vec(),
            stdin_types: raw.stdin.types.clone(),
            path: raw
                .trace
                .iter()
                .take(limit)
                .map(|r| (r.loc, r.direction))
                .collect(),
        }))
    }

    /// Stops everything and drops the tree; the loop is over.
    pub fn terminate(&mut self) {
        self.stop_all_analyses();
        self.tree.clear();
    }

    pub fn stop_all_analyses(&mut self) {
        self.sensitivity.stop(&mut self.tree);
        self.bitshare.stop(&mut self.tree);
        self.typed_minimization.stop(&mut self.tree);
        self.minimization.stop(&mut self.tree);
    }

    fn generate_next_input(&mut self) -> Result<Option<Vec<bool>>, EngineError> {
        loop {
            let produced = match self.state {
                FuzzerState::Startup => {
                    if self.num_driver_executions == 0 {
                        // The very first round runs on an empty stdin.
                        return Ok(Some(Vec::new()));
                    }
                    None
                }
                FuzzerState::Sensitivity => self.sensitivity.generate_next_input(&self.tree),
                FuzzerState::Bitshare => self.bitshare.generate_next_input(&self.tree),
                FuzzerState::TypedMinimization => {
                    self.typed_minimization.generate_next_input(&self.tree)
                }
                FuzzerState::Minimization => self.minimization.generate_next_input(&self.tree),
                FuzzerState::Finished => {
                    if !self.apply_coverage_failures_with_hope() {
                        if self.config.allow_blind_fuzzing && !self.coverage.uncovered.is_empty() {
                            return Ok(Some(self.random_blind_input()));
                        }
                        return Ok(None);
                    }
                    None
                }
            };
            if let Some(bits) = produced {
                return Ok(Some(bits));
            }
            self.stop_active_analysis();
            self.do_cleanup();
            self.select_next_state()?;
        }
    }

    fn stop_active_analysis(&mut self) {
        match self.state {
            FuzzerState::Sensitivity => self.sensitivity.stop(&mut self.tree),
            FuzzerState::Bitshare => self.bitshare.stop(&mut self.tree),
            FuzzerState::TypedMinimization => self.typed_minimization.stop(&mut self.tree),
            FuzzerState::Minimization => self.minimization.stop(&mut self.tree),
            _ => {}
        }
    }

    fn random_blind_input(&mut self) -> Vec<bool> {
        let num_bytes = self.max_input_width.max(1);
        (0..num_bytes * 8).map(|_| self.rng_blind.gen()).collect()
    }

    fn process_execution_results(&mut self, raw: &RawExecution) -> Result<u8, EngineError> {
        if self.state == FuzzerState::Finished {
            return Ok(0);
        }

        let mut exe_flags = 0u8;
        let mut trace = raw.trace.clone();
        let mut termination = raw.termination;
        if trace.len() > self.config.max_trace_length as usize {
            // Never merge past the limit.
            trace.truncate(self.config.max_trace_length as usize);
            termination = Termination::BoundaryViolation;
        }

        let stdin = Arc::new(StdinRecord::from_bytes(
            &raw.stdin.bytes,
            raw.stdin.types.clone(),
        ));
        let trace = Arc::new(trace);

        if !trace.is_empty() {
            let merge = self.tree.merge(
                &trace,
                &stdin,
                termination,
                self.num_driver_executions,
                &mut self.coverage,
            );
            let delta = match merge {
                Ok(delta) => delta,
                Err(err) => {
                    self.handle_tree_failure(err);
                    return Ok(exe_flags);
                }
            };

            let leaf = delta.leaf.expect("merge of a non-empty trace yields a leaf");
            if let Some(diverging) = delta.diverging_node {
                let mut cursor = Some(leaf);
                while let Some(id) = cursor {
                    self.targets.process_potential_coverage_target(
                        &self.tree,
                        &self.coverage,
                        &self.iid_pivots,
                        id,
                        false,
                    );
                    if id == diverging {
                        break;
                    }
                    cursor = self.tree.node(id).predecessor;
                }
            }

            let leaf_node = self.tree.node(leaf);
            if self.max_input_width < leaf_node.num_stdin_bytes {
                self.max_input_width = leaf_node.num_stdin_bytes;
                self.stats.max_input_width = self.max_input_width;
            }
            let leaf_loc = leaf_node.loc;

            match termination {
                Termination::Crash => {
                    self.stats.traces_to_crash += 1;
                    if self.coverage.locations_to_crashes.insert(leaf_loc) {
                        exe_flags |= flags::EXECUTION_CRASHES;
                    }
                }
                Termination::BoundaryViolation => {
                    self.stats.traces_to_boundary_violation += 1;
                    exe_flags |= flags::BOUNDARY_CONDITION_VIOLATION;
                }
                Termination::MediumOverflow => {
                    self.stats.traces_to_medium_overflow += 1;
                    exe_flags |= flags::MEDIUM_OVERFLOW;
                }
                _ => {}
            }

            if delta.any_location_discovered {
                exe_flags |= flags::BRANCH_DISCOVERED;
            }
            if !delta.covered_locations.is_empty() {
                exe_flags |= flags::BRANCH_COVERED;
            }
        } else {
            match termination {
                Termination::Crash => {
                    self.stats.traces_to_crash += 1;
                    exe_flags |= flags::EXECUTION_CRASHES;
                }
                Termination::BoundaryViolation => {
                    self.stats.traces_to_boundary_violation += 1;
                    exe_flags |= flags::BOUNDARY_CONDITION_VIOLATION;
                }
                Termination::MediumOverflow => {
                    self.stats.traces_to_medium_overflow += 1;
                    exe_flags |= flags::MEDIUM_OVERFLOW;
                }
                _ => {}
            }
            if self.state == FuzzerState::Startup {
                exe_flags |= flags::EMPTY_STARTUP_TRACE;
            }
        }

        match self.state {
            FuzzerState::Sensitivity => {
                self.sensitivity
                    .process_results(&trace, &stdin, &mut self.tree);
            }
            FuzzerState::TypedMinimization => {
                self.typed_minimization
                    .process_results(&trace, &stdin, &mut self.tree);
                if let Some(node) = self.typed_minimization.node() {
                    if self.tree.contains(node) && self.both_directions_explored(node) {
                        self.typed_minimization.stop(&mut self.tree);
                        BitshareAnalysis::bits_available_for_branching(
                            &mut self.bitshare_cache,
                            &self.tree,
                            node,
                            &trace,
                            &stdin,
                        );
                    }
                }
            }
            FuzzerState::Minimization => {
                self.minimization
                    .process_results(&trace, &stdin, &mut self.tree);
                if let Some(node) = self.minimization.node() {
                    if self.tree.contains(node) && self.both_directions_explored(node) {
                        self.minimization.stop(&mut self.tree);
                        BitshareAnalysis::bits_available_for_branching(
                            &mut self.bitshare_cache,
                            &self.tree,
                            node,
                            &trace,
                            &stdin,
                        );
                    }
                }
            }
            FuzzerState::Bitshare => {
                self.bitshare.process_results(&trace, &stdin, &mut self.tree);
                if let Some(node) = self.bitshare.node() {
                    if self.tree.contains(node) && self.both_directions_explored(node) {
                        self.bitshare.stop(&mut self.tree);
                    }
                }
            }
            _ => {}
        }

        Ok(exe_flags)
    }

    fn both_directions_explored(&self, node: NodeId) -> bool {
        let n = self.tree.node(node);
        n.is_direction_explored(false) && n.is_direction_explored(true)
    }

    /// A trace the tree cannot absorb aborts the running analysis and
    /// resets its target so a later, better witness can retry it.
    fn handle_tree_failure(&mut self, err: TreeError) {
        self.stats.internal_failures += 1;
        tracing::warn!(error = %err, "unmergeable trace; resetting the active target");
        let node = match self.state {
            FuzzerState::Sensitivity => self.sensitivity.node(),
            FuzzerState::Bitshare => self.bitshare.node(),
            FuzzerState::TypedMinimization => self.typed_minimization.node(),
            FuzzerState::Minimization => self.minimization.node(),
            _ => None,
        };
        self.stop_active_analysis();
        if let Some(node) = node {
            if self.tree.contains(node) {
                self.tree.node_mut(node).reset_analyses();
                self.reopen_ancestors(node);
            }
        }
    }

    fn reopen_ancestors(&mut self, node: NodeId) {
        let mut cursor = self.tree.node(node).predecessor;
        while let Some(id) = cursor {
            if !self.tree.node(id).closed {
                break;
            }
            self.tree.node_mut(id).closed = false;
            cursor = self.tree.node(id).predecessor;
        }
    }

    fn do_cleanup(&mut self) {
        match self.state {
            FuzzerState::Sensitivity => {
                if let Some(node) = self.sensitivity.node() {
                    let mut cursor = Some(node);
                    while let Some(id) = cursor {
                        if !self.tree.contains(id) {
                            break;
                        }
                        if !self.tree.node(id).closed {
                            self.tree.update_close_flags_from(id);
                            break;
                        }
                        cursor = self.tree.node(id).predecessor;
                    }
                    if self.tree.contains(node) {
                        let changed = self.sensitivity.changed_nodes().clone();
                        let coverage = &self.coverage;
                        self.iid_pivots.collect_from_sensitivity(
                            &self.tree,
                            &changed,
                            |loc| coverage.is_covered(loc),
                            node,
                        );
                    }
                }
            }
            FuzzerState::Bitshare => {
                if let Some(node) = self.bitshare.node() {
                    if self.tree.contains(node) {
                        self.tree.update_close_flags_from(node);
                    }
                }
            }
            FuzzerState::TypedMinimization | FuzzerState::Minimization => {
                let node = if self.state == FuzzerState::TypedMinimization {
                    self.typed_minimization.node()
                } else {
                    self.minimization.node()
                };
                if let Some(node) = node {
                    if self.tree.contains(node) {
                        self.tree.update_close_flags_from(node);
                        if !self.coverage.is_covered(self.tree.node(node).loc) {
                            self.coverage_failures_with_hope.insert(node);
                        }
                    }
                }
            }
            _ => {}
        }

        // Leaves whose path has since grown are consumed.
        let stale: Vec<NodeId> = self
            .tree
            .leaves()
            .iter()
            .copied()
            .filter(|&leaf| {
                let n = self.tree.node(leaf);
                n.successor(false).child().is_some() || n.successor(true).child().is_some()
            })
            .collect();
        for leaf in stale {
            let removed = self.tree.remove_leaf_branching_node(leaf);
            for &(id, loc) in &removed {
                self.targets.erase(id, loc);
                self.coverage_failures_with_hope.remove(&id);
            }
            self.iid_pivots.remove_nodes(&self.tree, &removed);
        }

        self.targets
            .do_cleanup(&self.tree, &self.coverage, &self.iid_pivots);

        let coverage = &self.coverage;
        self.iid_pivots.drop_covered(|loc| coverage.is_covered(loc));

        let tree = &self.tree;
        self.coverage_failures_with_hope
            .retain(|&id| tree.contains(id) && !coverage.is_covered(tree.node(id).loc));
    }

    fn select_next_state(&mut self) -> Result<(), EngineError> {
        let mut winner = self
            .targets
            .get_best(&self.tree, self.max_input_width, &mut self.stats);

        if winner.is_none() {
            let root_open = self
                .tree
                .root()
                .is_some_and(|root| !self.tree.node(root).closed);
            if root_open {
                winner = fuzzx_mc::select_iid_coverage_target(
                    &self.tree,
                    &mut self.iid_pivots,
                    self.max_input_width,
                    &mut self.rng_iid_location,
                    &mut self.rng_generator_selection,
                );
                if winner.is_some() {
                    self.stats.strategy_monte_carlo += 1;
                }
            }
        }

        let Some(mut winner) = winner else {
            self.state = FuzzerState::Finished;
            return Ok(());
        };

        if !self.tree.node(winner).is_open_branching() {
            return Err(EngineError::InvariantViolation(
                "selected coverage target is not an open branching".to_string(),
            ));
        }

        if !self.tree.node(winner).sensitivity_performed {
            // Slide to the deepest descendant reading the same input
            // width: one sweep latches the whole prefix.
            loop {
                let n = self.tree.node(winner);
                let width = n.num_stdin_bytes;
                let left = n
                    .successor(false)
                    .child()
                    .filter(|&c| self.tree.node(c).num_stdin_bytes == width);
                let right = n
                    .successor(true)
                    .child()
                    .filter(|&c| self.tree.node(c).num_stdin_bytes == width);
                winner = match (left, right) {
                    (Some(l), Some(r)) => {
                        if self.tree.node(l).max_successors_trace_index
                            >= self.tree.node(r).max_successors_trace_index
                        {
                            l
                        } else {
                            r
                        }
                    }
                    (Some(l), None) => l,
                    (None, Some(r)) => r,
                    (None, None) => break,
                };
            }
            self.sensitivity
                .start(&self.tree, winner, self.num_driver_executions);
            self.state = FuzzerState::Sensitivity;
        } else if !self.tree.node(winner).bitshare_performed {
            self.bitshare.start(
                &self.tree,
                &self.bitshare_cache,
                winner,
                self.num_driver_executions,
            );
            self.state = FuzzerState::Bitshare;
        } else if !self.tree.node(winner).xor_like
            && types_of_sensitive_bits_available(
                self.tree
                    .node(winner)
                    .best_stdin
                    .as_ref()
                    .expect("open targets carry a witness"),
                &self.tree.node(winner).sensitive_bits,
            )
        {
            self.typed_minimization
                .start(&self.tree, winner, self.num_driver_executions);
            self.state = FuzzerState::TypedMinimization;
        } else {
            self.minimization
                .start(&self.tree, winner, self.num_driver_executions);
            self.state = FuzzerState::Minimization;
        }
        Ok(())
    }

    /// Re-arms completed-but-unsuccessful minimization targets whose
    /// witness improved after the pass started.
    fn apply_coverage_failures_with_hope(&mut self) -> bool {
        let nodes: Vec<NodeId> = self.coverage_failures_with_hope.drain().collect();
        for node in nodes {
            if !self.tree.contains(node) {
                continue;
            }
            let n = self.tree.node(node);
            if n.minimization_performed
                && n.minimization_start_execution < n.best_value_execution
            {
                self.tree.node_mut(node).reset_analyses();
                self.reopen_ancestors(node);
                self.targets.process_potential_coverage_target(
                    &self.tree,
                    &self.coverage,
                    &self.iid_pivots,
                    node,
                    true,
                );
                self.stats.coverage_failure_resets += 1;
                tracing::debug!("coverage failure with hope re-armed");
            }
        }
        !self.targets.is_empty()
    }

    /// Final result aggregation; the driver supplies the records it
    /// collected across rounds.
    pub fn outcomes(
        &self,
        kind: TerminationKind,
        reason: Option<TerminationReason>,
        message: String,
        execution_records: Vec<ExecutionRecord>,
    ) -> AnalysisOutcomes {
        let mut covered: Vec<_> = self.coverage.covered.iter().copied().collect();
        covered.sort();
        let mut uncovered: Vec<_> = self.coverage.uncovered.iter().copied().collect();
        uncovered.sort();
        AnalysisOutcomes {
            termination_kind: kind,
            termination_reason: reason,
            termination_message: message,
            num_executions: self.num_driver_executions,
            num_elapsed_seconds: self.elapsed_seconds(),
            covered_branchings: covered,
            uncovered_branchings: uncovered,
            execution_records,
            engine_stats: self.stats.clone(),
            tree_stats: self.tree.stats().clone(),
            sensitivity_stats: self.sensitivity.stats().clone(),
            bitshare_stats: self.bitshare.stats().clone(),
            typed_stats: self.typed_minimization.stats().clone(),
            bitflip_stats: self.minimization.stats().clone(),
        }
    }
}
