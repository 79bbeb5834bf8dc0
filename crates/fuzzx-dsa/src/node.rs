use std::collections::BTreeSet;
use std::sync::Arc;

use fuzzx_io::{ExecutionTrace, LocationId, Predicate, StdinRecord};

use crate::arena::NodeId;

/// Per-direction child of a branching node.
///
/// Terminal labels record how executions ended past this direction;
/// `EndNormal` dominates `EndExceptional` when both were observed, and
/// a `Visited` child is never downgraded to a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Successor {
    #[default]
    NotVisited,
    EndExceptional,
    EndNormal,
    Visited(NodeId),
}

impl Successor {
    fn rank(self) -> u8 {
        match self {
            Successor::NotVisited => 0,
            Successor::EndExceptional => 1,
            Successor::EndNormal => 2,
            Successor::Visited(_) => 3,
        }
    }

    /// Raises the label towards `label`, keeping a `Visited` child
    /// intact. `label` must itself be terminal.
    pub fn raise_terminal(&mut self, label: Successor) {
        debug_assert!(!matches!(label, Successor::Visited(_)));
        if label.rank() > self.rank() {
            *self = label;
        }
    }

    pub fn child(self) -> Option<NodeId> {
        match self {
            Successor::Visited(id) => Some(id),
            _ => None,
        }
    }
}

/// One node of the branching tree: a distinct trace prefix, its best
/// witness so far, and the analysis progress flags.
#[derive(Debug)]
pub struct BranchingNode {
    pub loc: LocationId,
    pub trace_index: u32,
    pub num_stdin_bytes: u32,

    pub predecessor: Option<NodeId>,
    pub successors: [Successor; 2],

    /// Input that drove this branching closest to flipping so far,
    /// shared with every other node witnessed by the same execution.
    pub best_stdin: Option<Arc<StdinRecord>>,
    pub best_trace: Option<Arc<ExecutionTrace>>,
    pub best_coverage_value: f64,
    /// Sum of squared branching values along the path; only replaced
    /// by a strictly smaller finite value.
    pub best_summary_value: f64,
    pub best_value_execution: u32,

    pub sensitivity_performed: bool,
    pub bitshare_performed: bool,
    pub minimization_performed: bool,

    pub sensitivity_start_execution: u32,
    pub bitshare_start_execution: u32,
    pub minimization_start_execution: u32,

    /// Stdin bit indices this branching's value depends on; only
    /// meaningful once `sensitivity_performed` latched. Ordered so
    /// pattern projections are deterministic.
    pub sensitive_bits: BTreeSet<u32>,

    pub xor_like: bool,
    pub predicate: Predicate,

    pub closed: bool,

    pub max_successors_trace_index: u32,
    pub num_coverage_failure_resets: u32,
}

impl BranchingNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        loc: LocationId,
        trace_index: u32,
        num_stdin_bytes: u32,
        predecessor: Option<NodeId>,
        best_stdin: Option<Arc<StdinRecord>>,
        best_trace: Option<Arc<ExecutionTrace>>,
        best_coverage_value: f64,
        best_summary_value: f64,
        execution: u32,
        xor_like: bool,
        predicate: Predicate,
    ) -> Self {
        Self {
            loc,
            trace_index,
            num_stdin_bytes,
            predecessor,
            successors: [Successor::NotVisited; 2],
            best_stdin,
            best_trace,
            best_coverage_value,
            best_summary_value,
            best_value_execution: execution,
            sensitivity_performed: false,
            bitshare_performed: false,
            minimization_performed: false,
            sensitivity_start_execution: u32::MAX,
            bitshare_start_execution: u32::MAX,
            minimization_start_execution: u32::MAX,
            sensitive_bits: BTreeSet::new(),
            xor_like,
            predicate,
            closed: false,
            max_successors_trace_index: trace_index,
            num_coverage_failure_resets: 0,
        }
    }

    pub fn num_stdin_bits(&self) -> u32 {
        8 * self.num_stdin_bytes
    }

    pub fn successor(&self, direction: bool) -> Successor {
        self.successors[direction as usize]
    }

    pub fn successor_mut(&mut self, direction: bool) -> &mut Successor {
        &mut self.successors[direction as usize]
    }

    /// Direction leading to the given child.
    pub fn successor_direction(&self, child: NodeId) -> bool {
        match (self.successors[0], self.successors[1]) {
            (Successor::Visited(id), _) if id == child => false,
            (_, Successor::Visited(id)) if id == child => true,
            _ => panic!("successor_direction: node is not a child"),
        }
    }

    /// Explored means an execution went through and survived: either
    /// a visited subtree or a normal end. An exceptional end leaves
    /// the direction neither explored nor worth another attempt.
    pub fn is_direction_explored(&self, direction: bool) -> bool {
        matches!(
            self.successor(direction),
            Successor::Visited(_) | Successor::EndNormal
        )
    }

    pub fn is_direction_unexplored(&self, direction: bool) -> bool {
        self.successor(direction) == Successor::NotVisited
    }

    /// Open iff a direction is unvisited and some analysis step is
    /// still pending (sensitivity not run, or ran with findings and
    /// bitshare/minimization remain).
    pub fn is_open_branching(&self) -> bool {
        (self.is_direction_unexplored(false) || self.is_direction_unexplored(true))
            && (!self.sensitivity_performed
                || (!self.sensitive_bits.is_empty()
                    && (!self.bitshare_performed || !self.minimization_performed)))
    }

    pub fn is_did_branching(&self) -> bool {
        self.sensitivity_performed && !self.sensitive_bits.is_empty()
    }

    pub fn is_iid_branching(&self) -> bool {
        self.sensitivity_performed && self.sensitive_bits.is_empty()
    }

    /// Clears the analysis flags so the node can be attacked again
    /// after its witness improved.
    pub fn reset_analyses(&mut self) {
        self.sensitivity_performed = false;
        self.bitshare_performed = false;
        self.minimization_performed = false;
        self.sensitivity_start_execution = u32::MAX;
        self.bitshare_start_execution = u32::MAX;
        self.minimization_start_execution = u32::MAX;
        self.closed = false;
        self.num_coverage_failure_resets += 1;
    }
}
