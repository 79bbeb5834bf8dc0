use serde::Serialize;

use fuzzx_analysis::bitflip::BitflipStats;
use fuzzx_analysis::bitshare::BitshareStats;
use fuzzx_analysis::sensitivity::SensitivityStats;
use fuzzx_analysis::typed::TypedStats;
use fuzzx_dsa::TreeStats;
use fuzzx_io::{ExecutionRecord, LocationId};

/// Engine-level counters, aggregated into the outcomes at loop end.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub traces_to_crash: usize,
    pub traces_to_boundary_violation: usize,
    pub traces_to_medium_overflow: usize,
    pub coverage_failure_resets: usize,
    pub internal_failures: usize,
    pub strategy_primary_loop_head: usize,
    pub strategy_primary_sensitive: usize,
    pub strategy_primary_untouched: usize,
    pub strategy_primary_iid_twins: usize,
    pub strategy_monte_carlo: usize,
    pub max_input_width: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationKind {
    Normal,
    ServerInternalError,
}

/// Everything the search produced, returned once by the loop driver.
#[derive(Debug)]
pub struct AnalysisOutcomes {
    pub termination_kind: TerminationKind,
    pub termination_reason: Option<crate::engine::TerminationReason>,
    pub termination_message: String,
    pub num_executions: u32,
    pub num_elapsed_seconds: u64,
    pub covered_branchings: Vec<LocationId>,
    pub uncovered_branchings: Vec<(LocationId, bool)>,
    pub execution_records: Vec<ExecutionRecord>,
    pub engine_stats: EngineStats,
    pub tree_stats: TreeStats,
    pub sensitivity_stats: SensitivityStats,
    pub bitshare_stats: BitshareStats,
    pub typed_stats: TypedStats,
    pub bitflip_stats: BitflipStats,
}
