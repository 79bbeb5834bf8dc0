use serde::Serialize;
use serde_json::json;

use crate::stats::AnalysisOutcomes;

/// JSON image of one test-suite entry.
#[derive(Serialize)]
struct RecordDump<'a> {
    flags: u8,
    stdin_bytes: &'a [u8],
    stdin_types: Vec<u8>,
    path: Vec<(u32, u64, bool)>,
}

/// Serializes the outcomes for the on-disk test-suite dump.
pub fn outcomes_to_json(outcomes: &AnalysisOutcomes) -> serde_json::Value {
    let records: Vec<RecordDump<'_>> = outcomes
        .execution_records
        .iter()
        .map(|record| RecordDump {
            flags: record.flags,
            stdin_bytes: &record.stdin_bytes,
            stdin_types: record.stdin_types.iter().map(|t| t.to_id()).collect(),
            path: record
                .path
                .iter()
                .map(|(loc, direction)| (loc.id, loc.context_hash, *direction))
                .collect(),
        })
        .collect();

    json!({
        "termination_kind": outcomes.termination_kind,
        "termination_reason": outcomes.termination_reason,
        "termination_message": outcomes.termination_message,
        "num_executions": outcomes.num_executions,
        "num_elapsed_seconds": outcomes.num_elapsed_seconds,
        "covered_branchings": outcomes.covered_branchings,
        "uncovered_branchings": outcomes.uncovered_branchings,
        "test_suite": records,
    })
}

pub fn outcomes_to_json_string(outcomes: &AnalysisOutcomes) -> String {
    serde_json::to_string_pretty(&outcomes_to_json(outcomes))
        .unwrap_or_else(|_| "{}".to_string())
}
