//! Pattern reuse between branchings at the same location reached
//! through different call contexts.

mod common;

use common::MockClient;
use fuzz_x::{run_fuzzing_with_seed, FuzzerConfig, TerminationReason};
use fuzzx_io::{LocationId, Predicate};

#[test]
fn discriminating_bytes_transfer_across_call_contexts() {
    // The same textual branching (id 5) inlined under two call
    // contexts; each compares its own byte against 42.
    let mut client = MockClient::new(|ctx| {
        let a = ctx.read_u8()?;
        ctx.branch(LocationId::new(5, 0xA), a as f64 - 42.0, Predicate::Equal);
        let b = ctx.read_u8()?;
        ctx.branch(LocationId::new(5, 0xB), b as f64 - 42.0, Predicate::Equal);
        Ok(())
    });

    let config = FuzzerConfig {
        max_executions: 300,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing_with_seed(&mut client, config, Some(29));

    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::AllReachableBranchingsCovered)
    );
    assert!(outcomes.covered_branchings.contains(&LocationId::new(5, 0xA)));
    assert!(outcomes.covered_branchings.contains(&LocationId::new(5, 0xB)));
    // The second context was flipped by replaying the first one's
    // pattern, not by another descent.
    assert!(outcomes.bitshare_stats.hits >= 1);
    assert!(outcomes.bitshare_stats.generated_inputs >= 1);
}
