//! The literal end-to-end scenarios: small programs driven through
//! the full engine with an in-process mock client.

mod common;

use common::{ClientCtx, MockClient};
use fuzz_x::{
    run_fuzzing_with_seed, ClientExecutor, Fuzzer, FuzzerConfig, RoundBegin, Termination,
    TerminationKind, TerminationReason,
};
use fuzzx_dsa::Successor;
use fuzzx_io::record::flags;
use fuzzx_io::{bits_to_bytes, LocationId, Predicate};

#[test]
fn deterministic_two_branch_program() {
    let mut client = MockClient::new(|ctx| {
        let x = ctx.read_u8()?;
        ctx.branch(LocationId::flat(1), x as f64 - 42.0, Predicate::Equal);
        Ok(())
    });

    let outcomes = run_fuzzing_with_seed(&mut client, FuzzerConfig::default(), Some(7));

    assert_eq!(outcomes.termination_kind, TerminationKind::Normal);
    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::AllReachableBranchingsCovered)
    );
    assert!(outcomes.num_executions <= 40);
    assert_eq!(outcomes.covered_branchings, vec![LocationId::flat(1)]);
    assert!(outcomes.uncovered_branchings.is_empty());

    // Exactly two suite entries: the discovering input and the
    // covering one.
    assert_eq!(outcomes.execution_records.len(), 2);
    let with_42 = outcomes
        .execution_records
        .iter()
        .filter(|r| r.stdin_bytes.first() == Some(&42))
        .count();
    assert_eq!(with_42, 1);
}

#[test]
fn nested_if_reaches_the_inner_equality() {
    let mut client = MockClient::new(|ctx| {
        let x = ctx.read_u32()?;
        if ctx.branch(LocationId::flat(1), x as f64 - 10.0, Predicate::Less) {
            ctx.branch(LocationId::flat(2), x as f64 - 3.0, Predicate::Equal);
        }
        Ok(())
    });

    let config = FuzzerConfig {
        max_executions: 400,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing_with_seed(&mut client, config, Some(11));

    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::AllReachableBranchingsCovered)
    );
    assert!(outcomes.covered_branchings.contains(&LocationId::flat(1)));
    assert!(outcomes.covered_branchings.contains(&LocationId::flat(2)));

    // The descent must have proposed x = 3 for the covering input.
    let covering = outcomes
        .execution_records
        .iter()
        .find(|r| r.has(flags::BRANCH_COVERED) && r.path.contains(&(LocationId::flat(2), true)))
        .expect("the inner equality was covered by a recorded input");
    assert_eq!(covering.stdin_bytes[..4], 3u32.to_le_bytes());
}

#[test]
fn xor_guard_skips_typed_descent() {
    let mut client = MockClient::new(|ctx| {
        let a = ctx.read_u8()?;
        let b = ctx.read_u8()?;
        let c = ctx.read_u8()?;
        ctx.branch_xor_like(LocationId::flat(1), (a ^ b ^ c) as f64, Predicate::Equal);
        Ok(())
    });

    let config = FuzzerConfig {
        max_executions: 200,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing_with_seed(&mut client, config, Some(13));

    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::AllReachableBranchingsCovered)
    );
    assert!(outcomes.covered_branchings.contains(&LocationId::flat(1)));
    // Real-valued descent never ran on the discontinuous branching.
    assert_eq!(outcomes.typed_stats.start_calls, 0);
    assert!(outcomes.bitflip_stats.start_calls >= 1);
}

fn loop_program(ctx: &mut ClientCtx) -> Result<(), Termination> {
    // `for i in 0..4 do read(u8)`: the head compares the counter, so
    // every one of its hits is input-independent.
    let mut sum = 0u32;
    for i in 0..4u32 {
        ctx.branch(LocationId::flat(1), i as f64 - 4.0, Predicate::Less);
        sum += ctx.read_u8()? as u32;
    }
    ctx.branch(LocationId::flat(1), 0.0, Predicate::Less);
    if ctx.branch(
        LocationId::flat(2),
        sum as f64 - 341.0,
        Predicate::GreaterEqual,
    ) {
        ctx.branch(LocationId::flat(3), 1.0, Predicate::Greater);
    }
    Ok(())
}

#[test]
fn loop_with_iid_counter_classifies_heads_and_extends_the_trace() {
    let config = FuzzerConfig {
        max_executions: 2000,
        ..FuzzerConfig::default()
    };
    let mut client = MockClient::new(loop_program);
    // Driven by hand so the tree stays inspectable between rounds.
    let mut fuzzer = Fuzzer::with_seed(config, 17);

    let mut iid_heads_seen = false;
    loop {
        match fuzzer.round_begin().expect("engine stays healthy") {
            RoundBegin::Execute(bits) => {
                let raw = client.execute(&bits_to_bytes(&bits));
                fuzzer.round_end(&raw).expect("engine stays healthy");
            }
            RoundBegin::Terminated(_) => break,
        }
        let iid_heads = fuzzer
            .tree()
            .arena
            .iter()
            .filter(|(_, node)| node.loc == LocationId::flat(1) && node.is_iid_branching())
            .count();
        if iid_heads >= 5 {
            // All N+1 hits of the loop head latched input-independent.
            iid_heads_seen = true;
        }
    }

    assert!(iid_heads_seen);
    assert!(fuzzer.coverage().covered.contains(&LocationId::flat(2)));
    // The startup trace holds 6 records; flipping the sum guard
    // appends the guarded branching, so the longest observed branch
    // exceeds every earlier trace by at least one.
    assert!(fuzzer.tree().stats().longest_branch >= 7);
}

#[test]
fn unreachable_branch_depletes_the_strategy() {
    let mut client = MockClient::new(|ctx| {
        let x = ctx.read_u8()?;
        if ctx.branch(LocationId::flat(1), x as f64 - 128.0, Predicate::Less) {
            // Guarded by a constant: the true direction cannot exist.
            ctx.branch(LocationId::flat(2), -1.0, Predicate::Greater);
        }
        Ok(())
    });

    let config = FuzzerConfig {
        max_executions: 500,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing_with_seed(&mut client, config, Some(19));

    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::FuzzingStrategyDepleted)
    );
    assert!(outcomes.covered_branchings.contains(&LocationId::flat(1)));
    assert!(outcomes
        .uncovered_branchings
        .contains(&(LocationId::flat(2), true)));
}

#[test]
fn crash_on_specific_input_is_tagged_exceptional() {
    let mut client = MockClient::new(|ctx| {
        let x = ctx.read_u8()?;
        if ctx.branch(LocationId::flat(1), x as f64, Predicate::Equal) {
            return Err(Termination::Crash);
        }
        Ok(())
    });

    let mut fuzzer = Fuzzer::with_seed(FuzzerConfig::default(), 23);
    let mut crash_record_seen = false;
    let mut exceptional_leaf_seen = false;
    let mut reason = None;
    loop {
        match fuzzer.round_begin().expect("engine stays healthy") {
            RoundBegin::Execute(bits) => {
                let raw = client.execute(&bits_to_bytes(&bits));
                if let Some(record) = fuzzer.round_end(&raw).expect("engine stays healthy") {
                    if record.has(flags::EXECUTION_CRASHES) {
                        crash_record_seen = true;
                    }
                }
            }
            RoundBegin::Terminated(r) => {
                reason = Some(r);
                break;
            }
        }
        if let Some(root) = fuzzer.tree().root() {
            if fuzzer.tree().node(root).successor(true) == Successor::EndExceptional {
                exceptional_leaf_seen = true;
            }
        }
    }

    assert!(crash_record_seen);
    assert!(exceptional_leaf_seen);
    assert_eq!(reason, Some(TerminationReason::AllReachableBranchingsCovered));
    assert!(fuzzer.coverage().covered.contains(&LocationId::flat(1)));
}
