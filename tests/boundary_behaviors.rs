//! Budget edges, degenerate traces, and the round-trip laws of the
//! input encoding.

mod common;

use common::MockClient;
use fuzz_x::{
    run_fuzzing, run_fuzzing_with_seed, ClientExecutor, FuzzerConfig, RawExecution,
    TerminationKind, TerminationReason,
};
use fuzzx_io::record::flags;
use fuzzx_io::{bits_to_bytes, bytes_to_bits, LocationId, Predicate};

#[test]
fn zero_execution_budget_terminates_without_running_the_client() {
    let mut client = MockClient::new(|ctx| {
        ctx.read_u8()?;
        Ok(())
    });
    let config = FuzzerConfig {
        max_executions: 0,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing(&mut client, config);

    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::ExecutionsBudgetDepleted)
    );
    assert_eq!(outcomes.num_executions, 0);
    assert_eq!(client.executions, 0);
}

#[test]
fn empty_startup_trace_creates_no_root() {
    // A client with no instrumented branchings at all.
    let mut client = MockClient::new(|ctx| {
        ctx.read_u8()?;
        Ok(())
    });
    let outcomes = run_fuzzing(&mut client, FuzzerConfig::default());

    assert_eq!(outcomes.tree_stats.nodes_created, 0);
    let startup = outcomes
        .execution_records
        .iter()
        .find(|r| r.has(flags::EMPTY_STARTUP_TRACE))
        .expect("the empty startup trace is flagged");
    assert!(startup.path.is_empty());
    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::AllReachableBranchingsCovered)
    );
}

#[test]
fn overlong_traces_are_cut_at_the_limit() {
    let mut client = MockClient::new(|ctx| {
        for i in 0..10u32 {
            ctx.branch(LocationId::flat(100 + i), i as f64 - 10.0, Predicate::Less);
        }
        Ok(())
    });
    let config = FuzzerConfig {
        max_executions: 10,
        max_trace_length: 5,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing_with_seed(&mut client, config, Some(3));

    assert_eq!(outcomes.termination_kind, TerminationKind::Normal);
    assert!(outcomes.tree_stats.longest_branch <= 5);
    assert!(outcomes
        .execution_records
        .iter()
        .any(|r| r.has(flags::BOUNDARY_CONDITION_VIOLATION)));
}

#[test]
fn blind_fuzzing_outlives_strategy_depletion() {
    struct RecordingClient<E> {
        inner: E,
        input_lens: Vec<usize>,
    }

    impl<E: ClientExecutor> ClientExecutor for RecordingClient<E> {
        fn execute(&mut self, stdin_bytes: &[u8]) -> RawExecution {
            self.input_lens.push(stdin_bytes.len());
            self.inner.execute(stdin_bytes)
        }
    }

    // Same shape as the unreachable-branch scenario: once location 2's
    // true direction proves hopeless, the strategy is out of targets.
    let mut client = RecordingClient {
        inner: MockClient::new(|ctx| {
            let x = ctx.read_u8()?;
            if ctx.branch(LocationId::flat(1), x as f64 - 128.0, Predicate::Less) {
                ctx.branch(LocationId::flat(2), -1.0, Predicate::Greater);
            }
            Ok(())
        }),
        input_lens: Vec::new(),
    };

    let config = FuzzerConfig {
        max_executions: 200,
        allow_blind_fuzzing: true,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing_with_seed(&mut client, config, Some(31));

    // Blind inputs keep the loop alive until the execution budget;
    // without the knob this program ends in FuzzingStrategyDepleted.
    assert_eq!(
        outcomes.termination_reason,
        Some(TerminationReason::ExecutionsBudgetDepleted)
    );
    assert_eq!(outcomes.num_executions, 200);
    assert_eq!(client.input_lens.len(), 200);
    assert!(outcomes
        .uncovered_branchings
        .contains(&(LocationId::flat(2), true)));

    // Round one runs on the empty startup stdin; everything after it,
    // including every blind round, carries bytes.
    assert_eq!(client.input_lens[0], 0);
    assert!(client.input_lens.iter().skip(1).all(|&len| len > 0));
}

#[test]
fn unknown_stdin_model_is_a_configuration_error() {
    let mut client = MockClient::new(|_| Ok(()));
    let config = FuzzerConfig {
        stdin_model_name: "no_such_model".to_string(),
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing(&mut client, config);
    assert_eq!(outcomes.termination_kind, TerminationKind::ServerInternalError);
    assert_eq!(client.executions, 0);
}

#[test]
fn typed_descent_respects_its_execution_budget() {
    use std::sync::Arc;

    use fuzzx_analysis::{Analysis, TypedMinimization};
    use fuzzx_dsa::{BranchTree, Coverage};
    use fuzzx_io::{InputType, StdinRecord, Termination, TraceRecord};

    let mut tree = BranchTree::new();
    let mut coverage = Coverage::new();
    let rec = TraceRecord {
        loc: LocationId::flat(1),
        direction: false,
        value: 5.0,
        num_stdin_bytes: 1,
        xor_like: false,
        predicate: Predicate::Equal,
    };
    let stdin = Arc::new(StdinRecord::from_bytes(&[0x55], vec![InputType::U8]));
    let trace = Arc::new(vec![rec]);
    tree.merge(&trace, &stdin, Termination::Normal, 0, &mut coverage)
        .unwrap();
    let root = tree.root().unwrap();
    {
        let n = tree.node_mut(root);
        n.sensitivity_performed = true;
        n.bitshare_performed = true;
        n.sensitive_bits.extend(0..8);
    }

    let mut typed = TypedMinimization::new();
    typed.start(&tree, root, 1);
    let budget = typed.max_num_executions();

    // The branching value ignores the input entirely, so no partial
    // and no descent step can ever improve.
    let mut executed = 0u32;
    while typed.generate_next_input(&tree).is_some() {
        executed += 1;
        assert!(executed <= budget);
        typed.process_results(&trace, &stdin, &mut tree);
    }
    typed.stop(&mut tree);
    assert!(tree.node(root).minimization_performed);
}

#[test]
fn bit_byte_round_trip_pads_with_zero_bits() {
    let bits = vec![true, false, true, true, false, true, false, false, true, true];
    let bytes = bits_to_bytes(&bits);
    let mut expected = bits.clone();
    expected.resize(16, false);
    assert_eq!(bytes_to_bits(&bytes), expected);
}

#[test]
fn predicate_opposite_is_involutive() {
    for p in [
        Predicate::Equal,
        Predicate::Unequal,
        Predicate::Less,
        Predicate::LessEqual,
        Predicate::Greater,
        Predicate::GreaterEqual,
    ] {
        assert_eq!(p.opposite().opposite(), p);
    }
}
